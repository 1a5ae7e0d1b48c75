//! Newick format parser and writer.
//!
//! Supports the standard Newick grammar:
//! ```text
//! tree     = subtree ';'
//! subtree  = '(' children ')' label | label
//! children = subtree (',' subtree)*
//! label    = name? (':' length)?
//! name     = bare | "'" quoted "'"
//! ```
//!
//! Bracketed comments (`[...]`) are skipped wherever whitespace is allowed.
//! Quoted names may contain any character; a literal quote is written `''`.

use crate::tree::{check_branch_length, Node, NodeId, PhyloTree};
use ecosim_core::{EcosimError, Result};

/// Parse a Newick format string into a `PhyloTree`.
///
/// Any syntax error yields [`EcosimError::MalformedTree`] naming the offending
/// token and its byte offset; no partial tree is returned.
pub fn parse(input: &str) -> Result<PhyloTree> {
    let bytes = input.as_bytes();
    let mut parser = Parser::new(bytes);
    let (nodes, root) = parser.parse_tree()?;
    PhyloTree::from_nodes(nodes, root)
}

/// Serialize a `PhyloTree` to a Newick format string, full topology.
pub fn write(tree: &PhyloTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), false, &mut buf);
    buf.push(';');
    buf
}

/// Serialize a `PhyloTree`, writing every collapsed clade as one leaf.
pub fn write_collapsed(tree: &PhyloTree) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), true, &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &PhyloTree, id: NodeId, stop_at_collapsed: bool, buf: &mut String) {
    let Some(node) = tree.get_node(id) else {
        return;
    };
    let hide_children = stop_at_collapsed && node.collapsed;
    if !node.children.is_empty() && !hide_children {
        buf.push('(');
        for (i, &child) in node.children.iter().enumerate() {
            if i > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, stop_at_collapsed, buf);
        }
        buf.push(')');
    }
    if let Some(ref name) = node.name {
        write_name(name, buf);
    }
    if let Some(len) = node.branch_length {
        buf.push(':');
        // Use enough precision but strip trailing zeros
        let s = format!("{:.10}", len);
        let s = s.trim_end_matches('0');
        let s = s.trim_end_matches('.');
        buf.push_str(s);
    }
}

fn write_name(name: &str, buf: &mut String) {
    let needs_quotes = name.is_empty() || name.bytes().any(is_reserved);
    if needs_quotes {
        buf.push('\'');
        buf.push_str(&name.replace('\'', "''"));
        buf.push('\'');
    } else {
        buf.push_str(name);
    }
}

fn is_reserved(b: u8) -> bool {
    matches!(
        b,
        b':' | b',' | b')' | b'(' | b';' | b'[' | b']' | b'\'' | b' ' | b'\t' | b'\n' | b'\r'
    )
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<Node>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            nodes: Vec::new(),
        }
    }

    fn parse_tree(&mut self) -> Result<(Vec<Node>, NodeId)> {
        self.skip_whitespace()?;
        if self.pos >= self.input.len() {
            return Err(self.error("expected a tree"));
        }
        let root = self.parse_subtree(None)?;
        self.skip_whitespace()?;
        if self.peek() != Some(b';') {
            return Err(self.error("expected ';' at end of Newick string"));
        }
        self.pos += 1;
        self.skip_whitespace()?;
        if self.pos < self.input.len() {
            return Err(self.error("unexpected content after ';'"));
        }
        Ok((std::mem::take(&mut self.nodes), root))
    }

    fn parse_subtree(&mut self, parent: Option<NodeId>) -> Result<NodeId> {
        self.skip_whitespace()?;
        let id = self.alloc_node(parent);

        if self.peek() == Some(b'(') {
            self.pos += 1; // consume '('
            let first_child = self.parse_subtree(Some(id))?;
            self.nodes[id].children.push(first_child);

            loop {
                self.skip_whitespace()?;
                if self.peek() == Some(b',') {
                    self.pos += 1;
                    let child = self.parse_subtree(Some(id))?;
                    self.nodes[id].children.push(child);
                } else {
                    break;
                }
            }
            self.skip_whitespace()?;
            if self.peek() != Some(b')') {
                return Err(self.error("expected ')' or ','"));
            }
            self.pos += 1; // consume ')'
        }

        self.parse_label(id)?;
        if self.nodes[id].children.is_empty() && self.nodes[id].name.is_none() {
            // Anonymous leaves are legal Newick, but only where a label could stand.
            match self.peek() {
                Some(b',') | Some(b')') | Some(b';') | Some(b':') => {}
                _ => return Err(self.error("expected a leaf label")),
            }
        }
        Ok(id)
    }

    fn parse_label(&mut self, id: NodeId) -> Result<()> {
        self.skip_whitespace()?;
        let name = if self.peek() == Some(b'\'') {
            Some(self.parse_quoted_name()?)
        } else {
            let bare = self.parse_bare_name();
            (!bare.is_empty()).then_some(bare)
        };
        if name.is_some() {
            self.nodes[id].name = name;
        }
        self.skip_whitespace()?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace()?;
            let start = self.pos;
            let len_str = self.parse_float_str();
            if len_str.is_empty() {
                return Err(self.error("expected number after ':'"));
            }
            let len: f64 = len_str.parse().map_err(|_| {
                EcosimError::malformed(len_str.clone(), start, "invalid branch length")
            })?;
            check_branch_length(len)
                .map_err(|reason| EcosimError::malformed(len_str.clone(), start, reason))?;
            self.nodes[id].branch_length = Some(len);
        }
        Ok(())
    }

    fn parse_bare_name(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() && !is_reserved(self.input[self.pos]) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn parse_quoted_name(&mut self) -> Result<String> {
        let start = self.pos;
        self.pos += 1; // opening quote
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(EcosimError::malformed(
                        String::from_utf8_lossy(&self.input[start..]).into_owned(),
                        start,
                        "unterminated quoted label",
                    ))
                }
                Some(b'\'') if self.input.get(self.pos + 1) == Some(&b'\'') => {
                    out.push(b'\'');
                    self.pos += 2;
                }
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn parse_float_str(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E' => self.pos += 1,
                _ => break,
            }
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    fn alloc_node(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id, parent));
        id
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'[' => {
                    let start = self.pos;
                    match self.input[start..].iter().position(|&b| b == b']') {
                        Some(offset) => self.pos = start + offset + 1,
                        None => {
                            return Err(EcosimError::malformed(
                                "[",
                                start,
                                "unterminated comment",
                            ))
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// The token at the current position, for error messages.
    fn token(&self) -> String {
        match self.peek() {
            None => "<end of input>".to_string(),
            Some(b) if is_reserved(b) => (b as char).to_string(),
            Some(_) => {
                let end = self.input[self.pos..]
                    .iter()
                    .position(|&b| is_reserved(b))
                    .map_or(self.input.len(), |o| self.pos + o);
                String::from_utf8_lossy(&self.input[self.pos..end]).into_owned()
            }
        }
    }

    fn error(&self, reason: &str) -> EcosimError {
        EcosimError::malformed(self.token(), self.pos, reason)
    }
}
