//! Core phylogenetic tree data structures.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Parent links are plain indices,
//! so ownership stays strictly top-down.
//!
//! Two annotations ride on top of the fixed shape: the single *outgroup* leaf
//! and the *collapsed* flag that demarcation sets on clades it has declared
//! one ecotype. A collapsed node answers `true` to [`PhyloTree::is_leaf`] and
//! hides its subtree from every walk that honours collapse, yet keeps its
//! children so the full topology can still be written out.

use std::collections::HashMap;

use ecosim_core::{EcosimError, Result, Summarizable};
use serde::{Deserialize, Serialize};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A single node in a phylogenetic tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes.
    pub children: Vec<NodeId>,
    /// Branch length from this node to its parent.
    pub branch_length: Option<f64>,
    /// Taxon or clade label.
    pub name: Option<String>,
    /// Whether this leaf is the tree's outgroup.
    pub outgroup: bool,
    /// Whether this clade has been demarcated as a single ecotype.
    pub collapsed: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, parent: Option<NodeId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            branch_length: None,
            name: None,
            outgroup: false,
            collapsed: false,
        }
    }

    /// True if this node has no children or has been collapsed.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() || self.collapsed
    }

    /// True if this node has no children, regardless of collapse.
    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// True if this node has both parent and children.
    pub fn is_internal(&self) -> bool {
        !self.is_tip() && !self.is_root()
    }

    /// Branch length with a missing value read as zero.
    pub fn length(&self) -> f64 {
        self.branch_length.unwrap_or(0.0)
    }
}

/// Height and diameter of one subtree, honouring collapse.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct Extent {
    /// Longest path from the node down to one of its leaves.
    pub height: f64,
    /// Longest path between two leaves of the subtree.
    pub diameter: f64,
}

/// A rooted phylogenetic tree stored as an arena of nodes.
///
/// Deserialized trees go through [`PhyloTree::from_nodes`], so they carry
/// the same guarantees as built ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTree")]
pub struct PhyloTree {
    nodes: Vec<Node>,
    root: NodeId,
}

/// Unchecked wire form of a [`PhyloTree`].
#[derive(Deserialize)]
struct RawTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl TryFrom<RawTree> for PhyloTree {
    type Error = EcosimError;

    fn try_from(raw: RawTree) -> Result<Self> {
        Self::from_nodes(raw.nodes, raw.root)
    }
}

impl PhyloTree {
    /// Create a new tree with a single unnamed root node.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(0, None)],
            root: 0,
        }
    }

    /// Create a tree from pre-built nodes and a root index.
    ///
    /// This is used by the Newick parser and by deserialization. Node ids
    /// must match their arena positions and every branch length must be
    /// finite and non-negative. Every non-root node must hang below exactly
    /// one parent reachable from `root`, with its `parent` link pointing
    /// back at it. At most one node is the outgroup and it must be a
    /// structural leaf.
    pub fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        if nodes.is_empty() {
            return Err(EcosimError::InvalidInput("empty node list".into()));
        }
        if root >= nodes.len() {
            return Err(EcosimError::InvalidInput(format!(
                "root index {} out of range ({})",
                root,
                nodes.len()
            )));
        }
        if nodes[root].parent.is_some() {
            return Err(EcosimError::InvalidInput(format!(
                "root {} has a parent",
                root
            )));
        }
        for (idx, node) in nodes.iter().enumerate() {
            if node.id != idx {
                return Err(EcosimError::InvalidInput(format!(
                    "node at position {} carries id {}",
                    idx, node.id
                )));
            }
            if let Some(len) = node.branch_length {
                check_branch_length(len).map_err(EcosimError::InvalidInput)?;
            }
            if node.children.iter().any(|&c| c >= nodes.len()) {
                return Err(EcosimError::InvalidInput(format!(
                    "node {} has a child out of range",
                    idx
                )));
            }
        }
        if nodes[root].outgroup {
            return Err(EcosimError::InvalidInput(
                "the root cannot be the outgroup".into(),
            ));
        }
        check_structure(&nodes, root)?;
        Ok(Self { nodes, root })
    }

    /// Add a child to `parent` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<String>,
        branch_length: Option<f64>,
    ) -> Result<NodeId> {
        if parent >= self.nodes.len() {
            return Err(EcosimError::InvalidInput(format!(
                "parent index {} out of range ({})",
                parent,
                self.nodes.len()
            )));
        }
        if let Some(len) = branch_length {
            check_branch_length(len).map_err(EcosimError::InvalidInput)?;
        }
        if self.nodes[parent].outgroup {
            return Err(EcosimError::InvalidInput(
                "the outgroup must stay a leaf".into(),
            ));
        }
        let id = self.nodes.len();
        let mut node = Node::new(id, Some(parent));
        node.name = name;
        node.branch_length = branch_length;
        self.nodes.push(node);
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Access a node by id.
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable access to a node by id.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of structural leaf nodes (collapse is ignored).
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_tip()).count()
    }

    /// All structural leaf node ids, in arena order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_tip())
            .map(|n| n.id)
            .collect()
    }

    /// All internal (non-leaf, non-root) node ids.
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.is_internal())
            .map(|n| n.id)
            .collect()
    }

    /// Maximum depth (in edges) from root to any leaf.
    pub fn depth(&self) -> usize {
        fn dfs(tree: &PhyloTree, node: NodeId) -> usize {
            let children = &tree.nodes[node].children;
            if children.is_empty() {
                return 0;
            }
            children.iter().map(|&c| 1 + dfs(tree, c)).max().unwrap_or(0)
        }
        dfs(self, self.root)
    }

    /// Pre-order (parent before children) traversal yielding node ids.
    pub fn iter_preorder(&self) -> PreorderIter<'_> {
        self.iter_preorder_from(self.root)
    }

    /// Pre-order traversal of the subtree below `id`, ignoring collapse.
    pub fn iter_preorder_from(&self, id: NodeId) -> PreorderIter<'_> {
        let stack = if id < self.nodes.len() { vec![id] } else { Vec::new() };
        PreorderIter { tree: self, stack }
    }

    /// Post-order (children before parent) traversal yielding node ids.
    pub fn iter_postorder(&self) -> PostorderIter {
        self.iter_postorder_from(self.root)
    }

    /// Post-order traversal of the subtree below `id`, ignoring collapse.
    pub fn iter_postorder_from(&self, id: NodeId) -> PostorderIter {
        // Build postorder sequence by reversing a modified preorder
        // (visit right children first, then reverse the whole thing).
        let mut result = Vec::new();
        let mut stack = if id < self.nodes.len() { vec![id] } else { Vec::new() };
        while let Some(id) = stack.pop() {
            result.push(id);
            for &child in &self.nodes[id].children {
                stack.push(child);
            }
        }
        result.reverse();
        PostorderIter {
            sequence: result,
            pos: 0,
        }
    }

    /// Most recent common ancestor of two nodes.
    pub fn mrca(&self, a: NodeId, b: NodeId) -> Result<NodeId> {
        if a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(EcosimError::InvalidInput("node id out of range".into()));
        }
        let mut ancestors_a = Vec::new();
        let mut cur = a;
        loop {
            ancestors_a.push(cur);
            match self.nodes[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        cur = b;
        loop {
            if ancestors_a.contains(&cur) {
                return Ok(cur);
            }
            match self.nodes[cur].parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        Ok(self.root)
    }

    /// Sorted list of structural leaf names (leaves without names are excluded).
    pub fn leaf_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.is_tip())
            .filter_map(|n| n.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Look up a structural leaf by name.
    pub fn find_leaf(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.is_tip() && n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// True if `id` behaves as a leaf: no children, or collapsed.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Node::is_leaf)
    }

    /// True if `id` is the tree's outgroup leaf.
    pub fn is_outgroup(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.outgroup)
    }

    /// True if `id` has been collapsed into a single ecotype.
    pub fn is_collapsed(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.collapsed)
    }

    /// The outgroup leaf, if one has been designated.
    pub fn outgroup(&self) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.outgroup).map(|n| n.id)
    }

    /// Designate the leaf called `name` as the outgroup.
    ///
    /// Any previously designated outgroup is cleared. The outgroup must be a
    /// structural leaf other than the root and its name must be unique.
    pub fn set_outgroup(&mut self, name: &str) -> Result<NodeId> {
        let matches: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.is_tip() && n.name.as_deref() == Some(name))
            .map(|n| n.id)
            .collect();
        let id = match matches.as_slice() {
            [] => {
                return Err(EcosimError::InvalidInput(format!(
                    "no leaf named '{}'",
                    name
                )))
            }
            [id] => *id,
            _ => {
                return Err(EcosimError::InvalidInput(format!(
                    "leaf name '{}' is ambiguous ({} leaves)",
                    name,
                    matches.len()
                )))
            }
        };
        if id == self.root {
            return Err(EcosimError::InvalidInput(
                "the root cannot be the outgroup".into(),
            ));
        }
        for node in &mut self.nodes {
            node.outgroup = false;
        }
        self.nodes[id].outgroup = true;
        Ok(id)
    }

    /// The first-listed taxon: the leftmost structural leaf in pre-order.
    pub fn first_leaf(&self) -> Option<NodeId> {
        self.iter_preorder().find(|&id| self.nodes[id].is_tip())
    }

    /// Designate the first-listed taxon as the outgroup, by convention.
    pub fn set_first_leaf_as_outgroup(&mut self) -> Result<NodeId> {
        let id = self
            .first_leaf()
            .filter(|&id| id != self.root)
            .ok_or_else(|| EcosimError::InvalidInput("tree has no leaf besides the root".into()))?;
        for node in &mut self.nodes {
            node.outgroup = false;
        }
        self.nodes[id].outgroup = true;
        Ok(id)
    }

    /// All leaves of the subtree below `id`, in pre-order.
    ///
    /// Collapsed nodes are reported as leaves and their subtrees are not
    /// entered. The outgroup is included if it lies in the subtree.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn descendant_leaves(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let node = &self.nodes[cur];
            if node.is_leaf() {
                out.push(cur);
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Structural leaves below `id` in pre-order, looking through collapse.
    pub fn original_leaves(&self, id: NodeId) -> Vec<NodeId> {
        self.iter_preorder_from(id)
            .filter(|&n| self.nodes[n].is_tip())
            .collect()
    }

    /// Names of the non-outgroup structural leaves below `id`, in pre-order.
    ///
    /// Unnamed leaves contribute an empty string.
    pub fn sample(&self, id: NodeId) -> Vec<String> {
        self.original_leaves(id)
            .into_iter()
            .filter(|&n| !self.nodes[n].outgroup)
            .map(|n| self.nodes[n].name.clone().unwrap_or_default())
            .collect()
    }

    /// Longest path from `id` down to one of its leaves (0 for a leaf).
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn max_leaf_depth(&self, id: NodeId) -> f64 {
        self.subtree_extents(id)[&id].height
    }

    /// Maximum patristic distance between any two leaves below `id`.
    ///
    /// For every node the largest root-to-leaf depth through each child is
    /// found and the two largest are summed; the subtree's value is the
    /// largest such sum anywhere beneath `id`. A leaf or collapsed node has
    /// distance 0.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub fn max_pairwise_leaf_distance(&self, id: NodeId) -> f64 {
        self.subtree_extents(id)[&id].diameter
    }

    /// Height and diameter of every node reachable from `id` without
    /// entering collapsed clades.
    pub(crate) fn subtree_extents(&self, id: NodeId) -> HashMap<NodeId, Extent> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            order.push(cur);
            let node = &self.nodes[cur];
            if !node.is_leaf() {
                stack.extend(node.children.iter().copied());
            }
        }

        let mut extents: HashMap<NodeId, Extent> = HashMap::with_capacity(order.len());
        for &cur in order.iter().rev() {
            let node = &self.nodes[cur];
            if node.is_leaf() {
                extents.insert(cur, Extent::default());
                continue;
            }
            let (mut first, mut second) = (0.0_f64, 0.0_f64);
            let mut widest_child = 0.0_f64;
            for &child in &node.children {
                let ext = extents[&child];
                let reach = self.nodes[child].length() + ext.height;
                if reach > first {
                    second = first;
                    first = reach;
                } else if reach > second {
                    second = reach;
                }
                widest_child = widest_child.max(ext.diameter);
            }
            let through = if node.children.len() >= 2 {
                first + second
            } else {
                0.0
            };
            extents.insert(
                cur,
                Extent {
                    height: first,
                    diameter: through.max(widest_child),
                },
            );
        }
        extents
    }

    /// Mark `id` as collapsed. Children are kept.
    ///
    /// Returns `true` if the node was not collapsed before; collapsing twice
    /// is a no-op.
    pub fn collapse(&mut self, id: NodeId) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EcosimError::InvalidInput(format!("node id {} out of range", id)))?;
        let changed = !node.collapsed;
        node.collapsed = true;
        Ok(changed)
    }

    /// Replace the label of `id`.
    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| EcosimError::InvalidInput(format!("node id {} out of range", id)))?;
        node.name = Some(name.into());
        Ok(())
    }

    /// Compare topology, names, and branch lengths with another tree.
    ///
    /// Children are compared in order; branch lengths must agree within
    /// `tolerance` (a missing length only matches another missing length).
    /// Outgroup and collapse annotations are not part of the comparison.
    pub fn same_shape(&self, other: &PhyloTree, tolerance: f64) -> bool {
        fn eq(a: &PhyloTree, x: NodeId, b: &PhyloTree, y: NodeId, tol: f64) -> bool {
            let (nx, ny) = (&a.nodes[x], &b.nodes[y]);
            let lengths_match = match (nx.branch_length, ny.branch_length) {
                (None, None) => true,
                (Some(p), Some(q)) => (p - q).abs() <= tol,
                _ => false,
            };
            lengths_match
                && nx.name == ny.name
                && nx.children.len() == ny.children.len()
                && nx
                    .children
                    .iter()
                    .zip(&ny.children)
                    .all(|(&cx, &cy)| eq(a, cx, b, cy, tol))
        }
        eq(self, self.root, other, other.root, tolerance)
    }

    /// Parse a Newick format string into a tree.
    pub fn from_newick(input: &str) -> Result<Self> {
        crate::newick::parse(input)
    }

    /// Serialize the full topology to a Newick format string.
    pub fn to_newick(&self) -> String {
        crate::newick::write(self)
    }

    /// Serialize with every collapsed clade written as a single leaf.
    pub fn to_collapsed_newick(&self) -> String {
        crate::newick::write_collapsed(self)
    }
}

impl Default for PhyloTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizable for PhyloTree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        let internal = self.node_count() - leaves;
        let collapsed = self.nodes.iter().filter(|n| n.collapsed).count();
        format!(
            "PhyloTree: {} nodes ({} leaves, {} internal, {} collapsed)",
            self.node_count(),
            leaves,
            internal,
            collapsed
        )
    }
}

/// Every node reached exactly once from `root`, parent links consistent,
/// at most one outgroup and that one a structural leaf.
fn check_structure(nodes: &[Node], root: NodeId) -> Result<()> {
    let mut seen = vec![false; nodes.len()];
    seen[root] = true;
    let mut stack = vec![root];
    while let Some(cur) = stack.pop() {
        for &child in &nodes[cur].children {
            if seen[child] {
                return Err(EcosimError::InvalidInput(format!(
                    "node {} is reached more than once",
                    child
                )));
            }
            if nodes[child].parent != Some(cur) {
                return Err(EcosimError::InvalidInput(format!(
                    "node {} hangs below {} but names {:?} as its parent",
                    child, cur, nodes[child].parent
                )));
            }
            seen[child] = true;
            stack.push(child);
        }
    }
    if let Some(orphan) = seen.iter().position(|&reached| !reached) {
        return Err(EcosimError::InvalidInput(format!(
            "node {} is not reachable from the root",
            orphan
        )));
    }

    let outgroups: Vec<&Node> = nodes.iter().filter(|n| n.outgroup).collect();
    match outgroups.as_slice() {
        [] => Ok(()),
        [og] if og.is_tip() => Ok(()),
        [og] => Err(EcosimError::InvalidInput(format!(
            "outgroup node {} is not a leaf",
            og.id
        ))),
        _ => Err(EcosimError::InvalidInput(format!(
            "{} nodes are marked as outgroup",
            outgroups.len()
        ))),
    }
}

pub(crate) fn check_branch_length(len: f64) -> std::result::Result<(), String> {
    if !len.is_finite() {
        return Err(format!("branch length {} is not finite", len));
    }
    if len < 0.0 {
        return Err(format!("branch length {} is negative", len));
    }
    Ok(())
}

/// Pre-order iterator over node ids.
pub struct PreorderIter<'a> {
    tree: &'a PhyloTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for PreorderIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        // Push children in reverse order so leftmost is visited first.
        for &child in self.tree.nodes[id].children.iter().rev() {
            self.stack.push(child);
        }
        Some(id)
    }
}

/// Post-order iterator over node ids.
pub struct PostorderIter {
    sequence: Vec<NodeId>,
    pos: usize,
}

impl Iterator for PostorderIter {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = *self.sequence.get(self.pos)?;
        self.pos += 1;
        Some(id)
    }
}
