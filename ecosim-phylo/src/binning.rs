//! Multi-threshold complete-linkage binning over a phylogenetic tree.
//!
//! For a sequence-identity threshold `t` the tree is cut top-down: a clade
//! whose widest leaf pair is no further apart than `1 - t` becomes a single
//! cluster, anything wider is split into its children. Every threshold is
//! evaluated independently; the clade diameters are computed once per call
//! and shared between thresholds.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tree::{Extent, NodeId, PhyloTree};

/// Slack absorbed when comparing a clade diameter against a gap.
pub const EPSILON: f64 = 1e-6;

/// The identity levels scanned by default, ascending.
pub const DEFAULT_THRESHOLDS: [f64; 20] = [
    0.500, 0.550, 0.600, 0.650, 0.700, 0.750, 0.800, 0.850, 0.900, 0.950, 0.955, 0.960, 0.965,
    0.970, 0.975, 0.980, 0.985, 0.990, 0.995, 1.000,
];

/// Number of clusters found at one identity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinLevel {
    /// Sequence-identity fraction in `[0, 1]`.
    pub threshold: f64,
    /// Complete-linkage clusters at that threshold.
    pub cluster_count: usize,
}

impl BinLevel {
    pub fn new(threshold: f64, cluster_count: usize) -> Self {
        Self {
            threshold,
            cluster_count,
        }
    }

    /// Largest patristic distance allowed inside one cluster.
    pub fn gap(&self) -> f64 {
        1.0 - self.threshold
    }
}

impl fmt::Display for BinLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3} {}", self.threshold, self.cluster_count)
    }
}

/// Count complete-linkage clusters in the subtree below `root` at each
/// threshold, preserving the caller's threshold order.
///
/// The outgroup never counts. Collapsed clades count as single leaves. A
/// clade is split only when its diameter strictly exceeds `1 - t - EPSILON`.
pub fn compute_bins(tree: &PhyloTree, root: NodeId, thresholds: &[f64]) -> Vec<BinLevel> {
    if thresholds.is_empty() || tree.get_node(root).is_none() {
        return thresholds.iter().map(|&t| BinLevel::new(t, 0)).collect();
    }
    let extents = tree.subtree_extents(root);
    let populated = populated_clades(tree, root);
    thresholds
        .iter()
        .map(|&t| BinLevel::new(t, count_clusters(tree, root, 1.0 - t, &extents, &populated)))
        .collect()
}

/// Bin the whole tree.
pub fn compute_tree_bins(tree: &PhyloTree, thresholds: &[f64]) -> Vec<BinLevel> {
    compute_bins(tree, tree.root(), thresholds)
}

/// Drop levels that repeat the cluster count of the level before them.
///
/// The first level of each run of equal counts is kept. This is a policy a
/// caller may apply before handing bins to an oracle; [`compute_bins`] never
/// does it on its own.
pub fn compact_bins(levels: &[BinLevel]) -> Vec<BinLevel> {
    let mut out: Vec<BinLevel> = Vec::with_capacity(levels.len());
    for level in levels {
        if out
            .last()
            .map_or(true, |prev| prev.cluster_count != level.cluster_count)
        {
            out.push(*level);
        }
    }
    out
}

fn count_clusters(
    tree: &PhyloTree,
    id: NodeId,
    gap: f64,
    extents: &HashMap<NodeId, Extent>,
    populated: &HashMap<NodeId, bool>,
) -> usize {
    if tree.is_outgroup(id) {
        return 0;
    }
    if tree.is_leaf(id) {
        return 1;
    }
    if extents[&id].diameter > gap - EPSILON {
        return tree
            .get_node(id)
            .map(|node| {
                node.children
                    .iter()
                    .map(|&c| count_clusters(tree, c, gap, extents, populated))
                    .sum()
            })
            .unwrap_or(0);
    }
    usize::from(populated[&id])
}

/// Whether each clade below `root` holds at least one non-outgroup leaf.
fn populated_clades(tree: &PhyloTree, root: NodeId) -> HashMap<NodeId, bool> {
    let mut populated = HashMap::new();
    for id in tree.iter_postorder_from(root) {
        let Some(node) = tree.get_node(id) else {
            continue;
        };
        let value = if node.is_tip() {
            !node.outgroup
        } else {
            node.children.iter().any(|c| populated[c])
        };
        populated.insert(id, value);
    }
    populated
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Random binary tree built by repeatedly splitting a random leaf.
    fn random_tree() -> impl Strategy<Value = PhyloTree> {
        (
            proptest::collection::vec((0usize..1000, 0.0f64..0.2, 0.0f64..0.2), 1..12),
            any::<bool>(),
        )
            .prop_map(|(splits, with_outgroup)| {
                let mut tree = PhyloTree::new();
                let ingroup = if with_outgroup {
                    tree.add_child(0, Some("O".into()), Some(0.3)).unwrap();
                    tree.add_child(0, None, Some(0.01)).unwrap()
                } else {
                    0
                };
                let mut tips = vec![ingroup];
                for (pick, left, right) in splits {
                    let at = tips.swap_remove(pick % tips.len());
                    tips.push(tree.add_child(at, None, Some(left)).unwrap());
                    tips.push(tree.add_child(at, None, Some(right)).unwrap());
                }
                for (i, tip) in tips.into_iter().enumerate() {
                    tree.rename(tip, format!("s{}", i)).unwrap();
                }
                if with_outgroup {
                    tree.set_outgroup("O").unwrap();
                }
                tree
            })
    }

    proptest! {
        #[test]
        fn counts_monotone_in_threshold(tree in random_tree()) {
            let levels = compute_tree_bins(&tree, &DEFAULT_THRESHOLDS);
            for pair in levels.windows(2) {
                prop_assert!(pair[0].cluster_count <= pair[1].cluster_count,
                    "{} then {}", pair[0], pair[1]);
            }
        }

        #[test]
        fn counts_bounded_by_sample(tree in random_tree()) {
            let sample = tree.sample(tree.root()).len();
            for level in compute_tree_bins(&tree, &DEFAULT_THRESHOLDS) {
                prop_assert!(level.cluster_count >= 1);
                prop_assert!(level.cluster_count <= sample);
            }
        }
    }
}
