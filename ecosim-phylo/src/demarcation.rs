//! Recursive top-down ecotype demarcation.
//!
//! Starting at the root, each clade is either declared one ecotype or split
//! into its children:
//!
//! 1. a clade holding nothing but the outgroup is skipped;
//! 2. a single leaf is its own ecotype, no oracle call is needed;
//! 3. any other clade is binned on its own, the global population estimate is
//!    scaled to the clade's size, and the oracle is asked for the `npop = 1`
//!    candidate and the most likely candidate. The [`PrecisionMode`] picks
//!    one; if it has a single population the clade is collapsed and labelled
//!    as an ecotype, otherwise every child is visited in order.
//!
//! Leaves always terminate and a split clade hands its whole sample to its
//! children, so the ecotypes always partition the non-outgroup leaves.
//!
//! The walk itself only reads the tree. Collapse and relabelling are applied
//! once the decisions are in, so an oracle failure leaves earlier verdicts in
//! place and touches nothing else.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use ecosim_core::{EcosimError, Result, Scored, Summarizable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::binning::{compact_bins, compute_bins};
use crate::config::{DemarcationConfig, PrecisionMode};
use crate::oracle::{odd_seed, DemarcationOracle, OracleRequest, ParameterSet};
use crate::tree::{NodeId, PhyloTree};

/// One demarcated ecotype.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ecotype {
    /// 1-based position in the demarcation output.
    pub id: usize,
    pub label: String,
    /// The clade (or leaf) the ecotype was read from.
    pub node: NodeId,
    /// Leaf names; never empty, never the outgroup.
    pub members: BTreeSet<String>,
}

impl Ecotype {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }
}

/// Result of a demarcation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demarcation {
    /// Ecotypes in pre-order of the clades they came from.
    pub ecotypes: Vec<Ecotype>,
    /// How many times the oracle was consulted.
    pub oracle_calls: usize,
}

impl Demarcation {
    pub fn len(&self) -> usize {
        self.ecotypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecotypes.is_empty()
    }

    /// The ecotype a leaf was assigned to.
    pub fn ecotype_of(&self, name: &str) -> Option<&Ecotype> {
        self.ecotypes.iter().find(|e| e.contains(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ecotype> {
        self.ecotypes.iter()
    }
}

impl Summarizable for Demarcation {
    fn summary(&self) -> String {
        let sequences: usize = self.ecotypes.iter().map(Ecotype::len).sum();
        format!(
            "Demarcation: {} ecotypes over {} sequences ({} oracle calls)",
            self.ecotypes.len(),
            sequences,
            self.oracle_calls
        )
    }
}

/// A clade the walk has declared one ecotype.
#[derive(Debug)]
struct Verdict {
    node: NodeId,
    members: BTreeSet<String>,
    /// Whether the node is a clade that must be collapsed and relabelled.
    relabel: bool,
}

/// Runs demarcation against one oracle with one configuration.
pub struct Demarcator<'a, O: DemarcationOracle + ?Sized> {
    config: &'a DemarcationConfig,
    oracle: &'a O,
}

impl<'a, O: DemarcationOracle + ?Sized> Demarcator<'a, O> {
    pub fn new(config: &'a DemarcationConfig, oracle: &'a O) -> Self {
        Self { config, oracle }
    }

    /// Partition the tree's non-outgroup leaves into ecotypes.
    ///
    /// `global` is the oracle's estimate for the whole sample and
    /// `sequence_length` the alignment length. Every clade declared an
    /// ecotype is collapsed and renamed `<label-prefix><id>` on `tree`.
    ///
    /// # Errors
    ///
    /// Invalid parameters, duplicate or missing leaf names, and any oracle
    /// failure. On an oracle failure the clades decided before it are still
    /// collapsed and labelled.
    pub fn run(
        &self,
        tree: &mut PhyloTree,
        global: &ParameterSet,
        sequence_length: usize,
    ) -> Result<Demarcation> {
        self.config.validate()?;
        global.validate()?;
        if sequence_length == 0 {
            return Err(EcosimError::InvalidInput(
                "sequence length must be positive".into(),
            ));
        }
        let sample = tree.sample(tree.root());
        check_names(&sample)?;

        info!(
            sequences = sample.len(),
            npop = global.npop,
            precision = ?self.config.precision,
            "starting demarcation"
        );

        let walk = Walk {
            tree,
            config: self.config,
            oracle: self.oracle,
            global: *global,
            nu: sample.len(),
            sequence_length,
            iteration: AtomicUsize::new(0),
        };
        let mut verdicts = Vec::new();
        let outcome = walk.visit(walk.tree.root(), &mut verdicts);
        let oracle_calls = walk.iteration.load(Ordering::SeqCst);

        let ecotypes = self.apply(tree, verdicts)?;
        let demarcation = Demarcation {
            ecotypes,
            oracle_calls,
        };
        match outcome {
            Ok(()) => {
                info!(
                    ecotypes = demarcation.len(),
                    oracle_calls, "demarcation finished"
                );
                Ok(demarcation)
            }
            Err(err) => {
                warn!(
                    decided = demarcation.len(),
                    oracle_calls, "demarcation aborted: {}", err
                );
                Err(err)
            }
        }
    }

    fn apply(&self, tree: &mut PhyloTree, verdicts: Vec<Verdict>) -> Result<Vec<Ecotype>> {
        verdicts
            .into_iter()
            .enumerate()
            .map(|(idx, verdict)| {
                let id = idx + 1;
                let label = format!("{}{}", self.config.label_prefix, id);
                if verdict.relabel {
                    tree.collapse(verdict.node)?;
                    tree.rename(verdict.node, label.clone())?;
                }
                Ok(Ecotype {
                    id,
                    label,
                    node: verdict.node,
                    members: verdict.members,
                })
            })
            .collect()
    }
}

/// Demarcate `tree` with `oracle` in one call.
pub fn demarcate<O: DemarcationOracle + ?Sized>(
    tree: &mut PhyloTree,
    global: &ParameterSet,
    sequence_length: usize,
    config: &DemarcationConfig,
    oracle: &O,
) -> Result<Demarcation> {
    Demarcator::new(config, oracle).run(tree, global, sequence_length)
}

fn check_names(sample: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(sample.len());
    for name in sample {
        if name.is_empty() {
            return Err(EcosimError::InvalidInput("every leaf needs a name".into()));
        }
        if !seen.insert(name.as_str()) {
            return Err(EcosimError::InvalidInput(format!(
                "leaf name '{}' appears more than once",
                name
            )));
        }
    }
    Ok(())
}

/// State shared by every clade of one run.
struct Walk<'a, O: DemarcationOracle + ?Sized> {
    tree: &'a PhyloTree,
    config: &'a DemarcationConfig,
    oracle: &'a O,
    global: ParameterSet,
    /// Non-outgroup leaves in the whole tree.
    nu: usize,
    sequence_length: usize,
    iteration: AtomicUsize,
}

impl<O: DemarcationOracle + ?Sized> Walk<'_, O> {
    /// Decide the clade at `id`, appending verdicts in pre-order.
    fn visit(&self, id: NodeId, out: &mut Vec<Verdict>) -> Result<()> {
        let sample = self.tree.sample(id);
        if sample.is_empty() {
            return Ok(());
        }
        if self.tree.is_leaf(id) {
            // A tip is a singleton; a clade collapsed by an earlier run stays whole.
            out.push(Verdict {
                node: id,
                relabel: self.tree.get_node(id).is_some_and(|n| n.collapsed && !n.is_tip()),
                members: sample.into_iter().collect(),
            });
            return Ok(());
        }

        let mut bins = compute_bins(self.tree, id, &self.config.thresholds);
        if self.config.compact_bins {
            bins = compact_bins(&bins);
        }
        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst);
        let request = OracleRequest {
            iteration,
            bins,
            omega: self.global.omega,
            sigma: self.global.sigma,
            npop: self.scaled_npop(sample.len()),
            step: self.config.step,
            sample_size: sample.len(),
            replicates: self.config.replicates,
            seed: odd_seed(self.config.seed, iteration),
            sequence_length: self.sequence_length,
            averaging: self.config.averaging,
            likelihood_solution: self.global.likelihood,
        };
        let response = self.oracle.estimate(&request)?;

        let adopted = match self.config.precision {
            PrecisionMode::Fine => response.most_likely,
            PrecisionMode::Coarse if response.single.score() > self.config.coarse_epsilon => {
                response.single
            }
            PrecisionMode::Coarse => response.most_likely,
        };
        debug!(
            iteration,
            node = id,
            sample_size = sample.len(),
            npop_estimate = request.npop,
            single = response.single.score(),
            most_likely_npop = response.most_likely.npop,
            adopted_npop = adopted.npop,
            "clade decided"
        );

        if adopted.npop == 1 {
            out.push(Verdict {
                node: id,
                relabel: true,
                members: sample.into_iter().collect(),
            });
            return Ok(());
        }
        self.split(id, out)
    }

    /// `max(1, floor(npop * sample / nu))`.
    fn scaled_npop(&self, sample_size: usize) -> u32 {
        let nu = self.nu.max(1) as u64;
        let scaled = u64::from(self.global.npop) * sample_size as u64 / nu;
        scaled.clamp(1, u64::from(u32::MAX)) as u32
    }

    fn split(&self, id: NodeId, out: &mut Vec<Verdict>) -> Result<()> {
        let Some(node) = self.tree.get_node(id) else {
            return Ok(());
        };
        if self.config.parallel && node.children.len() > 1 {
            return self.visit_siblings(&node.children, out);
        }
        for &child in &node.children {
            self.visit(child, out)?;
        }
        Ok(())
    }

    /// Walk sibling clades concurrently, merging verdicts in child order.
    #[cfg(feature = "parallel")]
    fn visit_siblings(&self, children: &[NodeId], out: &mut Vec<Verdict>) -> Result<()> {
        use rayon::prelude::*;
        let results: Vec<(Vec<Verdict>, Result<()>)> = children
            .par_iter()
            .map(|&child| {
                let mut local = Vec::new();
                let outcome = self.visit(child, &mut local);
                (local, outcome)
            })
            .collect();
        let mut first_error = None;
        for (local, outcome) in results {
            out.extend(local);
            if let Err(err) = outcome {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    #[cfg(not(feature = "parallel"))]
    fn visit_siblings(&self, children: &[NodeId], out: &mut Vec<Verdict>) -> Result<()> {
        for &child in children {
            self.visit(child, out)?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::oracle::OracleResponse;
    use proptest::prelude::*;

    /// Random binary tree with an outgroup on the root; leaves are `s0..`.
    fn random_tree() -> impl Strategy<Value = PhyloTree> {
        proptest::collection::vec((0usize..1000, 0.0f64..0.1, 0.0f64..0.1), 0..15).prop_map(
            |splits| {
                let mut tree = PhyloTree::new();
                tree.add_child(0, Some("O".into()), Some(0.5)).unwrap();
                let ingroup = tree.add_child(0, None, Some(0.05)).unwrap();
                let mut tips = vec![ingroup];
                for (pick, left, right) in splits {
                    let at = tips.swap_remove(pick % tips.len());
                    tips.push(tree.add_child(at, None, Some(left)).unwrap());
                    tips.push(tree.add_child(at, None, Some(right)).unwrap());
                }
                for (i, tip) in tips.into_iter().enumerate() {
                    tree.rename(tip, format!("s{}", i)).unwrap();
                }
                tree.set_outgroup("O").unwrap();
                tree
            },
        )
    }

    fn assert_partition(tree: &PhyloTree, result: &Demarcation) -> std::result::Result<(), TestCaseError> {
        let mut seen = BTreeSet::new();
        for ecotype in result.iter() {
            prop_assert!(!ecotype.is_empty());
            for name in &ecotype.members {
                prop_assert!(seen.insert(name.clone()), "{} assigned twice", name);
            }
        }
        let expected: BTreeSet<String> = tree.sample(tree.root()).into_iter().collect();
        prop_assert_eq!(seen, expected);
        prop_assert!(!result.iter().any(|e| e.contains("O")));
        Ok(())
    }

    proptest! {
        #[test]
        fn splitting_oracle_reaches_every_leaf(tree in random_tree()) {
            let mut tree = tree;
            let oracle = |req: &OracleRequest| -> Result<OracleResponse> {
                let npop = if req.sample_size > 1 { 2 } else { 1 };
                Ok(OracleResponse {
                    single: ParameterSet::new(1, req.omega, req.sigma, 0.0),
                    most_likely: ParameterSet::new(npop, req.omega, req.sigma, 0.3),
                })
            };
            let config = DemarcationConfig::default();
            let global = ParameterSet::new(3, 0.1, 1.0, 0.01);
            let result = demarcate(&mut tree, &global, 500, &config, &oracle).unwrap();
            assert_partition(&tree, &result)?;
            prop_assert_eq!(result.len(), tree.sample(tree.root()).len());
        }

        #[test]
        fn any_verdicts_partition(tree in random_tree(), salt in 0u64..1000, coarse in any::<bool>()) {
            let mut tree = tree;
            let oracle = move |req: &OracleRequest| -> Result<OracleResponse> {
                let roll = (req.seed ^ salt) % 3;
                Ok(OracleResponse {
                    single: ParameterSet::new(1, req.omega, req.sigma, (roll % 2) as f64),
                    most_likely: ParameterSet::new(roll as u32 + 1, req.omega, req.sigma, 0.3),
                })
            };
            let config = DemarcationConfig {
                precision: if coarse { PrecisionMode::Coarse } else { PrecisionMode::Fine },
                ..DemarcationConfig::default()
            };
            let global = ParameterSet::new(2, 0.1, 1.0, 0.01);
            let result = demarcate(&mut tree, &global, 500, &config, &oracle).unwrap();
            assert_partition(&tree, &result)?;
            for ecotype in result.iter().filter(|e| e.len() > 1) {
                prop_assert!(tree.is_collapsed(ecotype.node));
                prop_assert_eq!(tree.get_node(ecotype.node).unwrap().name.as_deref(), Some(ecotype.label.as_str()));
            }
        }
    }
}
