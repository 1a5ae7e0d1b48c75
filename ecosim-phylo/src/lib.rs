//! Phylogenetic binning and recursive ecotype demarcation.
//!
//! Takes a rooted phylogeny with a designated outgroup and partitions its
//! sequences into putative ecotypes:
//!
//! - **Tree data structures**: arena-backed [`PhyloTree`] with outgroup and collapse annotations
//! - **Newick I/O**: [`newick::parse`], [`newick::write`] and [`newick::write_collapsed`]
//! - **Binning**: cluster counts per identity threshold via [`compute_bins`]
//! - **Demarcation**: top-down clade splitting driven by a [`DemarcationOracle`]
//! - **Process oracle**: [`ProcessOracle`] runs an external solver over request/response files
//! - **Configuration**: TOML-backed [`DemarcationConfig`]
//!
//! # Example
//!
//! ```
//! use ecosim_phylo::{demarcate, DemarcationConfig, OracleRequest, OracleResponse, ParameterSet, PhyloTree};
//!
//! let mut tree = PhyloTree::from_newick("(O:0.4,((A:0.01,B:0.01):0.13,(C:0.06,D:0.04):0.05):0.1);").unwrap();
//! tree.set_outgroup("O").unwrap();
//!
//! // A stand-in solver: clades of more than two sequences hold two populations.
//! let oracle = |req: &OracleRequest| -> ecosim_core::Result<OracleResponse> {
//!     let npop = if req.sample_size > 2 { 2 } else { 1 };
//!     Ok(OracleResponse {
//!         single: ParameterSet::new(1, req.omega, req.sigma, 0.0),
//!         most_likely: ParameterSet::new(npop, req.omega, req.sigma, 0.5),
//!     })
//! };
//!
//! let global = ParameterSet::new(2, 0.5, 4.0, 0.02);
//! let config = DemarcationConfig::default();
//! let result = demarcate(&mut tree, &global, 1000, &config, &oracle).unwrap();
//!
//! assert_eq!(result.len(), 2);
//! assert_eq!(tree.to_collapsed_newick(), "(O:0.4,(Ecotype1:0.13,Ecotype2:0.05):0.1);");
//! ```

pub mod binning;
pub mod config;
pub mod demarcation;
pub mod newick;
pub mod oracle;
pub mod tree;

pub use binning::{compact_bins, compute_bins, compute_tree_bins, BinLevel, DEFAULT_THRESHOLDS};
pub use config::{DemarcationConfig, OracleProcessConfig, PrecisionMode};
pub use demarcation::{demarcate, Demarcation, Demarcator, Ecotype};
pub use oracle::{
    AveragingCriterion, DemarcationOracle, OracleRequest, OracleResponse, ParameterSet,
    ProcessOracle,
};
pub use tree::{Node, NodeId, PhyloTree};
