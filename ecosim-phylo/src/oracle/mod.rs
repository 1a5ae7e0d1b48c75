//! The parameter-likelihood oracle boundary.
//!
//! Demarcation never estimates population parameters itself. For every clade
//! it hands the clade's bins and the global estimates to a
//! [`DemarcationOracle`], which answers with two candidates: the best
//! parameter set constrained to a single population, and the parameter set at
//! the most likely number of populations.
//!
//! [`ProcessOracle`] talks to the external solver through request/response
//! files (see [`codec`]); any closure with the right signature is an oracle
//! too, which is how tests and alternative solvers plug in.

pub mod codec;
pub mod process;

use std::fmt;

use ecosim_core::{EcosimError, Result, Scored};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::binning::BinLevel;

pub use process::ProcessOracle;

/// Population parameters estimated for one clade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Number of putative ecotypes.
    pub npop: u32,
    /// Ecotype formation rate.
    pub omega: f64,
    /// Periodic selection rate.
    pub sigma: f64,
    /// Likelihood of the estimate.
    pub likelihood: f64,
}

impl ParameterSet {
    pub fn new(npop: u32, omega: f64, sigma: f64, likelihood: f64) -> Self {
        Self {
            npop,
            omega,
            sigma,
            likelihood,
        }
    }

    /// Check the ranges a global estimate must satisfy before demarcation.
    pub fn validate(&self) -> Result<()> {
        if self.npop < 1 {
            return Err(EcosimError::InvalidInput("npop must be at least 1".into()));
        }
        if !(self.omega.is_finite() && self.omega > 0.0) {
            return Err(EcosimError::InvalidInput(format!(
                "omega must be positive, got {}",
                self.omega
            )));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(EcosimError::InvalidInput(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        if !self.likelihood.is_finite() {
            return Err(EcosimError::InvalidInput(format!(
                "likelihood must be finite, got {}",
                self.likelihood
            )));
        }
        Ok(())
    }
}

impl Scored for ParameterSet {
    fn score(&self) -> f64 {
        self.likelihood
    }
}

impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "npop={} omega={} sigma={} likelihood={}",
            self.npop, self.omega, self.sigma, self.likelihood
        )
    }
}

/// How strictly the solver averages its replicate likelihoods.
///
/// Codes 1 through 6 select increasingly lenient precision targets
/// (5x, 2x, 1.5x, 1.25x, 1.1x and 1.05x).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AveragingCriterion(u8);

impl AveragingCriterion {
    pub fn new(code: u8) -> Result<Self> {
        if (1..=6).contains(&code) {
            Ok(Self(code))
        } else {
            Err(EcosimError::InvalidInput(format!(
                "averaging criterion must be between 1 and 6, got {}",
                code
            )))
        }
    }

    pub fn code(self) -> u8 {
        self.0
    }
}

impl Default for AveragingCriterion {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for AveragingCriterion {
    type Error = EcosimError;

    fn try_from(code: u8) -> Result<Self> {
        Self::new(code)
    }
}

impl From<AveragingCriterion> for u8 {
    fn from(value: AveragingCriterion) -> Self {
        value.0
    }
}

/// Everything the oracle needs to judge one clade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleRequest {
    /// Unique tag of this call within a run; only used to name files.
    pub iteration: usize,
    /// Clade-local bins, ascending threshold.
    pub bins: Vec<BinLevel>,
    pub omega: f64,
    pub sigma: f64,
    /// Scaled starting estimate of the number of populations.
    pub npop: u32,
    pub step: f64,
    /// Number of sequences in the clade.
    pub sample_size: usize,
    pub replicates: u32,
    /// Odd random seed with fewer than nine digits.
    pub seed: u64,
    pub sequence_length: usize,
    pub averaging: AveragingCriterion,
    /// Likelihood of the global solution.
    pub likelihood_solution: f64,
}

/// The two candidates an oracle returns for a clade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OracleResponse {
    /// Best estimate constrained to `npop = 1`.
    pub single: ParameterSet,
    /// Estimate at the most likely `npop`.
    pub most_likely: ParameterSet,
}

/// Anything that can estimate a clade's population parameters.
pub trait DemarcationOracle: Sync {
    fn estimate(&self, request: &OracleRequest) -> Result<OracleResponse>;
}

impl<F> DemarcationOracle for F
where
    F: Fn(&OracleRequest) -> Result<OracleResponse> + Sync,
{
    fn estimate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        self(request)
    }
}

/// Largest seed the solver accepts: eight digits.
const SEED_LIMIT: u64 = 100_000_000;

/// Deterministic odd seed for one oracle call.
///
/// The same `(base, iteration)` pair always gives the same seed, whatever
/// order calls are issued in.
pub fn odd_seed(base: u64, iteration: usize) -> u64 {
    let mixed = base ^ (iteration as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let mut rng = rand::rngs::StdRng::seed_from_u64(mixed);
    rng.random_range(0..SEED_LIMIT / 2) * 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_are_odd_and_short() {
        for iteration in 0..200 {
            let seed = odd_seed(7, iteration);
            assert_eq!(seed % 2, 1);
            assert!(seed < SEED_LIMIT);
        }
    }

    #[test]
    fn seeds_are_reproducible() {
        assert_eq!(odd_seed(42, 3), odd_seed(42, 3));
        let distinct: std::collections::HashSet<u64> = (0..50).map(|i| odd_seed(42, i)).collect();
        assert!(distinct.len() > 40);
    }

    #[test]
    fn averaging_range() {
        assert!(AveragingCriterion::new(0).is_err());
        assert!(AveragingCriterion::new(7).is_err());
        assert_eq!(AveragingCriterion::new(6).unwrap().code(), 6);
        assert_eq!(AveragingCriterion::default().code(), 1);
    }

    #[test]
    fn parameter_validation() {
        assert!(ParameterSet::new(3, 0.5, 2.0, 0.01).validate().is_ok());
        assert!(ParameterSet::new(0, 0.5, 2.0, 0.01).validate().is_err());
        assert!(ParameterSet::new(3, 0.0, 2.0, 0.01).validate().is_err());
        assert!(ParameterSet::new(3, 0.5, -1.0, 0.01).validate().is_err());
        assert!(ParameterSet::new(3, 0.5, 2.0, f64::NAN).validate().is_err());
    }

    #[test]
    fn closures_are_oracles() {
        let oracle = |req: &OracleRequest| -> Result<OracleResponse> {
            let p = ParameterSet::new(1, req.omega, req.sigma, 0.5);
            Ok(OracleResponse {
                single: p,
                most_likely: p,
            })
        };
        let request = OracleRequest {
            iteration: 0,
            bins: vec![BinLevel::new(1.0, 2)],
            omega: 1.0,
            sigma: 2.0,
            npop: 1,
            step: 1.5,
            sample_size: 2,
            replicates: 10,
            seed: 1,
            sequence_length: 100,
            averaging: AveragingCriterion::default(),
            likelihood_solution: 0.1,
        };
        let response = oracle.estimate(&request).unwrap();
        assert_eq!(response.single.score(), 0.5);
        assert_eq!(response.most_likely.sigma, 2.0);
    }
}
