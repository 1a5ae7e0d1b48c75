//! Demarcation settings, loadable from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration:
//!
//! ```toml
//! thresholds = [0.80, 0.90, 0.95, 0.99, 1.0]
//! precision = "coarse"
//! label-prefix = "Ecotype"
//!
//! [oracle]
//! program = "/opt/es/bin/demarcation"
//! work-dir = "/tmp/es"
//! timeout-secs = 300
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ecosim_core::{EcosimError, Result};
use serde::{Deserialize, Serialize};

use crate::binning::DEFAULT_THRESHOLDS;
use crate::oracle::AveragingCriterion;

/// How demarcation chooses between the oracle's two candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrecisionMode {
    /// Always adopt the most likely number of populations.
    #[default]
    Fine,
    /// Adopt the single-population candidate whenever its likelihood is
    /// above `coarse-epsilon`.
    Coarse,
}

/// How to reach the external solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OracleProcessConfig {
    #[serde(default = "OracleProcessConfig::default_program")]
    pub program: PathBuf,
    /// Arguments placed before the input and output file paths.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "OracleProcessConfig::default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "OracleProcessConfig::default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub keep_files: bool,
}

impl OracleProcessConfig {
    fn default_program() -> PathBuf {
        PathBuf::from("demarcation")
    }
    fn default_work_dir() -> PathBuf {
        PathBuf::from(".")
    }
    fn default_timeout_secs() -> f64 {
        600.0
    }

    /// The per-call limit as a [`Duration`].
    ///
    /// Fails unless `timeout-secs` is positive and small enough to be
    /// represented.
    pub fn timeout(&self) -> Result<Duration> {
        let secs = self.timeout_secs;
        if !(secs > 0.0) {
            return Err(EcosimError::Config(format!(
                "oracle.timeout-secs: {} must be positive",
                secs
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(|e| {
            EcosimError::Config(format!("oracle.timeout-secs: {} is unusable: {}", secs, e))
        })
    }
}

impl Default for OracleProcessConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Vec::new(),
            work_dir: Self::default_work_dir(),
            timeout_secs: Self::default_timeout_secs(),
            keep_files: false,
        }
    }
}

/// Settings for one demarcation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DemarcationConfig {
    /// Identity thresholds, strictly ascending, each in `[0, 1]`.
    #[serde(default = "DemarcationConfig::default_thresholds")]
    pub thresholds: Vec<f64>,
    #[serde(default)]
    pub precision: PrecisionMode,
    #[serde(default = "DemarcationConfig::default_coarse_epsilon")]
    pub coarse_epsilon: f64,
    /// Drop bin levels repeating the previous cluster count before each
    /// oracle call.
    #[serde(default)]
    pub compact_bins: bool,
    #[serde(default = "DemarcationConfig::default_step")]
    pub step: f64,
    #[serde(default = "DemarcationConfig::default_replicates")]
    pub replicates: u32,
    #[serde(default)]
    pub averaging: AveragingCriterion,
    /// Base for the per-call solver seeds.
    #[serde(default = "DemarcationConfig::default_seed")]
    pub seed: u64,
    #[serde(default = "DemarcationConfig::default_label_prefix")]
    pub label_prefix: String,
    /// Walk sibling clades concurrently (needs the `parallel` feature).
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub oracle: OracleProcessConfig,
}

impl DemarcationConfig {
    fn default_thresholds() -> Vec<f64> {
        DEFAULT_THRESHOLDS.to_vec()
    }
    fn default_coarse_epsilon() -> f64 {
        1e-6
    }
    fn default_step() -> f64 {
        1.5
    }
    fn default_replicates() -> u32 {
        1000
    }
    fn default_seed() -> u64 {
        1
    }
    fn default_label_prefix() -> String {
        "Ecotype".to_string()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EcosimError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            EcosimError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EcosimError::Config(e.to_string()))
    }

    /// Check every field, naming the first offending one.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self
            .thresholds
            .iter()
            .find(|t| !(0.0..=1.0).contains(*t))
        {
            return Err(EcosimError::Config(format!(
                "thresholds: {} is outside [0, 1]",
                t
            )));
        }
        if let Some(pair) = self.thresholds.windows(2).find(|w| w[0] >= w[1]) {
            return Err(EcosimError::Config(format!(
                "thresholds: {} followed by {} is not ascending",
                pair[0], pair[1]
            )));
        }
        if !(self.coarse_epsilon.is_finite() && self.coarse_epsilon >= 0.0) {
            return Err(EcosimError::Config(format!(
                "coarse-epsilon: {} must be a non-negative number",
                self.coarse_epsilon
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(EcosimError::Config(format!(
                "step: {} must be positive",
                self.step
            )));
        }
        if self.replicates == 0 {
            return Err(EcosimError::Config("replicates: must be at least 1".into()));
        }
        if self.label_prefix.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(EcosimError::Config(format!(
                "label-prefix: '{}' must not contain whitespace",
                self.label_prefix
            )));
        }
        self.oracle.timeout()?;
        Ok(())
    }
}

impl Default for DemarcationConfig {
    fn default() -> Self {
        Self {
            thresholds: Self::default_thresholds(),
            precision: PrecisionMode::default(),
            coarse_epsilon: Self::default_coarse_epsilon(),
            compact_bins: false,
            step: Self::default_step(),
            replicates: Self::default_replicates(),
            averaging: AveragingCriterion::default(),
            seed: Self::default_seed(),
            label_prefix: Self::default_label_prefix(),
            parallel: false,
            oracle: OracleProcessConfig::default(),
        }
    }
}
