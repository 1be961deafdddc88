//! Run configuration.
//!
//! Every recognized option lives on [`RunConfig`]. Missing JSON fields fall
//! back to the defaults below, so `{}` is a valid configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TestId;

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Configuration of one battery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Length of each bitstream in bits.
    pub n: usize,
    /// Significance level.
    pub alpha: f64,
    pub num_bitstreams: usize,
    /// Number of histogram bins for the uniformity check.
    pub uniformity_bins: usize,
    /// Minimum uniformity p-value for a test to pass.
    pub uniformity_level: f64,
    /// Worker threads used during the iterate phase.
    pub threads: usize,
    /// Use the legacy report layout.
    pub legacy_output: bool,
    /// Write per-test stats.txt, results.txt and data*.txt files.
    pub write_results: bool,
    pub output_dir: PathBuf,
    /// Enabled tests.
    pub tests: BTreeSet<TestId>,
    /// Output partitions per test (absent means 1).
    pub partitions: BTreeMap<TestId, usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n: 1_000_000,
            alpha: 0.01,
            num_bitstreams: 1,
            uniformity_bins: 10,
            uniformity_level: 0.0001,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            legacy_output: false,
            write_results: true,
            output_dir: PathBuf::from("experiments"),
            tests: TestId::ALL.into_iter().collect(),
            partitions: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n == 0 {
            return Err(invalid("n", "bitstream length must be positive"));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(invalid("alpha", format!("{} is not in (0, 1)", self.alpha)));
        }
        if self.num_bitstreams == 0 {
            return Err(invalid("num_bitstreams", "at least one bitstream is required"));
        }
        if self.uniformity_bins < 2 {
            return Err(invalid(
                "uniformity_bins",
                format!("{} < 2", self.uniformity_bins),
            ));
        }
        if !(self.uniformity_level > 0.0 && self.uniformity_level < 1.0) {
            return Err(invalid(
                "uniformity_level",
                format!("{} is not in (0, 1)", self.uniformity_level),
            ));
        }
        if self.threads == 0 {
            return Err(invalid("threads", "at least one worker thread is required"));
        }
        if let Some((test, _)) = self.partitions.iter().find(|&(_, &count)| count == 0) {
            return Err(invalid("partitions", format!("{test} has 0 partitions")));
        }
        Ok(())
    }

    pub fn is_enabled(&self, test: TestId) -> bool {
        self.tests.contains(&test)
    }

    /// Number of output partitions configured for `test`.
    pub fn partition_count(&self, test: TestId) -> usize {
        self.partitions.get(&test).copied().unwrap_or(1)
    }
}
