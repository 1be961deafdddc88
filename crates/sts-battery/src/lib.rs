//! # sts-battery
//!
//! Lifecycle-driven statistical test battery for bitstreams, in the style of
//! NIST SP 800-22.
//!
//! Each test runs `init -> iterate -> print -> metrics -> destroy`. The iterate
//! phase processes every bitstream on a pool of worker threads; all other
//! phases are single-threaded. Per-iteration p-values are collected into
//! growable result stores, written out in bitstream order, and analyzed for
//! uniformity and proportion of passing sequences.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sts_battery::{BitBuffer, RunConfig, run_battery};
//!
//! let config = RunConfig {
//!     n: 1_000_000,
//!     num_bitstreams: 4,
//!     ..RunConfig::default()
//! };
//! let streams: Vec<BitBuffer> = (0..4)
//!     .map(|_| BitBuffer::from_bytes(&vec![0x5a; 125_000]))
//!     .collect();
//! let summary = run_battery(config, &streams).unwrap();
//! println!("{} partition(s) passed", summary.successful_tests);
//! ```
//!
//! Artifacts land in [`RunConfig::output_dir`]: a sub-directory per test with
//! `stats.txt`, `results.txt` and `dataK.txt`, plus `finalAnalysisReport.txt`
//! and `summary.json` for the whole run.
//!
//! Only Maurer's Universal test is implemented. New tests add a [`TestId`]
//! variant, a [`PrivateStats`] variant and a [`BatteryTest`] variant.

pub mod bits;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod report;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod universal;

pub use bits::{BitBuffer, BitError};
pub use config::{ConfigError, RunConfig};
pub use driver::{Battery, BatteryTest, TestLifecycle, run_battery, run_test};
pub use error::{FatalError, Phase, exit_with};
pub use metrics::{CheckStatus, MetricResult, MetricSummary};
pub use report::{LegacyStyle, ModernStyle, ReportStyle};
pub use scheduler::ThreadContext;
pub use state::{
    Counters, PrivateStats, RunState, RunSummary, TestId, TestSummary, Verdict, classify_p_value,
};
pub use store::ResultStore;
pub use universal::{UniversalStats, UniversalTest};

/// Crate version, recorded in summary.json.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
