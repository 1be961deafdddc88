//! Run-wide state shared by every test in the battery.
//!
//! [`RunState`] is created once per run and passed by reference through every
//! lifecycle phase. Single-threaded phases (init, print, metrics, destroy) take
//! `&mut RunState`. The iterate phase takes `&RunState` from many workers at
//! once; the only mutable data it touches is [`SharedState`], behind a single
//! mutex that is held only while an iteration publishes its result.

use std::collections::TryReserveError;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{FatalError, Phase};
use crate::metrics::MetricResult;
use crate::report::{self, ReportStyle};
use crate::store::{DEFAULT_CHUNK, ResultStore};
use crate::universal::UniversalStats;

/// File name of the run-wide summary report.
pub const FINAL_REPORT: &str = "finalAnalysisReport.txt";
/// File name of the machine-readable run summary.
pub const SUMMARY_JSON: &str = "summary.json";

// ═══════════════════════════════════════════════════════════════════════════════
// Test identity
// ═══════════════════════════════════════════════════════════════════════════════

/// A statistical test of the battery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TestId {
    Universal,
}

impl TestId {
    pub const ALL: [TestId; 1] = [TestId::Universal];

    pub fn name(self) -> &'static str {
        match self {
            TestId::Universal => "Universal",
        }
    }

    /// Position of this test in per-test tables.
    pub fn index(self) -> usize {
        match self {
            TestId::Universal => 0,
        }
    }

    /// First exit code of this test's reserved range.
    pub fn exit_code_base(self) -> i32 {
        match self {
            TestId::Universal => 200,
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Counters and p-value classification
// ═══════════════════════════════════════════════════════════════════════════════

/// Derived constants shared by all tests.
#[derive(Debug, Clone, Copy)]
pub struct Constants {
    pub ln2: f64,
    pub sqrt2: f64,
}

impl Default for Constants {
    fn default() -> Self {
        Self {
            ln2: std::f64::consts::LN_2,
            sqrt2: std::f64::consts::SQRT_2,
        }
    }
}

/// How a single computed p-value is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// `alpha <= p <= 1`.
    Success,
    /// `0 <= p < alpha`.
    Failure,
    /// `p` outside `[0, 1]` or not finite.
    Bogus,
}

pub fn classify_p_value(p: f64, alpha: f64) -> Verdict {
    if !(0.0..=1.0).contains(&p) {
        Verdict::Bogus
    } else if p < alpha {
        Verdict::Failure
    } else {
        Verdict::Success
    }
}

/// Aggregate per-test tallies. Only ever incremented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Iterations performed.
    pub count: u64,
    /// Iterations that produced a p-value.
    pub valid: u64,
    /// p-values inside `[0, 1]`.
    pub valid_p: u64,
    pub success: u64,
    pub failure: u64,
}

impl Counters {
    pub fn record(&mut self, verdict: Verdict) {
        self.count += 1;
        self.valid += 1;
        match verdict {
            Verdict::Success => {
                self.valid_p += 1;
                self.success += 1;
            }
            Verdict::Failure => {
                self.valid_p += 1;
                self.failure += 1;
            }
            Verdict::Bogus => self.failure += 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared tallies
// ═══════════════════════════════════════════════════════════════════════════════

/// Private per-iteration statistics, one variant per test.
#[derive(Debug, Clone, PartialEq)]
pub enum PrivateStats {
    Universal(UniversalStats),
}

impl PrivateStats {
    pub fn success(&self) -> bool {
        match self {
            PrivateStats::Universal(stat) => stat.success,
        }
    }
}

/// Counters and result stores of one test.
#[derive(Debug, Default)]
pub struct TestTally {
    pub counters: Counters,
    /// One entry per published p-value; `None` means not computed.
    pub p_val: Option<ResultStore<Option<f64>>>,
    /// Parallel to `p_val` when results files are enabled.
    pub stats: Option<ResultStore<PrivateStats>>,
    /// Iteration (bitstream) index of each `p_val` entry.
    pub order: Option<ResultStore<usize>>,
}

impl TestTally {
    /// Allocate stores sized for `expected` p-values.
    pub fn allocate(&mut self, expected: usize, with_stats: bool) -> Result<(), TryReserveError> {
        self.p_val = Some(ResultStore::new(DEFAULT_CHUNK, expected)?);
        self.order = Some(ResultStore::new(DEFAULT_CHUNK, expected)?);
        self.stats = if with_stats {
            Some(ResultStore::new(DEFAULT_CHUNK, expected)?)
        } else {
            None
        };
        Ok(())
    }

    /// Append one iteration's p-value (and stats, when kept).
    pub fn publish(
        &mut self,
        iteration: usize,
        p_value: Option<f64>,
        stat: PrivateStats,
    ) -> Result<(), TryReserveError> {
        if let Some(stats) = self.stats.as_mut() {
            stats.append(stat)?;
        }
        if let Some(order) = self.order.as_mut() {
            order.append(iteration)?;
        }
        if let Some(p_val) = self.p_val.as_mut() {
            p_val.append(p_value)?;
        }
        Ok(())
    }

    /// Number of published p-values.
    pub fn len(&self) -> usize {
        self.p_val.as_ref().map_or(0, ResultStore::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store positions sorted by iteration index (stable for equal indices).
    pub fn ordered_positions(&self) -> Vec<usize> {
        let mut positions: Vec<usize> = (0..self.len()).collect();
        if let Some(order) = self.order.as_ref() {
            positions.sort_by_key(|&pos| order.get(pos).copied().unwrap_or(usize::MAX));
        }
        positions
    }

    /// p-values in iteration order.
    pub fn ordered_p_values(&self) -> Vec<Option<f64>> {
        let Some(p_val) = self.p_val.as_ref() else {
            return Vec::new();
        };
        self.ordered_positions()
            .into_iter()
            .map(|pos| p_val[pos])
            .collect()
    }

    /// Drop every store, keeping the counters.
    pub fn release(&mut self) {
        self.p_val = None;
        self.stats = None;
        self.order = None;
    }
}

/// Everything the iterate phase may mutate.
#[derive(Debug)]
pub struct SharedState {
    tallies: Vec<TestTally>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            tallies: TestId::ALL.iter().map(|_| TestTally::default()).collect(),
        }
    }

    pub fn tally(&self, test: TestId) -> &TestTally {
        &self.tallies[test.index()]
    }

    pub fn tally_mut(&mut self, test: TestId) -> &mut TestTally {
        &mut self.tallies[test.index()]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run state
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-test configuration and verdicts that only single-threaded phases touch.
#[derive(Debug, Clone)]
pub struct TestSlot {
    pub enabled: bool,
    pub initialized: bool,
    pub partition_count: usize,
    /// Only strictly positive p-values count as samples.
    pub is_excursion: bool,
    pub p_values_per_iteration: usize,
    /// Directory for stats.txt, results.txt and data*.txt.
    pub sub_dir: Option<PathBuf>,
    /// One entry per partition, filled by the metrics phase.
    pub metric_results: Vec<MetricResult>,
}

/// Configuration, counters and artifacts of one battery run.
pub struct RunState {
    pub config: RunConfig,
    pub constants: Constants,
    id: String,
    started_at_unix_ms: u64,
    style: &'static dyn ReportStyle,
    slots: Vec<TestSlot>,
    shared: Mutex<SharedState>,
    final_report: BufWriter<File>,
    final_report_path: PathBuf,
    /// Partitions whose uniformity and proportion checks both passed.
    pub successful_tests: u64,
    pub max_general_sample_size: u64,
    pub max_excursion_sample_size: u64,
}

impl RunState {
    /// Validate `config`, create the output directory and open the final report.
    pub fn new(config: RunConfig) -> Result<Self, FatalError> {
        config.validate().map_err(|e| FatalError::Precondition {
            test: None,
            phase: Phase::Setup,
            reason: e.to_string(),
        })?;

        let setup_io = |path: &Path, e| FatalError::io(None, Phase::Setup, path, e);
        fs::create_dir_all(&config.output_dir).map_err(|e| setup_io(&config.output_dir, e))?;
        let final_report_path = config.output_dir.join(FINAL_REPORT);
        let file = File::create(&final_report_path).map_err(|e| setup_io(&final_report_path, e))?;
        let mut final_report = BufWriter::new(file);

        let style = report::style_for(config.legacy_output);
        style
            .final_report_header(&mut final_report, config.uniformity_bins)
            .map_err(|e| setup_io(&final_report_path, e))?;

        let slots = TestId::ALL
            .iter()
            .map(|&test| TestSlot {
                enabled: config.is_enabled(test),
                initialized: false,
                partition_count: config.partition_count(test),
                is_excursion: false,
                p_values_per_iteration: 1,
                sub_dir: None,
                metric_results: Vec::new(),
            })
            .collect();

        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Ok(Self {
            config,
            constants: Constants::default(),
            id: Uuid::new_v4().to_string(),
            started_at_unix_ms,
            style,
            slots,
            shared: Mutex::new(SharedState::new()),
            final_report,
            final_report_path,
            successful_tests: 0,
            max_general_sample_size: 0,
            max_excursion_sample_size: 0,
        })
    }

    /// Unique id of this run.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn style(&self) -> &'static dyn ReportStyle {
        self.style
    }

    pub fn slot(&self, test: TestId) -> &TestSlot {
        &self.slots[test.index()]
    }

    pub fn slot_mut(&mut self, test: TestId) -> &mut TestSlot {
        &mut self.slots[test.index()]
    }

    pub fn is_enabled(&self, test: TestId) -> bool {
        self.slot(test).enabled
    }

    /// Turn a test off for the rest of the run.
    pub fn disable(&mut self, test: TestId) {
        self.slot_mut(test).enabled = false;
    }

    /// Lock the shared tallies. Used by workers during the iterate phase.
    pub fn lock_shared(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct access to the shared tallies outside the iterate phase.
    pub fn shared_mut(&mut self) -> &mut SharedState {
        self.shared.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn final_report_path(&self) -> &Path {
        &self.final_report_path
    }

    pub(crate) fn final_report_mut(&mut self) -> &mut BufWriter<File> {
        &mut self.final_report
    }

    /// Flush the final report and write summary.json.
    pub fn finish(mut self) -> Result<RunSummary, FatalError> {
        let finish_io = |path: &Path, e| FatalError::io(None, Phase::Finish, path, e);
        self.final_report
            .flush()
            .map_err(|e| finish_io(&self.final_report_path, e))?;

        let summary = self.summary();
        let summary_path = self.config.output_dir.join(SUMMARY_JSON);
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| finish_io(&summary_path, e.into()))?;
        fs::write(&summary_path, json).map_err(|e| finish_io(&summary_path, e))?;

        log::info!(
            "run {} finished: {} partition(s) passed both metrics",
            summary.id,
            summary.successful_tests
        );
        Ok(summary)
    }

    /// Snapshot of counters and verdicts.
    pub fn summary(&mut self) -> RunSummary {
        let counters: Vec<Counters> = TestId::ALL
            .iter()
            .map(|&test| self.shared_mut().tally(test).counters)
            .collect();
        let tests = TestId::ALL
            .iter()
            .zip(counters)
            .map(|(&test, counters)| {
                let slot = self.slot(test);
                TestSummary {
                    name: test.name().to_string(),
                    enabled: slot.enabled,
                    partition_count: slot.partition_count,
                    counters,
                    metric_results: slot.metric_results.clone(),
                }
            })
            .collect();
        RunSummary {
            id: self.id.clone(),
            started_at_unix_ms: self.started_at_unix_ms,
            sts_battery_version: crate::VERSION.to_string(),
            config: self.config.clone(),
            tests,
            successful_tests: self.successful_tests,
            max_general_sample_size: self.max_general_sample_size,
            max_excursion_sample_size: self.max_excursion_sample_size,
        }
    }
}

/// Per-test section of [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub name: String,
    pub enabled: bool,
    pub partition_count: usize,
    pub counters: Counters,
    pub metric_results: Vec<MetricResult>,
}

/// Contents of summary.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub started_at_unix_ms: u64,
    pub sts_battery_version: String,
    pub config: RunConfig,
    pub tests: Vec<TestSummary>,
    pub successful_tests: u64,
    pub max_general_sample_size: u64,
    pub max_excursion_sample_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(success: bool) -> PrivateStats {
        PrivateStats::Universal(UniversalStats {
            success,
            ..UniversalStats::default()
        })
    }

    #[test]
    fn test_classify_p_value() {
        assert_eq!(classify_p_value(0.5, 0.01), Verdict::Success);
        assert_eq!(classify_p_value(0.01, 0.01), Verdict::Success);
        assert_eq!(classify_p_value(0.009, 0.01), Verdict::Failure);
        assert_eq!(classify_p_value(0.0, 0.01), Verdict::Failure);
        assert_eq!(classify_p_value(1.0, 0.01), Verdict::Success);
        assert_eq!(classify_p_value(-0.1, 0.01), Verdict::Bogus);
        assert_eq!(classify_p_value(1.5, 0.01), Verdict::Bogus);
        assert_eq!(classify_p_value(f64::NAN, 0.01), Verdict::Bogus);
    }

    #[test]
    fn test_counters_record() {
        let mut c = Counters::default();
        c.record(Verdict::Success);
        c.record(Verdict::Failure);
        c.record(Verdict::Bogus);
        assert_eq!(
            c,
            Counters {
                count: 3,
                valid: 3,
                valid_p: 2,
                success: 1,
                failure: 2,
            }
        );
    }

    #[test]
    fn test_tally_orders_by_iteration() {
        let mut tally = TestTally::default();
        tally.allocate(4, true).unwrap();
        tally.publish(2, Some(0.2), stat(true)).unwrap();
        tally.publish(0, Some(0.0), stat(false)).unwrap();
        tally.publish(3, None, stat(false)).unwrap();
        tally.publish(1, Some(0.1), stat(true)).unwrap();
        assert_eq!(tally.len(), 4);
        assert_eq!(tally.ordered_positions(), vec![1, 3, 0, 2]);
        assert_eq!(
            tally.ordered_p_values(),
            vec![Some(0.0), Some(0.1), Some(0.2), None]
        );
        tally.release();
        assert!(tally.is_empty());
        assert!(tally.stats.is_none());
    }

    #[test]
    fn test_tally_without_stats() {
        let mut tally = TestTally::default();
        tally.allocate(1, false).unwrap();
        tally.publish(0, Some(0.5), stat(true)).unwrap();
        assert!(tally.stats.is_none());
        assert_eq!(tally.len(), 1);
    }

    #[test]
    fn test_run_state_new_creates_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output_dir: dir.path().join("out"),
            ..RunConfig::default()
        };
        let state = RunState::new(config).unwrap();
        assert!(state.final_report_path().exists());
        assert!(state.is_enabled(TestId::Universal));
        assert_eq!(state.slot(TestId::Universal).partition_count, 1);
        assert_eq!(state.id().len(), 36);
    }

    #[test]
    fn test_run_state_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            alpha: 0.0,
            output_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let err = RunState::new(config).err().unwrap();
        assert_eq!(err.phase(), Phase::Setup);
        assert_eq!(err.exit_code(), crate::error::RUN_EXIT_BASE + 8);
    }

    #[test]
    fn test_finish_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let mut state = RunState::new(config).unwrap();
        state.disable(TestId::Universal);
        let summary = state.finish().unwrap();
        assert!(!summary.tests[0].enabled);
        let text = std::fs::read_to_string(dir.path().join(SUMMARY_JSON)).unwrap();
        let parsed: RunSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, summary);
    }
}
