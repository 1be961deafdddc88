//! Post-hoc analysis of a test's p-values across all bitstreams.
//!
//! Two checks are made per partition:
//! - **uniformity**: a chi-square test over a histogram of the p-values in
//!   `[0, 1]`. Needs at least one sample per bin.
//! - **proportion**: the number of p-values `>= alpha` must fall within
//!   three standard deviations of the binomial expectation `(1 - alpha) * N`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::error::{FatalError, Phase};
use crate::state::{RunState, TestId};

/// Combined verdict of the two checks for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricResult {
    PassedBoth,
    FailedUniformity,
    FailedProportion,
    FailedBoth,
}

impl MetricResult {
    fn from_checks(uniformity: CheckStatus, proportion: CheckStatus) -> Self {
        match (uniformity.passed(), proportion.passed()) {
            (true, true) => MetricResult::PassedBoth,
            (false, true) => MetricResult::FailedUniformity,
            (true, false) => MetricResult::FailedProportion,
            (false, false) => MetricResult::FailedBoth,
        }
    }
}

/// Outcome of a single check. Insufficient data does not count as passing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Passed,
    Failed,
    InsufficientData,
}

impl CheckStatus {
    pub fn passed(self) -> bool {
        self == CheckStatus::Passed
    }
}

/// Histogram and pass/fail counts of one partition's p-values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTally {
    pub sample_count: u64,
    /// Samples below alpha.
    pub too_low: u64,
    pub freq_per_bin: Vec<u64>,
}

impl PartitionTally {
    pub fn new(bins: usize) -> Self {
        Self {
            sample_count: 0,
            too_low: 0,
            freq_per_bin: vec![0; bins],
        }
    }

    /// Count one p-value. `None` is never a sample; for excursion-class
    /// tests neither is a p-value `<= 0`.
    pub fn add(&mut self, p_value: Option<f64>, alpha: f64, is_excursion: bool) {
        let Some(p) = p_value else {
            return;
        };
        if is_excursion && (p <= 0.0 || p.is_nan()) {
            return;
        }
        self.sample_count += 1;
        if p < alpha || p.is_nan() {
            self.too_low += 1;
        }
        let bins = self.freq_per_bin.len();
        if bins == 0 {
            return;
        }
        let bin = if p >= 1.0 {
            bins - 1
        } else if p >= 0.0 {
            ((p * bins as f64).floor() as usize).min(bins - 1)
        } else {
            0
        };
        self.freq_per_bin[bin] += 1;
    }

    pub fn pass_count(&self) -> u64 {
        self.sample_count.saturating_sub(self.too_low)
    }
}

/// Tally a sequence of p-values into `bins` uniformity bins.
pub fn tally_partition(
    p_values: impl IntoIterator<Item = Option<f64>>,
    bins: usize,
    alpha: f64,
    is_excursion: bool,
) -> PartitionTally {
    let mut tally = PartitionTally::new(bins);
    for p in p_values {
        tally.add(p, alpha, is_excursion);
    }
    tally
}

/// Chi-square survival probability of the histogram against a flat expectation.
///
/// Returns `None` when there are fewer samples than bins.
pub fn uniformity_p_value(freq_per_bin: &[u64], sample_count: u64) -> Option<f64> {
    let bins = freq_per_bin.len();
    if bins < 2 || sample_count < bins as u64 {
        return None;
    }
    let expected = sample_count as f64 / bins as f64;
    let chi2: f64 = freq_per_bin
        .iter()
        .map(|&f| {
            let diff = f as f64 - expected;
            diff * diff / expected
        })
        .sum();
    let dist = ChiSquared::new((bins - 1) as f64).ok()?;
    Some(dist.sf(chi2))
}

/// Acceptable range of passing samples, or `None` with no samples.
pub fn proportion_bounds(alpha: f64, sample_count: u64) -> Option<(f64, f64)> {
    if sample_count == 0 {
        return None;
    }
    let n = sample_count as f64;
    let p_hat = 1.0 - alpha;
    let spread = 3.0 * (p_hat * alpha / n).sqrt();
    Some(((p_hat - spread) * n, (p_hat + spread) * n))
}

/// Both checks evaluated for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSummary {
    pub tally: PartitionTally,
    pub uniformity: Option<f64>,
    pub uniformity_status: CheckStatus,
    pub pass_count: u64,
    pub proportion_bounds: Option<(f64, f64)>,
    pub proportion_status: CheckStatus,
    pub result: MetricResult,
}

pub fn evaluate(tally: PartitionTally, alpha: f64, uniformity_level: f64) -> MetricSummary {
    let uniformity = uniformity_p_value(&tally.freq_per_bin, tally.sample_count);
    let uniformity_status = match uniformity {
        None => CheckStatus::InsufficientData,
        Some(u) if u >= uniformity_level => CheckStatus::Passed,
        Some(_) => CheckStatus::Failed,
    };

    let pass_count = tally.pass_count();
    let bounds = proportion_bounds(alpha, tally.sample_count);
    let proportion_status = match bounds {
        None => CheckStatus::InsufficientData,
        Some((min, max)) if (min..=max).contains(&(pass_count as f64)) => CheckStatus::Passed,
        Some(_) => CheckStatus::Failed,
    };

    MetricSummary {
        tally,
        uniformity,
        uniformity_status,
        pass_count,
        proportion_bounds: bounds,
        proportion_status,
        result: MetricResult::from_checks(uniformity_status, proportion_status),
    }
}

/// The metrics phase: analyze every partition of `test`, append one final
/// report line per partition and record the verdicts on the test's slot.
pub fn run_metrics(state: &mut RunState, test: TestId) -> Result<Vec<MetricSummary>, FatalError> {
    let slot = state.slot(test);
    if !slot.enabled {
        log::debug!("metrics for {test} called while the test is disabled");
        return Ok(Vec::new());
    }
    if !slot.initialized {
        return Err(FatalError::NotInitialized {
            test,
            phase: Phase::Metrics,
        });
    }
    let partitions = slot.partition_count;
    let is_excursion = slot.is_excursion;
    let expected = state.config.num_bitstreams * slot.p_values_per_iteration;
    let (alpha, bins, level) = (
        state.config.alpha,
        state.config.uniformity_bins,
        state.config.uniformity_level,
    );

    let ordered = state.shared_mut().tally(test).ordered_p_values();
    if ordered.len() != expected {
        log::warn!(
            "metrics for {test}: {} p-values recorded, expected {expected}",
            ordered.len()
        );
    }

    let style = state.style();
    let mut summaries = Vec::with_capacity(partitions);
    for j in 0..partitions {
        let tally = tally_partition(
            ordered.iter().copied().skip(j).step_by(partitions),
            bins,
            alpha,
            is_excursion,
        );
        let summary = evaluate(tally, alpha, level);

        style
            .metric_line(state.final_report_mut(), test.name(), &summary)
            .map_err(|e| {
                FatalError::io(Some(test), Phase::MetricPrint, state.final_report_path(), e)
            })?;
        log::debug!("{test} partition {j}: {:?}", summary.result);

        if summary.result == MetricResult::PassedBoth {
            state.successful_tests += 1;
        }
        let samples = summary.tally.sample_count;
        if is_excursion {
            state.max_excursion_sample_size = state.max_excursion_sample_size.max(samples);
        } else {
            state.max_general_sample_size = state.max_general_sample_size.max(samples);
        }
        summaries.push(summary);
    }

    std::io::Write::flush(state.final_report_mut())
        .map_err(|e| FatalError::io(Some(test), Phase::MetricPrint, state.final_report_path(), e))?;

    state.slot_mut(test).metric_results = summaries.iter().map(|s| s.result).collect();
    Ok(summaries)
}
