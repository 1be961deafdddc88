//! Text artifacts of a run.
//!
//! Per enabled test, under `<output_dir>/<TestName>/`:
//! - `stats.txt`: one statistics block per bitstream
//! - `results.txt`: one p-value per line
//! - `dataK.txt`: partition `K` of the p-values, only when a test has more
//!   than one partition
//!
//! Run-wide, `finalAnalysisReport.txt` receives one line per test partition
//! from the metrics phase. The layout of the stats blocks and report lines is
//! chosen once per run through [`ReportStyle`].

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{FatalError, Phase};
use crate::metrics::{CheckStatus, MetricSummary};
use crate::state::{PrivateStats, RunState, TestId};

/// Written in place of a p-value that was not computed.
pub const INVALID_P_VALUE: &str = "__INVALID__";

/// Layout of the human-readable reports.
pub trait ReportStyle: Send + Sync {
    /// Header of finalAnalysisReport.txt.
    fn final_report_header(&self, out: &mut dyn Write, bins: usize) -> io::Result<()>;

    /// Title of a stats.txt block.
    fn stat_title(&self, out: &mut dyn Write, title: &str) -> io::Result<()>;

    /// Line reporting bits left over after the last full block.
    fn discarded_bits(&self, out: &mut dyn Write, label: &str, discarded: i64) -> io::Result<()>;

    /// One finalAnalysisReport.txt line for a test partition.
    fn metric_line(
        &self,
        out: &mut dyn Write,
        name: &str,
        summary: &MetricSummary,
    ) -> io::Result<()>;
}

/// The classic NIST STS layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyStyle;

/// Compact key=value layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernStyle;

pub fn style_for(legacy: bool) -> &'static dyn ReportStyle {
    if legacy { &LegacyStyle } else { &ModernStyle }
}

const RULE: &str =
    "------------------------------------------------------------------------------";

impl ReportStyle for LegacyStyle {
    fn final_report_header(&self, out: &mut dyn Write, bins: usize) -> io::Result<()> {
        writeln!(out, "{RULE}")?;
        writeln!(
            out,
            "RESULTS FOR THE UNIFORMITY OF P-VALUES AND THE PROPORTION OF PASSING SEQUENCES"
        )?;
        writeln!(out, "{RULE}")?;
        for i in 1..=bins {
            write!(out, "{:>3} ", format!("C{i}"))?;
        }
        writeln!(out, " P-VALUE  PROPORTION  STATISTICAL TEST")?;
        writeln!(out, "{RULE}")
    }

    fn stat_title(&self, out: &mut dyn Write, title: &str) -> io::Result<()> {
        writeln!(out, "\t\t{}", title.to_uppercase())?;
        writeln!(out, "\t\t--------------------------------------------")?;
        writeln!(out, "\t\tCOMPUTATIONAL INFORMATION:")
    }

    fn discarded_bits(&self, out: &mut dyn Write, label: &str, discarded: i64) -> io::Result<()> {
        writeln!(out, "\t\t{label} WARNING:  {discarded} bits were discarded.")
    }

    fn metric_line(
        &self,
        out: &mut dyn Write,
        name: &str,
        summary: &MetricSummary,
    ) -> io::Result<()> {
        for freq in &summary.tally.freq_per_bin {
            write!(out, "{freq:3} ")?;
        }

        match (summary.uniformity_status, summary.uniformity) {
            (CheckStatus::Passed, Some(u)) => write!(out, " {u:8.6}   ")?,
            (CheckStatus::Failed, Some(u)) => write!(out, " {u:8.6} * ")?,
            _ => write!(out, "    ----    ")?,
        }

        let samples = summary.tally.sample_count;
        match summary.proportion_status {
            CheckStatus::InsufficientData => writeln!(out, " ------     {name}"),
            CheckStatus::Failed => {
                writeln!(out, "{:4}/{:<4} *\t {name}", summary.pass_count, samples)
            }
            CheckStatus::Passed => {
                writeln!(out, "{:4}/{:<4}\t {name}", summary.pass_count, samples)
            }
        }
    }
}

fn status_word(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Passed => "passed",
        CheckStatus::Failed => "failed",
        CheckStatus::InsufficientData => "insufficient",
    }
}

impl ReportStyle for ModernStyle {
    fn final_report_header(&self, out: &mut dyn Write, bins: usize) -> io::Result<()> {
        writeln!(
            out,
            "# test bins[{bins}] uniformity uniformity_status proportion proportion_status result"
        )
    }

    fn stat_title(&self, out: &mut dyn Write, title: &str) -> io::Result<()> {
        writeln!(out, "\t\t{title}")
    }

    fn discarded_bits(&self, out: &mut dyn Write, label: &str, discarded: i64) -> io::Result<()> {
        writeln!(out, "\t\t{label} discarded = {discarded}")
    }

    fn metric_line(
        &self,
        out: &mut dyn Write,
        name: &str,
        summary: &MetricSummary,
    ) -> io::Result<()> {
        let bins: Vec<String> = summary
            .tally
            .freq_per_bin
            .iter()
            .map(u64::to_string)
            .collect();
        let uniformity = summary
            .uniformity
            .map_or_else(|| "-".to_string(), |u| format!("{u:.6}"));
        writeln!(
            out,
            "{name} bins=[{}] uniformity={uniformity} {} proportion={}/{} {} result={:?}",
            bins.join(" "),
            status_word(summary.uniformity_status),
            summary.pass_count,
            summary.tally.sample_count,
            status_word(summary.proportion_status),
            summary.result,
        )
    }
}

/// One results.txt / dataK.txt line.
pub fn write_p_value(out: &mut dyn Write, p_value: Option<f64>) -> io::Result<()> {
    match p_value {
        Some(p) => writeln!(out, "{p:.6}"),
        None => writeln!(out, "{INVALID_P_VALUE}"),
    }
}

/// Closing line of a stats.txt block.
pub fn write_verdict(out: &mut dyn Write, success: bool, p_value: Option<f64>) -> io::Result<()> {
    let word = if success { "SUCCESS" } else { "FAILURE" };
    match p_value {
        Some(p) => write!(out, "{word}\t\tp_value = {p:.6}\n\n"),
        None => write!(out, "{word}\t\tp_value = {INVALID_P_VALUE}\n\n"),
    }
}

/// `dataK.txt` for partition `index` (0-based), zero-padded to the width of `partitions`.
pub fn data_file_name(index: usize, partitions: usize) -> String {
    let width = partitions.to_string().len();
    format!("data{:0width$}.txt", index + 1)
}

/// Create `<output_dir>/<TestName>/` during init.
pub fn prepare_sub_dir(state: &RunState, test: TestId) -> Result<PathBuf, FatalError> {
    let dir = state.config.output_dir.join(test.name());
    fs::create_dir_all(&dir).map_err(|e| FatalError::io(Some(test), Phase::Init, &dir, e))?;
    Ok(dir)
}

fn create(path: &Path, test: TestId, phase: Phase) -> Result<BufWriter<File>, FatalError> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| FatalError::io(Some(test), phase, path, e))
}

fn close(
    mut out: BufWriter<File>,
    path: &Path,
    test: TestId,
    phase: Phase,
) -> Result<(), FatalError> {
    out.flush()
        .map_err(|e| FatalError::io(Some(test), phase, path, e))
}

/// The print phase shared by every test.
///
/// Writes stats.txt and results.txt in iteration order, then one dataK.txt
/// per partition when there is more than one. `write_stat` renders a single
/// stats block. A no-op when results files are disabled.
pub fn print_artifacts<F>(
    state: &mut RunState,
    test: TestId,
    mut write_stat: F,
) -> Result<(), FatalError>
where
    F: FnMut(&mut dyn Write, &dyn ReportStyle, &PrivateStats, Option<f64>) -> io::Result<()>,
{
    let slot = state.slot(test);
    if !slot.enabled {
        log::debug!("print for {test} called while the test is disabled");
        return Ok(());
    }
    if !state.config.write_results {
        log::debug!("results files disabled, nothing to print for {test}");
        return Ok(());
    }
    if !slot.initialized {
        return Err(FatalError::NotInitialized {
            test,
            phase: Phase::Print,
        });
    }
    let partitions = slot.partition_count;
    let expected = state.config.num_bitstreams * slot.p_values_per_iteration;
    let sub_dir = slot.sub_dir.clone().ok_or_else(|| {
        FatalError::precondition(test, Phase::Print, "output directory not prepared")
    })?;
    let style = state.style();

    let tally = state.shared_mut().tally(test);
    if tally.len() != expected {
        return Err(FatalError::precondition(
            test,
            Phase::Print,
            format!("{} p-values recorded, expected {expected}", tally.len()),
        ));
    }
    let (Some(p_val), Some(stats)) = (tally.p_val.as_ref(), tally.stats.as_ref()) else {
        return Err(FatalError::precondition(test, Phase::Print, "result stores not allocated"));
    };
    if stats.len() != p_val.len() {
        return Err(FatalError::precondition(
            test,
            Phase::Print,
            format!("{} stats records for {} p-values", stats.len(), p_val.len()),
        ));
    }
    let positions = tally.ordered_positions();

    let stats_path = sub_dir.join("stats.txt");
    let results_path = sub_dir.join("results.txt");
    let mut stats_out = create(&stats_path, test, Phase::Print)?;
    let mut results_out = create(&results_path, test, Phase::Print)?;

    for &pos in &positions {
        let stat = &stats[pos];
        let p_value = p_val[pos];
        if p_value.is_none() && stat.success() {
            return Err(FatalError::precondition(
                test,
                Phase::PrintStat,
                format!("record {pos} has no p-value but is marked as a success"),
            ));
        }
        write_stat(&mut stats_out, style, stat, p_value)
            .map_err(|e| FatalError::io(Some(test), Phase::PrintStat, &stats_path, e))?;
        write_p_value(&mut results_out, p_value)
            .map_err(|e| FatalError::io(Some(test), Phase::PrintPValue, &results_path, e))?;
    }
    close(stats_out, &stats_path, test, Phase::Print)?;
    close(results_out, &results_path, test, Phase::Print)?;

    if partitions > 1 {
        for j in 0..partitions {
            let path = sub_dir.join(data_file_name(j, partitions));
            let mut out = create(&path, test, Phase::Print)?;
            for &pos in positions.iter().skip(j).step_by(partitions) {
                write_p_value(&mut out, p_val[pos])
                    .map_err(|e| FatalError::io(Some(test), Phase::PrintPValue, &path, e))?;
            }
            close(out, &path, test, Phase::Print)?;
        }
    }

    log::debug!("wrote {} records for {test} to {}", positions.len(), sub_dir.display());
    Ok(())
}
