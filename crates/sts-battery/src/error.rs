//! Fatal precondition failures and their process exit codes.
//!
//! Statistical outcomes (low or bogus p-values, a test disabled because the
//! bitstream is too short) are recorded as data and never show up here. A
//! [`FatalError`] means the run itself is broken: a phase called out of order,
//! a missing scratch table, a result store that could not grow, or an artifact
//! that could not be written. Callers are expected to stop the run and exit
//! with [`FatalError::exit_code`].

use std::collections::TryReserveError;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::state::TestId;

/// Exit code base for failures that do not belong to a single test.
pub const RUN_EXIT_BASE: i32 = 10;

/// The operation during which a fatal error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    Iterate,
    PrintStat,
    PrintPValue,
    Print,
    MetricPrint,
    Metrics,
    Destroy,
    Setup,
    Finish,
}

impl Phase {
    /// Offset added to the exit code base.
    pub fn offset(self) -> i32 {
        match self {
            Phase::Init => 0,
            Phase::Iterate => 1,
            Phase::PrintStat => 2,
            Phase::PrintPValue => 3,
            Phase::Print => 4,
            Phase::MetricPrint => 5,
            Phase::Metrics => 6,
            Phase::Destroy => 7,
            Phase::Setup => 8,
            Phase::Finish => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Iterate => "iterate",
            Phase::PrintStat => "print_stat",
            Phase::PrintPValue => "print_p_value",
            Phase::Print => "print",
            Phase::MetricPrint => "metric_print",
            Phase::Metrics => "metrics",
            Phase::Destroy => "destroy",
            Phase::Setup => "setup",
            Phase::Finish => "finish",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `"Universal: "` for a test-scoped failure, empty for a run-level one.
fn scope(test: &Option<TestId>) -> String {
    test.map(|t| format!("{t}: ")).unwrap_or_default()
}

/// Unrecoverable run failure.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("{test}: {phase} called before init")]
    NotInitialized { test: TestId, phase: Phase },

    #[error("{}{phase}: {reason}", scope(.test))]
    Precondition {
        test: Option<TestId>,
        phase: Phase,
        reason: String,
    },

    #[error("{}{phase}: cannot grow result store: {source}", scope(.test))]
    Alloc {
        test: Option<TestId>,
        phase: Phase,
        #[source]
        source: TryReserveError,
    },

    #[error("{}{phase}: I/O error on {}: {source}", scope(.test), .path.display())]
    Io {
        test: Option<TestId>,
        phase: Phase,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FatalError {
    pub fn precondition(test: TestId, phase: Phase, reason: impl Into<String>) -> Self {
        FatalError::Precondition {
            test: Some(test),
            phase,
            reason: reason.into(),
        }
    }

    pub fn io(
        test: Option<TestId>,
        phase: Phase,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        FatalError::Io {
            test,
            phase,
            path: path.into(),
            source,
        }
    }

    pub fn alloc(test: TestId, phase: Phase, source: TryReserveError) -> Self {
        FatalError::Alloc {
            test: Some(test),
            phase,
            source,
        }
    }

    pub fn test(&self) -> Option<TestId> {
        match self {
            FatalError::NotInitialized { test, .. } => Some(*test),
            FatalError::Precondition { test, .. }
            | FatalError::Alloc { test, .. }
            | FatalError::Io { test, .. } => *test,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            FatalError::NotInitialized { phase, .. }
            | FatalError::Precondition { phase, .. }
            | FatalError::Alloc { phase, .. }
            | FatalError::Io { phase, .. } => *phase,
        }
    }

    /// Process exit code: the test's reserved base (or [`RUN_EXIT_BASE`]) plus the phase offset.
    pub fn exit_code(&self) -> i32 {
        let base = self.test().map_or(RUN_EXIT_BASE, TestId::exit_code_base);
        base + self.phase().offset()
    }
}

/// Log `err` and terminate the process with its exit code.
pub fn exit_with(err: &FatalError) -> ! {
    log::error!("fatal: {err}");
    std::process::exit(err.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_phase() {
        let phases = [
            Phase::Init,
            Phase::Iterate,
            Phase::PrintStat,
            Phase::PrintPValue,
            Phase::Print,
            Phase::MetricPrint,
            Phase::Metrics,
            Phase::Destroy,
        ];
        let mut codes: Vec<i32> = phases
            .iter()
            .map(|&phase| FatalError::precondition(TestId::Universal, phase, "x").exit_code())
            .collect();
        assert_eq!(codes[0], 200);
        assert_eq!(codes[7], 207);
        codes.dedup();
        assert_eq!(codes.len(), phases.len());
    }

    #[test]
    fn test_run_level_exit_code() {
        let err = FatalError::io(
            None,
            Phase::Finish,
            "summary.json",
            std::io::Error::other("disk full"),
        );
        assert_eq!(err.exit_code(), RUN_EXIT_BASE + 9);
        assert!(err.test().is_none());
        assert!(err.to_string().contains("summary.json"));
    }

    #[test]
    fn test_not_initialized_message() {
        let err = FatalError::NotInitialized {
            test: TestId::Universal,
            phase: Phase::Iterate,
        };
        assert_eq!(err.to_string(), "Universal: iterate called before init");
        assert_eq!(err.exit_code(), 201);
    }
}
