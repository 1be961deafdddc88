//! Test lifecycle and the battery driver.
//!
//! Every test runs through the same phases, strictly in order:
//!
//! ```text
//! init -> iterate (once per bitstream, in parallel) -> print -> metrics -> destroy
//! ```
//!
//! Only iterate may run concurrently. A test that disables itself during init
//! turns every later phase into a no-op.

use crate::bits::BitBuffer;
use crate::config::RunConfig;
use crate::error::{self, FatalError, Phase};
use crate::metrics;
use crate::scheduler::{self, ThreadContext};
use crate::state::{RunState, RunSummary, TestId};
use crate::universal::UniversalTest;

/// Phases of one statistical test.
pub trait TestLifecycle: Sync {
    fn id(&self) -> TestId;

    /// Validate parameters against the run configuration and allocate result stores.
    fn init(&mut self, state: &mut RunState) -> Result<(), FatalError>;

    /// Entries of per-thread scratch table needed by [`iterate`](Self::iterate).
    fn scratch_len(&self) -> usize;

    /// Process one bitstream. Called concurrently from worker threads.
    fn iterate(
        &self,
        state: &RunState,
        ctx: &mut ThreadContext,
        bits: &BitBuffer,
    ) -> Result<(), FatalError>;

    /// Write the per-test artifacts.
    fn print(&self, state: &mut RunState) -> Result<(), FatalError>;

    /// Uniformity and proportion checks over the collected p-values.
    fn metrics(&self, state: &mut RunState) -> Result<(), FatalError> {
        metrics::run_metrics(state, self.id()).map(|_| ())
    }

    /// Release per-test resources.
    fn destroy(&mut self, state: &mut RunState) -> Result<(), FatalError>;
}

/// A test of the battery.
#[derive(Debug)]
pub enum BatteryTest {
    Universal(UniversalTest),
}

impl BatteryTest {
    pub fn for_id(id: TestId) -> Self {
        match id {
            TestId::Universal => BatteryTest::Universal(UniversalTest::new()),
        }
    }

    fn inner(&self) -> &dyn TestLifecycle {
        match self {
            BatteryTest::Universal(t) => t,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn TestLifecycle {
        match self {
            BatteryTest::Universal(t) => t,
        }
    }
}

impl TestLifecycle for BatteryTest {
    fn id(&self) -> TestId {
        self.inner().id()
    }

    fn init(&mut self, state: &mut RunState) -> Result<(), FatalError> {
        self.inner_mut().init(state)
    }

    fn scratch_len(&self) -> usize {
        self.inner().scratch_len()
    }

    fn iterate(
        &self,
        state: &RunState,
        ctx: &mut ThreadContext,
        bits: &BitBuffer,
    ) -> Result<(), FatalError> {
        self.inner().iterate(state, ctx, bits)
    }

    fn print(&self, state: &mut RunState) -> Result<(), FatalError> {
        self.inner().print(state)
    }

    fn metrics(&self, state: &mut RunState) -> Result<(), FatalError> {
        self.inner().metrics(state)
    }

    fn destroy(&mut self, state: &mut RunState) -> Result<(), FatalError> {
        self.inner_mut().destroy(state)
    }
}

/// Drive one test through all of its phases.
pub fn run_test<T>(
    test: &mut T,
    state: &mut RunState,
    streams: &[BitBuffer],
) -> Result<(), FatalError>
where
    T: TestLifecycle + ?Sized,
{
    let id = test.id();
    test.init(state)?;

    if state.is_enabled(id) {
        let workers = scheduler::worker_count(state.config.threads, streams.len());
        let mut contexts = scheduler::build_contexts(workers, test.scratch_len());
        scheduler::run_iterations(&*test, state, streams, &mut contexts)?;
    } else {
        log::info!("{id} is disabled, skipping iterate");
    }

    test.print(state)?;
    test.metrics(state)?;
    test.destroy(state)
}

/// Every test of the battery, in [`TestId::ALL`] order.
#[derive(Debug)]
pub struct Battery {
    tests: Vec<BatteryTest>,
}

impl Default for Battery {
    fn default() -> Self {
        Self::new()
    }
}

impl Battery {
    pub fn new() -> Self {
        Self {
            tests: TestId::ALL.into_iter().map(BatteryTest::for_id).collect(),
        }
    }

    pub fn tests(&self) -> &[BatteryTest] {
        &self.tests
    }

    /// Run every test over `streams`, one after another.
    pub fn run(&mut self, state: &mut RunState, streams: &[BitBuffer]) -> Result<(), FatalError> {
        let expected = state.config.num_bitstreams;
        if streams.len() != expected {
            return Err(FatalError::Precondition {
                test: None,
                phase: Phase::Setup,
                reason: format!("{} bitstream(s) supplied, expected {expected}", streams.len()),
            });
        }
        log::info!(
            "run {}: {} bitstream(s) of {} bits, {} thread(s)",
            state.id(),
            expected,
            state.config.n,
            state.config.threads
        );

        for test in &mut self.tests {
            run_test(test, state, streams)?;
        }
        Ok(())
    }

    /// [`run`](Self::run), terminating the process on a fatal error.
    pub fn run_or_exit(&mut self, state: &mut RunState, streams: &[BitBuffer]) {
        if let Err(e) = self.run(state, streams) {
            error::exit_with(&e);
        }
    }
}

/// Create the run state, run the whole battery and write the run summary.
pub fn run_battery(config: RunConfig, streams: &[BitBuffer]) -> Result<RunSummary, FatalError> {
    let mut state = RunState::new(config)?;
    Battery::new().run(&mut state, streams)?;
    state.finish()
}
