//! Parallel driver of the iterate phase.
//!
//! Bitstreams are handed out one at a time from a shared counter to a fixed
//! set of scoped worker threads. Each worker owns a [`ThreadContext`] with its
//! scratch table, so tests never share mutable scratch space. Results are
//! published by the test itself under [`RunState::lock_shared`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::bits::BitBuffer;
use crate::driver::TestLifecycle;
use crate::error::{FatalError, Phase};
use crate::state::RunState;

/// Per-worker scratch state.
#[derive(Debug)]
pub struct ThreadContext {
    pub thread_id: usize,
    /// Index of the bitstream currently being processed.
    pub iteration: usize,
    /// Scratch table, sized by [`TestLifecycle::scratch_len`].
    pub table: Box<[usize]>,
}

impl ThreadContext {
    pub fn new(thread_id: usize, table_len: usize) -> Self {
        Self {
            thread_id,
            iteration: 0,
            table: vec![0; table_len].into_boxed_slice(),
        }
    }
}

/// Workers needed for `streams` bitstreams with `threads` configured: never more
/// than there are bitstreams, never fewer than one.
pub fn worker_count(threads: usize, streams: usize) -> usize {
    threads.min(streams).max(1)
}

/// One context per worker thread.
pub fn build_contexts(threads: usize, table_len: usize) -> Vec<ThreadContext> {
    (0..threads.max(1))
        .map(|id| ThreadContext::new(id, table_len))
        .collect()
}

/// Run `test.iterate` once per bitstream across `contexts.len()` workers.
///
/// Stops handing out work after the first error and returns it.
pub fn run_iterations<T>(
    test: &T,
    state: &RunState,
    streams: &[BitBuffer],
    contexts: &mut [ThreadContext],
) -> Result<(), FatalError>
where
    T: TestLifecycle + ?Sized,
{
    let id = test.id();
    if contexts.is_empty() {
        return Err(FatalError::precondition(id, Phase::Iterate, "no worker contexts"));
    }

    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<FatalError>> = Mutex::new(None);
    let workers = contexts.len().min(streams.len());
    log::debug!("{id}: {} bitstream(s) on {workers} worker(s)", streams.len());

    let panicked = std::thread::scope(|s| {
        let handles: Vec<_> = contexts
            .iter_mut()
            .take(workers)
            .map(|ctx| {
                let (next, failed, first_error) = (&next, &failed, &first_error);
                s.spawn(move || {
                    while !failed.load(Ordering::Relaxed) {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(bits) = streams.get(i) else {
                            break;
                        };
                        ctx.iteration = i;
                        if let Err(e) = test.iterate(state, ctx, bits) {
                            failed.store(true, Ordering::Relaxed);
                            let mut slot =
                                first_error.lock().unwrap_or_else(PoisonError::into_inner);
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join())
            .filter(Result::is_err)
            .count()
    });

    if let Some(e) = first_error
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
    {
        return Err(e);
    }
    if panicked > 0 {
        return Err(FatalError::precondition(
            id,
            Phase::Iterate,
            format!("{panicked} worker thread(s) panicked"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::state::TestId;

    /// Records which worker saw which bitstream.
    struct Recorder {
        seen: Mutex<Vec<(usize, usize)>>,
        fail_at: Option<usize>,
    }

    impl TestLifecycle for Recorder {
        fn id(&self) -> TestId {
            TestId::Universal
        }

        fn init(&mut self, _state: &mut RunState) -> Result<(), FatalError> {
            Ok(())
        }

        fn scratch_len(&self) -> usize {
            4
        }

        fn iterate(
            &self,
            _state: &RunState,
            ctx: &mut ThreadContext,
            _bits: &BitBuffer,
        ) -> Result<(), FatalError> {
            assert_eq!(ctx.table.len(), 4);
            if Some(ctx.iteration) == self.fail_at {
                return Err(FatalError::precondition(TestId::Universal, Phase::Iterate, "boom"));
            }
            self.seen.lock().unwrap().push((ctx.iteration, ctx.thread_id));
            Ok(())
        }

        fn print(&self, _state: &mut RunState) -> Result<(), FatalError> {
            Ok(())
        }

        fn destroy(&mut self, _state: &mut RunState) -> Result<(), FatalError> {
            Ok(())
        }
    }

    fn state() -> (tempfile::TempDir, RunState) {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..RunConfig::default()
        };
        let state = RunState::new(config).unwrap();
        (dir, state)
    }

    fn streams(count: usize) -> Vec<BitBuffer> {
        (0..count).map(|i| BitBuffer::from_bytes(&[i as u8])).collect()
    }

    #[test]
    fn test_every_stream_visited_once() {
        let (_dir, state) = state();
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        };
        let mut contexts = build_contexts(3, recorder.scratch_len());
        run_iterations(&recorder, &state, &streams(25), &mut contexts).unwrap();

        let mut seen: Vec<usize> = recorder.seen.lock().unwrap().iter().map(|&(i, _)| i).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
        assert!(recorder.seen.lock().unwrap().iter().all(|&(_, t)| t < 3));
    }

    #[test]
    fn test_more_workers_than_streams() {
        let (_dir, state) = state();
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        };
        let mut contexts = build_contexts(8, 4);
        run_iterations(&recorder, &state, &streams(2), &mut contexts).unwrap();
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_first_error_is_returned() {
        let (_dir, state) = state();
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
            fail_at: Some(5),
        };
        let mut contexts = build_contexts(1, 4);
        let err = run_iterations(&recorder, &state, &streams(10), &mut contexts).unwrap_err();
        assert_eq!(err.phase(), Phase::Iterate);
        assert_eq!(err.exit_code(), 201);
        // a single worker stops right after the failing bitstream
        assert_eq!(recorder.seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_worker_count_capped_by_streams() {
        assert_eq!(worker_count(64, 3), 3);
        assert_eq!(worker_count(2, 10), 2);
        assert_eq!(worker_count(8, 0), 1);
        assert_eq!(build_contexts(worker_count(1_000, 2), 1 << 16).len(), 2);
    }

    #[test]
    fn test_build_contexts_at_least_one() {
        let contexts = build_contexts(0, 16);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].table.len(), 16);
    }
}
