//! Dispatch of one XA phase across participants.

use super::context::{XaCommitContext, XaState};
use crate::error::{CoreError, CoreResult};
use std::thread;

/// Runs one phase for every participant.
///
/// An implementation must not return before every participant it started
/// has finished the phase. It reports the first failure it saw.
pub trait XaExecutor: Send + Sync {
    /// Runs `phase` on `contexts`.
    fn run_phase(&self, phase: XaState, contexts: &mut [XaCommitContext]) -> CoreResult<()>;
}

/// One participant after the other on the calling thread; stops at the
/// first failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialExecutor;

impl XaExecutor for SequentialExecutor {
    fn run_phase(&self, phase: XaState, contexts: &mut [XaCommitContext]) -> CoreResult<()> {
        for context in contexts.iter_mut().filter(|c| c.state() == phase) {
            context.run()?;
        }
        Ok(())
    }
}

/// One scoped thread per participant.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelExecutor;

impl XaExecutor for ParallelExecutor {
    fn run_phase(&self, phase: XaState, contexts: &mut [XaCommitContext]) -> CoreResult<()> {
        let results: Vec<CoreResult<()>> = thread::scope(|scope| {
            let workers: Vec<_> = contexts
                .iter_mut()
                .filter(|c| c.state() == phase)
                .map(|context| scope.spawn(move || context.run()))
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker
                        .join()
                        .unwrap_or_else(|_| Err(CoreError::invalid_operation("xa worker panicked")))
                })
                .collect()
        });
        results.into_iter().collect()
    }
}
