//! # Bounded worker-pool stages
//!
//! Every concurrent step of the external sort, the table reader and the
//! mark-and-compact pass is a [`ThreadPool`]: a fixed set of named OS
//! threads pulling work items from one **bounded** crossbeam channel.
//!
//! ## Design Overview
//!
//! - Each worker owns a private **local state** `L` (file handle, decode
//!   buffer, write cache, counter, ...). The number of locals handed to
//!   [`ThreadPool::new`] is the number of workers. Nothing in a local is
//!   ever shared with another worker.
//! - Producers hold a cloneable [`StageInput`]. `take()` blocks while the
//!   queue is full, which caps the memory in flight between stages.
//! - Stages are chained by moving the downstream [`StageInput`] into the
//!   upstream work closure. A stage's input closes once every handle to it
//!   is gone, i.e. after [`ThreadPool::close`] of all upstream stages.
//! - [`ThreadPool::close`] drops the pool's own input handle, drains every
//!   queued item, joins all workers and hands their locals back.
//!
//! ## Failure model
//!
//! There is no retry. The first task error marks the stage **failed**:
//! later items are drained and discarded (so producers never block on a
//! full queue forever), new `take()` calls fail with
//! [`PipelineError::Closed`], and `close()` returns the original error.
//! A failure therefore propagates upstream as `Closed`; [`settle`] picks
//! the root cause out of a chain of close results.


use std::error::Error as StdError;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Boxed error returned by stage work closures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid stage parameters (zero workers, zero queue depth).
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker for stage '{stage}': {source}")]
    Spawn {
        stage: String,
        #[source]
        source: io::Error,
    },

    /// A work item failed inside a stage.
    #[error("stage '{stage}' failed: {source}")]
    Task {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// The stage no longer accepts input because it failed or shut down.
    #[error("stage '{0}' is closed")]
    Closed(String),

    /// A worker thread panicked.
    #[error("worker of stage '{0}' panicked")]
    WorkerPanicked(String),

    /// Internal invariant violation (poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Returns `true` if this error only reports that a *downstream* stage
    /// refused input, i.e. it is a consequence of a failure elsewhere.
    pub fn is_cascade(&self) -> bool {
        match self {
            PipelineError::Closed(_) => true,
            PipelineError::Task { source, .. } => {
                let mut cause: Option<&(dyn StdError + 'static)> = Some(source.as_ref());
                while let Some(err) = cause {
                    if let Some(inner) = err.downcast_ref::<PipelineError>() {
                        return inner.is_cascade();
                    }
                    cause = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

/// Picks the root-cause error out of the close results of a stage chain.
///
/// Returns the first error that is not a [cascade](PipelineError::is_cascade),
/// falling back to the first error, or `Ok(())` when every stage succeeded.
pub fn settle(results: Vec<Result<(), PipelineError>>) -> Result<(), PipelineError> {
    let mut fallback = None;
    for result in results {
        if let Err(err) = result {
            if !err.is_cascade() {
                return Err(err);
            }
            if fallback.is_none() {
                fallback = Some(err);
            }
        }
    }
    match fallback {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ------------------------------------------------------------------------------------------------
// Shared stage status
// ------------------------------------------------------------------------------------------------

/// Failure flag and first error of one stage, shared by workers and inputs.
#[derive(Debug)]
struct StageStatus {
    name: String,
    failed: AtomicBool,
    first_error: Mutex<Option<PipelineError>>,
}

impl StageStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        }
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn fail(&self, err: PipelineError) {
        error!(stage = %self.name, error = %err, "stage failed");
        if let Ok(mut slot) = self.first_error.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.failed.store(true, Ordering::Release);
    }

    fn take_error(&self) -> Option<PipelineError> {
        match self.first_error.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => Some(PipelineError::Internal(format!(
                "error slot of stage '{}' poisoned",
                self.name
            ))),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// StageInput — producer handle
// ------------------------------------------------------------------------------------------------

/// Cloneable producer handle feeding one stage.
#[derive(Debug)]
pub struct StageInput<I> {
    sender: Sender<I>,
    status: Arc<StageStatus>,
}

impl<I> Clone for StageInput<I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            status: Arc::clone(&self.status),
        }
    }
}

impl<I> StageInput<I> {
    /// Queues one item, blocking while the stage's queue is full.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Closed`] if the stage has failed or all of its
    /// workers are gone.
    pub fn take(&self, item: I) -> Result<(), PipelineError> {
        if self.status.is_failed() {
            return Err(PipelineError::Closed(self.status.name.clone()));
        }
        self.sender
            .send(item)
            .map_err(|_| PipelineError::Closed(self.status.name.clone()))
    }

    /// Name of the stage this handle feeds.
    pub fn stage(&self) -> &str {
        &self.status.name
    }
}

// ------------------------------------------------------------------------------------------------
// ThreadPool
// ------------------------------------------------------------------------------------------------

/// A bounded multi-worker stage with per-worker local state `L`.
pub struct ThreadPool<I, L> {
    input: Option<StageInput<I>>,
    workers: Vec<JoinHandle<L>>,
    status: Arc<StageStatus>,
}

impl<I, L> std::fmt::Debug for ThreadPool<I, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("stage", &self.status.name)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl<I, L> ThreadPool<I, L>
where
    I: Send + 'static,
    L: Send + 'static,
{
    /// Starts one worker per element of `locals`.
    ///
    /// `work` is invoked for every queued item with the worker's own local.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::InvalidConfig`] if `locals` is empty or
    ///   `queue_depth` is zero.
    /// - [`PipelineError::Spawn`] if a thread cannot be started.
    pub fn new<F>(
        name: &str,
        locals: Vec<L>,
        queue_depth: usize,
        work: F,
    ) -> Result<Self, PipelineError>
    where
        F: Fn(I, &mut L) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        if locals.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "stage '{name}' needs at least one worker"
            )));
        }
        if queue_depth == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "stage '{name}' needs a queue depth >= 1"
            )));
        }

        let status = Arc::new(StageStatus::new(name));
        let (sender, receiver) = channel::bounded::<I>(queue_depth);
        let work = Arc::new(work);

        let mut pool = Self {
            input: Some(StageInput {
                sender,
                status: Arc::clone(&status),
            }),
            workers: Vec::with_capacity(locals.len()),
            status,
        };

        for (id, mut local) in locals.into_iter().enumerate() {
            let rx = receiver.clone();
            let work = Arc::clone(&work);
            let status = Arc::clone(&pool.status);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        if status.is_failed() {
                            continue; // drain
                        }
                        if let Err(source) = (*work)(item, &mut local) {
                            status.fail(PipelineError::Task {
                                stage: status.name.clone(),
                                source,
                            });
                        }
                    }
                    local
                });
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(source) => {
                    // Dropping `pool` joins the workers started so far.
                    return Err(PipelineError::Spawn {
                        stage: name.to_string(),
                        source,
                    });
                }
            }
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        debug!(stage = name, workers = pool.workers.len(), queue_depth, "stage started");
        Ok(pool)
    }

    /// Starts a single-worker stage.
    ///
    /// Items are processed strictly in arrival order, which makes this the
    /// building block for order-critical steps.
    pub fn single<F>(name: &str, local: L, queue_depth: usize, work: F) -> Result<Self, PipelineError>
    where
        F: Fn(I, &mut L) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self::new(name, vec![local], queue_depth, work)
    }

    /// Returns a new producer handle for this stage.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Closed`] if the stage is already closing.
    pub fn input(&self) -> Result<StageInput<I>, PipelineError> {
        self.input
            .clone()
            .ok_or_else(|| PipelineError::Closed(self.status.name.clone()))
    }

    /// Queues one item (shorthand for `input()?.take(item)`).
    pub fn take(&self, item: I) -> Result<(), PipelineError> {
        match &self.input {
            Some(input) => input.take(item),
            None => Err(PipelineError::Closed(self.status.name.clone())),
        }
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Name of this stage.
    pub fn name(&self) -> &str {
        &self.status.name
    }

    /// Drains all queued work, joins every worker and returns their locals
    /// in worker order.
    ///
    /// Blocks until every other [`StageInput`] clone has been dropped.
    ///
    /// # Errors
    ///
    /// The first task error of this stage, or
    /// [`PipelineError::WorkerPanicked`] if a worker panicked.
    pub fn close(mut self) -> Result<Vec<L>, PipelineError> {
        self.input = None;

        let mut locals = Vec::with_capacity(self.workers.len());
        let mut panicked = false;
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(local) => locals.push(local),
                Err(_) => panicked = true,
            }
        }

        if let Some(err) = self.status.take_error() {
            return Err(err);
        }
        if panicked {
            return Err(PipelineError::WorkerPanicked(self.status.name.clone()));
        }

        trace!(stage = %self.status.name, "stage closed");
        Ok(locals)
    }
}

impl<I, L> Drop for ThreadPool<I, L> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        // Drop our sender → workers drain remaining items then exit.
        self.input = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(stage = %self.status.name, "worker panicked during drop");
            }
        }
    }
}
