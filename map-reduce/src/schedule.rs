//! Fault-tolerant task dispatch.
//!
//! The idle worker pool is both the work queue and the capacity limit: a
//! task can only be dispatched by taking a worker out of the pool, and only
//! a worker that succeeded goes back in.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::{JobPhase, RunTaskArgs, TaskError, WorkerCaller};

/// Blocking FIFO of idle worker addresses.
#[derive(Debug)]
pub struct WorkerPool {
    tx: mpsc::UnboundedSender<String>,
    idle: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            idle: Mutex::new(rx),
        }
    }

    /// Makes `worker` available. Never blocks.
    pub fn push(&self, worker: String) {
        // The receiver lives as long as the pool.
        let _ = self.tx.send(worker);
    }

    /// Takes the longest-idle worker, waiting for one if the pool is empty.
    pub async fn pop(&self) -> Option<String> {
        self.idle.lock().await.recv().await
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// How often a task may fail before the phase gives up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self { max_attempts: None }
    }

    fn exhausted(&self, attempts: usize) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Lifecycle of one task within a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for an idle worker.
    Pending { attempt: usize },
    /// Handed to `worker`.
    Dispatched { worker: String, attempt: usize },
    Failed { attempt: usize },
    Succeeded,
}

/// Runs every task in `tasks` on workers from `pool` and returns once all
/// of them succeeded.
///
/// Tasks are handed out in order as workers become idle; each runs on its
/// own tokio task, so the number in flight is bounded only by the number of
/// workers. A failed task is retried on another idle worker, while the
/// worker that failed is not put back. The first task to exhaust `policy`
/// fails the phase, even while later tasks still wait for a worker.
pub async fn schedule(
    phase: JobPhase,
    tasks: Vec<RunTaskArgs>,
    pool: Arc<WorkerPool>,
    caller: Arc<dyn WorkerCaller>,
    policy: RetryPolicy,
) -> Result<()> {
    let ntasks = tasks.len();
    debug!("schedule: {} {} tasks", ntasks, phase);

    let mut pending = JoinSet::new();
    let mut tasks = tasks.into_iter();
    let mut next = tasks.next();
    while let Some(args) = next.take() {
        tokio::select! {
            worker = pool.pop() => {
                let worker = worker.ok_or_else(|| anyhow!("worker pool closed"))?;
                trace!("{} task #{} -> {}", phase, args.task_number, worker);
                pending.spawn(dispatch(
                    args,
                    worker,
                    pool.clone(),
                    caller.clone(),
                    policy,
                ));
                next = tasks.next();
            }
            Some(done) = pending.join_next() => {
                done.context("task dispatch panicked")??;
                next = Some(args);
            }
        }
    }

    while let Some(done) = pending.join_next().await {
        done.context("task dispatch panicked")??;
    }
    info!("all {} {} tasks completed", ntasks, phase);
    Ok(())
}

/// Drives one task until some worker runs it successfully.
async fn dispatch(
    args: RunTaskArgs,
    worker: String,
    pool: Arc<WorkerPool>,
    caller: Arc<dyn WorkerCaller>,
    policy: RetryPolicy,
) -> Result<()> {
    let mut state = TaskState::Dispatched { worker, attempt: 1 };
    loop {
        state = match state {
            TaskState::Pending { attempt } => {
                let worker = pool
                    .pop()
                    .await
                    .ok_or_else(|| anyhow!("worker pool closed"))?;
                TaskState::Dispatched { worker, attempt }
            }
            TaskState::Dispatched { worker, attempt } => {
                match caller.run_task(&worker, args.clone()).await {
                    Ok(()) => {
                        trace!("{} task #{} done on {}", args.phase, args.task_number, worker);
                        pool.push(worker);
                        TaskState::Succeeded
                    }
                    // A duplicate pool entry. The worker goes back to the
                    // pool when its running task ends.
                    Err(TaskError::Busy) => {
                        debug!(
                            "{} task #{}: {} busy, dropping its extra pool entry",
                            args.phase, args.task_number, worker
                        );
                        TaskState::Pending { attempt }
                    }
                    Err(e) => {
                        warn!(
                            "{} task #{} failed on {} (attempt {}): {}, reassigning",
                            args.phase, args.task_number, worker, attempt, e
                        );
                        TaskState::Failed { attempt }
                    }
                }
            }
            TaskState::Failed { attempt } => {
                if policy.exhausted(attempt) {
                    bail!(
                        "{} task #{} failed {} times",
                        args.phase,
                        args.task_number,
                        attempt
                    );
                }
                TaskState::Pending {
                    attempt: attempt + 1,
                }
            }
            TaskState::Succeeded => return Ok(()),
        };
    }
}
