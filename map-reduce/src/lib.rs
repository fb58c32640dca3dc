//! A small map/reduce framework.
//!
//! A [`Master`] splits a job into one map task per input file and a fixed
//! number of reduce tasks, hands them to registered workers over RPC and
//! retries a task on another worker whenever a call fails. Map tasks bucket
//! their output into per-partition files, reduce tasks fan those files in,
//! and the master merges the reduce outputs once every task succeeded.
//!
//! All task data lives on a filesystem shared by the master and its workers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod app;
pub mod codec;
mod master;
pub mod rpc;
pub mod schedule;
pub mod task;
mod worker;
pub mod workspace;

pub use master::{Job, JobReport, Master, MasterConfig};
pub use rpc::{RpcCaller, WorkerCaller};
pub use schedule::RetryPolicy;
pub use worker::Worker;
pub use workspace::Workspace;

/// A single key/value pair, the unit exchanged between map and reduce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// User map function: `(source name, contents) -> pairs`.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;

/// User reduce function: `(key, values in arrival order) -> result`.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// A map/reduce application.
#[derive(Clone, Copy)]
pub struct App {
    pub map: MapFn,
    pub reduce: ReduceFn,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

/// The two stages of a job. Every map task finishes before any reduce task
/// starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobPhase {
    Map,
    Reduce,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Map => write!(f, "map"),
            JobPhase::Reduce => write!(f, "reduce"),
        }
    }
}

/// Arguments the master passes to a worker along with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskArgs {
    pub job_name: String,
    /// Input file, only set for map tasks.
    pub file: Option<PathBuf>,
    pub phase: JobPhase,
    /// This task's index in the current phase.
    pub task_number: usize,
    /// Total number of tasks in the other phase: mappers need it to know
    /// how many partitions to write, reducers to know how many files to read.
    pub num_other_phase: usize,
}

/// Why a worker did not complete a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    /// The worker was already running another task and did not start this
    /// one.
    Busy,
    /// The task ran and failed, or the worker could not be reached.
    Failed(String),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Busy => write!(f, "worker busy"),
            TaskError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TaskError {}

/// Sent by a worker once it is ready to receive tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterArgs {
    pub worker: String,
}

/// Reply to a shutdown: the number of tasks the worker ran since it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReply {
    pub ntasks: usize,
}

#[tarpc::service]
pub trait MasterService {
    /// Called by a worker once it accepts tasks.
    async fn register(args: RegisterArgs);
}

#[tarpc::service]
pub trait WorkerService {
    /// Runs one task to completion.
    async fn run_task(args: RunTaskArgs) -> Result<(), TaskError>;
    /// Stops the worker.
    async fn shutdown() -> ShutdownReply;
}

/// 32-bit FNV-1a of `key`.
///
/// Partitioning depends on this value being identical in every process, so
/// it must not be swapped for a seeded hasher.
pub fn hash32(key: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    key.bytes().fold(OFFSET_BASIS, |h, b| (h ^ u32::from(b)).wrapping_mul(PRIME))
}

/// Reduce partition of `key` out of `n_reduce`.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    hash32(key) as usize % n_reduce
}
