use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use futures::{future, prelude::*};
use log::{debug, error, info};
use tarpc::{
    context,
    server::{self, Channel},
    serde_transport::tcp,
    tokio_serde::formats::Json,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::codec::open_records;
use crate::rpc::{self, RpcCaller, WorkerCaller};
use crate::schedule::{self, RetryPolicy, WorkerPool};
use crate::workspace::{self, Workspace};
use crate::{task, App, JobPhase, MasterService, RegisterArgs, RunTaskArgs};

/// A map/reduce job: one map task per input file, `n_reduce` reduce tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub files: Vec<PathBuf>,
    pub n_reduce: usize,
}

impl Job {
    pub fn new(name: impl Into<String>, files: Vec<PathBuf>, n_reduce: usize) -> Result<Self> {
        if n_reduce == 0 {
            bail!("a job needs at least one reduce task");
        }
        Ok(Self {
            name: name.into(),
            files,
            n_reduce,
        })
    }

    /// A job over every file in `dir`.
    pub fn from_dir(name: impl Into<String>, dir: &Path, n_reduce: usize) -> Result<Self> {
        Self::new(name, workspace::input_files(dir)?, n_reduce)
    }

    pub fn n_map(&self) -> usize {
        self.files.len()
    }

    /// The requests for every task of `phase`, in index order.
    pub fn tasks(&self, phase: JobPhase) -> Vec<RunTaskArgs> {
        let (ntasks, num_other_phase) = match phase {
            JobPhase::Map => (self.n_map(), self.n_reduce),
            JobPhase::Reduce => (self.n_reduce, self.n_map()),
        };
        (0..ntasks)
            .map(|i| RunTaskArgs {
                job_name: self.name.clone(),
                file: match phase {
                    JobPhase::Map => Some(self.files[i].clone()),
                    JobPhase::Reduce => None,
                },
                phase,
                task_number: i,
                num_other_phase,
            })
            .collect()
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Tasks run per worker, in registration order. Workers that could not
    /// be reached at shutdown are missing.
    pub stats: Vec<usize>,
    /// The merged output file.
    pub output: PathBuf,
}

/// Settings of a distributed master.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// Deadline of each call to a worker.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            timeout: rpc::DEFAULT_TIMEOUT,
            retry: RetryPolicy::unlimited(),
        }
    }
}

/// How phases are executed.
enum Execution {
    /// Every task in-process, one after the other.
    Sequential(App),
    /// Through the scheduler on registered workers.
    Distributed {
        caller: Arc<dyn WorkerCaller>,
        retry: RetryPolicy,
    },
}

struct Shared {
    address: String,
    workers: Mutex<Vec<String>>,
    pool: Arc<WorkerPool>,
    stop_rpc: Notify,
    done: Mutex<Option<JoinHandle<Result<JobReport>>>>,
}

/// Runs a single job and owns its registered workers.
///
/// Cloning yields another handle to the same master.
#[derive(Clone)]
pub struct Master {
    shared: Arc<Shared>,
}

impl Master {
    /// Runs `job` in-process without any workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn sequential(job: Job, workspace: Workspace, app: App) -> Self {
        Self::start("master".into(), job, workspace, Execution::Sequential(app))
    }

    /// Runs `job` on workers that register over RPC at `address`.
    pub async fn distributed(
        job: Job,
        workspace: Workspace,
        address: &str,
        config: MasterConfig,
    ) -> Result<Self> {
        let mut listener = tcp::listen(address, Json::default)
            .await
            .with_context(|| format!("unable to listen on {}", address))?;
        listener.config_mut().max_frame_length(usize::MAX);
        let address = listener.local_addr().to_string();

        let master = Self::start(
            address,
            job,
            workspace,
            Execution::Distributed {
                caller: Arc::new(RpcCaller::new(config.timeout)),
                retry: config.retry,
            },
        );

        let server = MasterServer {
            master: master.clone(),
        };
        let shared = master.shared.clone();
        tokio::spawn(async move {
            let accept = listener
                // Ignore accept errors.
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .for_each(|channel| {
                    tokio::spawn(channel.execute(server.clone().serve()).for_each(rpc::spawn));
                    future::ready(())
                });
            tokio::select! {
                _ = accept => {}
                _ = shared.stop_rpc.notified() => {}
            }
            debug!("{}: stopped accepting registrations", shared.address);
        });
        Ok(master)
    }

    /// Runs `job` on workers reached through `caller`.
    ///
    /// No listener is opened; workers join through [`Master::register`].
    pub fn with_caller(
        job: Job,
        workspace: Workspace,
        caller: Arc<dyn WorkerCaller>,
        retry: RetryPolicy,
    ) -> Self {
        Self::start(
            "master".into(),
            job,
            workspace,
            Execution::Distributed { caller, retry },
        )
    }

    fn start(address: String, job: Job, workspace: Workspace, execution: Execution) -> Self {
        let master = Self {
            shared: Arc::new(Shared {
                address,
                workers: Mutex::new(Vec::new()),
                pool: Arc::new(WorkerPool::new()),
                stop_rpc: Notify::new(),
                done: Mutex::new(None),
            }),
        };
        let handle = tokio::spawn(master.clone().run(job, workspace, execution));
        *master.shared.done.lock().unwrap() = Some(handle);
        master
    }

    /// The address workers register at.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Adds `worker` to the job and marks it idle.
    ///
    /// An address already known is not recorded twice, but it still goes
    /// back into the idle pool, so a worker that failed and restarted is
    /// used again.
    pub fn register(&self, worker: String) {
        {
            let mut workers = self.shared.workers.lock().unwrap();
            debug!("register: worker {}", worker);
            if !workers.contains(&worker) {
                workers.push(worker.clone());
            }
        }
        self.shared.pool.push(worker);
    }

    /// Registered workers, in registration order.
    pub fn workers(&self) -> Vec<String> {
        self.shared.workers.lock().unwrap().clone()
    }

    /// Blocks until the job completed.
    pub async fn wait(&self) -> Result<JobReport> {
        let handle = self
            .shared
            .done
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("job already awaited"))?;
        handle.await.context("job panicked")?
    }

    /// Map phase, barrier, reduce phase, teardown, merge.
    async fn run(self, job: Job, workspace: Workspace, execution: Execution) -> Result<JobReport> {
        workspace.reset()?;
        debug!("{}: starting map/reduce job {}", self.address(), job.name);

        info!("starting map phase");
        self.execute(&execution, &job, &workspace, JobPhase::Map)
            .await?;
        info!("starting reduce phase");
        self.execute(&execution, &job, &workspace, JobPhase::Reduce)
            .await?;

        let stats = self.finish(&execution, &job).await;
        let output = {
            let (workspace, job) = (workspace.clone(), job.clone());
            tokio::task::spawn_blocking(move || merge(&workspace, &job))
                .await
                .context("merge panicked")??
        };
        info!("job {} completed: {}", job.name, output.display());
        Ok(JobReport { stats, output })
    }

    async fn execute(
        &self,
        execution: &Execution,
        job: &Job,
        workspace: &Workspace,
        phase: JobPhase,
    ) -> Result<()> {
        match execution {
            Execution::Sequential(app) => {
                for args in job.tasks(phase) {
                    let (workspace, app) = (workspace.clone(), *app);
                    tokio::task::spawn_blocking(move || task::run_task(&workspace, app, &args))
                        .await
                        .context("task panicked")??;
                }
                Ok(())
            }
            Execution::Distributed { caller, retry } => {
                schedule::schedule(
                    phase,
                    job.tasks(phase),
                    self.shared.pool.clone(),
                    caller.clone(),
                    *retry,
                )
                .await
            }
        }
    }

    /// Collects per-worker task counts. In distributed mode this shuts the
    /// workers down and stops accepting registrations.
    async fn finish(&self, execution: &Execution, job: &Job) -> Vec<usize> {
        match execution {
            Execution::Sequential(_) => vec![job.n_map() + job.n_reduce],
            Execution::Distributed { caller, .. } => {
                let stats = self.kill_workers(caller.as_ref()).await;
                self.shared.stop_rpc.notify_one();
                stats
            }
        }
    }

    /// Sends a shutdown to every registered worker.
    async fn kill_workers(&self, caller: &dyn WorkerCaller) -> Vec<usize> {
        let workers = self.workers();
        let mut ntasks = Vec::with_capacity(workers.len());
        for w in workers {
            debug!("master: shutdown worker {}", w);
            match caller.shutdown(&w).await {
                Some(reply) => ntasks.push(reply.ntasks),
                None => error!("master: RPC {} shutdown error", w),
            }
        }
        ntasks
    }
}

/// Combines the reduce outputs into one `key: value` file sorted by key.
fn merge(workspace: &Workspace, job: &Job) -> Result<PathBuf> {
    debug!("merge phase");
    let mut kvs = BTreeMap::new();
    for r in 0..job.n_reduce {
        let p = workspace.reduce_output_path(&job.name, r);
        debug!("merge: read {}", p.display());
        let records = open_records(&p).with_context(|| format!("unable to open {}", p.display()))?;
        for record in records {
            let kv = record.with_context(|| format!("corrupt record in {}", p.display()))?;
            kvs.insert(kv.key, kv.value);
        }
    }

    let out = workspace.merged_output_path(&job.name);
    AtomicFile::new(&out, AllowOverwrite)
        .write(|f| {
            let mut w = BufWriter::new(f);
            for (k, v) in &kvs {
                writeln!(w, "{}: {}", k, v)?;
            }
            w.flush()
        })
        .with_context(|| format!("unable to write {}", out.display()))?;
    Ok(out)
}

#[derive(Clone)]
struct MasterServer {
    master: Master,
}

impl MasterService for MasterServer {
    async fn register(self, _: context::Context, args: RegisterArgs) {
        self.master.register(args.worker);
    }
}
