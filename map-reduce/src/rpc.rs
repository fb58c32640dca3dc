//! Connection-per-call RPC between master and workers.
//!
//! Every call dials a fresh TCP connection, so a stuck worker can only hold
//! up the call made to it. Dial errors, deadline expiry and remote errors
//! all collapse into a failure whose reason only shows up in the log. The
//! one exception is a worker that refused a task because it was busy.

use std::future::Future;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tarpc::{client, context, serde_transport::tcp, tokio_serde::formats::Json};

use crate::{
    MasterServiceClient, RegisterArgs, RunTaskArgs, ShutdownReply, TaskError, WorkerServiceClient,
};

/// Deadline applied to each call unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How the scheduler and the master reach workers.
#[async_trait]
pub trait WorkerCaller: Send + Sync {
    /// Asks `worker` to run a task. `Ok` iff the worker ran it to completion.
    async fn run_task(&self, worker: &str, args: RunTaskArgs) -> Result<(), TaskError>;

    /// Asks `worker` to exit. `None` if the call failed.
    async fn shutdown(&self, worker: &str) -> Option<ShutdownReply>;
}

/// Awaits `reply`, logging and discarding the error on failure.
pub async fn call<T, F>(srv: &str, rpcname: &str, reply: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match reply.await {
        Ok(reply) => Some(reply),
        Err(e) => {
            warn!("RPC {} to {} failed: {:#}", rpcname, srv, e);
            None
        }
    }
}

/// A context whose deadline is `timeout` from now.
pub fn deadline(timeout: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + timeout;
    ctx
}

pub async fn connect_worker(srv: &str) -> Result<WorkerServiceClient> {
    let transport = tcp::connect(srv, Json::default)
        .await
        .with_context(|| format!("unable to dial {}", srv))?;
    Ok(WorkerServiceClient::new(client::Config::default(), transport).spawn())
}

pub async fn connect_master(srv: &str) -> Result<MasterServiceClient> {
    let transport = tcp::connect(srv, Json::default)
        .await
        .with_context(|| format!("unable to dial {}", srv))?;
    Ok(MasterServiceClient::new(client::Config::default(), transport).spawn())
}

/// Tells the master at `master` that `worker` is ready for tasks.
pub async fn register(master: &str, worker: &str, timeout: Duration) -> bool {
    let args = RegisterArgs {
        worker: worker.to_owned(),
    };
    call(master, "Master.Register", async {
        let client = connect_master(master).await?;
        client.register(deadline(timeout), args).await?;
        Ok::<_, anyhow::Error>(())
    })
    .await
    .is_some()
}

/// [`WorkerCaller`] over tarpc.
#[derive(Debug, Clone)]
pub struct RpcCaller {
    timeout: Duration,
}

impl RpcCaller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RpcCaller {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl WorkerCaller for RpcCaller {
    async fn run_task(&self, worker: &str, args: RunTaskArgs) -> Result<(), TaskError> {
        let reply = call(worker, "Worker.RunTask", async {
            let client = connect_worker(worker).await?;
            Ok::<_, anyhow::Error>(client.run_task(deadline(self.timeout), args).await?)
        })
        .await;
        match reply {
            Some(Ok(())) => Ok(()),
            Some(Err(TaskError::Busy)) => {
                debug!("RPC Worker.RunTask to {}: worker busy", worker);
                Err(TaskError::Busy)
            }
            Some(Err(e)) => {
                warn!("RPC Worker.RunTask to {} failed: {}", worker, e);
                Err(e)
            }
            None => Err(TaskError::Failed(format!("unable to reach {}", worker))),
        }
    }

    async fn shutdown(&self, worker: &str) -> Option<ShutdownReply> {
        call(worker, "Worker.Shutdown", async {
            let client = connect_worker(worker).await?;
            Ok::<_, anyhow::Error>(client.shutdown(deadline(self.timeout)).await?)
        })
        .await
    }
}

/// Runs a request future on its own task.
pub(crate) async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}
