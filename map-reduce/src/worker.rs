use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{future, prelude::*};
use log::{debug, error, info, warn};
use tarpc::{
    context,
    server::{self, Channel},
    serde_transport::tcp,
    tokio_serde::formats::Json,
};
use tokio::sync::Notify;
use tokio_util::task::TaskTracker;

use crate::rpc;
use crate::{task, App, RunTaskArgs, ShutdownReply, TaskError, WorkerService, Workspace};

/// A worker process: serves tasks from one master until told to shut down.
#[derive(Debug, Clone)]
pub struct Worker {
    /// Address to listen on. Port 0 picks a free port; the bound address is
    /// what gets registered.
    pub address: String,
    /// Address of the master to register with.
    pub master: String,
    /// Shared directory holding the job's files.
    pub workspace: Workspace,
    pub app: App,
    /// Number of incoming connections to accept before going deaf. `None`
    /// serves until shutdown.
    pub nrpc: Option<usize>,
    /// Deadline for the registration call.
    pub timeout: Duration,
}

struct WorkerState {
    name: String,
    workspace: Workspace,
    app: App,
    ntasks: AtomicUsize,
    busy: AtomicBool,
    stop: Notify,
}

#[derive(Clone)]
struct WorkerServer {
    state: Arc<WorkerState>,
}

/// Clears the busy flag when the task ends, however it ends.
struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl WorkerService for WorkerServer {
    async fn run_task(self, _: context::Context, args: RunTaskArgs) -> Result<(), TaskError> {
        let state = self.state;
        if state.busy.swap(true, Ordering::SeqCst) {
            warn!(
                "{}: {} task #{} sent while another task is running",
                state.name, args.phase, args.task_number
            );
            return Err(TaskError::Busy);
        }
        let _busy = Busy(&state.busy);
        state.ntasks.fetch_add(1, Ordering::SeqCst);

        info!(
            "{}: given {} task #{} on file {:?} (nios: {})",
            state.name, args.phase, args.task_number, args.file, args.num_other_phase
        );
        let (workspace, app) = (state.workspace.clone(), state.app);
        let result = tokio::task::spawn_blocking(move || task::run_task(&workspace, app, &args))
            .await
            .context("task panicked")
            .and_then(|r| r);
        match result {
            Ok(()) => {
                debug!("{}: task done", state.name);
                Ok(())
            }
            Err(e) => {
                error!("{}: task failed: {:#}", state.name, e);
                Err(TaskError::Failed(format!("{:#}", e)))
            }
        }
    }

    async fn shutdown(self, _: context::Context) -> ShutdownReply {
        let state = self.state;
        debug!("{}: shutdown", state.name);
        state.stop.notify_one();
        ShutdownReply {
            ntasks: state.ntasks.load(Ordering::SeqCst),
        }
    }
}

impl Worker {
    /// Registers with the master and serves until shut down or until the
    /// RPC budget runs out. Returns the number of tasks run.
    pub async fn launch(self) -> Result<usize> {
        let mut listener = tcp::listen(&self.address, Json::default)
            .await
            .with_context(|| format!("unable to listen on {}", self.address))?;
        listener.config_mut().max_frame_length(usize::MAX);
        let name = listener.local_addr().to_string();

        let state = Arc::new(WorkerState {
            name: name.clone(),
            workspace: self.workspace,
            app: self.app,
            ntasks: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            stop: Notify::new(),
        });
        let server = WorkerServer {
            state: state.clone(),
        };

        // Connections queue up in the backlog until the accept loop runs.
        if !rpc::register(&self.master, &name, self.timeout).await {
            bail!("{}: unable to register with master {}", name, self.master);
        }
        info!("{}: registered with {}", name, self.master);

        let tracker = TaskTracker::new();
        let accept = listener
            // Ignore accept errors.
            .filter_map(|r| future::ready(r.ok()))
            .take(self.nrpc.unwrap_or(usize::MAX))
            .map(server::BaseChannel::with_defaults)
            .for_each(|channel| {
                tracker.spawn(channel.execute(server.clone().serve()).for_each(rpc::spawn));
                future::ready(())
            });
        tokio::select! {
            _ = accept => info!("{}: RPC budget used up", name),
            _ = state.stop.notified() => {}
        }

        // Let in-flight requests, the shutdown reply included, go out.
        tracker.close();
        tracker.wait().await;
        let ntasks = state.ntasks.load(Ordering::SeqCst);
        info!("{}: exiting after {} tasks", name, ntasks);
        Ok(ntasks)
    }
}
