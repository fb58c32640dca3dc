use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use log::info;
use structopt::StructOpt;

use mapreduce::app::wc;
use mapreduce::{Job, Master, MasterConfig, RetryPolicy, Worker, Workspace};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
enum Opt {
    /// Run a word count job
    Master {
        /// `sequential` to run in-process, otherwise the address to accept
        /// worker registrations on
        target: String,

        /// Directory holding the input files, one map task per file
        #[structopt(parse(from_os_str))]
        input_dir: PathBuf,

        /// Shared directory for intermediate and output files
        #[structopt(long, default_value = "mr-tmp", parse(from_os_str))]
        dir: PathBuf,

        #[structopt(long, default_value = "3")]
        nreduce: usize,

        /// Timeout in seconds used for communication with workers
        #[structopt(short, long, default_value = "60")]
        timeout: u64,

        /// Give up on a task after this many failed attempts
        #[structopt(long)]
        max_attempts: Option<usize>,

        #[structopt(long)]
        job_name: Option<String>,
    },
    /// Serve tasks for a master
    Worker {
        /// Address of the master
        master: String,

        /// Address to serve on
        address: String,

        /// Shared directory for intermediate and output files
        #[structopt(long, default_value = "mr-tmp", parse(from_os_str))]
        dir: PathBuf,

        /// Timeout in seconds used for registration
        #[structopt(short, long, default_value = "60")]
        timeout: u64,

        /// Stop accepting connections after this many
        #[structopt(long)]
        nrpc: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    match Opt::from_args() {
        Opt::Master {
            target,
            input_dir,
            dir,
            nreduce,
            timeout,
            max_attempts,
            job_name,
        } => {
            let workspace = Workspace::new(dir);
            let master = if target == "sequential" {
                let name = job_name.unwrap_or_else(|| "wcnt_seq".into());
                let job = Job::from_dir(name, &input_dir, nreduce)?;
                Master::sequential(job, workspace, wc::app())
            } else {
                let name = job_name.unwrap_or_else(|| "wcnt_dist".into());
                let job = Job::from_dir(name, &input_dir, nreduce)?;
                let config = MasterConfig {
                    timeout: Duration::from_secs(timeout),
                    retry: RetryPolicy { max_attempts },
                };
                let master = Master::distributed(job, workspace, &target, config).await?;
                info!("master listening on {}", master.address());
                master
            };
            let report = master.wait().await?;
            println!("output: {}", report.output.display());
            println!("tasks per worker: {:?}", report.stats);
        }
        Opt::Worker {
            master,
            address,
            dir,
            timeout,
            nrpc,
        } => {
            let ntasks = Worker {
                address,
                master,
                workspace: Workspace::new(dir),
                app: wc::app(),
                nrpc,
                timeout: Duration::from_secs(timeout),
            }
            .launch()
            .await?;
            info!("worker done after {} tasks", ntasks);
        }
    }
    Ok(())
}
