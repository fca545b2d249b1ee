//! Entry point of a forked worker process.
//!
//! Launched by the master with the pipeline id, its fork id, and the address
//! of the pipeline's control server. stdout stays silent; logs go to stderr.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use forkplane::{BuiltinExecutors, ForkId, PipelineId, WorkerConfig, run_worker};

#[derive(Parser, Debug)]
#[command(name = "forkplane-worker")]
#[command(version)]
#[command(about = "Runs work items handed out by a forkplane master")]
struct Args {
    /// Pipeline this fork belongs to
    #[arg(long, env = "FORKPLANE_PIPELINE_ID")]
    pipeline_id: PipelineId,

    /// Fork id, unique within the pipeline
    #[arg(long, env = "FORKPLANE_FORK_ID")]
    fork_id: u32,

    /// Control server address (host:port)
    #[arg(long, env = "FORKPLANE_SERVER_ADDR")]
    server_addr: String,

    /// Seconds to wait for the control connection
    #[arg(long, default_value = "10")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    forkplane::logging::init_tracing();
    let args = Args::parse();
    tracing::debug!(?args, "Worker starting");

    let config = WorkerConfig::new(args.pipeline_id, ForkId::new(args.fork_id), args.server_addr)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));

    let summary = run_worker(config, &BuiltinExecutors)
        .await
        .context("fork worker failed")?;
    tracing::debug!(?summary, "Worker exiting");
    Ok(())
}
