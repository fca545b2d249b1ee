//! Starting fork processes.
//!
//! The coordinator only needs two things from a launched fork: a way to learn
//! that it exited and a way to kill it. `ForkProcess` wraps either a real
//! child process or an in-process task behind those two operations.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{ForkId, PipelineId};

/// File name of the worker binary.
pub const WORKER_BIN_NAME: &str = "forkplane-worker";

/// Everything a fork needs to find its master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkTarget {
    pub pipeline_id: PipelineId,
    pub fork_id: ForkId,
    pub server_addr: SocketAddr,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn fork process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("fork launch failed: {0}")]
    Other(String),
}

/// How a fork process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkExit {
    Success,
    Failure(String),
    Killed,
}

enum ProcessInner {
    Child(Child),
    Task(JoinHandle<Result<(), String>>),
}

/// A launched fork.
pub struct ForkProcess {
    inner: ProcessInner,
}

impl ForkProcess {
    pub fn from_child(child: Child) -> Self {
        Self {
            inner: ProcessInner::Child(child),
        }
    }

    /// Wraps an in-process fork, e.g. a task running `run_worker`.
    pub fn from_task(handle: JoinHandle<Result<(), String>>) -> Self {
        Self {
            inner: ProcessInner::Task(handle),
        }
    }

    pub fn id(&self) -> Option<u32> {
        match &self.inner {
            ProcessInner::Child(child) => child.id(),
            ProcessInner::Task(_) => None,
        }
    }

    /// Waits for the fork to end. Call at most once to completion.
    pub async fn wait(&mut self) -> ForkExit {
        match &mut self.inner {
            ProcessInner::Child(child) => match child.wait().await {
                Ok(status) if status.success() => ForkExit::Success,
                Ok(status) => ForkExit::Failure(format!("exited with {status}")),
                Err(e) => ForkExit::Failure(format!("failed to wait for process: {e}")),
            },
            ProcessInner::Task(handle) => match handle.await {
                Ok(Ok(())) => ForkExit::Success,
                Ok(Err(message)) => ForkExit::Failure(message),
                Err(e) if e.is_cancelled() => ForkExit::Killed,
                Err(e) => ForkExit::Failure(e.to_string()),
            },
        }
    }

    pub async fn kill(&mut self) {
        match &mut self.inner {
            ProcessInner::Child(child) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid = ?child.id(), error = %e, "Failed to kill fork process");
                }
            }
            ProcessInner::Task(handle) => handle.abort(),
        }
    }
}

/// Extension point for different fork launch strategies.
#[async_trait]
pub trait ForkLauncher: Send + Sync {
    async fn launch(&self, target: &ForkTarget) -> Result<ForkProcess, LaunchError>;
}

/// Spawns the worker binary as a child process.
///
/// stdin and stdout are null; stderr is inherited so fork logs reach the
/// master's terminal.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// The worker binary installed next to the running executable.
    pub fn beside_current_exe() -> Result<Self, LaunchError> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe.with_file_name(WORKER_BIN_NAME)))
    }

    /// Argument placed before the fork's own flags.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn command(&self, target: &ForkTarget) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--pipeline-id")
            .arg(target.pipeline_id.to_string())
            .arg("--fork-id")
            .arg(target.fork_id.to_string())
            .arg("--server-addr")
            .arg(target.server_addr.to_string())
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ForkLauncher for ProcessLauncher {
    async fn launch(&self, target: &ForkTarget) -> Result<ForkProcess, LaunchError> {
        let child = self.command(target).spawn()?;
        tracing::info!(
            program = %self.program.display(),
            pid = ?child.id(),
            fork_id = %target.fork_id,
            "Spawned fork process"
        );
        Ok(ForkProcess::from_child(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn target() -> ForkTarget {
        ForkTarget {
            pipeline_id: PipelineId::new(),
            fork_id: ForkId::new(3),
            server_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    #[test]
    fn command_carries_fork_identity() {
        let target = target();
        let cmd = ProcessLauncher::new("forkplane-worker")
            .with_arg("--verbose")
            .command(&target);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "--verbose".to_string(),
                "--pipeline-id".to_string(),
                target.pipeline_id.to_string(),
                "--fork-id".to_string(),
                "3".to_string(),
                "--server-addr".to_string(),
                "127.0.0.1:4000".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = ProcessLauncher::new("/nonexistent/forkplane-worker")
            .launch(&target())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_maps_to_fork_exit() {
        let mut ok = ProcessLauncher::new("true").launch(&target()).await.unwrap();
        assert!(ok.id().is_some());
        assert_eq!(ok.wait().await, ForkExit::Success);

        let mut bad = ProcessLauncher::new("sh")
            .with_arg("-c")
            .with_arg("exit 3")
            .launch(&target())
            .await
            .unwrap();
        match bad.wait().await {
            ForkExit::Failure(message) => assert!(message.contains('3'), "{message}"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_forks_report_outcome_and_can_be_killed() {
        let mut done = ForkProcess::from_task(tokio::spawn(async { Err("crashed".to_string()) }));
        assert_eq!(done.wait().await, ForkExit::Failure("crashed".to_string()));

        let mut stuck = ForkProcess::from_task(tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));
        stuck.kill().await;
        assert_eq!(stuck.wait().await, ForkExit::Killed);
    }
}
