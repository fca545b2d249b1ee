//! Work executors run inside a fork.
//!
//! The master names a framework in `Initialize`; the worker resolves it
//! through an `ExecutorFactory` and drives the resulting executor from its
//! single execution thread.

use std::process::{Command, Stdio};
use std::time::Instant;

use serde::Deserialize;

use crate::bridge::protocol::{WorkItem, WorkResult};

/// Error raised while executing an item; converted into an `error` result.
pub type ExecutionError = Box<dyn std::error::Error + Send + Sync>;

/// Runs one item at a time. May block, may fail, may panic.
pub trait WorkExecutor: Send {
    fn execute(&mut self, item: &WorkItem) -> Result<WorkResult, ExecutionError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("unknown framework '{0}'")]
    UnknownFramework(String),
}

/// Resolves the framework named in `Initialize`.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, framework_id: &str) -> Result<Box<dyn WorkExecutor>, ExecutorError>;
}

/// Every item succeeds immediately.
#[derive(Debug, Default)]
pub struct NoopExecutor;

impl WorkExecutor for NoopExecutor {
    fn execute(&mut self, item: &WorkItem) -> Result<WorkResult, ExecutionError> {
        let start = Instant::now();
        Ok(WorkResult::success(item.clone(), start.elapsed()))
    }
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    argv: Vec<String>,
}

/// Runs `payload.argv` as a child process; exit status 0 is a success.
#[derive(Debug, Default)]
pub struct CommandExecutor;

impl WorkExecutor for CommandExecutor {
    fn execute(&mut self, item: &WorkItem) -> Result<WorkResult, ExecutionError> {
        let payload: CommandPayload = serde_json::from_value(item.payload.clone())
            .map_err(|e| format!("item {} has no runnable argv: {e}", item.name))?;
        let Some((program, args)) = payload.argv.split_first() else {
            return Err(format!("item {} has an empty argv", item.name).into());
        };

        let start = Instant::now();
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| format!("failed to run {program}: {e}"))?;
        let elapsed = start.elapsed();

        tracing::debug!(item = %item.name, %program, ?status, "Command finished");
        if status.success() {
            Ok(WorkResult::success(item.clone(), elapsed))
        } else {
            Ok(WorkResult::failure(
                item.clone(),
                format!("{program} exited with {status}"),
                elapsed,
            ))
        }
    }
}

/// Resolves `noop` and `command`.
#[derive(Debug, Default)]
pub struct BuiltinExecutors;

impl ExecutorFactory for BuiltinExecutors {
    fn create(&self, framework_id: &str) -> Result<Box<dyn WorkExecutor>, ExecutorError> {
        match framework_id {
            "noop" => Ok(Box::new(NoopExecutor)),
            "command" => Ok(Box::new(CommandExecutor)),
            other => Err(ExecutorError::UnknownFramework(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::WorkOutcome;
    use serde_json::json;

    #[test]
    fn builtin_factory_resolves_known_frameworks() {
        assert!(BuiltinExecutors.create("noop").is_ok());
        assert!(BuiltinExecutors.create("command").is_ok());
        assert_eq!(
            BuiltinExecutors.create("junit").err(),
            Some(ExecutorError::UnknownFramework("junit".to_string()))
        );
    }

    #[test]
    fn noop_succeeds() {
        let result = NoopExecutor.execute(&WorkItem::new("a")).unwrap();
        assert!(result.is_success());
        assert_eq!(result.item.name, "a");
    }

    #[cfg(unix)]
    #[test]
    fn command_exit_status_decides_outcome() {
        let ok = WorkItem::new("ok").with_payload(json!({"argv": ["true"]}));
        let bad = WorkItem::new("bad").with_payload(json!({"argv": ["false"]}));

        assert!(CommandExecutor.execute(&ok).unwrap().is_success());
        let result = CommandExecutor.execute(&bad).unwrap();
        assert!(matches!(result.outcome, WorkOutcome::Failure { .. }));
    }

    #[test]
    fn command_without_argv_is_an_execution_error() {
        let err = CommandExecutor
            .execute(&WorkItem::new("plain"))
            .unwrap_err();
        assert!(err.to_string().contains("plain"));

        let empty = WorkItem::new("empty").with_payload(json!({"argv": []}));
        assert!(CommandExecutor.execute(&empty).is_err());
    }
}
