//! Wire protocol types for master-fork communication.
//!
//! One TCP connection per fork. The fork drives the exchange:
//! - **ForkRequest** (fork → master): ForkStarted, NextAction, ForkStopped
//! - **ForkAction** (master → fork): exactly one reply per NextAction

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::refork::{ReforkDecisionContext, ReforkItemConfigs};

/// Identifier of a pipeline (one logical run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(uuid::Uuid);

impl PipelineId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for PipelineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PipelineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Fork slot number, unique within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForkId(u32);

impl ForkId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ForkId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Opaque unit of work handed to a fork (typically one test class).
///
/// Only `name` is used for logging; the payload is passed through untouched
/// to the executor named by the pipeline's framework id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// How the execution of one item ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkOutcome {
    Success,
    /// The work ran and reported a failure (e.g. a failing test).
    Failure { message: String },
    /// The executor itself errored or panicked.
    Error { message: String },
}

impl WorkOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    pub item: WorkItem,
    pub outcome: WorkOutcome,
    pub duration_millis: u64,
}

impl WorkResult {
    pub fn success(item: WorkItem, duration: Duration) -> Self {
        Self {
            item,
            outcome: WorkOutcome::Success,
            duration_millis: duration_millis(duration),
        }
    }

    pub fn failure(item: WorkItem, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            item,
            outcome: WorkOutcome::Failure {
                message: message.into(),
            },
            duration_millis: duration_millis(duration),
        }
    }

    pub fn error(item: WorkItem, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            item,
            outcome: WorkOutcome::Error {
                message: message.into(),
            },
            duration_millis: duration_millis(duration),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Messages from fork to master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForkRequest {
    /// First message after connecting.
    ForkStarted { fork_id: ForkId },

    /// Asks the master what to do next. Carries the outcome of the previous
    /// action; both fields are absent on the very first request.
    NextAction {
        fork_id: ForkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_result: Option<WorkResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refork_context: Option<ReforkDecisionContext>,
    },

    /// Last message before the fork closes its connection.
    ForkStopped { fork_id: ForkId },
}

impl ForkRequest {
    pub fn fork_id(&self) -> ForkId {
        match self {
            Self::ForkStarted { fork_id }
            | Self::NextAction { fork_id, .. }
            | Self::ForkStopped { fork_id } => *fork_id,
        }
    }
}

/// Replies from master to fork, one per `NextAction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForkAction {
    /// Always the reply to a connection's first request.
    Initialize {
        framework_id: String,
        refork_configs: ReforkItemConfigs,
    },

    Execute { item: WorkItem },

    /// Backlog temporarily empty; ask again after the given delay.
    Wait { millis: u64 },

    Stop,
}
