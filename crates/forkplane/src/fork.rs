//! Fork state machine.
//!
//! One `Fork` per worker slot. Every lifecycle transition goes through the
//! fork's mutex and is checked against the legal transition table; an illegal
//! transition is a protocol bug and returns `ForkError::IllegalTransition`
//! with the status left untouched.
//!
//! ```text
//! STOPPED/FAILED/ABORTED/RESTARTING --starting()--> STARTING
//! STARTED                           --restarting()--> RESTARTING
//! STARTING/RESTARTING               --started()--> STARTED
//! STARTED                           --stopping()--> STOPPING   (no-op when RESTARTING)
//! STOPPING/RESTARTING               --stopped()--> STOPPED
//! STARTED/STARTING/RESTARTING/STOPPING --failed()--> FAILED
//! STARTED/STARTING/RESTARTING/STOPPING --aborted()--> ABORTED
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::protocol::{ForkId, PipelineId, WorkItem, WorkResult};
use crate::dispatch::PipelineDispatcher;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForkStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Restarting,
    Stopping,
    Failed,
    Aborted,
}

impl ForkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Started => "STARTED",
            Self::Restarting => "RESTARTING",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }

    /// The fork holds no process and is out of the pipeline's active set.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Aborted)
    }

    fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Started | Self::Starting | Self::Restarting | Self::Stopping
        )
    }
}

impl std::fmt::Display for ForkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOperation {
    Starting,
    Restarting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Aborted,
}

impl ForkOperation {
    fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Restarting => "restarting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Target status if `op` is legal from `from`. `Ok(None)` is a legal no-op.
    fn target(self, from: ForkStatus) -> Option<Option<ForkStatus>> {
        use ForkStatus::*;
        match (self, from) {
            (Self::Starting, Stopped | Failed | Aborted | Restarting) => Some(Some(Starting)),
            (Self::Restarting, Started) => Some(Some(Restarting)),
            (Self::Started, Starting | Restarting) => Some(Some(Started)),
            (Self::Stopping, Started) => Some(Some(Stopping)),
            (Self::Stopping, Restarting) => Some(None),
            (Self::Stopped, Stopping | Restarting) => Some(Some(Stopped)),
            (Self::Failed, s) if s.is_live() => Some(Some(Failed)),
            (Self::Aborted, s) if s.is_live() => Some(Some(Aborted)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ForkOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ForkError {
    #[error("fork {fork_id}: illegal transition {operation}() from {status}")]
    IllegalTransition {
        fork_id: ForkId,
        operation: ForkOperation,
        status: ForkStatus,
    },
    #[error("fork {fork_id}: pipeline is stopping, refusing to start")]
    PipelineStopping { fork_id: ForkId },
}

/// Lifecycle notification emitted after every applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkEvent {
    pub pipeline_id: PipelineId,
    pub fork_id: ForkId,
    pub from: ForkStatus,
    pub to: ForkStatus,
    /// Set when the fork is being recycled rather than retired.
    pub restarting: bool,
}

#[derive(Debug, Default)]
struct ForkInner {
    status: ForkStatus,
    /// Item handed out to the current process; kept on failure for retry.
    current_item: Option<WorkItem>,
    /// Item of a failed process waiting for the relaunched one.
    pending_retry: Option<WorkItem>,
    /// Item an aborted fork never finished, parked for `take_unfinished_item`.
    unfinished: Option<WorkItem>,
    restarting: bool,
    /// Bumped on every `starting()`; identifies one process launch.
    generation: u64,
    failures: u32,
    /// The current process has been handed at least one item.
    worked: bool,
    /// Consecutive processes that failed before being handed any item.
    startup_failures: u32,
}

/// Master-side view of one worker slot.
pub struct Fork {
    id: ForkId,
    pipeline_id: PipelineId,
    inner: Mutex<ForkInner>,
    dispatcher: Arc<PipelineDispatcher>,
    events: mpsc::UnboundedSender<ForkEvent>,
}

impl Fork {
    pub fn new(
        id: ForkId,
        pipeline_id: PipelineId,
        dispatcher: Arc<PipelineDispatcher>,
        events: mpsc::UnboundedSender<ForkEvent>,
    ) -> Self {
        Self {
            id,
            pipeline_id,
            inner: Mutex::new(ForkInner::default()),
            dispatcher,
            events,
        }
    }

    pub fn id(&self) -> ForkId {
        self.id
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    fn lock(&self) -> MutexGuard<'_, ForkInner> {
        // Transitions are validated before any field is written, so the
        // state behind a poisoned lock is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!(fork_id = %self.id, "Fork mutex poisoned");
            poisoned.into_inner()
        })
    }

    pub fn status(&self) -> ForkStatus {
        self.lock().status
    }

    pub fn is_restarting(&self) -> bool {
        self.lock().restarting
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Failures in a row of processes that never got an item; reset by the
    /// first item handed out.
    pub fn startup_failures(&self) -> u32 {
        self.lock().startup_failures
    }

    pub fn current_item(&self) -> Option<WorkItem> {
        self.lock().current_item.clone()
    }

    /// Launch (or relaunch) the fork's process. Refused once the pipeline is stopping.
    pub fn starting(&self) -> Result<u64, ForkError> {
        let Some(added) = self.dispatcher.try_add_running_fork(self.id) else {
            tracing::debug!(fork_id = %self.id, "Refusing to start fork, pipeline stopping");
            return Err(ForkError::PipelineStopping { fork_id: self.id });
        };
        let result = self.transition(ForkOperation::Starting, |inner| {
            if inner.status == ForkStatus::Failed {
                inner.pending_retry = inner.current_item.take();
            }
            inner.current_item = None;
            inner.worked = false;
            inner.generation += 1;
        });
        if result.is_err() && added {
            self.leave_pipeline();
        }
        result
    }

    /// Marks the fork for recycling; its process should be relaunched after it stops.
    pub fn restarting(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Restarting, |inner| {
            inner.restarting = true;
            inner.current_item = None;
        })?;
        Ok(())
    }

    pub fn started(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Started, |inner| {
            inner.restarting = false;
        })?;
        Ok(())
    }

    pub fn stopping(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Stopping, |inner| {
            inner.current_item = None;
        })?;
        Ok(())
    }

    pub fn stopped(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Stopped, |inner| {
            inner.current_item = None;
        })?;
        self.leave_pipeline();
        Ok(())
    }

    /// The fork's process died; the item it was running is kept for retry.
    pub fn failed(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Failed, |inner| {
            inner.failures += 1;
            if !inner.worked {
                inner.startup_failures += 1;
            }
            if inner.current_item.is_none() {
                inner.current_item = inner.pending_retry.take();
            }
        })?;
        self.leave_pipeline();
        Ok(())
    }

    /// Discards the fork without retry; no further items are attributed to it.
    /// An item it had not finished is parked for `take_unfinished_item`.
    pub fn aborted(&self) -> Result<(), ForkError> {
        self.transition(ForkOperation::Aborted, |inner| {
            inner.restarting = false;
            if let Some(item) = inner.current_item.take().or_else(|| inner.pending_retry.take()) {
                inner.unfinished = Some(item);
            }
        })?;
        self.leave_pipeline();
        Ok(())
    }

    /// Takes the item a failed or aborted fork never finished.
    pub fn take_unfinished_item(&self) -> Option<WorkItem> {
        let mut inner = self.lock();
        if !inner.status.is_terminal() {
            return None;
        }
        let inner = &mut *inner;
        inner
            .current_item
            .take()
            .or_else(|| inner.pending_retry.take())
            .or_else(|| inner.unfinished.take())
    }

    /// A result for the fork's current item arrived; nothing is left to retry.
    pub fn complete_current(&self, result: &WorkResult) {
        let mut inner = self.lock();
        match inner.current_item.take() {
            Some(item) if item.name != result.item.name => {
                tracing::warn!(
                    fork_id = %self.id,
                    expected = %item.name,
                    received = %result.item.name,
                    "Result does not match the item handed out"
                );
            }
            _ => {}
        }
    }

    /// Scheduling decision for one `NextAction` request.
    ///
    /// A failed fork gets its remembered item back, a started fork gets the
    /// next item from the dispatcher, any other status gets nothing. Afterwards
    /// the pipeline is stopped if splitting ended and every item has a result.
    pub async fn next_item(&self) -> Option<WorkItem> {
        enum Pick {
            Remembered(Option<WorkItem>),
            Dispatch,
        }

        let pick = {
            let mut inner = self.lock();
            match inner.status {
                ForkStatus::Failed => Pick::Remembered(inner.current_item.clone()),
                ForkStatus::Started => match inner.pending_retry.take() {
                    Some(item) => {
                        tracing::info!(fork_id = %self.id, item = %item.name, "Retrying item of failed fork");
                        inner.current_item = Some(item.clone());
                        inner.worked = true;
                        inner.startup_failures = 0;
                        Pick::Remembered(Some(item))
                    }
                    None => Pick::Dispatch,
                },
                _ => Pick::Remembered(None),
            }
        };

        let item = match pick {
            Pick::Remembered(item) => item,
            Pick::Dispatch => match self.dispatcher.next_item().await {
                Some(item) => {
                    let mut inner = self.lock();
                    if inner.status == ForkStatus::Started {
                        inner.current_item = Some(item.clone());
                        inner.worked = true;
                        inner.startup_failures = 0;
                        Some(item)
                    } else {
                        drop(inner);
                        tracing::debug!(fork_id = %self.id, item = %item.name, "Fork left STARTED while waiting, returning item");
                        self.dispatcher.requeue(item);
                        None
                    }
                }
                None => None,
            },
        };

        if let Some(ref item) = item {
            tracing::debug!(fork_id = %self.id, item = %item.name, "Handing out item");
        }
        self.dispatcher.check_completion();
        item
    }

    fn transition(
        &self,
        operation: ForkOperation,
        apply: impl FnOnce(&mut ForkInner),
    ) -> Result<u64, ForkError> {
        let mut inner = self.lock();
        let from = inner.status;
        let Some(target) = operation.target(from) else {
            tracing::error!(
                fork_id = %self.id,
                pipeline = %self.pipeline_id,
                %operation,
                status = %from,
                "Illegal fork transition"
            );
            return Err(ForkError::IllegalTransition {
                fork_id: self.id,
                operation,
                status: from,
            });
        };
        let Some(to) = target else {
            tracing::debug!(fork_id = %self.id, %operation, status = %from, "Transition is a no-op");
            return Ok(inner.generation);
        };

        apply(&mut inner);
        inner.status = to;
        let event = ForkEvent {
            pipeline_id: self.pipeline_id,
            fork_id: self.id,
            from,
            to,
            restarting: inner.restarting,
        };
        let generation = inner.generation;
        drop(inner);

        tracing::debug!(fork_id = %self.id, %from, %to, "Fork transition");
        if self.events.send(event).is_err() {
            tracing::trace!(fork_id = %self.id, "Fork event receiver dropped");
        }
        Ok(generation)
    }

    fn leave_pipeline(&self) {
        if self.dispatcher.remove_running_fork(self.id) && self.dispatcher.is_stopping() {
            tracing::info!(pipeline = %self.pipeline_id, fork_id = %self.id, "Last fork stopped");
            self.dispatcher.signal_all_stopped();
        }
    }
}
