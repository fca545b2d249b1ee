//! Pipeline: one run's backlog, its forks, and where results go.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::bridge::protocol::{ForkId, PipelineId, WorkItem, WorkOutcome, WorkResult};
use crate::dispatch::PipelineDispatcher;
use crate::fork::{Fork, ForkEvent};
use crate::refork::ReforkItemConfigs;

/// Receives every result the master records.
pub trait ResultSink: Send + Sync {
    fn accept(&self, pipeline_id: PipelineId, fork_id: Option<ForkId>, result: &WorkResult);
}

/// Logs results; the default sink.
pub struct TracingResultSink;

impl ResultSink for TracingResultSink {
    fn accept(&self, pipeline_id: PipelineId, fork_id: Option<ForkId>, result: &WorkResult) {
        let fork = fork_id.map(|id| id.to_string()).unwrap_or_default();
        match &result.outcome {
            WorkOutcome::Success => tracing::info!(
                pipeline = %pipeline_id,
                fork_id = %fork,
                item = %result.item.name,
                duration_millis = result.duration_millis,
                "Item succeeded"
            ),
            WorkOutcome::Failure { message } => tracing::warn!(
                pipeline = %pipeline_id,
                fork_id = %fork,
                item = %result.item.name,
                %message,
                "Item failed"
            ),
            WorkOutcome::Error { message } => tracing::error!(
                pipeline = %pipeline_id,
                fork_id = %fork,
                item = %result.item.name,
                %message,
                "Item errored"
            ),
        }
    }
}

/// What the master tells each fork in `Initialize`, and how it paces them.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub framework_id: String,
    pub refork_configs: ReforkItemConfigs,
    /// Delay handed out in `Wait` when the backlog is temporarily empty.
    pub wait: Duration,
    /// How long a `NextAction` may block in the dispatcher before `Wait` is sent.
    pub poll_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            framework_id: "noop".to_string(),
            refork_configs: ReforkItemConfigs::default(),
            wait: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct ResultCounters {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    errored: AtomicUsize,
    reforks: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub reforks: usize,
}

pub struct Pipeline {
    id: PipelineId,
    settings: PipelineSettings,
    dispatcher: Arc<PipelineDispatcher>,
    forks: DashMap<ForkId, Arc<Fork>>,
    events_tx: mpsc::UnboundedSender<ForkEvent>,
    sink: Arc<dyn ResultSink>,
    counters: ResultCounters,
}

impl Pipeline {
    /// Creates the pipeline and the receiving end of its fork lifecycle events.
    pub fn new(
        id: PipelineId,
        settings: PipelineSettings,
        sink: Arc<dyn ResultSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ForkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(PipelineDispatcher::new(settings.poll_timeout));
        let pipeline = Arc::new(Self {
            id,
            settings,
            dispatcher,
            forks: DashMap::new(),
            events_tx,
            sink,
            counters: ResultCounters::default(),
        });
        (pipeline, events_rx)
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<PipelineDispatcher> {
        &self.dispatcher
    }

    /// Registers a fork slot, or returns the existing one.
    pub fn create_fork(&self, fork_id: ForkId) -> Arc<Fork> {
        let fork = self.forks.entry(fork_id).or_insert_with(|| {
            Arc::new(Fork::new(
                fork_id,
                self.id,
                Arc::clone(&self.dispatcher),
                self.events_tx.clone(),
            ))
        });
        Arc::clone(fork.value())
    }

    pub fn fork(&self, fork_id: ForkId) -> Option<Arc<Fork>> {
        self.forks.get(&fork_id).map(|f| Arc::clone(f.value()))
    }

    pub fn fork_ids(&self) -> Vec<ForkId> {
        let mut ids: Vec<_> = self.forks.iter().map(|f| *f.key()).collect();
        ids.sort();
        ids
    }

    /// Records a result against the backlog and forwards it to the sink.
    pub fn record_result(&self, fork_id: Option<ForkId>, result: &WorkResult) {
        let counter = match result.outcome {
            WorkOutcome::Success => &self.counters.succeeded,
            WorkOutcome::Failure { .. } => &self.counters.failed,
            WorkOutcome::Error { .. } => &self.counters.errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.record_result();
        self.sink.accept(self.id, fork_id, result);
    }

    /// Reports an item that never made it into the backlog as an error.
    pub(crate) fn reject_item(&self, item: WorkItem, reason: &str) {
        let result = WorkResult::error(item, reason, Duration::ZERO);
        self.counters.errored.fetch_add(1, Ordering::Relaxed);
        self.sink.accept(self.id, None, &result);
    }

    pub(crate) fn note_refork(&self) {
        self.counters.reforks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_counts(&self) -> ResultCounts {
        ResultCounts {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            errored: self.counters.errored.load(Ordering::Relaxed),
            reforks: self.counters.reforks.load(Ordering::Relaxed),
        }
    }
}
