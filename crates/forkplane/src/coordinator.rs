//! Master-side driver for one pipeline run.
//!
//! The coordinator owns everything around the control server: it feeds the
//! backlog, launches forks, reacts to their lifecycle events (relaunching
//! recycled forks, retrying failed ones), and tears the pipeline down once
//! its last fork has stopped.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::bridge::protocol::{ForkId, PipelineId, WorkItem, WorkResult};
use crate::fork::{Fork, ForkEvent, ForkStatus};
use crate::launcher::{ForkExit, ForkTarget, ForkLauncher};
use crate::pipeline::{Pipeline, PipelineSettings, ResultSink, TracingResultSink};
use crate::refork::{ReforkItemConfig, ReforkItemConfigs, ReforkMoment, ReforkSignal};
use crate::server::{ServerError, ServerRegistry};

/// How long fork processes get to exit on their own after the pipeline stopped.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_MAX_STARTUP_FAILURES: u32 = 2;
const DEFAULT_STARTUP_BACKOFF: Duration = Duration::from_millis(100);
const MAX_STARTUP_BACKOFF: Duration = Duration::from_secs(5);

/// How often a fork is relaunched after its process failed.
///
/// A process that fails after taking work is relaunched at once so its item
/// can be retried. One that fails before taking any item has nothing to
/// retry; it is relaunched with exponential backoff, and the fork is given up
/// after `max_startup_failures` such failures in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Relaunches allowed per fork. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub max_startup_failures: u32,
    /// Delay after the first startup failure; doubles with each further one.
    pub startup_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            max_startup_failures: DEFAULT_MAX_STARTUP_FAILURES,
            startup_backoff: DEFAULT_STARTUP_BACKOFF,
        }
    }

    pub fn max_attempts(n: u32) -> Self {
        Self {
            max_attempts: Some(n),
            ..Self::unlimited()
        }
    }

    pub fn with_startup_failures(mut self, n: u32) -> Self {
        self.max_startup_failures = n;
        self
    }

    pub fn with_startup_backoff(mut self, backoff: Duration) -> Self {
        self.startup_backoff = backoff;
        self
    }

    fn allows(&self, failures: u32) -> bool {
        self.max_attempts.is_none_or(|max| failures <= max)
    }

    fn allows_startup(&self, startup_failures: u32) -> bool {
        startup_failures <= self.max_startup_failures
    }

    fn backoff(&self, startup_failures: u32) -> Duration {
        if startup_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(startup_failures - 1).unwrap_or(u32::MAX);
        self.startup_backoff
            .saturating_mul(factor)
            .min(MAX_STARTUP_BACKOFF)
    }
}

pub struct PipelineConfig {
    pub framework_id: String,
    pub forks: usize,
    pub refork_configs: ReforkItemConfigs,
    pub wait: Duration,
    pub poll_timeout: Duration,
    pub retry: RetryPolicy,
    /// Interface the control server binds to.
    pub host: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let settings = PipelineSettings::default();
        Self {
            framework_id: settings.framework_id,
            forks: 1,
            refork_configs: settings.refork_configs,
            wait: settings.wait,
            poll_timeout: settings.poll_timeout,
            retry: RetryPolicy::default(),
            host: "127.0.0.1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_framework(mut self, framework_id: impl Into<String>) -> Self {
        self.framework_id = framework_id.into();
        self
    }

    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks;
        self
    }

    /// Recycle each fork after `n` executed items. Zero disables recycling.
    pub fn with_fork_every(mut self, n: u64) -> Self {
        self.refork_configs
            .items
            .retain(|c| c.signal != ReforkSignal::ExecutedItems);
        self.refork_configs = self.refork_configs.with_item(ReforkItemConfig::new(
            ReforkSignal::ExecutedItems,
            ReforkMoment::AfterExecution,
            n,
        ));
        self
    }

    pub fn with_refork_configs(mut self, configs: ReforkItemConfigs) -> Self {
        self.refork_configs = configs;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            framework_id: self.framework_id.clone(),
            refork_configs: self.refork_configs.clone(),
            wait: self.wait,
            poll_timeout: self.poll_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("a pipeline needs at least one fork")]
    NoForks,
    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: PipelineId,
    pub forks: usize,
    /// Fork processes launched, including relaunches.
    pub launches: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub reforks: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.errored
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

pub struct Coordinator {
    registry: Arc<ServerRegistry>,
    launcher: Arc<dyn ForkLauncher>,
    sink: Arc<dyn ResultSink>,
}

impl Coordinator {
    pub fn new(registry: Arc<ServerRegistry>, launcher: Arc<dyn ForkLauncher>) -> Self {
        Self {
            registry,
            launcher,
            sink: Arc::new(TracingResultSink),
        }
    }

    pub fn with_result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs a pipeline to completion.
    ///
    /// Items are read from `items` until its sender is dropped, which ends
    /// splitting. Returns once every fork has stopped and the control server
    /// is shut down.
    pub async fn run(
        &self,
        config: PipelineConfig,
        items: mpsc::Receiver<WorkItem>,
    ) -> Result<PipelineSummary, CoordinatorError> {
        if config.forks == 0 {
            return Err(CoordinatorError::NoForks);
        }
        let started_at = Utc::now();

        let (pipeline, mut events) =
            Pipeline::new(PipelineId::new(), config.settings(), Arc::clone(&self.sink));
        let id = pipeline.id();
        self.registry
            .add(Arc::clone(&pipeline), config.host.as_str())
            .await?;
        let addr = match self.registry.start(id).await {
            Ok(addr) => addr,
            Err(e) => {
                self.registry.remove(id).await;
                return Err(e.into());
            }
        };
        tracing::info!(pipeline = %id, %addr, forks = config.forks, "Pipeline started");

        let (stop_feed, feed_stopped) = oneshot::channel();
        let feeder = tokio::spawn(feed_items(Arc::clone(&pipeline), items, feed_stopped));
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel();
        let (relaunch_tx, mut relaunch_rx) = mpsc::unbounded_channel();
        let mut run = PipelineRun {
            pipeline: Arc::clone(&pipeline),
            launcher: Arc::clone(&self.launcher),
            addr,
            retry: config.retry,
            exits_tx,
            relaunch_tx,
            processes: HashMap::new(),
            live: BTreeSet::new(),
            launches: 0,
        };

        for n in 0..config.forks {
            let fork = pipeline.create_fork(ForkId::new(n as u32));
            run.launch(&fork).await;
        }

        let dispatcher = Arc::clone(pipeline.dispatcher());
        loop {
            run.check_stalled();
            tokio::select! {
                biased;

                Some(event) = events.recv() => run.on_event(event).await,

                Some(exit) = exits_rx.recv() => run.on_exit(exit),

                Some(fork_id) = relaunch_rx.recv() => run.relaunch(fork_id).await,

                _ = dispatcher.wait_all_stopped() => break,
            }
        }
        tracing::info!(pipeline = %id, "All forks stopped");

        let _ = stop_feed.send(());
        if let Err(e) = feeder.await {
            tracing::warn!(pipeline = %id, error = %e, "Item feeder ended abnormally");
        }
        run.reap(&mut exits_rx).await;
        self.registry.stop(id).await?;
        self.registry.remove(id).await;

        let counts = pipeline.result_counts();
        let summary = PipelineSummary {
            pipeline_id: id,
            forks: config.forks,
            launches: run.launches,
            succeeded: counts.succeeded,
            failed: counts.failed,
            errored: counts.errored,
            reforks: counts.reforks,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            pipeline = %id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            errored = summary.errored,
            reforks = summary.reforks,
            "Pipeline finished"
        );
        Ok(summary)
    }
}

/// Moves items from the caller's channel into the backlog until the sender
/// closes (splitting ends) or the coordinator says stop. Items the pipeline
/// can no longer accept are reported as errors.
async fn feed_items(
    pipeline: Arc<Pipeline>,
    mut items: mpsc::Receiver<WorkItem>,
    mut stop: oneshot::Receiver<()>,
) {
    const REJECTED: &str = "pipeline stopped before the item was queued";
    let dispatcher = pipeline.dispatcher();
    let mut fed = 0usize;

    loop {
        tokio::select! {
            biased;

            item = items.recv() => match item {
                Some(item) => match dispatcher.enqueue(item.clone()) {
                    Ok(()) => fed += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "Pipeline no longer accepts items");
                        pipeline.reject_item(item, REJECTED);
                    }
                },
                None => {
                    tracing::debug!(fed, "Item source closed");
                    dispatcher.end_splitting();
                    // An empty or already drained backlog completes here, not on the next request.
                    dispatcher.check_completion();
                    return;
                }
            },

            _ = &mut stop => break,
        }
    }

    items.close();
    while let Ok(item) = items.try_recv() {
        pipeline.reject_item(item, REJECTED);
    }
    tracing::debug!(fed, "Item feed stopped");
}

struct ProcessExit {
    fork_id: ForkId,
    generation: u64,
    exit: ForkExit,
}

struct PipelineRun {
    pipeline: Arc<Pipeline>,
    launcher: Arc<dyn ForkLauncher>,
    addr: SocketAddr,
    retry: RetryPolicy,
    exits_tx: mpsc::UnboundedSender<ProcessExit>,
    /// Forks whose backoff ran out.
    relaunch_tx: mpsc::UnboundedSender<ForkId>,
    /// Kill switch per fork, tagged with the launch generation it belongs to.
    processes: HashMap<ForkId, (u64, oneshot::Sender<()>)>,
    /// Forks that hold or are about to hold a process, as far as processed events tell.
    live: BTreeSet<ForkId>,
    launches: usize,
}

impl PipelineRun {
    async fn launch(&mut self, fork: &Arc<Fork>) {
        let fork_id = fork.id();
        let generation = match fork.starting() {
            Ok(generation) => generation,
            Err(e) => {
                tracing::debug!(%fork_id, error = %e, "Not launching fork");
                self.live.remove(&fork_id);
                self.record_unfinished(fork, "pipeline stopped before the item could be retried");
                return;
            }
        };
        self.live.insert(fork_id);

        let target = ForkTarget {
            pipeline_id: self.pipeline.id(),
            fork_id,
            server_addr: self.addr,
        };
        let mut process = match self.launcher.launch(&target).await {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(%fork_id, error = %e, "Failed to launch fork");
                if let Err(e) = fork.aborted() {
                    tracing::warn!(%fork_id, error = %e, "Could not abort fork");
                }
                return;
            }
        };
        self.launches += 1;
        tracing::debug!(%fork_id, generation, "Fork launched");

        let (kill_tx, mut kill_rx) = oneshot::channel();
        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = process.wait() => exit,
                Ok(()) = &mut kill_rx => {
                    process.kill().await;
                    ForkExit::Killed
                }
            };
            let _ = exits.send(ProcessExit {
                fork_id,
                generation,
                exit,
            });
        });
        self.processes.insert(fork_id, (generation, kill_tx));
    }

    async fn on_event(&mut self, event: ForkEvent) {
        let Some(fork) = self.pipeline.fork(event.fork_id) else {
            return;
        };
        let fork_id = event.fork_id;
        match event.to {
            ForkStatus::Stopped if event.restarting => {
                tracing::info!(%fork_id, "Relaunching recycled fork");
                self.launch(&fork).await;
            }
            ForkStatus::Stopped => {
                self.live.remove(&fork_id);
            }
            ForkStatus::Failed => {
                let failures = fork.failures();
                let startup_failures = fork.startup_failures();
                if !self.retry.allows(failures) {
                    tracing::error!(%fork_id, failures, "Fork failed too often, giving up");
                    self.live.remove(&fork_id);
                    self.record_unfinished(&fork, "fork failed repeatedly while running the item");
                } else if !self.retry.allows_startup(startup_failures) {
                    tracing::error!(%fork_id, startup_failures, "Fork keeps failing before taking work, giving up");
                    self.live.remove(&fork_id);
                    self.record_unfinished(&fork, "fork failed before it could retry the item");
                } else if startup_failures > 0 {
                    let delay = self.retry.backoff(startup_failures);
                    tracing::warn!(%fork_id, startup_failures, ?delay, "Fork failed before taking work, relaunching after backoff");
                    self.schedule_relaunch(fork_id, delay);
                } else {
                    tracing::warn!(%fork_id, failures, "Fork failed, relaunching");
                    self.launch(&fork).await;
                }
            }
            ForkStatus::Aborted => {
                self.live.remove(&fork_id);
                self.record_unfinished(&fork, "fork aborted while running the item");
            }
            _ => {}
        }
    }

    /// The fork stays live while it waits, so the backlog is not orphaned.
    fn schedule_relaunch(&self, fork_id: ForkId, delay: Duration) {
        let relaunch = self.relaunch_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = relaunch.send(fork_id);
        });
    }

    async fn relaunch(&mut self, fork_id: ForkId) {
        if let Some(fork) = self.pipeline.fork(fork_id)
            && fork.status() == ForkStatus::Failed
        {
            self.launch(&fork).await;
        }
    }

    fn on_exit(&mut self, exit: ProcessExit) {
        let ProcessExit {
            fork_id,
            generation,
            exit,
        } = exit;
        if self
            .processes
            .get(&fork_id)
            .is_some_and(|(g, _)| *g == generation)
        {
            self.processes.remove(&fork_id);
        }

        let Some(fork) = self.pipeline.fork(fork_id) else {
            return;
        };
        if fork.generation() != generation {
            tracing::trace!(%fork_id, generation, "Exit of a superseded fork process");
            return;
        }
        match fork.status() {
            ForkStatus::Starting => {
                tracing::error!(%fork_id, ?exit, "Fork process exited before connecting");
                if let Err(e) = fork.aborted() {
                    tracing::warn!(%fork_id, error = %e, "Could not abort fork");
                }
            }
            status if status.is_terminal() => {
                tracing::debug!(%fork_id, ?exit, "Fork process exited");
            }
            status => {
                // The session sees the connection drop and fails the fork.
                tracing::warn!(%fork_id, %status, ?exit, "Fork process exited while connected");
            }
        }
    }

    /// Ends the pipeline when no fork is left to run the backlog.
    fn check_stalled(&mut self) {
        let dispatcher = self.pipeline.dispatcher();
        if !self.live.is_empty() || dispatcher.is_stopping() {
            return;
        }
        dispatcher.stop();
        let orphaned = dispatcher.drain_backlog();
        tracing::error!(
            pipeline = %self.pipeline.id(),
            orphaned = orphaned.len(),
            "No fork left to run the backlog, stopping pipeline"
        );
        for item in orphaned {
            self.pipeline.record_result(
                None,
                &WorkResult::error(item, "no fork left to run the item", Duration::ZERO),
            );
        }
    }

    fn record_unfinished(&self, fork: &Fork, message: &str) {
        if let Some(item) = fork.take_unfinished_item() {
            self.pipeline
                .record_result(Some(fork.id()), &WorkResult::error(item, message, Duration::ZERO));
        }
    }

    /// Gives fork processes a grace period to exit, then kills the rest.
    async fn reap(&mut self, exits: &mut mpsc::UnboundedReceiver<ProcessExit>) {
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.processes.is_empty() {
            match tokio::time::timeout_at(deadline, exits.recv()).await {
                Ok(Some(exit)) => {
                    if self
                        .processes
                        .get(&exit.fork_id)
                        .is_some_and(|(g, _)| *g == exit.generation)
                    {
                        self.processes.remove(&exit.fork_id);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        for (fork_id, (_, kill)) in self.processes.drain() {
            tracing::warn!(%fork_id, "Killing fork process that outlived its pipeline");
            let _ = kill.send(());
        }
    }
}
