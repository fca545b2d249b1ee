//! Worker runtime - runs inside a forked process.
//!
//! Architecture:
//! - Network task: reads `ForkAction`s off the control connection into a
//!   bounded queue (reject-if-full after a timeout).
//! - Request loop: strictly one `NextAction` in flight; acts on each reply.
//! - Execution thread: one dedicated OS thread owns the executor and runs
//!   items serially, so a long item never blocks receipt of control messages.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ForkAction, ForkId, ForkRequest, PipelineId, WorkItem, WorkResult};
use crate::executor::{ExecutorError, ExecutorFactory, WorkExecutor};
use crate::refork::{ReforkDecisionGatherer, ReforkError, ReforkMoment};

type RequestWriter = FramedWrite<OwnedWriteHalf, JsonCodec<ForkRequest>>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("control connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control connection closed by master")]
    ConnectionClosed,
    #[error("unexpected action while {state}: {action}")]
    UnexpectedAction { state: &'static str, action: String },
    #[error("execute received before initialize")]
    NotInitialized,
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Refork(#[from] ReforkError),
    #[error("execution thread exited")]
    ExecutionThreadGone,
}

pub struct WorkerConfig {
    pub pipeline_id: PipelineId,
    pub fork_id: ForkId,
    /// `host:port` of the pipeline's control server.
    pub server_addr: String,
    pub connect_timeout: Duration,
    /// Capacity of the queue between the network task and the request loop.
    pub action_queue_capacity: usize,
    /// How long the network task waits on a full queue before giving up.
    pub action_queue_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(pipeline_id: PipelineId, fork_id: ForkId, server_addr: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            fork_id,
            server_addr: server_addr.into(),
            connect_timeout: Duration::from_secs(10),
            action_queue_capacity: 1,
            action_queue_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_action_queue(mut self, capacity: usize, timeout: Duration) -> Self {
        self.action_queue_capacity = capacity.max(1);
        self.action_queue_timeout = timeout;
        self
    }
}

/// What one worker process did before it was told to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub executed: usize,
    pub unsuccessful: usize,
    pub waits: usize,
}

struct Job {
    item: WorkItem,
    reply: oneshot::Sender<WorkResult>,
}

/// The fork's single execution thread.
struct ExecutionThread {
    jobs: mpsc::UnboundedSender<Job>,
    handle: std::thread::JoinHandle<()>,
}

impl ExecutionThread {
    fn spawn(mut executor: Box<dyn WorkExecutor>) -> Result<Self, WorkerError> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("fork-executor".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let result = execute_caught(executor.as_mut(), job.item);
                    if job.reply.send(result).is_err() {
                        tracing::debug!("Result receiver dropped");
                    }
                }
                tracing::trace!("Execution thread exiting");
            })?;
        Ok(Self { jobs, handle })
    }

    async fn execute(&self, item: WorkItem) -> Result<WorkResult, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { item, reply })
            .map_err(|_| WorkerError::ExecutionThreadGone)?;
        rx.await.map_err(|_| WorkerError::ExecutionThreadGone)
    }

    async fn shutdown(self) {
        drop(self.jobs);
        let handle = self.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::error!("Execution thread panicked"),
            Err(e) => tracing::warn!(error = %e, "Failed to join execution thread"),
        }
    }
}

/// Runs one item, turning executor errors and panics into `error` results.
fn execute_caught(executor: &mut dyn WorkExecutor, item: WorkItem) -> WorkResult {
    let start = Instant::now();
    match catch_unwind(AssertUnwindSafe(|| executor.execute(&item))) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            tracing::warn!(item = %item.name, error = %e, "Execution failed");
            WorkResult::error(item, e.to_string(), start.elapsed())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(item = %item.name, %message, "Executor panicked");
            WorkResult::error(item, format!("executor panicked: {message}"), start.elapsed())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

async fn action_reader_task(
    mut reader: FramedRead<OwnedReadHalf, JsonCodec<ForkAction>>,
    actions: mpsc::Sender<ForkAction>,
    queue_timeout: Duration,
) {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(action) => match actions.send_timeout(action, queue_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(action)) => {
                    tracing::error!(?action, ?queue_timeout, "Action queue full, rejecting action");
                    return;
                }
                Err(SendTimeoutError::Closed(_)) => return,
            },
            Err(e) => {
                tracing::error!(error = %e, "Control connection error");
                return;
            }
        }
    }
    tracing::debug!("Control connection closed");
}

async fn connect(config: &WorkerConfig) -> Result<TcpStream, WorkerError> {
    let addr = config.server_addr.as_str();
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| WorkerError::ConnectTimeout {
            addr: addr.to_string(),
            timeout: config.connect_timeout,
        })?
        .map_err(|source| WorkerError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Run the worker: connect, announce, and serve actions until told to stop.
pub async fn run_worker(
    config: WorkerConfig,
    factory: &dyn ExecutorFactory,
) -> Result<WorkerSummary, WorkerError> {
    let stream = connect(&config).await?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = FramedWrite::new(write_half, JsonCodec::<ForkRequest>::new());

    let (action_tx, action_rx) = mpsc::channel(config.action_queue_capacity.max(1));
    let reader_task = tokio::spawn(action_reader_task(
        FramedRead::new(read_half, JsonCodec::new()),
        action_tx,
        config.action_queue_timeout,
    ));

    tracing::info!(
        pipeline = %config.pipeline_id,
        fork_id = %config.fork_id,
        addr = %config.server_addr,
        "Connected to master"
    );

    let mut fork = ForkLoop {
        fork_id: config.fork_id,
        actions: action_rx,
        gatherer: ReforkDecisionGatherer::new(),
        executor: None,
        summary: WorkerSummary::default(),
    };
    let outcome = fork.run(&mut writer, factory).await;

    reader_task.abort();
    if let Some(executor) = fork.executor.take() {
        executor.shutdown().await;
    }

    match &outcome {
        Ok(()) => tracing::info!(fork_id = %config.fork_id, summary = ?fork.summary, "Fork finished"),
        Err(e) => tracing::error!(fork_id = %config.fork_id, error = %e, "Fork loop failed"),
    }
    outcome.map(|()| fork.summary)
}

struct ForkLoop {
    fork_id: ForkId,
    actions: mpsc::Receiver<ForkAction>,
    gatherer: ReforkDecisionGatherer,
    executor: Option<ExecutionThread>,
    summary: WorkerSummary,
}

impl ForkLoop {
    async fn run(
        &mut self,
        writer: &mut RequestWriter,
        factory: &dyn ExecutorFactory,
    ) -> Result<(), WorkerError> {
        let fork_id = self.fork_id;
        writer.send(ForkRequest::ForkStarted { fork_id }).await?;

        let mut previous_result = None;
        let mut refork_context = None;
        loop {
            writer
                .send(ForkRequest::NextAction {
                    fork_id,
                    previous_result: previous_result.take(),
                    refork_context: refork_context.take(),
                })
                .await?;

            let action = self
                .actions
                .recv()
                .await
                .ok_or(WorkerError::ConnectionClosed)?;

            match action {
                ForkAction::Initialize {
                    framework_id,
                    refork_configs,
                } => {
                    if self.executor.is_some() {
                        tracing::warn!(%framework_id, "Initialize received twice, ignoring");
                        continue;
                    }
                    let executor = factory.create(&framework_id)?;
                    self.gatherer.initialize(refork_configs)?;
                    self.executor = Some(ExecutionThread::spawn(executor)?);
                    tracing::info!(%fork_id, %framework_id, "Fork initialized");
                }
                ForkAction::Execute { item } => {
                    tracing::debug!(%fork_id, item = %item.name, "Executing item");
                    let executor = self.executor.as_ref().ok_or(WorkerError::NotInitialized)?;
                    let result =
                        watch_connection(&mut self.actions, "executing", executor.execute(item))
                            .await??;

                    self.summary.executed += 1;
                    if !result.is_success() {
                        self.summary.unsuccessful += 1;
                    }
                    refork_context = Some(
                        self.gatherer
                            .gather_data(ReforkMoment::AfterExecution, &result)?,
                    );
                    previous_result = Some(result);
                }
                ForkAction::Wait { millis } => {
                    self.summary.waits += 1;
                    tracing::trace!(%fork_id, millis, "Waiting for work");
                    let sleep = tokio::time::sleep(Duration::from_millis(millis));
                    watch_connection(&mut self.actions, "waiting", sleep).await?;
                }
                ForkAction::Stop => {
                    tracing::info!(%fork_id, "Stop received");
                    writer.send(ForkRequest::ForkStopped { fork_id }).await?;
                    writer.close().await?;
                    return Ok(());
                }
            }
        }
    }
}

/// Awaits `fut` while watching the action queue. The master never sends an
/// unsolicited action, so anything arriving here, or the queue closing,
/// ends the loop.
async fn watch_connection<F: Future>(
    actions: &mut mpsc::Receiver<ForkAction>,
    state: &'static str,
    fut: F,
) -> Result<F::Output, WorkerError> {
    tokio::select! {
        output = fut => Ok(output),
        action = actions.recv() => match action {
            Some(action) => Err(WorkerError::UnexpectedAction {
                state,
                action: format!("{action:?}"),
            }),
            None => Err(WorkerError::ConnectionClosed),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bridge::protocol::WorkOutcome;
    use crate::executor::{BuiltinExecutors, ExecutionError, NoopExecutor};
    use crate::fork::ForkStatus;
    use crate::pipeline::{Pipeline, PipelineSettings, TracingResultSink};
    use crate::refork::ReforkItemConfigs;
    use crate::server::ServerRegistry;

    struct Flaky;

    impl WorkExecutor for Flaky {
        fn execute(&mut self, item: &WorkItem) -> Result<WorkResult, ExecutionError> {
            match item.name.as_str() {
                "panic" => panic!("kaboom"),
                "error" => Err("no such class".into()),
                "fail" => Ok(WorkResult::failure(item.clone(), "assertion", Duration::ZERO)),
                _ => Ok(WorkResult::success(item.clone(), Duration::ZERO)),
            }
        }
    }

    struct FlakyFactory;

    impl ExecutorFactory for FlakyFactory {
        fn create(&self, _framework_id: &str) -> Result<Box<dyn WorkExecutor>, ExecutorError> {
            Ok(Box::new(Flaky))
        }
    }

    struct Served {
        registry: ServerRegistry,
        pipeline: Arc<Pipeline>,
        addr: String,
    }

    async fn serve(settings: PipelineSettings, items: &[&str]) -> Served {
        let (pipeline, _events) =
            Pipeline::new(PipelineId::new(), settings, Arc::new(TracingResultSink));
        for name in items {
            pipeline.dispatcher().enqueue(WorkItem::new(*name)).unwrap();
        }
        pipeline.dispatcher().end_splitting();

        let registry = ServerRegistry::new();
        registry.add(Arc::clone(&pipeline), "127.0.0.1").await.unwrap();
        let addr = registry.start(pipeline.id()).await.unwrap().to_string();
        Served {
            registry,
            pipeline,
            addr,
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            poll_timeout: Duration::from_millis(20),
            wait: Duration::from_millis(5),
            ..PipelineSettings::default()
        }
    }

    async fn wait_for_status(fork: &crate::fork::Fork, status: ForkStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while fork.status() != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("fork never reached {status}"));
    }

    fn config(served: &Served, fork_id: ForkId) -> WorkerConfig {
        WorkerConfig::new(served.pipeline.id(), fork_id, served.addr.clone())
            .with_connect_timeout(Duration::from_secs(2))
    }

    #[test]
    fn panics_and_errors_become_error_results() {
        let panicked = execute_caught(&mut Flaky, WorkItem::new("panic"));
        match panicked.outcome {
            WorkOutcome::Error { message } => assert!(message.contains("kaboom")),
            other => panic!("expected error outcome, got {other:?}"),
        }

        let errored = execute_caught(&mut Flaky, WorkItem::new("error"));
        assert_eq!(
            errored.outcome,
            WorkOutcome::Error {
                message: "no such class".to_string()
            }
        );
        assert!(execute_caught(&mut NoopExecutor, WorkItem::new("ok")).is_success());
    }

    #[tokio::test]
    async fn execution_thread_keeps_running_after_panic() {
        let thread = ExecutionThread::spawn(Box::new(Flaky)).unwrap();
        let first = thread.execute(WorkItem::new("panic")).await.unwrap();
        assert!(!first.is_success());
        let second = thread.execute(WorkItem::new("ok")).await.unwrap();
        assert!(second.is_success());
        thread.shutdown().await;
    }

    #[tokio::test]
    async fn worker_drains_pipeline_and_stops() {
        let served = serve(settings(), &["a", "b", "c"]).await;
        let fork = served.pipeline.create_fork(ForkId::new(0));
        fork.starting().unwrap();

        let summary = run_worker(config(&served, ForkId::new(0)), &BuiltinExecutors)
            .await
            .unwrap();

        assert_eq!(summary.executed, 3);
        assert_eq!(served.pipeline.result_counts().succeeded, 3);
        assert!(served.pipeline.dispatcher().is_all_items_executed());
        tokio::time::timeout(
            Duration::from_secs(1),
            served.pipeline.dispatcher().wait_all_stopped(),
        )
        .await
        .unwrap();
        assert_eq!(fork.status(), ForkStatus::Stopped);
        served.registry.stop(served.pipeline.id()).await.unwrap();
    }

    #[tokio::test]
    async fn failing_items_are_reported_and_loop_continues() {
        let served = serve(settings(), &["panic", "error", "fail", "ok"]).await;
        served.pipeline.create_fork(ForkId::new(0)).starting().unwrap();

        let summary = run_worker(config(&served, ForkId::new(0)), &FlakyFactory)
            .await
            .unwrap();

        assert_eq!(summary.executed, 4);
        assert_eq!(summary.unsuccessful, 3);
        let counts = served.pipeline.result_counts();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.errored, 2);
        served.registry.stop(served.pipeline.id()).await.unwrap();
    }

    #[tokio::test]
    async fn refork_stops_worker_after_threshold() {
        let served = serve(
            PipelineSettings {
                refork_configs: ReforkItemConfigs::fork_every(2),
                ..settings()
            },
            &["a", "b", "c"],
        )
        .await;
        let fork = served.pipeline.create_fork(ForkId::new(1));
        fork.starting().unwrap();

        let first = run_worker(config(&served, ForkId::new(1)), &BuiltinExecutors)
            .await
            .unwrap();
        assert_eq!(first.executed, 2);
        wait_for_status(&fork, ForkStatus::Stopped).await;
        assert!(fork.is_restarting());
        assert!(!served.pipeline.dispatcher().is_stopping());

        fork.starting().unwrap();
        let second = run_worker(config(&served, ForkId::new(1)), &BuiltinExecutors)
            .await
            .unwrap();
        assert_eq!(second.executed, 1);
        assert_eq!(served.pipeline.result_counts().reforks, 1);
        tokio::time::timeout(
            Duration::from_secs(1),
            served.pipeline.dispatcher().wait_all_stopped(),
        )
        .await
        .unwrap();
        served.registry.stop(served.pipeline.id()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_framework_fails_the_fork() {
        let served = serve(
            PipelineSettings {
                framework_id: "spock".to_string(),
                ..settings()
            },
            &["a"],
        )
        .await;
        let fork = served.pipeline.create_fork(ForkId::new(0));
        fork.starting().unwrap();

        let err = run_worker(config(&served, ForkId::new(0)), &BuiltinExecutors)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Executor(ExecutorError::UnknownFramework(ref id)) if id == "spock"
        ));

        wait_for_status(&fork, ForkStatus::Failed).await;
        served.registry.stop(served.pipeline.id()).await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = run_worker(
            WorkerConfig::new(PipelineId::new(), ForkId::new(0), addr.to_string()),
            &BuiltinExecutors,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Connect { .. }));
    }
}
