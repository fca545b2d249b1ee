//! Control server: one TCP listener per pipeline.
//!
//! Each accepted connection becomes a fork session that decodes
//! `ForkRequest`s, applies lifecycle messages to the fork's state machine and
//! answers every `NextAction` with exactly one `ForkAction`.
//!
//! Servers live in a `ServerRegistry` keyed by pipeline id, so several
//! pipelines can be served and torn down independently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ForkAction, ForkId, ForkRequest, PipelineId, WorkResult};
use crate::fork::{Fork, ForkError, ForkStatus};
use crate::pipeline::Pipeline;
use crate::refork::ReforkDecisionContext;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("pipeline {0} already has a control server")]
    AlreadyRegistered(PipelineId),
    #[error("no control server for pipeline {0}")]
    UnknownPipeline(PipelineId),
    #[error("control server for pipeline {0} already started")]
    AlreadyStarted(PipelineId),
    #[error("failed to bind control server: {0}")]
    Bind(#[source] std::io::Error),
    #[error("unknown fork {0}")]
    UnknownFork(ForkId),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Fork(#[from] ForkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Created,
    Running,
    Stopped,
}

struct ControlServer {
    pipeline: Arc<Pipeline>,
    host: String,
    status: ServerStatus,
    addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

/// Control servers keyed by pipeline.
///
/// Lookups take the read lock; add/start/stop take the write lock.
#[derive(Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<PipelineId, ControlServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, pipeline: Arc<Pipeline>, host: impl Into<String>) -> Result<(), ServerError> {
        let id = pipeline.id();
        let mut servers = self.servers.write().await;
        if servers.contains_key(&id) {
            return Err(ServerError::AlreadyRegistered(id));
        }
        let (shutdown_tx, _) = watch::channel(false);
        servers.insert(
            id,
            ControlServer {
                pipeline,
                host: host.into(),
                status: ServerStatus::Created,
                addr: None,
                shutdown_tx,
                accept_task: None,
            },
        );
        tracing::debug!(pipeline = %id, "Control server registered");
        Ok(())
    }

    /// Binds an ephemeral port and starts accepting forks.
    pub async fn start(&self, id: PipelineId) -> Result<SocketAddr, ServerError> {
        let mut servers = self.servers.write().await;
        let server = servers
            .get_mut(&id)
            .ok_or(ServerError::UnknownPipeline(id))?;
        if server.status != ServerStatus::Created {
            return Err(ServerError::AlreadyStarted(id));
        }

        let listener = TcpListener::bind((server.host.as_str(), 0))
            .await
            .map_err(ServerError::Bind)?;
        let addr = listener.local_addr().map_err(ServerError::Bind)?;

        let pipeline = Arc::clone(&server.pipeline);
        let shutdown_rx = server.shutdown_tx.subscribe();
        server.accept_task = Some(tokio::spawn(accept_loop(listener, pipeline, shutdown_rx)));
        server.addr = Some(addr);
        server.status = ServerStatus::Running;

        tracing::info!(pipeline = %id, %addr, "Control server listening");
        Ok(addr)
    }

    /// Stops accepting, closes every session, and waits for them to finish.
    pub async fn stop(&self, id: PipelineId) -> Result<(), ServerError> {
        let accept_task = {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(&id)
                .ok_or(ServerError::UnknownPipeline(id))?;
            if server.status == ServerStatus::Stopped {
                return Ok(());
            }
            server.status = ServerStatus::Stopped;
            server.shutdown_tx.send_replace(true);
            server.accept_task.take()
        };

        if let Some(task) = accept_task
            && let Err(e) = task.await
        {
            tracing::warn!(pipeline = %id, error = %e, "Accept loop ended abnormally");
        }
        tracing::info!(pipeline = %id, "Control server stopped");
        Ok(())
    }

    /// Drops a stopped server from the registry.
    pub async fn remove(&self, id: PipelineId) -> Option<Arc<Pipeline>> {
        let mut servers = self.servers.write().await;
        match servers.get(&id) {
            Some(server) if server.status == ServerStatus::Running => {
                tracing::warn!(pipeline = %id, "Refusing to remove a running control server");
                None
            }
            Some(_) => servers.remove(&id).map(|s| s.pipeline),
            None => None,
        }
    }

    pub async fn addr(&self, id: PipelineId) -> Option<SocketAddr> {
        self.servers.read().await.get(&id).and_then(|s| s.addr)
    }

    pub async fn port(&self, id: PipelineId) -> Option<u16> {
        self.addr(id).await.map(|a| a.port())
    }

    pub async fn status(&self, id: PipelineId) -> Option<ServerStatus> {
        self.servers.read().await.get(&id).map(|s| s.status)
    }

    pub async fn pipeline(&self, id: PipelineId) -> Option<Arc<Pipeline>> {
        self.servers
            .read()
            .await
            .get(&id)
            .map(|s| Arc::clone(&s.pipeline))
    }

    pub async fn pipelines(&self) -> Vec<PipelineId> {
        self.servers.read().await.keys().copied().collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    pipeline: Arc<Pipeline>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tracing::debug!(pipeline = %pipeline.id(), %peer, "Fork connected");
                    sessions.spawn(run_session(
                        Arc::clone(&pipeline),
                        stream,
                        peer,
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(pipeline = %pipeline.id(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    while sessions.join_next().await.is_some() {}
    tracing::debug!(pipeline = %pipeline.id(), "Accept loop exiting");
}

#[derive(Debug)]
enum SessionEnd {
    Closed,
    Dropped(String),
    Protocol(ServerError),
    Shutdown,
}

async fn run_session(
    pipeline: Arc<Pipeline>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<ForkRequest>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<ForkAction>::new());
    let mut session = ForkSession::new(pipeline);

    let end = loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break SessionEnd::Shutdown,

            msg = reader.next() => match msg {
                Some(Ok(request)) => match session.handle(request).await {
                    Ok(Some(action)) => {
                        if let Err(e) = writer.send(action).await {
                            break SessionEnd::Dropped(e.to_string());
                        }
                    }
                    Ok(None) => {}
                    Err(e) => break SessionEnd::Protocol(e),
                },
                Some(Err(e)) => break SessionEnd::Dropped(e.to_string()),
                None => break SessionEnd::Closed,
            },
        }
    };

    session.finish(end, peer);
}

/// Per-connection state.
struct ForkSession {
    pipeline: Arc<Pipeline>,
    fork: Option<Arc<Fork>>,
    initialized: bool,
    stopped: bool,
}

impl ForkSession {
    fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            fork: None,
            initialized: false,
            stopped: false,
        }
    }

    async fn handle(&mut self, request: ForkRequest) -> Result<Option<ForkAction>, ServerError> {
        tracing::trace!(fork_id = %request.fork_id(), ?request, "Request received");
        match request {
            ForkRequest::ForkStarted { fork_id } => {
                if let Some(fork) = &self.fork {
                    return Err(ServerError::Protocol(format!(
                        "fork {fork_id} announced itself on a session already bound to fork {}",
                        fork.id()
                    )));
                }
                let fork = self
                    .pipeline
                    .fork(fork_id)
                    .ok_or(ServerError::UnknownFork(fork_id))?;
                fork.started()?;
                tracing::info!(pipeline = %self.pipeline.id(), %fork_id, "Fork started");
                self.fork = Some(fork);
                Ok(None)
            }
            ForkRequest::NextAction {
                fork_id,
                previous_result,
                refork_context,
            } => {
                let fork = self.bound(fork_id)?;
                let action = self
                    .next_action(&fork, previous_result, refork_context)
                    .await?;
                tracing::trace!(%fork_id, ?action, "Replying to NextAction");
                Ok(Some(action))
            }
            ForkRequest::ForkStopped { fork_id } => {
                let fork = self.bound(fork_id)?;
                fork.stopped()?;
                self.stopped = true;
                tracing::info!(pipeline = %self.pipeline.id(), %fork_id, "Fork stopped");
                Ok(None)
            }
        }
    }

    fn bound(&self, fork_id: ForkId) -> Result<Arc<Fork>, ServerError> {
        match &self.fork {
            Some(fork) if fork.id() == fork_id => Ok(Arc::clone(fork)),
            Some(fork) => Err(ServerError::Protocol(format!(
                "message for fork {fork_id} on session of fork {}",
                fork.id()
            ))),
            None => Err(ServerError::Protocol(format!(
                "fork {fork_id} sent a request before ForkStarted"
            ))),
        }
    }

    async fn next_action(
        &mut self,
        fork: &Fork,
        previous_result: Option<WorkResult>,
        refork_context: Option<ReforkDecisionContext>,
    ) -> Result<ForkAction, ServerError> {
        if !self.initialized {
            self.initialized = true;
            let settings = self.pipeline.settings();
            return Ok(ForkAction::Initialize {
                framework_id: settings.framework_id.clone(),
                refork_configs: settings.refork_configs.clone(),
            });
        }

        let dispatcher = self.pipeline.dispatcher();
        if let Some(result) = previous_result {
            fork.complete_current(&result);
            self.pipeline.record_result(Some(fork.id()), &result);
        }

        if dispatcher.check_completion() {
            return self.stop_fork(fork);
        }

        if let Some(ctx) = refork_context
            && fork.status() == ForkStatus::Started
            && ctx.should_refork()
        {
            tracing::info!(
                fork_id = %fork.id(),
                triggered = ?ctx.triggered(),
                "Refork threshold reached, recycling fork"
            );
            fork.restarting()?;
            self.pipeline.note_refork();
            return Ok(ForkAction::Stop);
        }

        match fork.next_item().await {
            Some(item) => Ok(ForkAction::Execute { item }),
            None if dispatcher.is_stopping() || fork.status() != ForkStatus::Started => {
                self.stop_fork(fork)
            }
            None => Ok(ForkAction::Wait {
                millis: u64::try_from(self.pipeline.settings().wait.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    fn stop_fork(&self, fork: &Fork) -> Result<ForkAction, ServerError> {
        if fork.status() == ForkStatus::Started {
            fork.stopping()?;
        }
        Ok(ForkAction::Stop)
    }

    fn finish(self, end: SessionEnd, peer: SocketAddr) {
        let Some(fork) = self.fork else {
            tracing::debug!(%peer, ?end, "Session closed before a fork announced itself");
            return;
        };

        let result = match end {
            SessionEnd::Closed if self.stopped => {
                tracing::debug!(fork_id = %fork.id(), "Session closed");
                return;
            }
            _ if fork.status().is_terminal() => return,
            SessionEnd::Closed => {
                tracing::warn!(fork_id = %fork.id(), "Fork disconnected without ForkStopped");
                fork.failed()
            }
            SessionEnd::Dropped(error) => {
                tracing::warn!(fork_id = %fork.id(), %error, "Fork connection dropped");
                fork.failed()
            }
            SessionEnd::Protocol(error) => {
                tracing::error!(fork_id = %fork.id(), %error, "Protocol violation, aborting fork");
                fork.aborted()
            }
            SessionEnd::Shutdown => {
                tracing::debug!(fork_id = %fork.id(), "Server shutting down, aborting fork");
                fork.aborted()
            }
        };
        if let Err(e) = result {
            tracing::warn!(fork_id = %fork.id(), error = %e, "Could not record session end");
        }
    }
}
