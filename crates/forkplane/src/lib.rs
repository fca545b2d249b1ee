//! forkplane: control plane distributing test work to forked worker processes.

pub mod bridge;
pub mod coordinator;
pub mod dispatch;
pub mod executor;
pub mod fork;
pub mod launcher;
pub mod logging;
pub mod pipeline;
pub mod refork;
pub mod server;
pub mod worker;

pub use bridge::protocol::{
    ForkAction, ForkId, ForkRequest, PipelineId, WorkItem, WorkOutcome, WorkResult,
};
pub use coordinator::{Coordinator, CoordinatorError, PipelineConfig, PipelineSummary, RetryPolicy};
pub use dispatch::{DispatchError, DispatchStats, PipelineDispatcher};
pub use executor::{
    BuiltinExecutors, CommandExecutor, ExecutionError, ExecutorError, ExecutorFactory,
    NoopExecutor, WorkExecutor,
};
pub use fork::{Fork, ForkError, ForkEvent, ForkStatus};
pub use launcher::{ForkExit, ForkTarget, ForkLauncher, ForkProcess, LaunchError, ProcessLauncher};
pub use pipeline::{Pipeline, PipelineSettings, ResultCounts, ResultSink, TracingResultSink};
pub use refork::{
    ReforkDecisionContext, ReforkDecisionGatherer, ReforkError, ReforkItemConfig,
    ReforkItemConfigs, ReforkMoment, ReforkSignal,
};
pub use server::{ServerError, ServerRegistry, ServerStatus};
pub use worker::{WorkerConfig, WorkerError, WorkerSummary, run_worker};
