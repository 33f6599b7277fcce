//! Orchestration layer.
//!
//! The scheduler drives tasks through their lifecycle; workers run one
//! attempt each through an [`Executor`], supervised by the
//! [`ProcessSupervisor`], and hand successes to the [`ResultAggregator`].

pub mod aggregator;
pub mod executor;
pub mod failure;
pub mod hooks;
pub mod resources;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use aggregator::{BaseSnapshot, IntegrationOutcome, ManualResolution, ResultAggregator};
pub use executor::{CommandExecutor, Executor};
pub use failure::{CircuitBreaker, FailureClassifier, FailureDecision, FailureHandler, RetryPolicy};
pub use hooks::{IntegrationDiff, IntegrationHooks, NoopHooks};
pub use resources::{HostUsage, ResourceMonitor, ResourceSampler, ResourceSignal, SysinfoSampler};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle, SchedulerOutcome};
pub use supervisor::{
    ProcessHandle, ProcessMarker, ProcessSupervisor, Reconciliation, SupervisorConfig,
};
pub use worker::{WorkerContext, WorkerReport, WorkerResult};
