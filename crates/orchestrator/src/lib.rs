pub mod agent;
pub mod classify;
pub mod core;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod kube;
pub mod phases;
pub mod retry;
pub mod store;

pub use classify::{classify, should_reconnect_peer, ErrorKind};
pub use core::{ExecContext, ExecutorParams, PhaseExecutor};
pub use dispatch::{DispatchResolver, ExecutorFactory, PhaseMatcher};
pub use engine::{Engine, EngineConfig};
pub use error::{ExitCodeError, OrchestratorError, Result, RollbackFailure};
pub use phases::{install_resolver, InstallConfig};
pub use retry::{with_retry, RetryPolicy};
pub use store::{MemoryPlanStore, PlanStore};
