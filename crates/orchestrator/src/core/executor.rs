use async_trait::async_trait;
use clusterops_core::{OperationKind, Phase, Plan, Server};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Cancellable scope for a single executor call.
#[derive(Debug, Clone)]
pub struct ExecContext {
    operation_id: Uuid,
    phase_id: String,
    cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(operation_id: Uuid, phase_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            operation_id,
            phase_id: phase_id.into(),
            cancel,
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn phase_id(&self) -> &str {
        &self.phase_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// A nested scope cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            operation_id: self.operation_id,
            phase_id: self.phase_id.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    /// Drives `fut` until it finishes or the scope is cancelled.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = fut => result,
        }
    }
}

/// The four-step contract every phase implements.
///
/// All steps default to no-ops except `execute`. An implementation must
/// return [`OrchestratorError::Cancelled`] promptly once `ctx` is cancelled;
/// [`ExecContext::run`] does that for any future.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Validates preconditions. Must not change anything.
    async fn pre_check(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()>;

    /// Undoes `execute`. A resource that is already gone counts as success.
    async fn rollback(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    async fn post_check(&self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }
}

/// What a factory sees when building an executor.
#[derive(Debug, Clone)]
pub struct ExecutorParams {
    pub phase: Phase,
    pub plan: Arc<Plan>,
    pub operation_id: Uuid,
    pub operation_kind: OperationKind,
}

impl ExecutorParams {
    pub fn new(plan: Arc<Plan>, phase_id: &str) -> Result<Self> {
        let phase = plan.get_phase(phase_id)?.clone();
        Ok(Self {
            phase,
            operation_id: plan.operation_id,
            operation_kind: plan.operation_kind,
            plan,
        })
    }

    /// The node the phase targets, if it has one.
    pub fn server(&self) -> Option<&Server> {
        self.phase.data.as_ref().and_then(|d| d.server.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterops_core::PhaseData;

    struct Noop;

    #[async_trait]
    impl PhaseExecutor for Noop {
        async fn execute(&self, _ctx: &ExecContext) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_steps_are_noops() {
        let ctx = ExecContext::new(Uuid::new_v4(), "/checks", CancellationToken::new());
        let executor = Noop;

        assert!(executor.pre_check(&ctx).await.is_ok());
        assert!(executor.execute(&ctx).await.is_ok());
        assert!(executor.rollback(&ctx).await.is_ok());
        assert!(executor.post_check(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = ExecContext::new(Uuid::new_v4(), "/checks", CancellationToken::new());
        let child = ctx.child();
        ctx.token().cancel();

        assert!(child.is_cancelled());
        let result = child.run(std::future::pending::<Result<()>>()).await;
        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
    }

    #[test]
    fn test_params_from_plan() {
        let plan = Plan::new(OperationKind::Join, "example.com").with_phases(vec![
            clusterops_core::Phase::new("/nodes/node-1", "Join node-1").with_data(PhaseData {
                server: Some(Server {
                    hostname: "node-1".to_string(),
                    advertise_ip: "10.0.0.5".to_string(),
                    role: "node".to_string(),
                }),
                ..Default::default()
            }),
        ]);
        let plan = Arc::new(plan);

        let params = ExecutorParams::new(Arc::clone(&plan), "/nodes/node-1").unwrap();
        assert_eq!(params.operation_id, plan.operation_id);
        assert_eq!(params.operation_kind, OperationKind::Join);
        assert_eq!(params.server().unwrap().advertise_ip, "10.0.0.5");

        let err = ExecutorParams::new(plan, "/missing").unwrap_err();
        assert!(matches!(err, OrchestratorError::PhaseNotFound(_)));
    }
}
