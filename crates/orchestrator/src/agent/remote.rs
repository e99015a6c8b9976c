use async_trait::async_trait;
use clusterops_core::PhaseData;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::client::{RemoteAction, RemotePhaseRequest};
use super::coordinator::AgentCoordinator;
use crate::core::{ExecContext, ExecutorParams, PhaseExecutor};
use crate::error::{OrchestratorError, Result};

/// Runs every step of a phase on the agent of the phase's server.
pub struct RemoteExecutor {
    coordinator: Arc<AgentCoordinator>,
    peer: String,
    operation_id: Uuid,
    phase_id: String,
    data: Option<PhaseData>,
}

impl RemoteExecutor {
    pub fn new(coordinator: Arc<AgentCoordinator>, params: &ExecutorParams) -> Result<Self> {
        let server = params.server().ok_or_else(|| {
            OrchestratorError::BadParameter(format!(
                "phase {} does not name a server to run on",
                params.phase.id
            ))
        })?;
        Ok(Self {
            coordinator,
            peer: server.advertise_ip.clone(),
            operation_id: params.operation_id,
            phase_id: params.phase.id.clone(),
            data: params.phase.data.clone(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one step to the agent inside a watched scope.
    ///
    /// When the watcher cancels the scope while the caller's context is
    /// still live, the call fails as a connection problem so the retry
    /// boundary may reconnect.
    async fn call(&self, ctx: &ExecContext, action: RemoteAction) -> Result<()> {
        let client = self.coordinator.connect(&self.peer, ctx.token()).await?;
        let scope = ctx.token().child_token();
        let watcher = self
            .coordinator
            .watch(client.as_ref(), scope.clone(), Some(self.operation_id))
            .await?;

        let request = RemotePhaseRequest {
            operation_id: self.operation_id,
            phase_id: self.phase_id.clone(),
            action,
            data: self.data.clone(),
        };
        info!(peer = %self.peer, phase = %self.phase_id, action = %action, "Running phase step on agent");

        let result = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                if ctx.is_cancelled() {
                    Err(OrchestratorError::Cancelled)
                } else {
                    warn!(peer = %self.peer, phase = %self.phase_id, "Agent connection lost during phase step");
                    Err(OrchestratorError::connection_problem(
                        self.peer.clone(),
                        format!("connection lost while running {} of {}", action, self.phase_id),
                    ))
                }
            }
            result = client.run_phase(&request) => result,
        };

        watcher.abort();
        result
    }
}

#[async_trait]
impl PhaseExecutor for RemoteExecutor {
    async fn pre_check(&self, ctx: &ExecContext) -> Result<()> {
        self.call(ctx, RemoteAction::PreCheck).await
    }

    async fn execute(&self, ctx: &ExecContext) -> Result<()> {
        self.call(ctx, RemoteAction::Execute).await
    }

    async fn rollback(&self, ctx: &ExecContext) -> Result<()> {
        self.call(ctx, RemoteAction::Rollback).await
    }

    async fn post_check(&self, ctx: &ExecContext) -> Result<()> {
        self.call(ctx, RemoteAction::PostCheck).await
    }
}

/// Dispatch factory building a [`RemoteExecutor`] per phase.
pub fn remote_factory(
    coordinator: Arc<AgentCoordinator>,
) -> impl Fn(&ExecutorParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync + 'static {
    move |params| {
        let executor = RemoteExecutor::new(Arc::clone(&coordinator), params)?;
        Ok(Box::new(executor) as Box<dyn PhaseExecutor>)
    }
}
