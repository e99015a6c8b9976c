//! Plan execution engine.
//!
//! The engine owns a plan for the duration of an action. Phase bodies run
//! as spawned tasks; every state transition is applied by the run loop
//! alone and persisted before any dependent phase is scheduled.

use chrono::Utc;
use clusterops_core::{PhaseError, PhaseState, Plan};
use events::{Event, EventBus};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{classify, is_cancelled};
use crate::core::{ExecContext, ExecutorParams};
use crate::dispatch::DispatchResolver;
use crate::error::{OrchestratorError, Result, RollbackFailure};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::PlanStore;

const DEFAULT_MAX_CONCURRENT_PHASES: usize = 8;
const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on leaf phases running at once
    pub max_concurrent_phases: usize,
    /// Retry boundary around each phase body
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_phases: DEFAULT_MAX_CONCURRENT_PHASES,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_concurrent_phases(mut self, max: usize) -> Self {
        self.max_concurrent_phases = max.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct Engine {
    store: Arc<dyn PlanStore>,
    resolver: Arc<DispatchResolver>,
    config: EngineConfig,
    event_bus: Option<EventBus>,
    active: Mutex<HashSet<Uuid>>,
}

impl Engine {
    pub fn new(store: Arc<dyn PlanStore>, resolver: DispatchResolver) -> Self {
        Self {
            store,
            resolver: Arc::new(resolver),
            config: EngineConfig::default(),
            event_bus: None,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Validates and stores a new plan.
    pub async fn create(&self, plan: Plan) -> Result<Plan> {
        plan.validate()?;
        self.store.create_plan(&plan).await?;

        info!(
            operation_id = %plan.operation_id,
            kind = plan.operation_kind.as_str(),
            cluster = %plan.cluster_name,
            "Plan created"
        );
        self.emit(Event::PlanCreated {
            operation_id: plan.operation_id,
            operation_kind: plan.operation_kind.as_str().to_string(),
            cluster_name: plan.cluster_name.clone(),
        });
        Ok(plan)
    }

    pub async fn plan(&self, operation_id: Uuid) -> Result<Plan> {
        self.store.get_plan(operation_id).await
    }

    pub async fn plans(&self) -> Result<Vec<Plan>> {
        self.store.list_plans().await
    }

    /// Runs every runnable phase until the plan is done or blocked.
    ///
    /// Refuses a plan with phases left in progress by an earlier run; use
    /// [`Engine::resume`] for those.
    pub async fn execute(&self, operation_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.acquire(operation_id)?;
        let mut plan = self.open(operation_id).await?;

        let interrupted = plan.in_progress_leaves();
        if !interrupted.is_empty() {
            return Err(OrchestratorError::Conflict(format!(
                "phases {} were interrupted, resume the operation instead",
                interrupted.join(", ")
            )));
        }

        self.emit(Event::PlanStarted {
            operation_id,
            action: "execute".to_string(),
        });
        self.run(&mut plan, cancel).await
    }

    /// Continues an operation after a crash or abort.
    ///
    /// Phases left in progress are failed as interrupted and run again.
    pub async fn resume(&self, operation_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.acquire(operation_id)?;
        let mut plan = self.open(operation_id).await?;

        self.fail_interrupted(&mut plan).await?;
        self.emit(Event::PlanStarted {
            operation_id,
            action: "resume".to_string(),
        });
        self.run(&mut plan, cancel).await
    }

    /// Unwinds finished phases, newest first.
    ///
    /// Every candidate gets a rollback attempt even when an earlier one
    /// fails; failures are returned together as
    /// [`OrchestratorError::RollbackFailed`].
    pub async fn rollback(
        &self,
        operation_id: Uuid,
        from_phase: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.acquire(operation_id)?;
        let mut plan = self.open(operation_id).await?;
        if let Some(from) = from_phase {
            plan.get_phase(from)?;
        }

        self.fail_interrupted(&mut plan).await?;
        let candidates: Vec<String> = plan
            .rollback_candidates(from_phase)?
            .into_iter()
            .map(|phase| phase.id.clone())
            .collect();
        for phase_id in &candidates {
            self.resolver.route_for(phase_id)?;
        }

        self.emit(Event::PlanStarted {
            operation_id,
            action: "rollback".to_string(),
        });
        info!(
            operation_id = %operation_id,
            phases = candidates.len(),
            from = from_phase.unwrap_or("-"),
            "Rolling back operation"
        );

        let runner = self.runner();
        let mut failures = Vec::new();
        for phase_id in candidates {
            if cancel.is_cancelled() {
                warn!(operation_id = %operation_id, "Rollback cancelled");
                return Err(OrchestratorError::Cancelled);
            }

            let params = ExecutorParams::new(Arc::new(plan.clone()), &phase_id)?;
            let ctx = ExecContext::new(operation_id, &phase_id, cancel.child_token());
            info!(operation_id = %operation_id, phase = %phase_id, "Rolling back phase");

            match runner.rollback(&params, &ctx).await {
                Ok(()) => {
                    self.transition(&mut plan, &phase_id, PhaseState::RolledBack)
                        .await?
                }
                Err(err) if is_cancelled(&err) && cancel.is_cancelled() => {
                    warn!(operation_id = %operation_id, phase = %phase_id, "Rollback cancelled");
                    return Err(err);
                }
                Err(err) => {
                    let kind = classify(&err);
                    error!(
                        operation_id = %operation_id,
                        phase = %phase_id,
                        kind = %kind,
                        error = %err,
                        "Rollback failed, continuing with the next phase"
                    );
                    plan.record_error(&phase_id, PhaseError::new(kind.as_str(), err.to_string()))?;
                    self.persist(&mut plan, &phase_id).await?;
                    self.emit(Event::RollbackFailed {
                        operation_id,
                        phase_id: phase_id.clone(),
                        message: err.to_string(),
                    });
                    failures.push(RollbackFailure {
                        phase: phase_id,
                        error: err,
                    });
                }
            }
        }

        if failures.is_empty() {
            info!(operation_id = %operation_id, "Rollback finished");
            Ok(())
        } else {
            Err(OrchestratorError::RollbackFailed { failures })
        }
    }

    /// Closes the plan once every phase is Completed or RolledBack.
    pub async fn complete(&self, operation_id: Uuid) -> Result<()> {
        let _guard = self.acquire(operation_id)?;
        let mut plan = self.store.get_plan(operation_id).await?;
        if plan.is_completed() {
            debug!(operation_id = %operation_id, "Operation already completed");
            return Ok(());
        }

        plan.mark_completed()?;
        let completed_at = plan.completed_at.unwrap_or_else(Utc::now);
        self.store.mark_completed(operation_id, completed_at).await?;

        info!(operation_id = %operation_id, "Operation completed");
        self.emit(Event::PlanCompleted { operation_id });
        Ok(())
    }

    async fn run(&self, plan: &mut Plan, cancel: &CancellationToken) -> Result<()> {
        plan.validate()?;
        let pending: Vec<String> = plan
            .leaves()
            .into_iter()
            .filter(|phase| phase.state != PhaseState::Completed)
            .map(|phase| phase.id.clone())
            .collect();
        for phase_id in &pending {
            self.resolver.route_for(phase_id)?;
        }

        let operation_id = plan.operation_id;
        let runner = self.runner();
        let capacity = self.config.max_concurrent_phases.max(1);
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut first_error: Option<OrchestratorError> = None;

        loop {
            if !cancel.is_cancelled() {
                for phase_id in self.ready(plan, &attempted, capacity.saturating_sub(tasks.len()))? {
                    self.transition(plan, &phase_id, PhaseState::InProgress)
                        .await?;
                    attempted.insert(phase_id.clone());

                    let params = ExecutorParams::new(Arc::new(plan.clone()), &phase_id)?;
                    let ctx = ExecContext::new(operation_id, &phase_id, cancel.child_token());
                    let runner = runner.clone();
                    tasks.spawn(async move {
                        let result = AssertUnwindSafe(runner.execute(&params, &ctx))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(OrchestratorError::ExecutionFailed(format!(
                                    "phase {} panicked",
                                    params.phase.id
                                )))
                            });
                        (phase_id, result)
                    });
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (phase_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(operation_id = %operation_id, error = %e, "Phase task failed to join");
                    first_error.get_or_insert(OrchestratorError::ExecutionFailed(e.to_string()));
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    self.transition(plan, &phase_id, PhaseState::Completed)
                        .await?
                }
                Err(err) => {
                    let kind = classify(&err);
                    error!(
                        operation_id = %operation_id,
                        phase = %phase_id,
                        kind = %kind,
                        error = %err,
                        "Phase failed"
                    );
                    self.fail(plan, &phase_id, PhaseError::new(kind.as_str(), err.to_string()))
                        .await?;
                    self.emit(Event::PhaseFailed {
                        operation_id,
                        phase_id: phase_id.clone(),
                        kind: kind.as_str().to_string(),
                        message: err.to_string(),
                    });
                    first_error.get_or_insert(OrchestratorError::phase_failed(phase_id, err));
                }
            }
        }

        if cancel.is_cancelled() {
            warn!(operation_id = %operation_id, "Operation cancelled");
            return Err(OrchestratorError::Cancelled);
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let blocked: Vec<String> = plan
            .leaves()
            .into_iter()
            .filter(|phase| phase.state != PhaseState::Completed)
            .map(|phase| phase.id.clone())
            .collect();
        if !blocked.is_empty() {
            return Err(OrchestratorError::Conflict(format!(
                "phases {} cannot run because their dependencies are not completed",
                blocked.join(", ")
            )));
        }

        info!(operation_id = %operation_id, "All phases completed");
        Ok(())
    }

    /// Runnable leaves not yet tried in this run, in plan order.
    fn ready(&self, plan: &Plan, attempted: &HashSet<String>, limit: usize) -> Result<Vec<String>> {
        let mut ready = Vec::new();
        for phase in plan.leaves() {
            if ready.len() >= limit {
                break;
            }
            if !attempted.contains(&phase.id) && plan.is_runnable(&phase.id)? {
                ready.push(phase.id.clone());
            }
        }
        Ok(ready)
    }

    async fn open(&self, operation_id: Uuid) -> Result<Plan> {
        let plan = self.store.get_plan(operation_id).await?;
        if plan.is_completed() {
            return Err(OrchestratorError::Conflict(format!(
                "operation {} is already completed",
                operation_id
            )));
        }
        Ok(plan)
    }

    async fn fail_interrupted(&self, plan: &mut Plan) -> Result<()> {
        let interrupted = plan.in_progress_leaves();
        if interrupted.is_empty() {
            return Ok(());
        }

        let mut changes = Vec::with_capacity(interrupted.len());
        for phase_id in interrupted {
            warn!(
                operation_id = %plan.operation_id,
                phase = %phase_id,
                "Phase was interrupted by a previous run"
            );
            let from = plan.fail_phase(
                &phase_id,
                PhaseError::new(INTERRUPTED, "phase was interrupted by a previous run"),
            )?;
            changes.push((phase_id, from));
        }

        // Recovered phases are written in a single transaction.
        self.store.save_plan(plan).await?;
        plan.take_dirty();
        for (phase_id, from) in changes {
            self.announce(plan, &phase_id, from, PhaseState::Failed);
        }
        Ok(())
    }

    async fn transition(&self, plan: &mut Plan, phase_id: &str, to: PhaseState) -> Result<()> {
        let from = plan.set_phase_state(phase_id, to)?;
        self.record(plan, phase_id, from, to).await
    }

    async fn fail(&self, plan: &mut Plan, phase_id: &str, error: PhaseError) -> Result<()> {
        let from = plan.fail_phase(phase_id, error)?;
        self.record(plan, phase_id, from, PhaseState::Failed).await
    }

    async fn record(
        &self,
        plan: &mut Plan,
        phase_id: &str,
        from: PhaseState,
        to: PhaseState,
    ) -> Result<()> {
        self.persist(plan, phase_id).await?;
        self.announce(plan, phase_id, from, to);
        Ok(())
    }

    fn announce(&self, plan: &Plan, phase_id: &str, from: PhaseState, to: PhaseState) {
        info!(
            operation_id = %plan.operation_id,
            phase = %phase_id,
            from = %from,
            to = %to,
            "Phase state changed"
        );
        self.emit(Event::PhaseStateChanged {
            operation_id: plan.operation_id,
            phase_id: phase_id.to_string(),
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
        });
    }

    /// Writes a phase and every container above it.
    async fn persist(&self, plan: &mut Plan, phase_id: &str) -> Result<()> {
        let mut lineage: Vec<String> = plan
            .ancestors(phase_id)?
            .into_iter()
            .map(|phase| phase.id.clone())
            .collect();
        lineage.push(phase_id.to_string());

        for id in &lineage {
            let phase = plan.get_phase(id)?;
            self.store
                .update_phase(plan.operation_id, phase, plan.updated_at)
                .await?;
        }
        plan.take_dirty();
        Ok(())
    }

    fn acquire(&self, operation_id: Uuid) -> Result<OperationGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(operation_id) {
            return Err(OrchestratorError::Conflict(format!(
                "operation {} is already running",
                operation_id
            )));
        }
        Ok(OperationGuard {
            active: &self.active,
            operation_id,
        })
    }

    fn runner(&self) -> PhaseRunner {
        PhaseRunner {
            resolver: Arc::clone(&self.resolver),
            retry: self.config.retry.clone(),
            event_bus: self.event_bus.clone(),
        }
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }
}

/// Releases an operation id when an engine action ends.
struct OperationGuard<'a> {
    active: &'a Mutex<HashSet<Uuid>>,
    operation_id: Uuid,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.operation_id);
    }
}

/// Resolves and drives one phase inside the retry boundary.
#[derive(Clone)]
struct PhaseRunner {
    resolver: Arc<DispatchResolver>,
    retry: RetryPolicy,
    event_bus: Option<EventBus>,
}

impl PhaseRunner {
    async fn execute(&self, params: &ExecutorParams, ctx: &ExecContext) -> Result<()> {
        let name = format!("phase {}", params.phase.id);
        let resolver = &self.resolver;
        with_retry(
            &self.retry,
            ctx.token(),
            &name,
            move |attempt| async move {
                debug!(phase = %params.phase.id, attempt, "Executing phase");
                let executor = resolver.resolve(params)?;
                ctx.run(executor.pre_check(ctx)).await?;
                ctx.run(executor.execute(ctx)).await?;
                ctx.run(executor.post_check(ctx)).await
            },
            |attempt, err| self.retrying(params, attempt, err),
        )
        .await
    }

    async fn rollback(&self, params: &ExecutorParams, ctx: &ExecContext) -> Result<()> {
        let name = format!("rollback of phase {}", params.phase.id);
        let resolver = &self.resolver;
        with_retry(
            &self.retry,
            ctx.token(),
            &name,
            move |_| async move {
                let executor = resolver.resolve(params)?;
                ctx.run(executor.rollback(ctx)).await
            },
            |attempt, err| self.retrying(params, attempt, err),
        )
        .await
    }

    fn retrying(&self, params: &ExecutorParams, attempt: u32, err: &OrchestratorError) {
        if let Some(bus) = &self.event_bus {
            bus.emit(Event::PhaseRetrying {
                operation_id: params.operation_id,
                phase_id: params.phase.id.clone(),
                attempt,
                error: err.to_string(),
            });
        }
    }
}
