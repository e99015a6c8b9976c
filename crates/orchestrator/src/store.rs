use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clusterops_core::{Phase, Plan};
use db::{DbError, PlanRepository};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Durable storage for plans.
///
/// `update_phase` must write a single phase atomically; the engine calls it
/// after every state transition.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn create_plan(&self, plan: &Plan) -> Result<()>;

    async fn get_plan(&self, id: Uuid) -> Result<Plan>;

    async fn list_plans(&self) -> Result<Vec<Plan>>;

    async fn update_phase(&self, plan_id: Uuid, phase: &Phase, updated_at: DateTime<Utc>)
        -> Result<()>;

    async fn save_plan(&self, plan: &Plan) -> Result<()>;

    async fn mark_completed(&self, plan_id: Uuid, completed_at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
impl PlanStore for PlanRepository {
    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        self.create(plan).await?;
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.find_by_id(id)
            .await?
            .ok_or(OrchestratorError::PlanNotFound(id))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        Ok(self.find_all().await?)
    }

    async fn update_phase(
        &self,
        plan_id: Uuid,
        phase: &Phase,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        PlanRepository::update_phase(self, plan_id, phase, updated_at)
            .await
            .map_err(not_found)
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        self.save(plan).await.map_err(not_found)
    }

    async fn mark_completed(&self, plan_id: Uuid, completed_at: DateTime<Utc>) -> Result<()> {
        PlanRepository::mark_completed(self, plan_id, completed_at)
            .await
            .map_err(not_found)
    }
}

fn not_found(err: DbError) -> OrchestratorError {
    match err {
        DbError::PlanNotFound(id) => OrchestratorError::PlanNotFound(id),
        DbError::PhaseNotFound { phase_id, .. } => OrchestratorError::PhaseNotFound(phase_id),
        other => other.into(),
    }
}

/// In-memory store for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryPlanStore {
    plans: Arc<RwLock<HashMap<Uuid, Plan>>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn create_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().await;
        if plans.contains_key(&plan.operation_id) {
            return Err(OrchestratorError::Conflict(format!(
                "plan {} already exists",
                plan.operation_id
            )));
        }
        plans.insert(plan.operation_id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: Uuid) -> Result<Plan> {
        self.plans
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(OrchestratorError::PlanNotFound(id))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.plans.read().await.values().cloned().collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }

    async fn update_phase(
        &self,
        plan_id: Uuid,
        phase: &Phase,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut plans = self.plans.write().await;
        let plan = plans
            .get_mut(&plan_id)
            .ok_or(OrchestratorError::PlanNotFound(plan_id))?;
        if !replace_phase_state(&mut plan.phases, phase) {
            return Err(OrchestratorError::PhaseNotFound(phase.id.clone()));
        }
        plan.updated_at = updated_at;
        Ok(())
    }

    async fn save_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().await;
        match plans.get_mut(&plan.operation_id) {
            Some(stored) => {
                *stored = plan.clone();
                Ok(())
            }
            None => Err(OrchestratorError::PlanNotFound(plan.operation_id)),
        }
    }

    async fn mark_completed(&self, plan_id: Uuid, completed_at: DateTime<Utc>) -> Result<()> {
        let mut plans = self.plans.write().await;
        let plan = plans
            .get_mut(&plan_id)
            .ok_or(OrchestratorError::PlanNotFound(plan_id))?;
        plan.completed_at = Some(completed_at);
        plan.updated_at = completed_at;
        Ok(())
    }
}

/// Copies the mutable fields of `update` onto the stored phase with the same id.
fn replace_phase_state(phases: &mut [Phase], update: &Phase) -> bool {
    for phase in phases.iter_mut() {
        if phase.id == update.id {
            phase.state = update.state;
            phase.data = update.data.clone();
            phase.error = update.error.clone();
            phase.completion_seq = update.completion_seq;
            phase.started_at = update.started_at;
            phase.completed_at = update.completed_at;
            return true;
        }
        if replace_phase_state(&mut phase.phases, update) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterops_core::{OperationKind, PhaseState};

    fn sample_plan() -> Plan {
        Plan::new(OperationKind::Install, "example.com").with_phases(vec![Phase::new(
            "/masters",
            "Install masters",
        )
        .with_phases(vec![Phase::new("/masters/node-1", "Install node-1")])])
    }

    #[tokio::test]
    async fn test_memory_store_update_phase() {
        let store = MemoryPlanStore::new();
        let mut plan = sample_plan();
        store.create_plan(&plan).await.unwrap();

        plan.set_phase_state("/masters/node-1", PhaseState::InProgress)
            .unwrap();
        let phase = plan.get_phase("/masters/node-1").unwrap().clone();
        store
            .update_phase(plan.operation_id, &phase, plan.updated_at)
            .await
            .unwrap();

        let stored = store.get_plan(plan.operation_id).await.unwrap();
        assert_eq!(
            stored.get_phase("/masters/node-1").unwrap().state,
            PhaseState::InProgress
        );
        // Parents are written by their own update.
        assert_eq!(stored.get_phase("/masters").unwrap().state, PhaseState::Unstarted);
    }

    #[tokio::test]
    async fn test_memory_store_missing() {
        let store = MemoryPlanStore::new();
        let plan = sample_plan();

        let err = store.get_plan(plan.operation_id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanNotFound(_)));

        store.create_plan(&plan).await.unwrap();
        assert!(matches!(
            store.create_plan(&plan).await.unwrap_err(),
            OrchestratorError::Conflict(_)
        ));
        let err = store
            .update_phase(plan.operation_id, &Phase::new("/bogus", "Bogus"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PhaseNotFound(_)));
    }

    #[tokio::test]
    async fn test_repository_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("plans.db").display());
        let pool = db::open(&url, &db::PoolConfig::default()).await.unwrap();
        let store: Arc<dyn PlanStore> = Arc::new(PlanRepository::new(pool));

        let plan = sample_plan();
        store.create_plan(&plan).await.unwrap();
        let loaded = store.get_plan(plan.operation_id).await.unwrap();
        assert_eq!(loaded.operation_id, plan.operation_id);
        assert_eq!(store.list_plans().await.unwrap().len(), 1);

        let err = store.get_plan(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PlanNotFound(_)));
    }
}
