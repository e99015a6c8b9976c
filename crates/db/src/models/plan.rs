use chrono::{DateTime, TimeZone, Utc};
use clusterops_core::{DnsConfig, OperationKind, Phase, PhaseData, PhaseError, PhaseState, Plan};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::DbError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRow {
    pub id: String,
    pub operation_kind: String,
    pub cluster_name: String,
    pub dns_config: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl PlanRow {
    pub fn from_plan(plan: &Plan) -> Result<Self, DbError> {
        Ok(Self {
            id: plan.operation_id.to_string(),
            operation_kind: plan.operation_kind.as_str().to_string(),
            cluster_name: plan.cluster_name.clone(),
            dns_config: serde_json::to_string(&plan.dns_config)?,
            created_at: datetime_to_timestamp(plan.created_at),
            updated_at: datetime_to_timestamp(plan.updated_at),
            completed_at: plan.completed_at.map(datetime_to_timestamp),
        })
    }

    /// Rebuilds the plan from its row and its phase rows ordered by position.
    pub fn into_domain(self, phases: Vec<PhaseRow>) -> Result<Plan, DbError> {
        let dns_config: DnsConfig = serde_json::from_str(&self.dns_config).unwrap_or_default();
        let mut plan = Plan::new(
            OperationKind::parse(&self.operation_kind).unwrap_or_default(),
            self.cluster_name,
        )
        .with_id(Uuid::parse_str(&self.id).unwrap_or_default())
        .with_dns_config(dns_config)
        .with_phases(build_tree(phases)?);
        plan.created_at = timestamp_to_datetime(self.created_at);
        plan.updated_at = timestamp_to_datetime(self.updated_at);
        plan.completed_at = self.completed_at.map(timestamp_to_datetime);
        Ok(plan)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhaseRow {
    pub plan_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub position: i64,
    pub description: String,
    pub state: String,
    pub requires: String,
    pub data: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub completion_seq: Option<i64>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl PhaseRow {
    pub fn from_phase(
        plan_id: Uuid,
        phase: &Phase,
        parent_id: Option<&str>,
        position: i64,
    ) -> Result<Self, DbError> {
        let data = match &phase.data {
            Some(data) => Some(serde_json::to_string(data)?),
            None => None,
        };
        Ok(Self {
            plan_id: plan_id.to_string(),
            id: phase.id.clone(),
            parent_id: parent_id.map(str::to_string),
            position,
            description: phase.description.clone(),
            state: phase.state.as_str().to_string(),
            requires: serde_json::to_string(&phase.requires)?,
            data,
            error_kind: phase.error.as_ref().map(|e| e.kind.clone()),
            error_message: phase.error.as_ref().map(|e| e.message.clone()),
            completion_seq: phase.completion_seq.map(|seq| seq as i64),
            started_at: phase.started_at.map(datetime_to_timestamp),
            completed_at: phase.completed_at.map(datetime_to_timestamp),
        })
    }

    /// Flattens a phase tree in pre-order, recording parent and position.
    pub fn flatten(plan_id: Uuid, phases: &[Phase]) -> Result<Vec<Self>, DbError> {
        let mut rows = Vec::new();
        flatten_into(plan_id, phases, None, &mut rows)?;
        Ok(rows)
    }

    pub fn into_domain(self) -> Result<Phase, DbError> {
        let data: Option<PhaseData> = match self.data {
            Some(data) => Some(serde_json::from_str(&data)?),
            None => None,
        };
        let error = match (self.error_kind, self.error_message) {
            (Some(kind), Some(message)) => Some(PhaseError { kind, message }),
            _ => None,
        };
        Ok(Phase {
            id: self.id,
            description: self.description,
            state: PhaseState::parse(&self.state).unwrap_or_default(),
            requires: serde_json::from_str(&self.requires)?,
            data,
            phases: Vec::new(),
            started_at: self.started_at.map(timestamp_to_datetime),
            completed_at: self.completed_at.map(timestamp_to_datetime),
            error,
            completion_seq: self.completion_seq.map(|seq| seq as u64),
        })
    }
}

fn flatten_into(
    plan_id: Uuid,
    phases: &[Phase],
    parent_id: Option<&str>,
    rows: &mut Vec<PhaseRow>,
) -> Result<(), DbError> {
    for phase in phases {
        let position = rows.len() as i64;
        rows.push(PhaseRow::from_phase(plan_id, phase, parent_id, position)?);
        flatten_into(plan_id, &phase.phases, Some(phase.id.as_str()), rows)?;
    }
    Ok(())
}

fn build_tree(rows: Vec<PhaseRow>) -> Result<Vec<Phase>, DbError> {
    let mut by_parent: HashMap<Option<String>, Vec<PhaseRow>> = HashMap::new();
    for row in rows {
        by_parent.entry(row.parent_id.clone()).or_default().push(row);
    }
    for siblings in by_parent.values_mut() {
        siblings.sort_by_key(|row| row.position);
    }
    assemble(None, &mut by_parent)
}

fn assemble(
    parent_id: Option<String>,
    by_parent: &mut HashMap<Option<String>, Vec<PhaseRow>>,
) -> Result<Vec<Phase>, DbError> {
    let rows = by_parent.remove(&parent_id).unwrap_or_default();
    let mut phases = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.clone();
        let mut phase = row.into_domain()?;
        phase.phases = assemble(Some(id), by_parent)?;
        phases.push(phase);
    }
    Ok(phases)
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn datetime_to_timestamp(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}
