use crate::error::DbError;
use crate::models::{PhaseRow, PlanRow};
use chrono::{DateTime, Utc};
use clusterops_core::{Phase, Plan};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

const PHASE_COLUMNS: &str = "plan_id, id, parent_id, position, description, state, requires, data, error_kind, error_message, completion_seq, started_at, completed_at";

#[derive(Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, plan: &Plan) -> Result<Plan, DbError> {
        let row = PlanRow::from_plan(plan)?;
        let phases = PhaseRow::flatten(plan.operation_id, &plan.phases)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO plans (id, operation_kind, cluster_name, dns_config, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.operation_kind)
        .bind(&row.cluster_name)
        .bind(&row.dns_config)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .execute(&mut *tx)
        .await?;

        insert_phases(&mut tx, &phases).await?;
        tx.commit().await?;

        debug!(operation_id = %plan.operation_id, phases = phases.len(), "Plan created");
        Ok(plan.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Plan>, DbError> {
        let row: Option<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, operation_kind, cluster_name, dns_config, created_at, updated_at, completed_at
            FROM plans
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let phases = self.phase_rows(&row.id).await?;
        Ok(Some(row.into_domain(phases)?))
    }

    pub async fn find_all(&self) -> Result<Vec<Plan>, DbError> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, operation_kind, cluster_name, dns_config, created_at, updated_at, completed_at
            FROM plans
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut plans = Vec::with_capacity(rows.len());
        for row in rows {
            let phases = self.phase_rows(&row.id).await?;
            plans.push(row.into_domain(phases)?);
        }
        Ok(plans)
    }

    /// Atomically writes the state of a single phase.
    pub async fn update_phase(
        &self,
        plan_id: Uuid,
        phase: &Phase,
        updated_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let row = PhaseRow::from_phase(plan_id, phase, None, 0)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE phases
            SET state = ?, data = ?, error_kind = ?, error_message = ?, completion_seq = ?, started_at = ?, completed_at = ?
            WHERE plan_id = ? AND id = ?
            "#,
        )
        .bind(&row.state)
        .bind(&row.data)
        .bind(&row.error_kind)
        .bind(&row.error_message)
        .bind(row.completion_seq)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(&row.plan_id)
        .bind(&row.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::PhaseNotFound {
                plan_id,
                phase_id: phase.id.clone(),
            });
        }

        sqlx::query("UPDATE plans SET updated_at = ? WHERE id = ?")
            .bind(updated_at.timestamp())
            .bind(&row.plan_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(operation_id = %plan_id, phase = %phase.id, state = %phase.state, "Phase persisted");
        Ok(())
    }

    /// Replaces the stored plan with `plan` in one transaction.
    pub async fn save(&self, plan: &Plan) -> Result<(), DbError> {
        let row = PlanRow::from_plan(plan)?;
        let phases = PhaseRow::flatten(plan.operation_id, &plan.phases)?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET operation_kind = ?, cluster_name = ?, dns_config = ?, updated_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&row.operation_kind)
        .bind(&row.cluster_name)
        .bind(&row.dns_config)
        .bind(row.updated_at)
        .bind(row.completed_at)
        .bind(&row.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::PlanNotFound(plan.operation_id));
        }

        sqlx::query("DELETE FROM phases WHERE plan_id = ?")
            .bind(&row.id)
            .execute(&mut *tx)
            .await?;
        insert_phases(&mut tx, &phases).await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn mark_completed(
        &self,
        plan_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE plans SET completed_at = ?, updated_at = ? WHERE id = ?")
            .bind(completed_at.timestamp())
            .bind(completed_at.timestamp())
            .bind(plan_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::PlanNotFound(plan_id));
        }
        Ok(())
    }

    async fn phase_rows(&self, plan_id: &str) -> Result<Vec<PhaseRow>, DbError> {
        let query = format!(
            "SELECT {} FROM phases WHERE plan_id = ? ORDER BY position",
            PHASE_COLUMNS
        );
        let rows: Vec<PhaseRow> = sqlx::query_as(&query)
            .bind(plan_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

async fn insert_phases(
    tx: &mut Transaction<'_, Sqlite>,
    phases: &[PhaseRow],
) -> Result<(), DbError> {
    let statement = format!(
        "INSERT INTO phases ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        PHASE_COLUMNS
    );
    for row in phases {
        sqlx::query(&statement)
            .bind(&row.plan_id)
            .bind(&row.id)
            .bind(&row.parent_id)
            .bind(row.position)
            .bind(&row.description)
            .bind(&row.state)
            .bind(&row.requires)
            .bind(&row.data)
            .bind(&row.error_kind)
            .bind(&row.error_message)
            .bind(row.completion_seq)
            .bind(row.started_at)
            .bind(row.completed_at)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}
