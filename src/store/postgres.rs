//! Postgres-backed run storage
//!
//! One row per run in `workflow_runs`, rewritten wholesale on every save.
//! The `cancel_requested` column is only ever flipped to true by
//! `mark_cancelled`; `save` folds it back into the stored status so a
//! cancel that lands mid-step wins over the engine's in-flight state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::types::RunState;

use super::RunStore;

#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_state(row: PgRow) -> Result<RunState> {
    let workflow: JsonValue = row.try_get("workflow")?;
    let context: JsonValue = row.try_get("context")?;
    let loop_stack: JsonValue = row.try_get("loop_stack")?;
    let outputs: JsonValue = row.try_get("outputs")?;
    let error: Option<JsonValue> = row.try_get("error")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(RunState {
        run_id: row.try_get("run_id")?,
        workflow: serde_json::from_value(workflow).context("Invalid stored workflow")?,
        version_hash: row.try_get("version_hash")?,
        status: row.try_get("status")?,
        current_step: row.try_get("current_step")?,
        context: serde_json::from_value(context).context("Invalid stored context")?,
        loop_stack: serde_json::from_value(loop_stack).context("Invalid stored loop stack")?,
        outputs: serde_json::from_value(outputs).context("Invalid stored outputs")?,
        error: error
            .map(serde_json::from_value)
            .transpose()
            .context("Invalid stored error")?,
        created_at,
        updated_at,
    })
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn create(&self, state: &RunState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (run_id, workflow, version_hash, status, current_step,
                 context, loop_stack, outputs, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&state.run_id)
        .bind(serde_json::to_value(&state.workflow)?)
        .bind(&state.version_hash)
        .bind(state.status)
        .bind(&state.current_step)
        .bind(JsonValue::Object(state.context.clone()))
        .bind(serde_json::to_value(&state.loop_stack)?)
        .bind(serde_json::to_value(&state.outputs)?)
        .bind(state.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;

        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, workflow, version_hash, status, current_step,
                   context, loop_stack, outputs, error, created_at, updated_at
            FROM workflow_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load run")?;

        row.map(row_to_state).transpose()
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = CASE WHEN cancel_requested THEN 'cancelled' ELSE $2 END,
                current_step = $3,
                context = $4,
                loop_stack = $5,
                outputs = $6,
                error = $7,
                updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(&state.run_id)
        .bind(state.status)
        .bind(&state.current_step)
        .bind(JsonValue::Object(state.context.clone()))
        .bind(serde_json::to_value(&state.loop_stack)?)
        .bind(serde_json::to_value(&state.outputs)?)
        .bind(state.error.as_ref().map(serde_json::to_value).transpose()?)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn mark_cancelled(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET cancel_requested = TRUE,
                status = 'cancelled',
                updated_at = NOW()
            WHERE run_id = $1
              AND status IN ('running', 'suspended')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel run")?;

        Ok(result.rows_affected() > 0)
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        let cancelled: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT cancel_requested FROM workflow_runs WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to check cancellation")?;

        Ok(cancelled.unwrap_or(false))
    }
}
