use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use stepwire_model::rpc::WorkflowError;
use stepwire_model::{
    ApiConnectionId, DelayId, DelayRecord, DurableDelay, Environment,
    EnvironmentId, ExternalSource, ExternalSourceId, RunId, StepId, StepKind,
    StepStatus, Wait, WorkflowId, WorkflowRunRef, WorkflowStep,
};
use tracing::{debug, instrument};

use crate::coordination::{DelayResolution, NewStep, WorkflowStore};
use crate::error::{RecordKind, StoreError};

const DELAY_RECORD_SELECT: &str = r#"
    SELECT
        d.id AS delay_id,
        d.step_id,
        d.wait_seconds,
        d.resolve_at,
        d.resolved_at,
        d.created_at,
        s.run_id,
        s.idempotency_key,
        s.kind,
        s.status AS step_status,
        s.input,
        s.started_at,
        s.finished_at,
        r.workflow_id,
        r.environment_id,
        r.status AS run_status
    FROM durable_delays d
    JOIN workflow_run_steps s ON s.id = d.step_id
    JOIN workflow_runs r ON r.id = s.run_id
"#;

const STEP_COLUMNS: &str = r#"
    id, run_id, idempotency_key, kind, status, input, started_at, finished_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct DelayRecordRow {
    delay_id: String,
    step_id: String,
    wait_seconds: i64,
    resolve_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    run_id: String,
    idempotency_key: String,
    kind: String,
    step_status: String,
    input: Option<Value>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    workflow_id: String,
    environment_id: String,
    run_status: String,
}

impl DelayRecordRow {
    fn into_record(self) -> Result<DelayRecord, StoreError> {
        let step_id = StepId::new(self.step_id);
        let run_id = RunId::new(self.run_id);
        Ok(DelayRecord {
            delay: DurableDelay {
                id: DelayId::new(self.delay_id),
                step_id: step_id.clone(),
                wait_seconds: self.wait_seconds,
                resolve_at: self.resolve_at,
                resolved_at: self.resolved_at,
                created_at: self.created_at,
            },
            step: WorkflowStep {
                id: step_id,
                run_id: run_id.clone(),
                key: self.idempotency_key,
                kind: parse_column(&self.kind)?,
                status: parse_column(&self.step_status)?,
                input: self.input,
                started_at: self.started_at,
                finished_at: self.finished_at,
            },
            run: WorkflowRunRef {
                id: run_id,
                workflow_id: WorkflowId::new(self.workflow_id),
                environment_id: EnvironmentId::new(self.environment_id),
                status: parse_column(&self.run_status)?,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StepRow {
    id: String,
    run_id: String,
    idempotency_key: String,
    kind: String,
    status: String,
    input: Option<Value>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn into_step(self) -> Result<WorkflowStep, StoreError> {
        Ok(WorkflowStep {
            id: StepId::new(self.id),
            run_id: RunId::new(self.run_id),
            key: self.idempotency_key,
            kind: parse_column(&self.kind)?,
            status: parse_column(&self.status)?,
            input: self.input,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ExternalSourceRow {
    id: String,
    service: String,
    status: String,
    connection_id: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct EnvironmentRow {
    id: String,
    slug: String,
    api_key: String,
}

fn parse_column<T>(value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| StoreError::Database(format!("corrupt row: {e}")))
}

/// [`WorkflowStore`] backed by PostgreSQL.
///
/// Schema lives in `migrations/`; run [`crate::persistence::MIGRATOR`]
/// (or [`PgWorkflowStore::migrate`]) before first use.
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl fmt::Debug for PgWorkflowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgWorkflowStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        super::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
    }

    async fn delay_record(
        tx: &mut Transaction<'_, Postgres>,
        id: &DelayId,
        lock: bool,
    ) -> Result<Option<DelayRecord>, StoreError> {
        let query = if lock {
            format!("{DELAY_RECORD_SELECT} WHERE d.id = $1 FOR UPDATE OF d, s")
        } else {
            format!("{DELAY_RECORD_SELECT} WHERE d.id = $1")
        };
        sqlx::query_as::<_, DelayRecordRow>(&query)
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?
            .map(DelayRecordRow::into_record)
            .transpose()
    }

    async fn ensure_run(
        tx: &mut Transaction<'_, Postgres>,
        run_id: &RunId,
    ) -> Result<(), StoreError> {
        let exists: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM workflow_runs WHERE id = $1")
                .bind(run_id.as_str())
                .fetch_optional(&mut **tx)
                .await?;
        exists
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(RecordKind::Run, run_id))
    }

    async fn step_by_key(
        tx: &mut Transaction<'_, Postgres>,
        run_id: &RunId,
        key: &str,
    ) -> Result<Option<WorkflowStep>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_run_steps \
             WHERE run_id = $1 AND idempotency_key = $2"
        ))
        .bind(run_id.as_str())
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?
        .map(StepRow::into_step)
        .transpose()
    }

    /// Inserts the step unless `(run_id, key)` already exists. Returns the
    /// stored step and whether this call created it.
    async fn insert_step(
        tx: &mut Transaction<'_, Postgres>,
        step: &NewStep,
    ) -> Result<(WorkflowStep, bool), StoreError> {
        let status = if step.completed {
            StepStatus::Success
        } else {
            StepStatus::Running
        };
        let inserted = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO workflow_run_steps
                (id, run_id, idempotency_key, kind, status, input, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_id, idempotency_key) DO NOTHING
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(StepId::generate().as_str())
        .bind(step.run_id.as_str())
        .bind(&step.key)
        .bind(step.kind.as_str())
        .bind(status.as_str())
        .bind(&step.input)
        .bind(step.started_at)
        .bind(step.completed.then_some(step.started_at))
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(row) => Ok((row.into_step()?, true)),
            None => {
                let existing = Self::step_by_key(tx, &step.run_id, &step.key)
                    .await?
                    .ok_or_else(|| StoreError::Conflict {
                        kind: RecordKind::Step,
                        id: step.key.clone(),
                        reason: "step vanished after key conflict".into(),
                    })?;
                Ok((existing, false))
            }
        }
    }

    async fn update_run(
        &self,
        run_id: &RunId,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), StoreError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(RecordKind::Run, run_id));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn find_delay(&self, id: &DelayId) -> Result<Option<DelayRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let record = Self::delay_record(&mut tx, id, false).await?;
        tx.commit().await?;
        Ok(record)
    }

    #[instrument(skip_all, fields(delay_id = %id), err)]
    async fn resolve_delay(
        &self,
        id: &DelayId,
        resolved_at: DateTime<Utc>,
    ) -> Result<DelayResolution, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::delay_record(&mut tx, id, true)
            .await?
            .ok_or_else(|| StoreError::not_found(RecordKind::Delay, id))?;
        if current.delay.is_resolved() {
            tx.rollback().await?;
            return Ok(DelayResolution::AlreadyResolved(current));
        }

        let updated = sqlx::query(
            "UPDATE durable_delays SET resolved_at = $2 \
             WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id.as_str())
        .bind(resolved_at)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let record = self
                .find_delay(id)
                .await?
                .ok_or_else(|| StoreError::not_found(RecordKind::Delay, id))?;
            return Ok(DelayResolution::AlreadyResolved(record));
        }

        sqlx::query(
            "UPDATE workflow_run_steps SET status = $2, finished_at = $3 WHERE id = $1",
        )
        .bind(current.step.id.as_str())
        .bind(StepStatus::Success.as_str())
        .bind(resolved_at)
        .execute(&mut *tx)
        .await?;

        let record = Self::delay_record(&mut tx, id, false)
            .await?
            .ok_or_else(|| StoreError::not_found(RecordKind::Delay, id))?;
        tx.commit().await?;
        debug!("delay row and step committed");
        Ok(DelayResolution::Resolved(record))
    }

    async fn connect_external_source(
        &self,
        source_id: &ExternalSourceId,
        connection_id: &ApiConnectionId,
    ) -> Result<ExternalSource, StoreError> {
        let mut tx = self.pool.begin().await?;
        let connection: Option<(String,)> =
            sqlx::query_as("SELECT id FROM api_connections WHERE id = $1")
                .bind(connection_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if connection.is_none() {
            return Err(StoreError::not_found(
                RecordKind::ApiConnection,
                connection_id,
            ));
        }

        let row = sqlx::query_as::<_, ExternalSourceRow>(
            r#"
            UPDATE external_sources
            SET connection_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, service, status, connection_id, updated_at
            "#,
        )
        .bind(source_id.as_str())
        .bind(connection_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found(RecordKind::ExternalSource, source_id))?;
        tx.commit().await?;

        Ok(ExternalSource {
            id: ExternalSourceId::new(row.id),
            service: row.service,
            status: parse_column(&row.status)?,
            connection_id: row.connection_id.map(ApiConnectionId::new),
            updated_at: row.updated_at,
        })
    }

    async fn find_environment_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Environment>, StoreError> {
        let row = sqlx::query_as::<_, EnvironmentRow>(
            "SELECT id, slug, api_key FROM environments WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Environment {
            id: EnvironmentId::new(row.id),
            slug: row.slug,
            api_key: row.api_key,
        }))
    }

    async fn start_run(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<(), StoreError> {
        // Only a pending run moves; a replayed start still has to find the row.
        self.update_run(
            run_id,
            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = CASE WHEN status = 'PENDING' THEN 'RUNNING' ELSE status END,
                    started_at = COALESCE(started_at, $2)
                WHERE id = $1
                "#,
            )
            .bind(run_id.as_str())
            .bind(at),
        )
        .await
    }

    async fn complete_run(
        &self,
        run_id: &RunId,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query(
                "UPDATE workflow_runs SET status = 'SUCCESS', output = $2, finished_at = $3 \
                 WHERE id = $1",
            )
            .bind(run_id.as_str())
            .bind(output)
            .bind(at),
        )
        .await
    }

    async fn fail_run(
        &self,
        run_id: &RunId,
        error: &WorkflowError,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_run(
            run_id,
            sqlx::query(
                "UPDATE workflow_runs SET status = 'FAILURE', error = $2, finished_at = $3 \
                 WHERE id = $1",
            )
            .bind(run_id.as_str())
            .bind(Json(error.clone()))
            .bind(at),
        )
        .await
    }

    #[instrument(skip_all, fields(run_id = %run_id, key = %key), err)]
    async fn record_delay_step(
        &self,
        run_id: &RunId,
        key: &str,
        wait: &Wait,
        requested_at: DateTime<Utc>,
    ) -> Result<DelayRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_run(&mut tx, run_id).await?;

        let (step, created) = Self::insert_step(
            &mut tx,
            &NewStep {
                run_id: run_id.clone(),
                key: key.to_owned(),
                kind: StepKind::DurableDelay,
                input: json!(wait),
                started_at: requested_at,
                completed: false,
            },
        )
        .await?;

        let delay_id = if created {
            let resolve_at = wait.resolve_at(requested_at);
            let id = DelayId::generate();
            sqlx::query(
                "INSERT INTO durable_delays (id, step_id, wait_seconds, resolve_at) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id.as_str())
            .bind(step.id.as_str())
            .bind((resolve_at - requested_at).num_seconds())
            .bind(resolve_at)
            .execute(&mut *tx)
            .await?;
            id
        } else {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT id FROM durable_delays WHERE step_id = $1")
                    .bind(step.id.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            let (id,) = existing.ok_or_else(|| StoreError::Conflict {
                kind: RecordKind::Step,
                id: step.id.to_string(),
                reason: format!("step key {key} is not a delay"),
            })?;
            DelayId::new(id)
        };

        let record = Self::delay_record(&mut tx, &delay_id, false)
            .await?
            .ok_or_else(|| StoreError::not_found(RecordKind::Delay, &delay_id))?;
        tx.commit().await?;
        Ok(record)
    }

    async fn record_step(&self, step: NewStep) -> Result<WorkflowStep, StoreError> {
        let mut tx = self.pool.begin().await?;
        Self::ensure_run(&mut tx, &step.run_id).await?;
        let (stored, _) = Self::insert_step(&mut tx, &step).await?;
        tx.commit().await?;
        Ok(stored)
    }
}
