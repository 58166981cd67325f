//! Postgres-backed execution ledger.
//!
//! The [`ExecutionLedger`] trait is synchronous while SQLx is async, so the ledger
//! owns a small Tokio runtime and blocks on it for every call. Do not call it from
//! inside another async runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) on instance insert | `23505` | `DuplicateInstance` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Io / other | N/A | `Backend` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Runtime;
use tracing::{info, instrument};

use forgebatch_core::{
    BatchStatus, ExecutionContext, ExecutionId, ExitStatus, InstanceId, JobExecution, JobInstance,
    JobParameters, StepExecution, StepExecutionId,
};

use super::{ExecutionLedger, LedgerError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS batch_job_instance (
        id BIGSERIAL PRIMARY KEY,
        job_name TEXT NOT NULL,
        identity_key TEXT NOT NULL,
        UNIQUE (job_name, identity_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batch_job_execution (
        id BIGSERIAL PRIMARY KEY,
        instance_id BIGINT NOT NULL REFERENCES batch_job_instance (id),
        status TEXT NOT NULL,
        exit_code TEXT NOT NULL,
        exit_description TEXT NOT NULL,
        create_time TIMESTAMPTZ NOT NULL,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        last_updated TIMESTAMPTZ NOT NULL,
        parameters JSONB NOT NULL,
        execution_context JSONB NOT NULL,
        failure_messages JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS batch_step_execution (
        id BIGSERIAL PRIMARY KEY,
        job_execution_id BIGINT NOT NULL REFERENCES batch_job_execution (id),
        step_name TEXT NOT NULL,
        status TEXT NOT NULL,
        exit_code TEXT NOT NULL,
        exit_description TEXT NOT NULL,
        read_count BIGINT NOT NULL,
        write_count BIGINT NOT NULL,
        commit_count BIGINT NOT NULL,
        rollback_count BIGINT NOT NULL,
        filter_count BIGINT NOT NULL,
        read_skip_count BIGINT NOT NULL,
        process_skip_count BIGINT NOT NULL,
        write_skip_count BIGINT NOT NULL,
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        last_updated TIMESTAMPTZ NOT NULL,
        execution_context JSONB NOT NULL,
        failure_messages JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS batch_job_execution_instance_idx ON batch_job_execution (instance_id)",
    "CREATE INDEX IF NOT EXISTS batch_step_execution_job_idx ON batch_step_execution (job_execution_id)",
];

const EXECUTION_COLUMNS: &str = r#"
    e.id, e.instance_id, i.job_name, i.identity_key, e.status, e.exit_code, e.exit_description,
    e.create_time, e.start_time, e.end_time, e.last_updated, e.parameters, e.execution_context,
    e.failure_messages
"#;

const STEP_COLUMNS: &str = r#"
    id, job_execution_id, step_name, status, exit_code, exit_description, read_count,
    write_count, commit_count, rollback_count, filter_count, read_skip_count,
    process_skip_count, write_skip_count, start_time, end_time, last_updated,
    execution_context, failure_messages
"#;

/// Postgres-backed execution ledger.
///
/// Uses a SQLx connection pool which is thread-safe; the ledger can be shared
/// across job threads.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
    runtime: Arc<Runtime>,
}

impl PostgresLedger {
    /// Connect to `database_url` and create the ledger tables if missing.
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("batch-ledger-io")
            .enable_all()
            .build()
            .map_err(|e| LedgerError::Backend(format!("failed to start ledger runtime: {e}")))?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| map_sqlx_error("connect", e))?;

        let ledger = Self {
            pool: Arc::new(pool),
            runtime: Arc::new(runtime),
        };
        ledger.migrate()?;
        info!(max_connections, "postgres execution ledger ready");
        Ok(ledger)
    }

    pub fn migrate(&self) -> Result<(), LedgerError> {
        self.runtime.block_on(async {
            for statement in SCHEMA {
                sqlx::query(statement)
                    .execute(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("migrate", e))?;
            }
            Ok(())
        })
    }

    async fn load_steps(&self, execution_ids: &[i64]) -> Result<Vec<StepExecution>, LedgerError> {
        if execution_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM batch_step_execution WHERE job_execution_id = ANY($1) ORDER BY id ASC"
        ))
        .bind(execution_ids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_steps", e))?;

        rows.iter()
            .map(|row| {
                StepRow::from_row(row)
                    .map_err(|e| LedgerError::Backend(format!("failed to decode step row: {e}")))?
                    .try_into()
            })
            .collect()
    }

    /// Decode execution rows and attach their steps.
    async fn hydrate(&self, rows: Vec<PgRow>) -> Result<Vec<JobExecution>, LedgerError> {
        let mut executions = rows
            .iter()
            .map(|row| {
                ExecutionRow::from_row(row)
                    .map_err(|e| LedgerError::Backend(format!("failed to decode execution row: {e}")))?
                    .try_into()
            })
            .collect::<Result<Vec<JobExecution>, LedgerError>>()?;

        let ids: Vec<i64> = executions.iter().map(|e| e.id.get() as i64).collect();
        for step in self.load_steps(&ids).await? {
            if let Some(execution) = executions.iter_mut().find(|e| e.id == step.job_execution_id) {
                execution.step_executions.push(step);
            }
        }
        Ok(executions)
    }
}

impl ExecutionLedger for PostgresLedger {
    #[instrument(skip(self), err)]
    fn find_instance(&self, job_name: &str, identity_key: &str) -> Result<Option<JobInstance>, LedgerError> {
        self.runtime.block_on(async {
            let row = sqlx::query(
                "SELECT id, job_name, identity_key FROM batch_job_instance WHERE job_name = $1 AND identity_key = $2",
            )
            .bind(job_name)
            .bind(identity_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_instance", e))?;

            row.map(|row| decode_instance(&row)).transpose()
        })
    }

    #[instrument(skip(self), err)]
    fn create_instance(&self, job_name: &str, identity_key: &str) -> Result<JobInstance, LedgerError> {
        self.runtime.block_on(async {
            let row = sqlx::query(
                "INSERT INTO batch_job_instance (job_name, identity_key) VALUES ($1, $2) RETURNING id, job_name, identity_key",
            )
            .bind(job_name)
            .bind(identity_key)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    LedgerError::DuplicateInstance {
                        job_name: job_name.to_string(),
                        identity_key: identity_key.to_string(),
                    }
                } else {
                    map_sqlx_error("create_instance", e)
                }
            })?;

            decode_instance(&row)
        })
    }

    #[instrument(skip(self, instance, parameters), fields(job_name = %instance.job_name, instance_id = %instance.id), err)]
    fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution, LedgerError> {
        // Built first so the stored and returned timestamps agree; the id is replaced below.
        let mut execution = JobExecution::new(ExecutionId::new(0), instance.clone(), parameters.clone());
        let params = serde_json::to_value(parameters)
            .map_err(|e| LedgerError::Backend(format!("failed to encode parameters: {e}")))?;

        let id: i64 = self.runtime.block_on(async {
            let row = sqlx::query(
                r#"
                INSERT INTO batch_job_execution (
                    instance_id, status, exit_code, exit_description, create_time,
                    last_updated, parameters, execution_context, failure_messages
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING id
                "#,
            )
            .bind(instance.id.get() as i64)
            .bind(execution.status.as_str())
            .bind(&execution.exit_status.exit_code)
            .bind(&execution.exit_status.exit_description)
            .bind(execution.create_time)
            .bind(execution.last_updated)
            .bind(&params)
            .bind(execution.execution_context.to_json())
            .bind(JsonValue::Array(Vec::new()))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_execution", e))?;

            row.try_get("id").map_err(|e| map_sqlx_error("create_execution", e))
        })?;

        execution.id = ExecutionId::new(id as u64);
        Ok(execution)
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status), err)]
    fn update_execution(&self, execution: &JobExecution) -> Result<(), LedgerError> {
        let failures = serde_json::to_value(&execution.failure_messages)
            .map_err(|e| LedgerError::Backend(format!("failed to encode failure messages: {e}")))?;

        self.runtime.block_on(async {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let current = sqlx::query("SELECT status FROM batch_job_execution WHERE id = $1 FOR UPDATE")
                .bind(execution.id.get() as i64)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_execution", e))?
                .ok_or_else(|| LedgerError::NotFound(format!("execution {}", execution.id)))?;

            let status: String = current
                .try_get("status")
                .map_err(|e| map_sqlx_error("update_execution", e))?;
            if parse_status(&status)?.is_terminal() && execution.status != BatchStatus::Abandoned {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(LedgerError::TerminalExecution(execution.id));
            }

            sqlx::query(
                r#"
                UPDATE batch_job_execution SET
                    status = $2, exit_code = $3, exit_description = $4, start_time = $5,
                    end_time = $6, last_updated = $7, execution_context = $8, failure_messages = $9
                WHERE id = $1
                "#,
            )
            .bind(execution.id.get() as i64)
            .bind(execution.status.as_str())
            .bind(&execution.exit_status.exit_code)
            .bind(&execution.exit_status.exit_description)
            .bind(execution.start_time)
            .bind(execution.end_time)
            .bind(execution.last_updated)
            .bind(execution.execution_context.to_json())
            .bind(&failures)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_execution", e))?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))
        })
    }

    #[instrument(skip(self, step), fields(execution_id = %step.job_execution_id, step_name = %step.step_name), err)]
    fn add_step(&self, step: &mut StepExecution) -> Result<(), LedgerError> {
        let failures = serde_json::to_value(&step.failure_messages)
            .map_err(|e| LedgerError::Backend(format!("failed to encode failure messages: {e}")))?;

        let id: i64 = self.runtime.block_on(async {
            let row = sqlx::query(
                r#"
                INSERT INTO batch_step_execution (
                    job_execution_id, step_name, status, exit_code, exit_description,
                    read_count, write_count, commit_count, rollback_count, filter_count,
                    read_skip_count, process_skip_count, write_skip_count,
                    start_time, end_time, last_updated, execution_context, failure_messages
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                RETURNING id
                "#,
            )
            .bind(step.job_execution_id.get() as i64)
            .bind(&step.step_name)
            .bind(step.status.as_str())
            .bind(&step.exit_status.exit_code)
            .bind(&step.exit_status.exit_description)
            .bind(step.read_count as i64)
            .bind(step.write_count as i64)
            .bind(step.commit_count as i64)
            .bind(step.rollback_count as i64)
            .bind(step.filter_count as i64)
            .bind(step.read_skip_count as i64)
            .bind(step.process_skip_count as i64)
            .bind(step.write_skip_count as i64)
            .bind(step.start_time)
            .bind(step.end_time)
            .bind(step.last_updated)
            .bind(step.execution_context.to_json())
            .bind(&failures)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("add_step", e))?;

            row.try_get("id").map_err(|e| map_sqlx_error("add_step", e))
        })?;

        step.id = Some(StepExecutionId::new(id as u64));
        Ok(())
    }

    #[instrument(skip(self, step), fields(step_name = %step.step_name, status = %step.status), err)]
    fn update_step(&self, step: &StepExecution) -> Result<(), LedgerError> {
        let id = step
            .id
            .ok_or_else(|| LedgerError::NotFound(format!("step {} has no id", step.step_name)))?;
        let failures = serde_json::to_value(&step.failure_messages)
            .map_err(|e| LedgerError::Backend(format!("failed to encode failure messages: {e}")))?;

        let updated = self.runtime.block_on(async {
            sqlx::query(
                r#"
                UPDATE batch_step_execution SET
                    status = $2, exit_code = $3, exit_description = $4,
                    read_count = $5, write_count = $6, commit_count = $7, rollback_count = $8,
                    filter_count = $9, read_skip_count = $10, process_skip_count = $11,
                    write_skip_count = $12, start_time = $13, end_time = $14, last_updated = $15,
                    execution_context = $16, failure_messages = $17
                WHERE id = $1
                "#,
            )
            .bind(id.get() as i64)
            .bind(step.status.as_str())
            .bind(&step.exit_status.exit_code)
            .bind(&step.exit_status.exit_description)
            .bind(step.read_count as i64)
            .bind(step.write_count as i64)
            .bind(step.commit_count as i64)
            .bind(step.rollback_count as i64)
            .bind(step.filter_count as i64)
            .bind(step.read_skip_count as i64)
            .bind(step.process_skip_count as i64)
            .bind(step.write_skip_count as i64)
            .bind(step.start_time)
            .bind(step.end_time)
            .bind(step.last_updated)
            .bind(step.execution_context.to_json())
            .bind(&failures)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_step", e))
        })?;

        if updated.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("step execution {id}")));
        }
        Ok(())
    }

    fn get_execution(&self, id: ExecutionId) -> Result<Option<JobExecution>, LedgerError> {
        self.runtime.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM batch_job_execution e JOIN batch_job_instance i ON i.id = e.instance_id WHERE e.id = $1"
            ))
            .bind(id.get() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_execution", e))?;

            Ok(self.hydrate(rows).await?.into_iter().next())
        })
    }

    fn executions_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobExecution>, LedgerError> {
        self.runtime.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM batch_job_execution e JOIN batch_job_instance i ON i.id = e.instance_id WHERE e.instance_id = $1 ORDER BY e.id DESC"
            ))
            .bind(instance_id.get() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("executions_for_instance", e))?;

            self.hydrate(rows).await
        })
    }

    fn latest_execution(&self, job_name: &str) -> Result<Option<JobExecution>, LedgerError> {
        self.runtime.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM batch_job_execution e JOIN batch_job_instance i ON i.id = e.instance_id WHERE i.job_name = $1 ORDER BY e.id DESC LIMIT 1"
            ))
            .bind(job_name)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_execution", e))?;

            Ok(self.hydrate(rows).await?.into_iter().next())
        })
    }

    #[instrument(skip(self), err)]
    fn history(&self, job_name: &str, page: usize, size: usize) -> Result<Vec<JobExecution>, LedgerError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let offset = page.saturating_mul(size);
        self.runtime.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {EXECUTION_COLUMNS}
                FROM batch_job_execution e JOIN batch_job_instance i ON i.id = e.instance_id
                WHERE i.job_name = $1
                ORDER BY COALESCE(e.start_time, e.create_time) DESC, e.id DESC
                LIMIT $2 OFFSET $3
                "#
            ))
            .bind(job_name)
            .bind(size as i64)
            .bind(offset as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("history", e))?;

            self.hydrate(rows).await
        })
    }
}

fn decode_instance(row: &PgRow) -> Result<JobInstance, LedgerError> {
    let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("decode_instance", e))?;
    Ok(JobInstance {
        id: InstanceId::new(id as u64),
        job_name: row
            .try_get("job_name")
            .map_err(|e| map_sqlx_error("decode_instance", e))?,
        identity_key: row
            .try_get("identity_key")
            .map_err(|e| map_sqlx_error("decode_instance", e))?,
    })
}

fn parse_status(raw: &str) -> Result<BatchStatus, LedgerError> {
    raw.parse().map_err(LedgerError::Backend)
}

fn parse_messages(value: JsonValue) -> Result<Vec<String>, LedgerError> {
    serde_json::from_value(value)
        .map_err(|e| LedgerError::Backend(format!("failed to decode failure messages: {e}")))
}

/// Map SQLx errors to LedgerError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Backend(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => LedgerError::Backend(format!("connection pool closed in {operation}")),
        other => LedgerError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct ExecutionRow {
    id: i64,
    instance_id: i64,
    job_name: String,
    identity_key: String,
    status: String,
    exit_code: String,
    exit_description: String,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    parameters: JsonValue,
    execution_context: JsonValue,
    failure_messages: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for ExecutionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutionRow {
            id: row.try_get("id")?,
            instance_id: row.try_get("instance_id")?,
            job_name: row.try_get("job_name")?,
            identity_key: row.try_get("identity_key")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            exit_description: row.try_get("exit_description")?,
            create_time: row.try_get("create_time")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated: row.try_get("last_updated")?,
            parameters: row.try_get("parameters")?,
            execution_context: row.try_get("execution_context")?,
            failure_messages: row.try_get("failure_messages")?,
        })
    }
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = LedgerError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let parameters: JobParameters = serde_json::from_value(row.parameters)
            .map_err(|e| LedgerError::Backend(format!("failed to decode parameters: {e}")))?;
        Ok(JobExecution {
            id: ExecutionId::new(row.id as u64),
            instance: JobInstance {
                id: InstanceId::new(row.instance_id as u64),
                job_name: row.job_name,
                identity_key: row.identity_key,
            },
            parameters,
            status: parse_status(&row.status)?,
            exit_status: ExitStatus::new(row.exit_code, row.exit_description),
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            last_updated: row.last_updated,
            step_executions: Vec::new(),
            execution_context: ExecutionContext::from_json(&row.execution_context),
            failure_messages: parse_messages(row.failure_messages)?,
        })
    }
}

#[derive(Debug)]
struct StepRow {
    id: i64,
    job_execution_id: i64,
    step_name: String,
    status: String,
    exit_code: String,
    exit_description: String,
    counts: [i64; 8],
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
    execution_context: JsonValue,
    failure_messages: JsonValue,
}

impl<'r> FromRow<'r, PgRow> for StepRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StepRow {
            id: row.try_get("id")?,
            job_execution_id: row.try_get("job_execution_id")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            exit_description: row.try_get("exit_description")?,
            counts: [
                row.try_get("read_count")?,
                row.try_get("write_count")?,
                row.try_get("commit_count")?,
                row.try_get("rollback_count")?,
                row.try_get("filter_count")?,
                row.try_get("read_skip_count")?,
                row.try_get("process_skip_count")?,
                row.try_get("write_skip_count")?,
            ],
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            last_updated: row.try_get("last_updated")?,
            execution_context: row.try_get("execution_context")?,
            failure_messages: row.try_get("failure_messages")?,
        })
    }
}

impl TryFrom<StepRow> for StepExecution {
    type Error = LedgerError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let [read, write, commit, rollback, filter, read_skip, process_skip, write_skip] =
            row.counts.map(|c| c.max(0) as u64);
        Ok(StepExecution {
            id: Some(StepExecutionId::new(row.id as u64)),
            job_execution_id: ExecutionId::new(row.job_execution_id as u64),
            step_name: row.step_name,
            status: parse_status(&row.status)?,
            exit_status: ExitStatus::new(row.exit_code, row.exit_description),
            read_count: read,
            write_count: write,
            commit_count: commit,
            rollback_count: rollback,
            filter_count: filter,
            read_skip_count: read_skip,
            process_skip_count: process_skip,
            write_skip_count: write_skip,
            start_time: row.start_time,
            end_time: row.end_time,
            last_updated: row.last_updated,
            execution_context: ExecutionContext::from_json(&row.execution_context),
            failure_messages: parse_messages(row.failure_messages)?,
        })
    }
}
