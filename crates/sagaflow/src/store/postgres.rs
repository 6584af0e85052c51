//! PostgreSQL store implementation.

use serde_json::{Map, Value, json};
use sqlx::PgPool;
use sqlx::types::Json;
use time::OffsetDateTime;

use super::{AuditQuery, AuditStore, CheckpointStore, SagaAuditLogEntry, SagaCheckpoint};
use crate::context::SagaContext;
use crate::error::{Error, Result};
use crate::saga::{SagaId, SagaState};

/// PostgreSQL-backed store for production use.
///
/// Implements both [`CheckpointStore`] and [`AuditStore`]. Every operation is
/// a single-row statement; there are no transactions spanning the two
/// tables, since audit entries are forensic and the checkpoint alone drives
/// recovery.
///
/// # Database Schema
///
/// Requires the tables created by [`PgStore::migrate`]:
///
/// | Table              | Purpose                                           |
/// |--------------------|---------------------------------------------------|
/// | `saga_checkpoints` | One row per saga, upserted after every transition |
/// | `saga_audit_logs`  | Append-only lifecycle events for compliance       |
///
/// The `context` column holds a versioned envelope:
/// `{"schema_version": 1, "saga_type": "...", "values": {...}}`.
///
/// # Example
///
/// ```ignore
/// use sagaflow::PgStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    saga_id: String,
    state: String,
    current_step_index: i32,
    completed_steps: Json<Vec<String>>,
    compensated_steps: Json<Vec<String>>,
    context: Value,
    error: Option<String>,
    started_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    total_steps: i32,
    retries: i32,
}

impl TryFrom<CheckpointRow> for SagaCheckpoint {
    type Error = Error;

    fn try_from(row: CheckpointRow) -> Result<Self> {
        let (saga_type, context) = decode_context(row.context)?;

        Ok(SagaCheckpoint {
            saga_id: SagaId::new(row.saga_id),
            saga_type,
            state: row.state.parse()?,
            current_step_index: row.current_step_index as usize,
            completed_steps: row.completed_steps.0,
            compensated_steps: row.compensated_steps.0,
            context,
            error: row.error,
            started_at: row.started_at,
            updated_at: row.updated_at,
            total_steps: row.total_steps as usize,
            retries: row.retries as u32,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    saga_id: String,
    event_type: String,
    step_name: Option<String>,
    step_index: Option<i32>,
    event_data: Json<Map<String, Value>>,
    context_snapshot: Value,
    error_message: Option<String>,
    error_stack_trace: Option<String>,
    timestamp: OffsetDateTime,
    duration_ms: Option<i64>,
    user_id: Option<String>,
    ip_address: Option<String>,
    saga_state_before: Option<String>,
    saga_state_after: Option<String>,
    retry_count: i32,
}

impl TryFrom<AuditRow> for SagaAuditLogEntry {
    type Error = Error;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(SagaAuditLogEntry {
            id: Some(row.id),
            saga_id: SagaId::new(row.saga_id),
            event_type: row.event_type.parse()?,
            step_name: row.step_name,
            step_index: row.step_index.map(|i| i as usize),
            event_data: row.event_data.0,
            context_snapshot: serde_json::from_value(row.context_snapshot)?,
            error_message: row.error_message,
            error_stack_trace: row.error_stack_trace,
            timestamp: row.timestamp,
            duration_ms: row.duration_ms,
            user_id: row.user_id,
            ip_address: row.ip_address,
            saga_state_before: row
                .saga_state_before
                .as_deref()
                .map(str::parse)
                .transpose()?,
            saga_state_after: row
                .saga_state_after
                .as_deref()
                .map(str::parse)
                .transpose()?,
            retry_count: row.retry_count as u32,
        })
    }
}

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations that create the saga tables.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

impl CheckpointStore for PgStore {
    async fn create(&self, checkpoint: &SagaCheckpoint) -> Result<()> {
        let context = encode_context(&checkpoint.saga_type, &checkpoint.context);

        let result = sqlx::query(
            r#"
            INSERT INTO saga_checkpoints (
                saga_id, state, current_step_index, completed_steps, compensated_steps,
                context, error, started_at, updated_at, total_steps, retries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(checkpoint.saga_id.as_str())
        .bind(checkpoint.state.as_str())
        .bind(checkpoint.current_step_index as i32)
        .bind(Json(&checkpoint.completed_steps))
        .bind(Json(&checkpoint.compensated_steps))
        .bind(context)
        .bind(checkpoint.error.as_deref())
        .bind(checkpoint.started_at)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.total_steps as i32)
        .bind(checkpoint.retries as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::SagaExists(checkpoint.saga_id.clone()));
        }

        Ok(())
    }

    async fn save(&self, checkpoint: &SagaCheckpoint) -> Result<()> {
        let context = encode_context(&checkpoint.saga_type, &checkpoint.context);

        let result = sqlx::query(
            r#"
            INSERT INTO saga_checkpoints (
                saga_id, state, current_step_index, completed_steps, compensated_steps,
                context, error, started_at, updated_at, total_steps, retries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (saga_id) DO UPDATE
            SET state = EXCLUDED.state,
                current_step_index = EXCLUDED.current_step_index,
                completed_steps = EXCLUDED.completed_steps,
                compensated_steps = EXCLUDED.compensated_steps,
                context = EXCLUDED.context,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at,
                total_steps = EXCLUDED.total_steps,
                retries = EXCLUDED.retries
            WHERE saga_checkpoints.state NOT IN ('completed', 'failed', 'aborted')
            "#,
        )
        .bind(checkpoint.saga_id.as_str())
        .bind(checkpoint.state.as_str())
        .bind(checkpoint.current_step_index as i32)
        .bind(Json(&checkpoint.completed_steps))
        .bind(Json(&checkpoint.compensated_steps))
        .bind(context)
        .bind(checkpoint.error.as_deref())
        .bind(checkpoint.started_at)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.total_steps as i32)
        .bind(checkpoint.retries as i32)
        .execute(&self.pool)
        .await?;

        // The conditional update matched nothing: the stored row is terminal.
        if result.rows_affected() == 0 {
            return Err(Error::CheckpointImmutable(checkpoint.saga_id.clone()));
        }

        Ok(())
    }

    async fn load(&self, saga_id: &SagaId) -> Result<Option<SagaCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT saga_id, state, current_step_index, completed_steps, compensated_steps,
                   context, error, started_at, updated_at, total_steps, retries
            FROM saga_checkpoints
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SagaCheckpoint::try_from).transpose()
    }

    async fn query_stale(
        &self,
        state: SagaState,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<SagaCheckpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT saga_id, state, current_step_index, completed_steps, compensated_steps,
                   context, error, started_at, updated_at, total_steps, retries
            FROM saga_checkpoints
            WHERE state = $1
              AND updated_at < $2
            ORDER BY updated_at, saga_id
            LIMIT $3
            "#,
        )
        .bind(state.as_str())
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SagaCheckpoint::try_from).collect()
    }
}

impl AuditStore for PgStore {
    async fn append(&self, entry: &SagaAuditLogEntry) -> Result<i64> {
        let context_snapshot = serde_json::to_value(&entry.context_snapshot)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO saga_audit_logs (
                saga_id, event_type, step_name, step_index, event_data, context_snapshot,
                error_message, error_stack_trace, "timestamp", duration_ms, user_id,
                ip_address, saga_state_before, saga_state_after, retry_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id
            "#,
        )
        .bind(entry.saga_id.as_str())
        .bind(entry.event_type.as_str())
        .bind(entry.step_name.as_deref())
        .bind(entry.step_index.map(|i| i as i32))
        .bind(Json(&entry.event_data))
        .bind(context_snapshot)
        .bind(entry.error_message.as_deref())
        .bind(entry.error_stack_trace.as_deref())
        .bind(entry.timestamp)
        .bind(entry.duration_ms)
        .bind(entry.user_id.as_deref())
        .bind(entry.ip_address.as_deref())
        .bind(entry.saga_state_before.map(|s| s.as_str()))
        .bind(entry.saga_state_after.map(|s| s.as_str()))
        .bind(entry.retry_count as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<SagaAuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, saga_id, event_type, step_name, step_index, event_data, context_snapshot,
                   error_message, error_stack_trace, "timestamp", duration_ms, user_id,
                   ip_address, saga_state_before, saga_state_after, retry_count
            FROM saga_audit_logs
            WHERE ($1::text IS NULL OR saga_id = $1)
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::text IS NULL OR user_id = $3)
              AND ($4::timestamptz IS NULL OR "timestamp" >= $4)
              AND ($5::timestamptz IS NULL OR "timestamp" < $5)
            ORDER BY "timestamp", id
            LIMIT $6
            "#,
        )
        .bind(query.saga_id.as_ref().map(SagaId::as_str))
        .bind(query.event_type.map(|t| t.as_str()))
        .bind(query.user_id.as_deref())
        .bind(query.from)
        .bind(query.to)
        .bind(query.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SagaAuditLogEntry::try_from).collect()
    }
}

/// Wrap a context in the persisted envelope, tagging it with the saga type.
fn encode_context(saga_type: &str, context: &SagaContext) -> Value {
    json!({
        "schema_version": context.schema_version(),
        "saga_type": saga_type,
        "values": context.as_map(),
    })
}

/// Split a persisted envelope into saga type and context.
///
/// Bare objects written without an envelope load with an empty saga type.
fn decode_context(value: Value) -> Result<(String, SagaContext)> {
    let saga_type = value
        .get("saga_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let context = serde_json::from_value(value)?;
    Ok((saga_type, context))
}
