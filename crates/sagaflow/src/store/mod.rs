//! Storage abstraction for saga checkpoints and audit entries.
//!
//! This module provides the [`CheckpointStore`] and [`AuditStore`] traits that
//! abstract over different storage backends. Two implementations are provided:
//!
//! - [`MemoryStore`]: process-local storage for tests and embedded use
//! - [`PgStore`]: PostgreSQL storage for production (requires `postgres` feature)

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::future::Future;

use serde_json::{Map, Value};
use time::OffsetDateTime;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::audit::AuditEventType;
use crate::context::SagaContext;
use crate::error::{Error, Result};
use crate::saga::{SagaId, SagaState};

/// Durable snapshot of one saga's progress.
///
/// The checkpoint is the authoritative record used for crash recovery.
/// Only the orchestrator currently holding the saga writes it, and once the
/// state is terminal the row is never modified again.
///
/// While running without failure, `completed_steps.len() == current_step_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaCheckpoint {
    pub saga_id: SagaId,
    /// Saga type label, used to route recovery to the right definition.
    pub saga_type: String,
    pub state: SagaState,
    /// Index of the next step to execute.
    pub current_step_index: usize,
    /// Step names successfully executed, in order.
    pub completed_steps: Vec<String>,
    /// Step names successfully compensated, in order.
    pub compensated_steps: Vec<String>,
    pub context: SagaContext,
    /// The error that triggered compensation.
    pub error: Option<String>,
    pub started_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub total_steps: usize,
    /// Failed attempts that were retried, across all steps.
    pub retries: u32,
}

impl SagaCheckpoint {
    /// Create a fresh checkpoint in the `Idle` state.
    pub fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        total_steps: usize,
        context: SagaContext,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            state: SagaState::Idle,
            current_step_index: 0,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            context,
            error: None,
            started_at: now,
            updated_at: now,
            total_steps,
            retries: 0,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, next: SagaState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record a successfully executed step and advance the cursor.
    pub fn record_completed(&mut self, step_name: impl Into<String>) {
        self.completed_steps.push(step_name.into());
        self.current_step_index = self.completed_steps.len();
    }

    /// Returns `true` if the step has already been compensated.
    pub fn is_compensated(&self, step_name: &str) -> bool {
        self.compensated_steps.iter().any(|name| name == step_name)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One immutable audit log row.
///
/// `id` is assigned by the store on append and is `None` before that.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaAuditLogEntry {
    pub id: Option<i64>,
    pub saga_id: SagaId,
    pub event_type: AuditEventType,
    /// Absent for saga-level events.
    pub step_name: Option<String>,
    pub step_index: Option<usize>,
    /// Free-form description of the event (retry count, output payload, ...).
    pub event_data: Map<String, Value>,
    /// Saga context at the moment of the event.
    pub context_snapshot: SagaContext,
    pub error_message: Option<String>,
    /// Error `source()` chain, one cause per line.
    pub error_stack_trace: Option<String>,
    pub timestamp: OffsetDateTime,
    pub duration_ms: Option<i64>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub saga_state_before: Option<SagaState>,
    pub saga_state_after: Option<SagaState>,
    pub retry_count: u32,
}

/// Filter for audit log queries.
///
/// Use the builder methods to filter by saga, event type, user, or time
/// range. Results are ordered by timestamp, oldest first.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub saga_id: Option<SagaId>,
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    /// Inclusive lower bound on `timestamp`.
    pub from: Option<OffsetDateTime>,
    /// Exclusive upper bound on `timestamp`.
    pub to: Option<OffsetDateTime>,
    /// Maximum number of results to return.
    pub limit: Option<u32>,
}

impl AuditQuery {
    /// Create a new empty query (matches all entries).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saga_id(mut self, saga_id: impl Into<SagaId>) -> Self {
        self.saga_id = Some(saga_id.into());
        self
    }

    pub fn event_type(mut self, event_type: AuditEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to `from <= timestamp < to`.
    pub fn between(mut self, from: OffsetDateTime, to: OffsetDateTime) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns `true` if `entry` satisfies every filter (the limit is not considered).
    pub fn matches(&self, entry: &SagaAuditLogEntry) -> bool {
        self.saga_id.as_ref().is_none_or(|id| *id == entry.saga_id)
            && self.event_type.is_none_or(|t| t == entry.event_type)
            && self
                .user_id
                .as_deref()
                .is_none_or(|user| entry.user_id.as_deref() == Some(user))
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp < to)
    }
}

/// Durable storage for saga checkpoints.
///
/// Each row is keyed by a unique saga ID and written only by the orchestrator
/// holding that saga, so no cross-saga locking is required.
///
/// # Implementations
///
/// - [`MemoryStore`]: in-process maps
/// - [`PgStore`]: the `saga_checkpoints` table (requires `postgres` feature)
pub trait CheckpointStore: Send + Sync + Clone + 'static {
    /// Insert the first checkpoint of a new saga.
    ///
    /// Fails with [`Error::SagaExists`] if any row already holds the saga ID,
    /// whatever its state. The check and the insert are atomic.
    fn create(&self, checkpoint: &SagaCheckpoint) -> impl Future<Output = Result<()>> + Send;

    /// Insert or update the checkpoint keyed by its saga ID.
    ///
    /// Fails with [`Error::CheckpointImmutable`] if the stored row is already
    /// terminal.
    fn save(&self, checkpoint: &SagaCheckpoint) -> impl Future<Output = Result<()>> + Send;

    /// Load a checkpoint, returning `None` if the saga is unknown.
    fn load(
        &self,
        saga_id: &SagaId,
    ) -> impl Future<Output = Result<Option<SagaCheckpoint>>> + Send;

    /// Fetch checkpoints in `state` whose `updated_at` is before `older_than`.
    ///
    /// Returns the oldest first, at most `limit` rows.
    fn query_stale(
        &self,
        state: SagaState,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<SagaCheckpoint>>> + Send;
}

/// Append-only storage for audit entries.
///
/// Entries are never updated or deleted.
pub trait AuditStore: Send + Sync + Clone + 'static {
    /// Append one entry and return its assigned ID.
    fn append(&self, entry: &SagaAuditLogEntry) -> impl Future<Output = Result<i64>> + Send;

    /// Fetch entries matching `query`, ordered by timestamp then ID.
    fn query(
        &self,
        query: &AuditQuery,
    ) -> impl Future<Output = Result<Vec<SagaAuditLogEntry>>> + Send;
}
