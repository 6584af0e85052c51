//! Compliance audit trail for saga lifecycle events.
//!
//! Every state change of a saga (start, each step attempt, each
//! compensation, the terminal outcome) is appended as one
//! [`SagaAuditLogEntry`] through an [`AuditStore`]. The trail is forensic:
//! recovery never reads it, and a failed audit write is logged and dropped
//! rather than failing the saga.

use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::warn;

use crate::context::SagaContext;
use crate::error::{Error, Result, error_chain};
use crate::metrics::MetricsRecorder;
use crate::saga::{SagaId, SagaState};
use crate::store::{AuditQuery, AuditStore, SagaAuditLogEntry};

/// Kind of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SagaStart,
    StepStart,
    StepComplete,
    StepFailed,
    StepRetry,
    CompensationStart,
    CompensationComplete,
    CompensationFailed,
    SagaComplete,
    /// Terminal event for both failed and aborted sagas.
    SagaFailed,
}

impl AuditEventType {
    /// The persisted string form of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::SagaStart => "saga_start",
            AuditEventType::StepStart => "step_start",
            AuditEventType::StepComplete => "step_complete",
            AuditEventType::StepFailed => "step_failed",
            AuditEventType::StepRetry => "step_retry",
            AuditEventType::CompensationStart => "compensation_start",
            AuditEventType::CompensationComplete => "compensation_complete",
            AuditEventType::CompensationFailed => "compensation_failed",
            AuditEventType::SagaComplete => "saga_complete",
            AuditEventType::SagaFailed => "saga_failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "saga_start" => AuditEventType::SagaStart,
            "step_start" => AuditEventType::StepStart,
            "step_complete" => AuditEventType::StepComplete,
            "step_failed" => AuditEventType::StepFailed,
            "step_retry" => AuditEventType::StepRetry,
            "compensation_start" => AuditEventType::CompensationStart,
            "compensation_complete" => AuditEventType::CompensationComplete,
            "compensation_failed" => AuditEventType::CompensationFailed,
            "saga_complete" => AuditEventType::SagaComplete,
            "saga_failed" => AuditEventType::SagaFailed,
            other => return Err(Error::InvalidEventType(other.to_owned())),
        })
    }
}

impl SagaAuditLogEntry {
    /// Start an entry with the required fields; the rest default to empty.
    pub fn new(
        saga_id: SagaId,
        event_type: AuditEventType,
        context_snapshot: SagaContext,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            id: None,
            saga_id,
            event_type,
            step_name: None,
            step_index: None,
            event_data: Map::new(),
            context_snapshot,
            error_message: None,
            error_stack_trace: None,
            timestamp,
            duration_ms: None,
            user_id: None,
            ip_address: None,
            saga_state_before: None,
            saga_state_after: None,
            retry_count: 0,
        }
    }

    pub fn step(mut self, step_name: impl Into<String>, step_index: usize) -> Self {
        self.step_name = Some(step_name.into());
        self.step_index = Some(step_index);
        self
    }

    /// Add one key to `event_data`.
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event_data.insert(key.into(), value.into());
        self
    }

    /// Record an error message and its `source()` chain.
    pub fn error(mut self, err: &(dyn std::error::Error + 'static)) -> Self {
        self.error_message = Some(err.to_string());
        self.error_stack_trace = Some(error_chain(err));
        self
    }

    /// Record an error known only by its message.
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as i64);
        self
    }

    pub fn states(mut self, before: SagaState, after: SagaState) -> Self {
        self.saga_state_before = Some(before);
        self.saga_state_after = Some(after);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Best-effort writer and query front-end for the audit trail.
///
/// Stamps every entry with the configured `user_id` and `ip_address`
/// (unless the entry carries its own) and counts successful writes in
/// [`MetricsRecorder`] when one is attached.
///
/// # Example
///
/// ```
/// # async fn example() -> sagaflow::Result<()> {
/// use sagaflow::{AuditLogger, MemoryStore, SagaId};
///
/// let logger = AuditLogger::new(MemoryStore::new()).attribution(Some("analyst-7".into()), None);
/// let trail = logger.for_saga(&SagaId::new("backtest-42")).await?;
/// assert!(trail.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AuditLogger<A> {
    store: A,
    enabled: bool,
    user_id: Option<String>,
    ip_address: Option<String>,
    metrics: Option<(MetricsRecorder, String)>,
}

impl<A: AuditStore> AuditLogger<A> {
    /// Create an enabled logger with no attribution.
    pub fn new(store: A) -> Self {
        Self {
            store,
            enabled: true,
            user_id: None,
            ip_address: None,
            metrics: None,
        }
    }

    /// Turn writes on or off. Queries work either way.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the user and client address stamped on every entry.
    pub fn attribution(mut self, user_id: Option<String>, ip_address: Option<String>) -> Self {
        self.user_id = user_id;
        self.ip_address = ip_address;
        self
    }

    /// Count writes under `saga_type` in `metrics`.
    pub fn metrics(mut self, metrics: MetricsRecorder, saga_type: impl Into<String>) -> Self {
        self.metrics = Some((metrics, saga_type.into()));
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn store(&self) -> &A {
        &self.store
    }

    /// Append one entry.
    ///
    /// Returns the assigned ID, or `None` if auditing is disabled or the
    /// write failed. Failures are logged and never propagated.
    pub async fn record(&self, mut entry: SagaAuditLogEntry) -> Option<i64> {
        if !self.enabled {
            return None;
        }

        if entry.user_id.is_none() {
            entry.user_id.clone_from(&self.user_id);
        }
        if entry.ip_address.is_none() {
            entry.ip_address.clone_from(&self.ip_address);
        }

        let started = Instant::now();
        match self.store.append(&entry).await {
            Ok(id) => {
                if let Some((metrics, saga_type)) = &self.metrics {
                    metrics.audit_written(saga_type, entry.event_type.as_str(), started.elapsed());
                }
                Some(id)
            }
            Err(error) => {
                warn!(
                    saga_id = %entry.saga_id,
                    event_type = %entry.event_type,
                    error = %error,
                    "Failed to write audit entry"
                );
                None
            }
        }
    }

    /// All entries for one saga, oldest first.
    pub async fn for_saga(&self, saga_id: &SagaId) -> Result<Vec<SagaAuditLogEntry>> {
        self.store
            .query(&AuditQuery::new().saga_id(saga_id.clone()))
            .await
    }

    /// Entries of one type with `from <= timestamp < to`.
    pub async fn by_event_type(
        &self,
        event_type: AuditEventType,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<SagaAuditLogEntry>> {
        self.store
            .query(&AuditQuery::new().event_type(event_type).between(from, to))
            .await
    }

    /// Entries attributed to one user with `from <= timestamp < to`.
    pub async fn by_user(
        &self,
        user_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<SagaAuditLogEntry>> {
        self.store
            .query(&AuditQuery::new().user_id(user_id).between(from, to))
            .await
    }

    /// Entries matching an arbitrary query.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<SagaAuditLogEntry>> {
        self.store.query(query).await
    }
}
