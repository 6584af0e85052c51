//! Error types for sagaflow.

use std::time::Duration;

use thiserror::Error;

use crate::saga::{SagaId, SagaState};

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end an orchestrator or store invocation.
///
/// Step and compensation failures are *not* represented here: they are
/// handled inside the saga and surface through
/// [`SagaResult`](crate::SagaResult). An `Error` means the invocation itself
/// could not complete (store unavailable, corrupt checkpoint, bad wiring).
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize checkpoint or audit data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` for matching on specific database
    /// error conditions (connection timeout, constraint violation, etc.).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// Applying the embedded schema migrations failed.
    #[cfg(feature = "postgres")]
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Recovering a saga from its checkpoint failed.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// A persisted state string did not name a known saga state.
    #[error("invalid saga state: {0:?}")]
    InvalidState(String),

    /// A persisted event type string did not name a known audit event.
    #[error("invalid audit event type: {0:?}")]
    InvalidEventType(String),

    /// The state machine does not allow this transition.
    #[error("invalid saga state transition from {from} to {to}")]
    InvalidTransition {
        /// State the saga was in.
        from: SagaState,
        /// State that was requested.
        to: SagaState,
    },

    /// Attempted to overwrite a checkpoint that already reached a terminal state.
    #[error("checkpoint for saga {0} is terminal and cannot be modified")]
    CheckpointImmutable(SagaId),

    /// A checkpoint already exists for the saga ID a new saga was started with.
    #[error("saga {0} already exists")]
    SagaExists(SagaId),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two steps in one definition share a name.
    #[error("duplicate step name {step:?} in saga type {saga_type:?}")]
    DuplicateStepName {
        /// The saga type label of the definition.
        saga_type: String,
        /// The repeated step name.
        step: String,
    },

    /// Saga type was registered more than once with the recovery scanner.
    #[error("duplicate saga type registration: {0}")]
    DuplicateSagaType(String),

    /// No orchestrator is registered for a saga type.
    #[error("unknown saga type: {0}")]
    UnknownSagaType(String),

    /// Registering or encoding metrics failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// A spawned saga task panicked or was cancelled.
    #[error("saga task failed: {0}")]
    Task(String),
}

/// Failure of a single step attempt.
///
/// Both variants count as a failed attempt and are retried up to the step's
/// retry budget.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Business-logic failure raised by the action.
    #[error("{message}")]
    Execution {
        /// Human-readable failure description.
        message: String,
    },

    /// The action did not finish before the step deadline.
    #[error("step timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },
}

impl StepError {
    /// Create an execution error from any displayable value.
    pub fn execution(message: impl std::fmt::Display) -> Self {
        StepError::Execution {
            message: message.to_string(),
        }
    }

    /// Returns `true` if the attempt failed because of its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout { .. })
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::execution(err)
    }
}

/// Failure raised by a compensation.
///
/// Recorded in the audit log and metrics; never stops the rollback of the
/// remaining steps.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompensationError {
    /// The compensation reported a failure.
    #[error("{message}")]
    Failed {
        /// Human-readable failure description.
        message: String,
    },

    /// The compensation exceeded the configured compensation timeout.
    #[error("compensation timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The deadline that was exceeded.
        timeout: Duration,
    },
}

impl CompensationError {
    /// Create a compensation failure from any displayable value.
    pub fn failed(message: impl std::fmt::Display) -> Self {
        CompensationError::Failed {
            message: message.to_string(),
        }
    }
}

/// Failure to resume a saga from its persisted checkpoint.
///
/// Surfaced immediately to the caller of `recover`; the recovery scanner
/// logs these at error level so an operator can act on the stuck saga.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// No checkpoint exists for the saga.
    #[error("no checkpoint found for saga {0}")]
    NotFound(SagaId),

    /// The checkpoint exists but could not be read.
    #[error("checkpoint for saga {saga_id} is unreadable: {source}")]
    Unreadable {
        /// The saga being recovered.
        saga_id: SagaId,
        /// The underlying load failure.
        #[source]
        source: Box<Error>,
    },

    /// The checkpoint was written by a different saga definition.
    #[error("checkpoint for saga {saga_id} does not match definition {saga_type:?}: {reason}")]
    DefinitionMismatch {
        /// The saga being recovered.
        saga_id: SagaId,
        /// The saga type of the definition used for recovery.
        saga_type: String,
        /// What did not match.
        reason: String,
    },

    /// The checkpoint violates its own invariants.
    #[error("checkpoint for saga {saga_id} is inconsistent: {reason}")]
    Inconsistent {
        /// The saga being recovered.
        saga_id: SagaId,
        /// The violated invariant.
        reason: String,
    },
}

impl RecoveryError {
    /// The saga this error refers to.
    pub fn saga_id(&self) -> &SagaId {
        match self {
            RecoveryError::NotFound(saga_id)
            | RecoveryError::Unreadable { saga_id, .. }
            | RecoveryError::DefinitionMismatch { saga_id, .. }
            | RecoveryError::Inconsistent { saga_id, .. } => saga_id,
        }
    }
}

/// Render an error and its `source()` chain, one cause per line.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
