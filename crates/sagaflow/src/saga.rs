//! Saga identity, lifecycle states and results.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::SagaContext;
use crate::error::{Error, Result};

/// A saga instance identifier.
///
/// Globally unique; used as the primary key of the checkpoint row and to
/// correlate audit entries.
///
/// # Example
///
/// ```
/// use sagaflow::SagaId;
///
/// let id = SagaId::new("backtest-42");
/// assert_eq!(id.as_str(), "backtest-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(String);

impl SagaId {
    /// Create a saga ID from an existing key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered saga ID (UUID v7).
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for SagaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SagaId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lifecycle state of a saga.
///
/// ```text
///  Idle ──► Running ──► Completed
///              │
///              ▼
///        Compensating ──► Failed
///                    └──► Aborted
/// ```
///
/// `Running → Running` and `Compensating → Compensating` are allowed so that
/// progress checkpoints and resumed sagas stay in their state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Idle,
    Running,
    Compensating,
    Completed,
    Failed,
    Aborted,
}

impl SagaState {
    /// The persisted string form of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Idle => "idle",
            SagaState::Running => "running",
            SagaState::Compensating => "compensating",
            SagaState::Completed => "completed",
            SagaState::Failed => "failed",
            SagaState::Aborted => "aborted",
        }
    }

    /// Returns `true` for `Completed`, `Failed` and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Aborted
        )
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;

        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Compensating)
                | (Compensating, Compensating)
                | (Compensating, Failed)
                | (Compensating, Aborted)
        )
    }

    /// The terminal status for this state, if it is terminal.
    pub fn status(&self) -> Option<SagaStatus> {
        match self {
            SagaState::Completed => Some(SagaStatus::Completed),
            SagaState::Failed => Some(SagaStatus::Failed),
            SagaState::Aborted => Some(SagaStatus::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idle" => Ok(SagaState::Idle),
            "running" => Ok(SagaState::Running),
            "compensating" => Ok(SagaState::Compensating),
            "completed" => Ok(SagaState::Completed),
            "failed" => Ok(SagaState::Failed),
            "aborted" => Ok(SagaState::Aborted),
            other => Err(Error::InvalidState(other.to_owned())),
        }
    }
}

/// Definitive outcome reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Completed,
    Failed,
    Aborted,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `execute` or `recover`.
///
/// By the time a `SagaResult` exists the saga has reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaResult {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    /// The saga context after the last successful step.
    pub context: SagaContext,
    /// The error that triggered compensation, if any.
    pub error: Option<String>,
    /// Names of the steps that completed, in execution order.
    pub completed_steps: Vec<String>,
    /// Names of the steps that were compensated, in compensation order.
    pub compensated_steps: Vec<String>,
}

impl SagaResult {
    pub fn is_completed(&self) -> bool {
        self.status == SagaStatus::Completed
    }
}

/// Per-saga clock whose readings never go backwards.
///
/// Wall-clock time can step back (NTP adjustments); checkpoint `updated_at`
/// and audit `timestamp` values for one saga must not.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    last: OffsetDateTime,
}

impl MonotonicClock {
    /// Start a clock at the current time.
    pub fn new() -> Self {
        Self {
            last: OffsetDateTime::now_utc(),
        }
    }

    /// Start a clock that will never read earlier than `floor`.
    pub fn starting_at(floor: OffsetDateTime) -> Self {
        Self { last: floor }
    }

    /// Current time, clamped to be no earlier than the previous reading.
    pub fn now(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        if now > self.last {
            self.last = now;
        }
        self.last
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}
