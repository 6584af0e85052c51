//! Saga steps: an action, an optional compensation, a timeout and a retry budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::{SagaContext, StepOutput};
use crate::error::{CompensationError, StepError};
use crate::saga::SagaId;

/// Context handed to actions and compensations.
///
/// Contains the saga context as of the start of the call, plus metadata for
/// correlation and idempotency.
///
/// # Cancellation
///
/// When the step deadline passes, [`cancellation`](Self::cancellation) is
/// cancelled and the attempt is abandoned. Actions that perform long I/O
/// should observe the token and stop cooperatively; the orchestrator never
/// interrupts a side effect by force.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The saga this call belongs to.
    pub saga_id: SagaId,

    /// Saga type label.
    pub saga_type: String,

    /// Name of the step being executed or compensated.
    pub step_name: String,

    /// Zero-based position of the step in its definition.
    pub step_index: usize,

    /// Current attempt number (1-based).
    ///
    /// First execution is attempt 1, first retry is attempt 2, etc.
    /// Always 1 for compensations.
    pub attempt: u32,

    /// Fires when the attempt's deadline passes.
    pub cancellation: CancellationToken,

    context: SagaContext,
}

impl StepContext {
    pub(crate) fn new(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        step_name: impl Into<String>,
        step_index: usize,
        attempt: u32,
        context: SagaContext,
    ) -> Self {
        Self {
            saga_id,
            saga_type: saga_type.into(),
            step_name: step_name.into(),
            step_index,
            attempt,
            cancellation: CancellationToken::new(),
            context,
        }
    }

    /// The saga context accumulated before this call.
    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    /// Get the idempotency key for external service calls.
    ///
    /// Format: `{saga_type}:{saga_id}:{step_name}`
    ///
    /// Stable across retries and across recovery of the same saga, so
    /// downstream services can deduplicate repeated calls.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.saga_type, self.saga_id, self.step_name)
    }

    /// Returns `true` if this is a retry (attempt > 1).
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Returns `true` once the attempt's deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Forward work of a step.
///
/// Returns a partial context that is merged into the saga context, or a
/// [`StepError`] which counts as a failed attempt.
///
/// # Idempotency
///
/// Steps have **at-least-once** semantics: an attempt abandoned by its
/// timeout, or a saga resumed after a crash, may run the action again.
/// Use [`StepContext::idempotency_key()`] when calling external APIs.
#[async_trait]
pub trait StepAction: Send + Sync + 'static {
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;
}

/// Semantic undo of a completed step.
///
/// Must be idempotent. Failures are logged and recorded, and rollback of
/// the remaining steps continues regardless.
#[async_trait]
pub trait Compensation: Send + Sync + 'static {
    async fn compensate(&self, ctx: &StepContext) -> Result<(), CompensationError>;
}

/// [`StepAction`] backed by an async closure.
pub(crate) struct FnAction<F>(F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        (self.0)(ctx.clone()).await
    }
}

/// [`Compensation`] backed by an async closure.
pub(crate) struct FnCompensation<F>(F);

#[async_trait]
impl<F, Fut> Compensation for FnCompensation<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CompensationError>> + Send + 'static,
{
    async fn compensate(&self, ctx: &StepContext) -> Result<(), CompensationError> {
        (self.0)(ctx.clone()).await
    }
}

/// One named unit of work in a [`SagaDefinition`](crate::SagaDefinition).
///
/// Timeout and retry budget fall back to the orchestrator's
/// [`SagaConfig`](crate::SagaConfig) defaults when not set.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::{SagaStep, StepOutput};
/// use serde_json::json;
///
/// let step = SagaStep::from_fn("create_backtest", |_ctx| async move {
///     let mut out = StepOutput::new();
///     out.insert("backtest_id".into(), json!(17));
///     Ok(out)
/// })
/// .compensate_with(|_ctx| async move { Ok(()) })
/// .timeout(Duration::from_secs(30))
/// .max_retries(2);
///
/// assert_eq!(step.name(), "create_backtest");
/// assert!(step.has_compensation());
/// ```
#[derive(Clone)]
pub struct SagaStep {
    name: String,
    action: Arc<dyn StepAction>,
    compensation: Option<Arc<dyn Compensation>>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
}

impl SagaStep {
    /// Create a step from a [`StepAction`] implementation.
    pub fn new(name: impl Into<String>, action: impl StepAction) -> Self {
        Self {
            name: name.into(),
            action: Arc::new(action),
            compensation: None,
            timeout: None,
            max_retries: None,
        }
    }

    /// Create a step from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutput, StepError>> + Send + 'static,
    {
        Self::new(name, FnAction(action))
    }

    /// Attach a [`Compensation`] implementation.
    pub fn with_compensation(mut self, compensation: impl Compensation) -> Self {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    /// Attach a compensation backed by an async closure.
    pub fn compensate_with<F, Fut>(self, compensation: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CompensationError>> + Send + 'static,
    {
        self.with_compensation(FnCompensation(compensation))
    }

    /// Override the default step timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the default retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }

    pub(crate) fn action(&self) -> &dyn StepAction {
        self.action.as_ref()
    }

    pub(crate) fn compensation(&self) -> Option<&dyn Compensation> {
        self.compensation.as_deref()
    }

    /// The step timeout, or `default` if the step does not set one.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// The retry budget, or `default` if the step does not set one.
    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
