//! The saga engine: drives the state machine for one definition.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::SagaConfig;
use crate::context::{SagaContext, StepOutput};
use crate::definition::SagaDefinition;
use crate::error::{CompensationError, Error, RecoveryError, Result, StepError};
use crate::metrics::MetricsRecorder;
use crate::saga::{MonotonicClock, SagaId, SagaResult, SagaState};
use crate::step::{SagaStep, StepContext};
use crate::store::{AuditStore, CheckpointStore, SagaAuditLogEntry, SagaCheckpoint};

/// Error recorded on sagas closed by [`SagaOrchestrator::mark_failed`] without
/// running compensations.
pub const MANUALLY_COMPENSATED: &str = "manually compensated";

/// Error recorded on sagas rolled back through an [`AbortHandle`].
pub const ABORTED: &str = "saga aborted";

/// Requests that a running saga stop and roll back.
///
/// The request is honored before the next step starts; a step already in
/// flight runs to completion (or to its timeout). Clones share the request.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A saga running on its own tokio task. Created by [`SagaOrchestrator::spawn`].
#[derive(Debug)]
pub struct SagaHandle {
    saga_id: SagaId,
    abort: AbortHandle,
    join: JoinHandle<Result<SagaResult>>,
}

impl SagaHandle {
    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    /// Request an abort. See [`AbortHandle`].
    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Wait for the saga to reach a terminal state.
    pub async fn join(self) -> Result<SagaResult> {
        self.join
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }
}

/// Executes, recovers and closes sagas of one [`SagaDefinition`].
///
/// The orchestrator holds only injected dependencies (checkpoint store,
/// audit store, optional metrics) and carries no per-saga state, so one
/// instance can drive any number of sagas concurrently. Cloning is cheap.
///
/// # Lifecycle
///
/// 1. Create a `running` checkpoint and emit `saga_start`
/// 2. Run each step under its timeout, retrying up to its budget; the
///    checkpoint is saved before each step and every `heartbeat_interval`
///    while it runs
/// 3. After each success, merge the output into the context and save
/// 4. On failure or abort, compensate completed steps in reverse order
/// 5. Save the terminal checkpoint and emit `saga_complete`/`saga_failed`
///
/// # Example
///
/// ```ignore
/// use sagaflow::{MemoryStore, SagaContext, SagaDefinition, SagaOrchestrator};
///
/// let store = MemoryStore::new();
/// let orchestrator = SagaOrchestrator::builder(definition, store.clone(), store)
///     .build()?;
///
/// let result = orchestrator.execute(SagaContext::new()).await?;
/// assert!(result.is_completed());
/// ```
pub struct SagaOrchestrator<C, A> {
    inner: Arc<Inner<C, A>>,
}

impl<C, A> Clone for SagaOrchestrator<C, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, A> std::fmt::Debug for SagaOrchestrator<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("saga_type", &self.inner.saga_type)
            .field("steps", &self.inner.definition.step_names())
            .finish_non_exhaustive()
    }
}

struct Inner<C, A> {
    definition: SagaDefinition,
    saga_type: String,
    config: SagaConfig,
    checkpoints: C,
    audit: AuditLogger<A>,
    metrics: Option<MetricsRecorder>,
}

/// Builder for [`SagaOrchestrator`].
pub struct SagaOrchestratorBuilder<C, A> {
    definition: SagaDefinition,
    checkpoints: C,
    audit: A,
    config: SagaConfig,
    metrics: Option<MetricsRecorder>,
}

impl<C: CheckpointStore, A: AuditStore> SagaOrchestratorBuilder<C, A> {
    pub fn config(mut self, config: SagaConfig) -> Self {
        self.config = config;
        self
    }

    /// Record metrics in `metrics`. Ignored when `enable_metrics` is off.
    pub fn metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the definition and build the orchestrator.
    pub fn build(self) -> Result<SagaOrchestrator<C, A>> {
        self.definition.validate()?;
        if self.config.heartbeat_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat_interval must be non-zero".to_owned(),
            ));
        }

        let saga_type = self
            .config
            .saga_type
            .clone()
            .unwrap_or_else(|| self.definition.saga_type().to_owned());
        let metrics = self.metrics.filter(|_| self.config.enable_metrics);

        let mut audit = AuditLogger::new(self.audit)
            .enabled(self.config.enable_audit_log)
            .attribution(self.config.user_id.clone(), self.config.ip_address.clone());
        if let Some(metrics) = &metrics {
            audit = audit.metrics(metrics.clone(), saga_type.clone());
        }

        Ok(SagaOrchestrator {
            inner: Arc::new(Inner {
                definition: self.definition,
                saga_type,
                config: self.config,
                checkpoints: self.checkpoints,
                audit,
                metrics,
            }),
        })
    }
}

impl<C: CheckpointStore, A: AuditStore> SagaOrchestrator<C, A> {
    /// Start building an orchestrator with default configuration.
    pub fn builder(
        definition: SagaDefinition,
        checkpoints: C,
        audit: A,
    ) -> SagaOrchestratorBuilder<C, A> {
        SagaOrchestratorBuilder {
            definition,
            checkpoints,
            audit,
            config: SagaConfig::default(),
            metrics: None,
        }
    }

    /// Label used for metrics, audit and checkpoints.
    pub fn saga_type(&self) -> &str {
        &self.inner.saga_type
    }

    pub fn definition(&self) -> &SagaDefinition {
        &self.inner.definition
    }

    pub fn config(&self) -> &SagaConfig {
        &self.inner.config
    }

    pub fn audit(&self) -> &AuditLogger<A> {
        &self.inner.audit
    }

    pub fn checkpoints(&self) -> &C {
        &self.inner.checkpoints
    }

    /// Run a new saga to a terminal state under a generated ID.
    ///
    /// Step failures do not produce an `Err`; they surface as a `failed`
    /// [`SagaResult`]. An `Err` means a store write failed and the saga was
    /// left at its last checkpoint for recovery.
    pub async fn execute(&self, initial: SagaContext) -> Result<SagaResult> {
        self.execute_with(SagaId::generate(), initial, &AbortHandle::new())
            .await
    }

    /// Run a new saga under a caller-chosen ID, observing `abort`.
    ///
    /// Fails with [`Error::SagaExists`] if a checkpoint already holds
    /// `saga_id`; use [`recover`](Self::recover) to continue an existing saga.
    pub async fn execute_with(
        &self,
        saga_id: SagaId,
        initial: SagaContext,
        abort: &AbortHandle,
    ) -> Result<SagaResult> {
        let inner = &*self.inner;
        let mut clock = MonotonicClock::new();
        let checkpoint = SagaCheckpoint::new(
            saga_id,
            inner.saga_type.clone(),
            inner.definition.len(),
            initial,
            clock.now(),
        );

        let mut run = SagaRun::new(inner, checkpoint, clock, abort);
        run.checkpoint.transition(SagaState::Running)?;
        run.create().await?;

        let _running = inner.metrics.as_ref().map(|m| m.running(&inner.saga_type));
        if let Some(metrics) = &inner.metrics {
            metrics.saga_started(&inner.saga_type);
        }
        let entry = run
            .entry(AuditEventType::SagaStart)
            .states(SagaState::Idle, SagaState::Running)
            .data("total_steps", inner.definition.len());
        run.record(entry).await;

        info!(
            saga_id = %run.checkpoint.saga_id,
            saga_type = %inner.saga_type,
            total_steps = inner.definition.len(),
            "Saga started"
        );

        run.forward().await
    }

    /// Run a new saga on its own task.
    pub fn spawn(&self, initial: SagaContext) -> SagaHandle {
        let saga_id = SagaId::generate();
        let abort = AbortHandle::new();

        let orchestrator = self.clone();
        let task_id = saga_id.clone();
        let task_abort = abort.clone();
        let join = tokio::spawn(async move {
            orchestrator
                .execute_with(task_id, initial, &task_abort)
                .await
        });

        SagaHandle {
            saga_id,
            abort,
            join,
        }
    }

    /// Resume a saga from its checkpoint.
    ///
    /// - `running`: continues at `current_step_index`; completed steps are
    ///   not run again.
    /// - `compensating`: finishes the rollback, skipping steps already
    ///   compensated. It ends `aborted` if the rollback was started by an
    ///   abort, `failed` otherwise. A saga interrupted inside
    ///   [`mark_failed`](Self::mark_failed) is closed without compensating.
    /// - terminal: returns the recorded result without touching anything.
    ///
    /// A resumed saga does not emit a second `saga_start`. The first audit
    /// entry written by the recovery carries `recovered: true` and
    /// `resume_from` in its event data instead.
    pub async fn recover(&self, saga_id: &SagaId) -> Result<SagaResult> {
        self.recover_with(saga_id, &AbortHandle::new()).await
    }

    /// [`recover`](Self::recover), observing `abort` between steps.
    pub async fn recover_with(&self, saga_id: &SagaId, abort: &AbortHandle) -> Result<SagaResult> {
        let inner = &*self.inner;
        let checkpoint = self.load_for_recovery(saga_id).await?;

        if checkpoint.is_terminal() {
            debug!(saga_id = %saga_id, state = %checkpoint.state, "Saga already terminal");
            return terminal_result(&checkpoint);
        }

        let clock = MonotonicClock::starting_at(checkpoint.updated_at);
        let mut run = SagaRun::new(inner, checkpoint, clock, abort);
        run.resumed_from = Some(run.checkpoint.current_step_index);
        let _running = inner.metrics.as_ref().map(|m| m.running(&inner.saga_type));

        let state = run.checkpoint.state;
        match state {
            SagaState::Compensating => {
                let error = run
                    .checkpoint
                    .error
                    .clone()
                    .unwrap_or_else(|| "compensation interrupted".to_owned());
                info!(
                    saga_id = %saga_id,
                    compensated = run.checkpoint.compensated_steps.len(),
                    error = %error,
                    "Resuming saga compensation"
                );
                let outcome = match error.as_str() {
                    // Interrupted inside `mark_failed`: nothing to undo.
                    MANUALLY_COMPENSATED => None,
                    ABORTED => Some(SagaState::Aborted),
                    _ => Some(SagaState::Failed),
                };
                match outcome {
                    Some(outcome) => run.compensate(error, outcome).await,
                    None => run.finish(SagaState::Failed).await,
                }
            }
            before => {
                run.checkpoint.transition(SagaState::Running)?;
                run.save().await?;

                let resume_from = run.checkpoint.current_step_index;
                // Sagas persisted as idle never emitted their start event.
                if before == SagaState::Idle {
                    let entry = run
                        .entry(AuditEventType::SagaStart)
                        .states(before, SagaState::Running)
                        .data("total_steps", inner.definition.len());
                    run.record(entry).await;
                }

                info!(
                    saga_id = %saga_id,
                    saga_type = %inner.saga_type,
                    resume_from,
                    "Resuming saga"
                );
                run.forward().await
            }
        }
    }

    /// Close a saga as `failed` without running any compensation.
    ///
    /// Used when automatic recovery is not wanted and the side effects are
    /// reconciled by hand. Terminal sagas are returned unchanged.
    pub async fn mark_failed(&self, saga_id: &SagaId, reason: &str) -> Result<SagaResult> {
        let inner = &*self.inner;
        let checkpoint = self.load_for_recovery(saga_id).await?;

        if checkpoint.is_terminal() {
            return terminal_result(&checkpoint);
        }

        let clock = MonotonicClock::starting_at(checkpoint.updated_at);
        let abort = AbortHandle::new();
        let mut run = SagaRun::new(inner, checkpoint, clock, &abort);

        if run.checkpoint.state == SagaState::Idle {
            run.checkpoint.transition(SagaState::Running)?;
        }
        if run.checkpoint.state == SagaState::Running {
            run.checkpoint.transition(SagaState::Compensating)?;
        }
        run.checkpoint.error = Some(reason.to_owned());
        run.save().await?;

        warn!(saga_id = %saga_id, reason, "Marking saga failed without compensation");
        run.finish(SagaState::Failed).await
    }

    async fn load_for_recovery(&self, saga_id: &SagaId) -> Result<SagaCheckpoint> {
        let inner = &*self.inner;

        let checkpoint = match inner.checkpoints.load(saga_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return Err(RecoveryError::NotFound(saga_id.clone()).into()),
            Err(source) => {
                return Err(RecoveryError::Unreadable {
                    saga_id: saga_id.clone(),
                    source: Box::new(source),
                }
                .into());
            }
        };
        if let Some(metrics) = &inner.metrics {
            metrics.checkpoint_loaded(&inner.saga_type);
        }

        if !checkpoint.is_terminal() {
            self.check_checkpoint(&checkpoint)?;
        }
        Ok(checkpoint)
    }

    /// Reject checkpoints that this definition cannot resume.
    fn check_checkpoint(&self, checkpoint: &SagaCheckpoint) -> Result<()> {
        let inner = &*self.inner;
        let saga_id = &checkpoint.saga_id;
        let mismatch = |reason: String| {
            Error::from(RecoveryError::DefinitionMismatch {
                saga_id: saga_id.clone(),
                saga_type: inner.saga_type.clone(),
                reason,
            })
        };
        let inconsistent = |reason: String| {
            Error::from(RecoveryError::Inconsistent {
                saga_id: saga_id.clone(),
                reason,
            })
        };

        // Rows written without a saga type tag are accepted as-is.
        if !checkpoint.saga_type.is_empty() && checkpoint.saga_type != inner.saga_type {
            return Err(mismatch(format!(
                "checkpoint has saga type {:?}",
                checkpoint.saga_type
            )));
        }
        if checkpoint.total_steps != inner.definition.len() {
            return Err(mismatch(format!(
                "checkpoint has {} steps, definition has {}",
                checkpoint.total_steps,
                inner.definition.len()
            )));
        }

        let steps = inner.definition.steps();
        if checkpoint.completed_steps.len() > steps.len() {
            return Err(inconsistent(format!(
                "{} completed steps exceed the {} defined",
                checkpoint.completed_steps.len(),
                steps.len()
            )));
        }
        for (index, (completed, step)) in checkpoint.completed_steps.iter().zip(steps).enumerate() {
            if completed != step.name() {
                return Err(mismatch(format!(
                    "completed step {index} is {completed:?}, definition has {:?}",
                    step.name()
                )));
            }
        }
        if let Some(extra) = checkpoint
            .compensated_steps
            .iter()
            .find(|name| !checkpoint.completed_steps.contains(name))
        {
            return Err(inconsistent(format!(
                "step {extra:?} is compensated but never completed"
            )));
        }
        if checkpoint.state == SagaState::Running
            && checkpoint.current_step_index != checkpoint.completed_steps.len()
        {
            return Err(inconsistent(format!(
                "current_step_index {} does not match {} completed steps",
                checkpoint.current_step_index,
                checkpoint.completed_steps.len()
            )));
        }

        Ok(())
    }
}

/// State of one saga while an orchestrator call drives it.
struct SagaRun<'a, C, A> {
    inner: &'a Inner<C, A>,
    checkpoint: SagaCheckpoint,
    clock: MonotonicClock,
    abort: &'a AbortHandle,
    /// Set when resuming from a checkpoint; tags the next audit entry.
    resumed_from: Option<usize>,
}

impl<'a, C: CheckpointStore, A: AuditStore> SagaRun<'a, C, A> {
    fn new(
        inner: &'a Inner<C, A>,
        checkpoint: SagaCheckpoint,
        clock: MonotonicClock,
        abort: &'a AbortHandle,
    ) -> Self {
        Self {
            inner,
            checkpoint,
            clock,
            abort,
            resumed_from: None,
        }
    }

    /// Execute steps from `current_step_index` to the end.
    async fn forward(mut self) -> Result<SagaResult> {
        let inner = self.inner;
        let steps = inner.definition.steps();

        for index in self.checkpoint.current_step_index..steps.len() {
            if self.abort.is_aborted() {
                info!(
                    saga_id = %self.checkpoint.saga_id,
                    next_step = steps[index].name(),
                    "Abort requested, rolling back saga"
                );
                return self.compensate(ABORTED.to_owned(), SagaState::Aborted).await;
            }

            let step = &steps[index];
            let started = Instant::now();
            match self.run_step(index, step).await? {
                Ok((output, attempts)) => {
                    self.checkpoint.context.merge(output.clone());
                    self.checkpoint.record_completed(step.name());
                    self.save().await?;

                    let duration = started.elapsed();
                    let entry = self
                        .entry(AuditEventType::StepComplete)
                        .step(step.name(), index)
                        .states(SagaState::Running, SagaState::Running)
                        .duration(duration)
                        .retry_count(attempts - 1)
                        .data("output", Value::Object(output));
                    self.record(entry).await;
                    if let Some(metrics) = &inner.metrics {
                        metrics.step_executed(&inner.saga_type, step.name(), duration);
                    }

                    debug!(
                        saga_id = %self.checkpoint.saga_id,
                        step = step.name(),
                        attempts,
                        "Step completed"
                    );
                }
                Err(error) => {
                    let message = format!("step {:?} failed: {error}", step.name());
                    return self.compensate(message, SagaState::Failed).await;
                }
            }
        }

        self.finish(SagaState::Completed).await
    }

    /// Run one step with timeout and retries.
    ///
    /// Returns the output and the number of attempts made, or the error of
    /// the last attempt once the retry budget is exhausted. The outer `Err`
    /// is a checkpoint write failure.
    async fn run_step(
        &mut self,
        index: usize,
        step: &'a SagaStep,
    ) -> Result<std::result::Result<(StepOutput, u32), StepError>> {
        let inner = self.inner;
        let timeout = step.timeout_or(inner.config.default_timeout);
        let max_retries = step.max_retries_or(inner.config.default_max_retries);
        let policy = &inner.config.retry_policy;
        let started = Instant::now();

        self.save().await?;

        let entry = self
            .entry(AuditEventType::StepStart)
            .step(step.name(), index)
            .states(SagaState::Running, SagaState::Running)
            .data("timeout_ms", timeout.as_millis() as u64)
            .data("max_retries", max_retries);
        self.record(entry).await;

        let mut attempt = 1;
        loop {
            debug!(
                saga_id = %self.checkpoint.saga_id,
                step = step.name(),
                attempt,
                "Executing step"
            );

            let ctx = self.step_context(index, step, attempt);
            let attempt_result = self
                .beating(tokio::time::timeout(timeout, step.action().execute(&ctx)))
                .await?;
            let result = match attempt_result {
                Ok(result) => result,
                Err(_) => {
                    ctx.cancellation.cancel();
                    Err(StepError::Timeout { timeout })
                }
            };

            let error = match result {
                Ok(output) => return Ok(Ok((output, attempt))),
                Err(error) => error,
            };

            if policy.should_retry(attempt, max_retries) {
                self.checkpoint.retries += 1;
                self.save().await?;
                warn!(
                    saga_id = %self.checkpoint.saga_id,
                    step = step.name(),
                    attempt,
                    max_retries,
                    error = %error,
                    "Step failed, retrying"
                );

                let entry = self
                    .entry(AuditEventType::StepRetry)
                    .step(step.name(), index)
                    .states(SagaState::Running, SagaState::Running)
                    .error(&error)
                    .retry_count(attempt)
                    .data("attempt", attempt);
                self.record(entry).await;
                if let Some(metrics) = &inner.metrics {
                    metrics.step_retried(&inner.saga_type, step.name());
                }

                let delay = policy.backoff_duration(attempt);
                if !delay.is_zero() {
                    self.beating(tokio::time::sleep(delay)).await?;
                }
                attempt += 1;
                continue;
            }

            let duration = started.elapsed();
            warn!(
                saga_id = %self.checkpoint.saga_id,
                step = step.name(),
                attempts = attempt,
                error = %error,
                "Step failed after exhausting retries"
            );

            let entry = self
                .entry(AuditEventType::StepFailed)
                .step(step.name(), index)
                .states(SagaState::Running, SagaState::Compensating)
                .error(&error)
                .duration(duration)
                .retry_count(attempt - 1)
                .data("attempts", attempt);
            self.record(entry).await;
            if let Some(metrics) = &inner.metrics {
                metrics.step_failed(&inner.saga_type, step.name(), duration);
            }

            return Ok(Err(error));
        }
    }

    /// Roll back completed steps in reverse order, then close as `outcome`.
    ///
    /// A failing compensation is recorded and skipped; the remaining steps
    /// are still compensated.
    async fn compensate(mut self, error: String, outcome: SagaState) -> Result<SagaResult> {
        let inner = self.inner;

        if self.checkpoint.state != SagaState::Compensating {
            self.checkpoint.transition(SagaState::Compensating)?;
            self.checkpoint.error = Some(error);
            self.save().await?;
        }

        info!(
            saga_id = %self.checkpoint.saga_id,
            error = self.checkpoint.error.as_deref().unwrap_or_default(),
            completed = self.checkpoint.completed_steps.len(),
            "Compensating saga"
        );

        let completed = self.checkpoint.completed_steps.clone();
        for name in completed.iter().rev() {
            if self.checkpoint.is_compensated(name) {
                continue;
            }
            let Some((index, step)) = inner.definition.find(name) else {
                continue;
            };
            let Some(compensation) = step.compensation() else {
                continue;
            };

            let entry = self
                .entry(AuditEventType::CompensationStart)
                .step(name.as_str(), index)
                .states(SagaState::Compensating, SagaState::Compensating);
            self.record(entry).await;

            let ctx = self.step_context(index, step, 1);
            let started = Instant::now();
            let result = match inner.config.compensation_timeout {
                Some(timeout) => {
                    let attempt = self
                        .beating(tokio::time::timeout(timeout, compensation.compensate(&ctx)))
                        .await?;
                    match attempt {
                        Ok(result) => result,
                        Err(_) => {
                            ctx.cancellation.cancel();
                            Err(CompensationError::Timeout { timeout })
                        }
                    }
                }
                None => self.beating(compensation.compensate(&ctx)).await?,
            };
            let duration = started.elapsed();

            match result {
                Ok(()) => {
                    self.checkpoint.compensated_steps.push(name.clone());
                    self.save().await?;

                    let entry = self
                        .entry(AuditEventType::CompensationComplete)
                        .step(name.as_str(), index)
                        .states(SagaState::Compensating, SagaState::Compensating)
                        .duration(duration);
                    self.record(entry).await;
                    if let Some(metrics) = &inner.metrics {
                        metrics.compensation_executed(&inner.saga_type, name, duration);
                    }
                    debug!(saga_id = %self.checkpoint.saga_id, step = %name, "Step compensated");
                }
                Err(error) => {
                    warn!(
                        saga_id = %self.checkpoint.saga_id,
                        step = %name,
                        error = %error,
                        "Compensation failed, continuing rollback"
                    );

                    let entry = self
                        .entry(AuditEventType::CompensationFailed)
                        .step(name.as_str(), index)
                        .states(SagaState::Compensating, SagaState::Compensating)
                        .error(&error)
                        .duration(duration);
                    self.record(entry).await;
                    if let Some(metrics) = &inner.metrics {
                        metrics.compensation_failed(&inner.saga_type, name, duration);
                    }
                }
            }
        }

        self.finish(outcome).await
    }

    /// Save the terminal state and emit the closing audit event.
    async fn finish(mut self, terminal: SagaState) -> Result<SagaResult> {
        let inner = self.inner;
        let before = self.checkpoint.state;

        self.checkpoint.transition(terminal)?;
        self.save().await?;

        let result = terminal_result(&self.checkpoint)?;
        let duration = saga_duration(&self.checkpoint);

        let event_type = if terminal == SagaState::Completed {
            AuditEventType::SagaComplete
        } else {
            AuditEventType::SagaFailed
        };
        let mut entry = self
            .entry(event_type)
            .states(before, terminal)
            .duration(duration)
            .retry_count(self.checkpoint.retries)
            .data("status", result.status.as_str())
            .data("completed_steps", self.checkpoint.completed_steps.clone())
            .data("compensated_steps", self.checkpoint.compensated_steps.clone());
        if let Some(error) = &self.checkpoint.error {
            entry = entry.error_message(error.clone());
        }
        self.record(entry).await;

        if let Some(metrics) = &inner.metrics {
            metrics.saga_finished(&inner.saga_type, result.status, duration);
        }

        match &result.error {
            None => info!(
                saga_id = %result.saga_id,
                saga_type = %inner.saga_type,
                "Saga completed"
            ),
            Some(error) => info!(
                saga_id = %result.saga_id,
                saga_type = %inner.saga_type,
                status = %result.status,
                error = %error,
                compensated = result.compensated_steps.len(),
                "Saga rolled back"
            ),
        }

        Ok(result)
    }

    async fn save(&mut self) -> Result<()> {
        self.checkpoint.updated_at = self.clock.now();

        let started = Instant::now();
        self.inner.checkpoints.save(&self.checkpoint).await?;
        if let Some(metrics) = &self.inner.metrics {
            metrics.checkpoint_saved(&self.inner.saga_type, started.elapsed());
        }
        Ok(())
    }

    /// First write of a new saga. Fails if the saga ID is taken.
    async fn create(&mut self) -> Result<()> {
        self.checkpoint.updated_at = self.clock.now();

        let started = Instant::now();
        self.inner.checkpoints.create(&self.checkpoint).await?;
        if let Some(metrics) = &self.inner.metrics {
            metrics.checkpoint_saved(&self.inner.saga_type, started.elapsed());
        }
        Ok(())
    }

    /// Await `work`, re-saving the checkpoint every heartbeat interval until
    /// it finishes.
    async fn beating<T>(&mut self, work: impl Future<Output = T>) -> Result<T> {
        let period = self.inner.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                output = &mut work => return Ok(output),
                _ = heartbeat.tick() => {
                    debug!(saga_id = %self.checkpoint.saga_id, "Checkpoint heartbeat");
                    self.save().await?;
                }
            }
        }
    }

    fn entry(&mut self, event_type: AuditEventType) -> SagaAuditLogEntry {
        let entry = SagaAuditLogEntry::new(
            self.checkpoint.saga_id.clone(),
            event_type,
            self.checkpoint.context.clone(),
            self.clock.now(),
        );
        match self.resumed_from.take() {
            Some(index) => entry.data("recovered", true).data("resume_from", index),
            None => entry,
        }
    }

    async fn record(&self, entry: SagaAuditLogEntry) {
        self.inner.audit.record(entry).await;
    }

    fn step_context(&self, index: usize, step: &SagaStep, attempt: u32) -> StepContext {
        StepContext::new(
            self.checkpoint.saga_id.clone(),
            self.inner.saga_type.clone(),
            step.name(),
            index,
            attempt,
            self.checkpoint.context.clone(),
        )
    }
}

fn terminal_result(checkpoint: &SagaCheckpoint) -> Result<SagaResult> {
    let status = checkpoint.state.status().ok_or_else(|| {
        Error::from(RecoveryError::Inconsistent {
            saga_id: checkpoint.saga_id.clone(),
            reason: format!("state {} is not terminal", checkpoint.state),
        })
    })?;

    Ok(SagaResult {
        saga_id: checkpoint.saga_id.clone(),
        status,
        context: checkpoint.context.clone(),
        error: checkpoint.error.clone(),
        completed_steps: checkpoint.completed_steps.clone(),
        compensated_steps: checkpoint.compensated_steps.clone(),
    })
}

fn saga_duration(checkpoint: &SagaCheckpoint) -> Duration {
    (checkpoint.updated_at - checkpoint.started_at)
        .try_into()
        .unwrap_or_default()
}
