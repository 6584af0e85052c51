//! Background recovery of sagas left behind by crashed processes.
//!
//! A saga whose checkpoint has sat in `running` (or `compensating`) longer
//! than [`RecoveryConfig::stale_after`] is assumed abandoned. Live sagas
//! re-save their checkpoint every
//! [`SagaConfig::heartbeat_interval`](crate::SagaConfig::heartbeat_interval), so a
//! slow step never crosses that threshold. The
//! [`RecoveryScanner`] finds those checkpoints, routes each to the
//! orchestrator registered for its saga type, and either resumes it or
//! closes it as failed, per [`RecoveryAction`].
//!
//! # Example
//!
//! ```ignore
//! use sagaflow::{RecoveryConfig, RecoveryScanner};
//!
//! let scanner = RecoveryScanner::builder(store.clone())
//!     .register(backtest_orchestrator)
//!     .register(report_orchestrator)
//!     .config(RecoveryConfig::default())
//!     .build()?;
//!
//! // Run until Ctrl+C
//! scanner.run(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::config::{RecoveryAction, RecoveryConfig};
use crate::error::{Error, Result};
use crate::orchestrator::{MANUALLY_COMPENSATED, SagaOrchestrator};
use crate::saga::{SagaId, SagaState};
use crate::store::{AuditStore, CheckpointStore};

/// Outcome of one recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Sagas resumed to a terminal state.
    pub recovered: Vec<SagaId>,
    /// Sagas closed as failed without compensation.
    pub marked_failed: Vec<SagaId>,
    /// Sagas that could not be handled. These need an operator.
    pub errors: Vec<(SagaId, Error)>,
}

impl RecoveryReport {
    /// Number of stale sagas the scan found.
    pub fn total(&self) -> usize {
        self.recovered.len() + self.marked_failed.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

enum Outcome {
    Recovered,
    MarkedFailed,
}

/// Builder for [`RecoveryScanner`].
pub struct RecoveryScannerBuilder<C, A> {
    checkpoints: C,
    orchestrators: HashMap<String, SagaOrchestrator<C, A>>,
    duplicate_saga_type: Option<String>,
    config: RecoveryConfig,
}

impl<C: CheckpointStore, A: AuditStore> RecoveryScannerBuilder<C, A> {
    /// Route stale sagas of `orchestrator.saga_type()` to `orchestrator`.
    ///
    /// Each saga type can only be registered once. Duplicate checks are
    /// deferred until build time.
    pub fn register(mut self, orchestrator: SagaOrchestrator<C, A>) -> Self {
        let saga_type = orchestrator.saga_type().to_owned();
        if self.orchestrators.contains_key(&saga_type) {
            if self.duplicate_saga_type.is_none() {
                self.duplicate_saga_type = Some(saga_type);
            }
            return self;
        }

        self.orchestrators.insert(saga_type, orchestrator);
        self
    }

    /// Set the scanner configuration.
    ///
    /// If not called, uses [`RecoveryConfig::default()`].
    pub fn config(mut self, config: RecoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the scanner.
    ///
    /// Fails if a saga type was registered twice, or if `stale_after` does
    /// not exceed the heartbeat interval of every registered orchestrator.
    pub fn build(self) -> Result<RecoveryScanner<C, A>> {
        if let Some(saga_type) = self.duplicate_saga_type {
            return Err(Error::DuplicateSagaType(saga_type));
        }
        // A live saga must refresh its checkpoint before it can look stale.
        for (saga_type, orchestrator) in self.orchestrators.iter() {
            let heartbeat = orchestrator.config().heartbeat_interval;
            if self.config.stale_after <= heartbeat {
                return Err(Error::InvalidConfig(format!(
                    "stale_after ({:?}) must exceed the heartbeat interval of saga type \
                     {saga_type:?} ({heartbeat:?})",
                    self.config.stale_after
                )));
            }
        }
        let worker_id = self
            .config
            .worker_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(RecoveryScanner {
            checkpoints: self.checkpoints,
            orchestrators: Arc::new(self.orchestrators),
            config: self.config,
            worker_id,
        })
    }
}

/// Finds stale sagas and resumes or closes them.
///
/// Recovery of different sagas runs concurrently, bounded by
/// [`RecoveryConfig::max_concurrent`].
///
/// # Lifecycle
///
/// 1. Every `scan_interval`, query checkpoints not updated for `stale_after`
/// 2. Look up the orchestrator by the checkpoint's saga type
/// 3. Resume via `recover` or close via `mark_failed`
/// 4. Log errors for sagas that could not be handled
/// 5. Repeat until shutdown
#[derive(Clone)]
pub struct RecoveryScanner<C, A> {
    checkpoints: C,
    orchestrators: Arc<HashMap<String, SagaOrchestrator<C, A>>>,
    config: RecoveryConfig,
    worker_id: String,
}

impl<C: CheckpointStore, A: AuditStore> RecoveryScanner<C, A> {
    /// Create a new scanner builder over `checkpoints`.
    pub fn builder(checkpoints: C) -> RecoveryScannerBuilder<C, A> {
        RecoveryScannerBuilder {
            checkpoints,
            orchestrators: HashMap::new(),
            duplicate_saga_type: None,
            config: RecoveryConfig::default(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of registered saga types.
    pub fn saga_type_count(&self) -> usize {
        self.orchestrators.len()
    }

    /// Run one scan and wait for every recovery it starts.
    ///
    /// Only a failing stale-checkpoint query returns `Err`; per-saga
    /// failures are collected in the report.
    pub async fn scan_once(&self) -> Result<RecoveryReport> {
        let cutoff = OffsetDateTime::now_utc() - self.config.stale_after;
        let mut report = RecoveryReport::default();

        let mut stale = self
            .checkpoints
            .query_stale(SagaState::Running, cutoff, self.config.batch_size)
            .await?;
        let remaining = self.config.batch_size.saturating_sub(stale.len() as u32);
        if remaining > 0 {
            stale.extend(
                self.checkpoints
                    .query_stale(SagaState::Compensating, cutoff, remaining)
                    .await?,
            );
        }

        if stale.is_empty() {
            debug!(worker_id = %self.worker_id, "No stale sagas");
            return Ok(report);
        }

        info!(
            worker_id = %self.worker_id,
            count = stale.len(),
            action = ?self.config.action,
            "Recovering stale sagas"
        );

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for checkpoint in stale {
            let saga_id = checkpoint.saga_id;
            let Some(orchestrator) = self.orchestrators.get(&checkpoint.saga_type).cloned() else {
                error!(
                    saga_id = %saga_id,
                    saga_type = %checkpoint.saga_type,
                    "No orchestrator registered for stale saga"
                );
                report
                    .errors
                    .push((saga_id, Error::UnknownSagaType(checkpoint.saga_type)));
                continue;
            };

            let permits = Arc::clone(&permits);
            let action = self.config.action;
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await;
                let outcome = match action {
                    RecoveryAction::Resume => orchestrator
                        .recover(&saga_id)
                        .await
                        .map(|_| Outcome::Recovered),
                    RecoveryAction::MarkFailed => orchestrator
                        .mark_failed(&saga_id, MANUALLY_COMPENSATED)
                        .await
                        .map(|_| Outcome::MarkedFailed),
                };
                (saga_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((saga_id, Ok(Outcome::Recovered))) => report.recovered.push(saga_id),
                Ok((saga_id, Ok(Outcome::MarkedFailed))) => report.marked_failed.push(saga_id),
                Ok((saga_id, Err(e))) => {
                    error!(saga_id = %saga_id, error = %e, "Saga recovery failed");
                    report.errors.push((saga_id, e));
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "Recovery task panicked");
                }
            }
        }

        info!(
            worker_id = %self.worker_id,
            recovered = report.recovered.len(),
            marked_failed = report.marked_failed.len(),
            errors = report.errors.len(),
            "Recovery scan finished"
        );

        Ok(report)
    }

    /// Scan every `scan_interval` until `shutdown` completes.
    ///
    /// # Shutdown Behavior
    ///
    /// When the shutdown future completes:
    /// 1. No new scan is started
    /// 2. A scan in progress gets `shutdown_timeout` to finish
    /// 3. Recoveries still running after that are cancelled; their sagas
    ///    stay stale and are picked up by the next scanner
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            worker_id = %self.worker_id,
            saga_types = self.saga_type_count(),
            scan_interval_secs = self.config.scan_interval.as_secs(),
            "Recovery scanner started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let scan = self.scan_once();
            tokio::pin!(scan);

            let finished = tokio::select! {
                result = &mut scan => Some(result),
                _ = &mut shutdown => None,
            };

            match finished {
                Some(result) => {
                    if let Err(e) = result {
                        error!(worker_id = %self.worker_id, error = %e, "Recovery scan failed");
                    }
                }
                None => {
                    match tokio::time::timeout(self.config.shutdown_timeout, &mut scan).await {
                        Ok(Err(e)) => {
                            error!(worker_id = %self.worker_id, error = %e, "Recovery scan failed");
                        }
                        Ok(Ok(_)) => {}
                        Err(_) => {
                            warn!(
                                worker_id = %self.worker_id,
                                timeout_secs = self.config.shutdown_timeout.as_secs(),
                                "Shutdown timeout exceeded, cancelling recoveries"
                            );
                        }
                    }
                    break;
                }
            }
        }

        info!(worker_id = %self.worker_id, "Recovery scanner stopped");
        Ok(())
    }
}
