//! Orchestrator and recovery configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Per-orchestrator configuration.
///
/// Carries compliance attribution (who started the saga, from where),
/// feature toggles and the per-step defaults that a [`SagaStep`](crate::SagaStep)
/// can override.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::SagaConfig;
///
/// let config = SagaConfig {
///     user_id: Some("analyst-7".into()),
///     ip_address: Some("10.0.0.12".into()),
///     default_timeout: Duration::from_secs(60),
///     default_max_retries: 1,
///     ..Default::default()
/// };
/// assert!(config.enable_audit_log);
/// ```
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Label for metrics and audit entries.
    ///
    /// If `None`, the definition's saga type is used.
    pub saga_type: Option<String>,

    /// User who initiated the saga, copied onto every audit entry.
    pub user_id: Option<String>,

    /// Client address that initiated the saga, copied onto every audit entry.
    pub ip_address: Option<String>,

    /// Record Prometheus metrics. Default: `true`.
    pub enable_metrics: bool,

    /// Write audit entries. Default: `true`.
    pub enable_audit_log: bool,

    /// Step timeout when the step does not set one. Default: 5 minutes.
    pub default_timeout: Duration,

    /// Retries after the first attempt when the step does not set a budget.
    /// Default: 3.
    pub default_max_retries: u32,

    /// Delay between failed attempts. Default: immediate.
    pub retry_policy: RetryPolicy,

    /// How often the checkpoint is re-saved while a step or compensation is
    /// in flight.
    ///
    /// Each save refreshes `updated_at`, so a slow but live saga never looks
    /// stale to the [`RecoveryScanner`](crate::RecoveryScanner). Must be
    /// non-zero and shorter than [`RecoveryConfig::stale_after`].
    /// Default: 30 seconds.
    pub heartbeat_interval: Duration,

    /// Deadline for each compensation call.
    ///
    /// Compensations are not bound by their step's timeout. If `None`
    /// (the default) they run to completion.
    pub compensation_timeout: Option<Duration>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            saga_type: None,
            user_id: None,
            ip_address: None,
            enable_metrics: true,
            enable_audit_log: true,
            default_timeout: Duration::from_secs(300), // 5 minutes
            default_max_retries: 3,
            retry_policy: RetryPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            compensation_timeout: None,
        }
    }
}

/// What the recovery scanner does with a stale running saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryAction {
    /// Resume execution at the checkpointed step.
    #[default]
    Resume,
    /// Mark the saga failed as "manually compensated" without running anything.
    MarkFailed,
}

/// Configuration for the background recovery scanner.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sagaflow::{RecoveryAction, RecoveryConfig};
///
/// let config = RecoveryConfig {
///     stale_after: Duration::from_secs(600),
///     max_concurrent: 8,
///     action: RecoveryAction::MarkFailed,
///     ..Default::default()
/// };
/// assert_eq!(config.batch_size, 100);
/// ```
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often to scan for stale sagas.
    ///
    /// Default: 60 seconds.
    pub scan_interval: Duration,

    /// A running saga whose checkpoint has not been updated for this long is
    /// considered stuck.
    ///
    /// Live sagas refresh their checkpoint every
    /// [`SagaConfig::heartbeat_interval`], so this must be longer than the
    /// heartbeat of every registered orchestrator. The scanner refuses to
    /// build otherwise. Default: 15 minutes.
    pub stale_after: Duration,

    /// Maximum number of stale sagas fetched per scan. Default: 100.
    pub batch_size: u32,

    /// Maximum number of sagas recovered concurrently. Default: 4.
    pub max_concurrent: usize,

    /// Resume stale sagas or mark them failed. Default: resume.
    pub action: RecoveryAction,

    /// Maximum time to wait for in-flight recoveries during shutdown.
    ///
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Identifier for log correlation.
    ///
    /// If `None`, a UUID is generated when the scanner is built.
    pub worker_id: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(900), // 15 minutes
            batch_size: 100,
            max_concurrent: 4,
            action: RecoveryAction::Resume,
            shutdown_timeout: Duration::from_secs(30),
            worker_id: None,
        }
    }
}
