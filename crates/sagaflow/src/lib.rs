//! Durable saga orchestrator for multi-step operations with compensation.
//!
//! Sagaflow runs an ordered list of steps where:
//!
//! - **Compensation over transactions**: each step may carry a semantic undo,
//!   run in reverse order when a later step fails
//! - **Checkpointing**: progress is persisted after every step, so a crashed
//!   saga resumes where it stopped instead of starting over
//! - **Audit trail**: every transition is appended to an immutable log for
//!   compliance replay
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SagaOrchestrator<C, A>                            │
//! │                                                                         │
//! │   1. Save checkpoint (running), audit saga_start                        │
//! │   2. For each step: run under timeout, retry up to budget               │
//! │   3. Merge output into context, save checkpoint, audit step_complete    │
//! │   4. On failure/abort: compensate completed steps in reverse            │
//! │   5. Save terminal checkpoint, audit saga_complete / saga_failed        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          │                        │                        │
//!          ▼                        ▼                        ▼
//!   CheckpointStore            AuditLogger            MetricsRecorder
//!   (authoritative)           (forensic only)          (prometheus)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sagaflow::{MemoryStore, SagaContext, SagaDefinition, SagaOrchestrator, SagaStep, StepOutput};
//! use serde_json::json;
//!
//! let definition = SagaDefinition::new("backtest")
//!     .step(
//!         SagaStep::from_fn("create_backtest", |_ctx| async move {
//!             let mut out = StepOutput::new();
//!             out.insert("backtest_id".into(), json!(17));
//!             Ok(out)
//!         })
//!         .compensate_with(|_ctx| async move { Ok(()) }),
//!     )
//!     .step(SagaStep::from_fn("run_strategy", |_ctx| async move { Ok(StepOutput::new()) }));
//!
//! let store = MemoryStore::new();
//! let orchestrator = SagaOrchestrator::builder(definition, store.clone(), store).build()?;
//!
//! let result = orchestrator.execute(SagaContext::new()).await?;
//! assert!(result.is_completed());
//! ```
//!
//! # Feature Flags
//!
//! - `postgres`: Enables [`PgStore`] for production use with PostgreSQL
//!
//! # Design Documentation
//!
//! See `DESIGN.md` for architectural decisions.

pub mod audit;
mod config;
mod context;
mod definition;
mod error;
pub mod metrics;
mod orchestrator;
pub mod recovery;
mod retry;
mod saga;
mod step;
pub mod store;

pub use audit::{AuditEventType, AuditLogger};
pub use config::{RecoveryAction, RecoveryConfig, SagaConfig};
pub use context::{CONTEXT_SCHEMA_VERSION, SagaContext, StepOutput};
pub use definition::SagaDefinition;
pub use error::{CompensationError, Error, RecoveryError, Result, StepError};
pub use metrics::MetricsRecorder;
pub use orchestrator::{
    ABORTED, AbortHandle, MANUALLY_COMPENSATED, SagaHandle, SagaOrchestrator, SagaOrchestratorBuilder,
};
pub use recovery::{RecoveryReport, RecoveryScanner, RecoveryScannerBuilder};
pub use retry::RetryPolicy;
pub use saga::{MonotonicClock, SagaId, SagaResult, SagaState, SagaStatus};
pub use step::{Compensation, SagaStep, StepAction, StepContext};
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use store::{
    AuditQuery, AuditStore, CheckpointStore, MemoryStore, SagaAuditLogEntry, SagaCheckpoint,
};
