use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sagaflow::{
    AuditQuery, AuditStore, CompensationError, MemoryStore, Result, SagaAuditLogEntry,
    SagaCheckpoint, SagaConfig, SagaContext, SagaDefinition, SagaId, SagaOrchestrator, SagaState,
    SagaStep, StepError, StepOutput,
};
use serde_json::json;
use time::OffsetDateTime;

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sagaflow=debug")
        .try_init();
}

/// Ordered record of action and compensation calls across steps.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Names of executed steps, in call order.
    pub fn executed(&self) -> Vec<String> {
        self.with_prefix("exec:")
    }

    /// Names of compensated steps, in call order.
    pub fn compensated(&self) -> Vec<String> {
        self.with_prefix("comp:")
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_owned))
            .collect()
    }
}

/// A step that records its call and outputs `{name}_done: true`.
pub fn ok_step(name: &'static str, journal: &Journal) -> SagaStep {
    let exec = journal.clone();
    let comp = journal.clone();
    SagaStep::from_fn(name, move |_ctx| {
        let journal = exec.clone();
        async move {
            journal.push(format!("exec:{name}"));
            let mut out = StepOutput::new();
            out.insert(format!("{name}_done"), json!(true));
            Ok(out)
        }
    })
    .compensate_with(move |_ctx| {
        let journal = comp.clone();
        async move {
            journal.push(format!("comp:{name}"));
            Ok(())
        }
    })
}

/// A step whose action always fails. Its compensation is never called.
pub fn failing_step(name: &'static str, journal: &Journal) -> SagaStep {
    let exec = journal.clone();
    let comp = journal.clone();
    SagaStep::from_fn(name, move |_ctx| {
        let journal = exec.clone();
        async move {
            journal.push(format!("exec:{name}"));
            Err(StepError::execution(format!("{name} exploded")))
        }
    })
    .compensate_with(move |_ctx| {
        let journal = comp.clone();
        async move {
            journal.push(format!("comp:{name}"));
            Ok(())
        }
    })
}

/// A step that succeeds but whose compensation always fails.
pub fn stubborn_step(name: &'static str, journal: &Journal) -> SagaStep {
    let exec = journal.clone();
    let comp = journal.clone();
    SagaStep::from_fn(name, move |_ctx| {
        let journal = exec.clone();
        async move {
            journal.push(format!("exec:{name}"));
            Ok(StepOutput::new())
        }
    })
    .compensate_with(move |_ctx| {
        let journal = comp.clone();
        async move {
            journal.push(format!("comp:{name}"));
            Err(CompensationError::failed(format!("{name} cannot be undone")))
        }
    })
}

/// Definition built from `steps`.
pub fn definition(saga_type: &str, steps: impl IntoIterator<Item = SagaStep>) -> SagaDefinition {
    steps
        .into_iter()
        .fold(SagaDefinition::new(saga_type), SagaDefinition::step)
}

/// Orchestrator over a fresh in-memory store for both checkpoints and audit.
pub fn orchestrator(
    definition: SagaDefinition,
) -> (SagaOrchestrator<MemoryStore, MemoryStore>, MemoryStore) {
    orchestrator_with(definition, SagaConfig::default())
}

/// Config where every failed attempt is final.
pub fn no_retries() -> SagaConfig {
    SagaConfig {
        default_max_retries: 0,
        ..Default::default()
    }
}

pub fn orchestrator_with(
    definition: SagaDefinition,
    config: SagaConfig,
) -> (SagaOrchestrator<MemoryStore, MemoryStore>, MemoryStore) {
    init_test_tracing();
    let store = MemoryStore::new();
    let orchestrator = SagaOrchestrator::builder(definition, store.clone(), store.clone())
        .config(config)
        .build()
        .expect("valid definition");
    (orchestrator, store)
}

/// Orchestrator sharing `store` with other orchestrators in the test.
pub fn orchestrator_on(
    store: &MemoryStore,
    definition: SagaDefinition,
    config: SagaConfig,
) -> SagaOrchestrator<MemoryStore, MemoryStore> {
    init_test_tracing();
    SagaOrchestrator::builder(definition, store.clone(), store.clone())
        .config(config)
        .build()
        .expect("valid definition")
}

/// A `running` checkpoint left behind `age` ago with `completed` done.
pub fn abandoned_checkpoint(
    saga_id: &str,
    saga_type: &str,
    total_steps: usize,
    completed: &[&str],
    age: Duration,
) -> SagaCheckpoint {
    let mut checkpoint = SagaCheckpoint::new(
        SagaId::new(saga_id),
        saga_type,
        total_steps,
        SagaContext::new(),
        OffsetDateTime::now_utc() - age,
    );
    checkpoint
        .transition(SagaState::Running)
        .expect("idle to running");
    for name in completed {
        checkpoint.record_completed(*name);
    }
    checkpoint
}

/// Audit trail of one saga as `event_type` strings, oldest first.
pub async fn audit_events(store: &MemoryStore, saga_id: &SagaId) -> Vec<String> {
    audit_trail(store, saga_id)
        .await
        .into_iter()
        .map(|e| e.event_type.to_string())
        .collect()
}

pub async fn audit_trail(store: &MemoryStore, saga_id: &SagaId) -> Vec<SagaAuditLogEntry> {
    store
        .query(&AuditQuery::new().saga_id(saga_id.clone()))
        .await
        .expect("memory store query")
}

/// Assert that the audit trail matches the expected event types in order.
pub fn assert_event_types(actual: &[String], expected: &[&str]) {
    assert_eq!(
        actual, expected,
        "audit trail mismatch: expected {expected:?}, got {actual:?}"
    );
}

/// Audit store whose writes always fail.
#[derive(Debug, Clone, Default)]
pub struct OfflineAuditStore;

impl AuditStore for OfflineAuditStore {
    async fn append(&self, _entry: &SagaAuditLogEntry) -> Result<i64> {
        Err(serde_json::Error::io(std::io::Error::other("audit store offline")).into())
    }

    async fn query(&self, _query: &AuditQuery) -> Result<Vec<SagaAuditLogEntry>> {
        Ok(Vec::new())
    }
}
