//! Declarative saga definitions.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::step::SagaStep;

/// An ordered list of steps plus the saga type label.
///
/// Steps run strictly in the order they were added; compensations run in
/// reverse completion order. Step names must be unique within a definition
/// because checkpoints record progress by name.
///
/// # Example
///
/// ```
/// use sagaflow::{SagaDefinition, SagaStep, StepOutput};
///
/// let definition = SagaDefinition::new("backtest")
///     .step(SagaStep::from_fn("create_backtest", |_| async { Ok(StepOutput::new()) }))
///     .step(SagaStep::from_fn("run_strategy", |_| async { Ok(StepOutput::new()) }));
///
/// assert_eq!(definition.len(), 2);
/// assert_eq!(definition.step_names(), vec!["create_backtest", "run_strategy"]);
/// ```
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<SagaStep>,
}

impl SagaDefinition {
    /// Create an empty definition.
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Saga type label used for metrics, audit and recovery routing.
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step and its index by name.
    pub fn find(&self, name: &str) -> Option<(usize, &SagaStep)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, step)| step.name() == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(SagaStep::name).collect()
    }

    /// Reject definitions with repeated step names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(Error::DuplicateStepName {
                    saga_type: self.saga_type.clone(),
                    step: step.name().to_owned(),
                });
            }
        }
        Ok(())
    }
}
