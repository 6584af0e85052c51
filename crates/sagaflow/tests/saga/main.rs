//! Integration tests for the saga orchestrator over the in-memory store.

mod execute;
mod support;
