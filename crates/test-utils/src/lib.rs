//! Shared helpers for sagaflow integration tests.

pub mod db;
