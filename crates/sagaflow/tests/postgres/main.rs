//! PostgreSQL integration tests.
//!
//! Each test runs against its own temporary database and is skipped unless
//! `TEST_ADMIN_DATABASE_URL` is set.

mod store;
