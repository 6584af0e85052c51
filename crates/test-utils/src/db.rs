//! Throwaway PostgreSQL databases for sagaflow integration tests.
//!
//! Each `db_test!` gets its own database, created from the server named by
//! `TEST_ADMIN_DATABASE_URL` (read from the environment or `.env`) and
//! migrated with the sagaflow schema. The account needs CREATE/DROP DATABASE.
//!
//! Databases of passing tests are dropped. Failing or panicking tests leave
//! theirs behind for inspection, as does setting `TEST_KEEP_DB`. Without an
//! admin URL the tests are skipped.

use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use url::Url;
use uuid::Uuid;

/// Environment variable holding the admin connection URL.
pub const ADMIN_URL_VAR: &str = "TEST_ADMIN_DATABASE_URL";

/// Set to keep every test database, including those of passing tests.
pub const KEEP_DB_VAR: &str = "TEST_KEEP_DB";

/// Postgres truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

const NAME_PREFIX: &str = "saga_";

/// A migrated database owned by one test.
struct TestDb {
    admin: PgConnection,
    name: String,
    pool: PgPool,
}

impl TestDb {
    async fn create(admin_url: &str, test_name: &str) -> Result<Self> {
        let mut admin = PgConnection::connect(admin_url).await?;
        let name = database_name(test_name);
        admin
            .execute(format!(r#"CREATE DATABASE "{name}""#).as_str())
            .await?;

        let mut url = Url::parse(admin_url)?;
        url.set_path(&format!("/{name}"));
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url.as_str())
            .await?;

        // Relative to this crate's manifest.
        sqlx::migrate!("../sagaflow/migrations").run(&pool).await?;

        Ok(Self { admin, name, pool })
    }

    async fn drop_database(mut self) {
        self.pool.close().await;

        let statement = format!(r#"DROP DATABASE IF EXISTS "{}" WITH (FORCE)"#, self.name);
        match self.admin.execute(statement.as_str()).await {
            Ok(_) => eprintln!("[db_test] dropped {}", self.name),
            Err(e) => eprintln!("[db_test] could not drop {}: {e}", self.name),
        }
    }
}

/// Run `body` against a fresh database named after `test_name`.
///
/// Returns `Ok(())` without running `body` when no admin URL is configured.
pub async fn with_test_db<F>(test_name: &str, body: F) -> Result<()>
where
    F: for<'a> FnOnce(&'a PgPool) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>,
{
    dotenvy::dotenv().ok();

    let Ok(admin_url) = std::env::var(ADMIN_URL_VAR) else {
        eprintln!("[db_test] {ADMIN_URL_VAR} is not set, skipping {test_name}");
        return Ok(());
    };

    let db = TestDb::create(&admin_url, test_name).await?;
    let result = body(&db.pool).await;

    if result.is_err() || std::env::var_os(KEEP_DB_VAR).is_some() {
        eprintln!("[db_test] kept {} for {test_name}", db.name);
    } else {
        db.drop_database().await;
    }

    result
}

/// `saga_<sanitized test name>_<uuid>`, within the identifier limit.
fn database_name(test_name: &str) -> String {
    let suffix = Uuid::now_v7().simple().to_string();
    let budget = MAX_IDENTIFIER_LEN - NAME_PREFIX.len() - 1 - suffix.len();

    let sanitized: String = test_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let stem: String = sanitized.trim_matches('_').chars().take(budget).collect();

    format!("{NAME_PREFIX}{stem}_{suffix}")
}

/// Define an async test that receives a `&PgPool` to its own database.
///
/// ```ignore
/// use test_utils::db_test;
///
/// db_test!(checkpoint_round_trip, |pool| {
///     let store = PgStore::new(pool.clone());
///     assert!(store.load(&SagaId::new("missing")).await?.is_none());
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! db_test {
    ($name:ident, |$pool:ident| $body:block) => {
        #[tokio::test(flavor = "multi_thread")]
        async fn $name() -> anyhow::Result<()> {
            $crate::db::with_test_db(stringify!($name), |$pool| {
                Box::pin(async move { $body })
            })
            .await
        }
    };
}
