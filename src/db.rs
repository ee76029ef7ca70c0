//! SQLite pool setup and migration runner.
//!
//! Queries throughout `acl`, `ledger`, and `policy` use the runtime
//! `sqlx::query`/`query_as` API rather than the `query!` compile-time macro,
//! since there is no live database reachable at build time — grounded on the
//! pack's `sqlx::query(...).fetch_optional().row.try_get(...)` idiom (e.g.
//! `NorvetMSP-peanut-pos`'s `auth-service`).

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;

pub async fn connect(path: &Path) -> Result<SqlitePool, Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Internal(format!("failed to create db directory: {e}")))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .map_err(|e| Error::Internal(format!("invalid database path: {e}")))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Internal(format!("migration failed: {e}")))?;

    Ok(pool)
}

/// Used by this crate's own unit tests and by its integration tests under
/// `tests/`; not `cfg(test)`-gated since the latter link against a normal
/// (non-test) build of this library.
pub async fn connect_in_memory() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite connect");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrate in-memory db");
    pool
}
