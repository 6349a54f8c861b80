//! SQLite connection pool and migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

/// Open the database at the configured path and bring its schema up to date.
///
/// The journal runs in WAL mode with `synchronous = FULL`, so a committed
/// write is on disk before the call that made it returns.
pub async fn connect(config: &StoreConfig) -> Result<SqlitePool> {
    info!(path = %config.path.display(), "Opening document database");

    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("{}: {}", parent.display(), e))
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(config.busy_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

    run_migrations(&pool).await?;
    debug!("Document database ready");

    Ok(pool)
}

/// Run the embedded migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
