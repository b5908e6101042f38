//! SQLite pool creation and schema setup.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS matches (
        id                    INTEGER PRIMARY KEY AUTOINCREMENT,
        post_id               TEXT    NOT NULL UNIQUE,
        account               TEXT    NOT NULL,
        post_text             TEXT    NOT NULL,
        matched_patterns      TEXT    NOT NULL,
        extracted_values      TEXT    NOT NULL DEFAULT '[]',
        created_at            TEXT    NOT NULL,
        permalink             TEXT    NOT NULL,
        delivered             INTEGER NOT NULL DEFAULT 0,
        notified_destinations TEXT    NOT NULL DEFAULT '[]'
    )",
    "CREATE INDEX IF NOT EXISTS idx_matches_account ON matches (account)",
    "CREATE INDEX IF NOT EXISTS idx_matches_created_at ON matches (created_at)",
    "CREATE TABLE IF NOT EXISTS app_state (
        key        TEXT NOT NULL PRIMARY KEY,
        value      TEXT,
        updated_at TEXT NOT NULL
    )",
];

/// Open a pool for `url` and make sure the schema exists.
///
/// In-memory databases are private to a connection, so they get a
/// single-connection pool that never recycles it.
pub async fn create_pool(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = url.contains(":memory:");

    let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let mut pool_options = SqlitePoolOptions::new();
    if in_memory {
        pool_options = pool_options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    } else {
        pool_options = pool_options.max_connections(5);
    }

    let pool = pool_options.connect_with(options).await?;
    apply_schema(&pool).await?;

    tracing::debug!("Database ready at {}", url);
    Ok(pool)
}

/// [`create_pool`] with up to `attempts` tries; the wait after attempt `n`
/// (counting from 1) is `n * base_delay`.
pub async fn create_pool_with_retry(
    url: &str,
    attempts: u32,
    base_delay: Duration,
) -> Result<SqlitePool, sqlx::Error> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match create_pool(url).await {
            Ok(pool) => return Ok(pool),
            Err(err) if attempt < attempts => {
                let wait = base_delay * attempt;
                tracing::warn!(
                    "Database init failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    attempts,
                    wait,
                    err
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn memory_pool_has_both_tables() {
        let pool = create_pool("sqlite::memory:").await.unwrap();

        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();

        assert!(names.contains(&"matches".to_string()));
        assert!(names.contains(&"app_state".to_string()));
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        assert!(apply_schema(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn retry_gives_up_after_the_last_attempt() {
        let url = "sqlite:///definitely/missing/dir/monitor.db";

        let started = tokio::time::Instant::now();
        let result = create_pool_with_retry(url, 3, Duration::from_millis(20)).await;

        assert!(result.is_err());
        // Waits 20ms then 40ms between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let pool = create_pool_with_retry("sqlite::memory:", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(apply_schema(&pool).await.is_ok());
    }
}
