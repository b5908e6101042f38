//! Database repository for matches and application state.
//!
//! All SQLite read/write logic lives here. The monitor calls
//! [`MatchRepository::store_match`] for every matched post and
//! [`MatchRepository::mark_delivered`] for every successful delivery, then
//! [`MatchRepository::trim`] to keep the table bounded.
//!
//! Writes go through a single async lock so the existence check in
//! `store_match` can never race another writer; the `UNIQUE` constraint on
//! `post_id` backs that up at the storage level. Reads go straight to the
//! pool.
//!
//! [`MatchRepository::claim_post`] serializes the whole check, store and
//! notify sequence for one post id across concurrent cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::monitor::types::{Match, MatchStats};

/// Well-known `app_state` keys written by the monitor.
pub mod state_keys {
    pub const RUNNING: &str = "running";
    pub const START_TIME: &str = "start_time";
    pub const STOP_TIME: &str = "stop_time";
}

const MATCH_COLUMNS: &str = "id, post_id, account, post_text, matched_patterns, extracted_values, \
                             created_at, permalink, delivered, notified_destinations";

/// Repository for reading and writing matches and app state to SQLite.
pub struct MatchRepository {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    post_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Exclusive hold on one post id, released on drop.
pub struct PostClaim<'a> {
    post_id: String,
    locks: &'a StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for PostClaim<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // Only the map and this guard hold the lock: nobody is waiting.
        if locks
            .get(&self.post_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.post_id);
        }
    }
}

impl MatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            post_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait until no other caller holds `post_id`, then hold it until the
    /// returned claim is dropped.
    pub async fn claim_post(&self, post_id: &str) -> PostClaim<'_> {
        let lock = {
            let mut locks = self.post_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(post_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        PostClaim {
            post_id: post_id.to_string(),
            locks: &self.post_locks,
            _guard: lock.lock_owned().await,
        }
    }

    // ---- Matches ----

    /// Insert `m`, or update the existing row with the same post id.
    ///
    /// On update the matched patterns and extracted values are replaced and
    /// the notified-destination set is merged, never shrunk. Returns the row
    /// id either way.
    pub async fn store_match(&self, m: &Match) -> Result<i64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id, delivered, notified_destinations FROM matches WHERE post_id = ?",
        )
        .bind(&m.post_id)
        .fetch_optional(&mut *tx)
        .await?;

        let id = match existing {
            Some(row) => {
                let id: i64 = row.try_get("id")?;
                let was_delivered: i64 = row.try_get("delivered")?;
                let mut notified = decode_list(row.try_get("notified_destinations")?)?;
                for destination in &m.notified_destinations {
                    if !notified.contains(destination) {
                        notified.push(destination.clone());
                    }
                }
                let delivered = was_delivered != 0 || m.delivered || !notified.is_empty();

                sqlx::query(
                    "UPDATE matches
                     SET matched_patterns = ?, extracted_values = ?, delivered = ?, notified_destinations = ?
                     WHERE id = ?",
                )
                .bind(encode_list(&m.matched_patterns)?)
                .bind(encode_list(&m.extracted_values)?)
                .bind(delivered as i64)
                .bind(encode_list(&notified)?)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                id
            }
            None => {
                let delivered = m.delivered || !m.notified_destinations.is_empty();
                let result = sqlx::query(
                    "INSERT INTO matches
                     (post_id, account, post_text, matched_patterns, extracted_values,
                      created_at, permalink, delivered, notified_destinations)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&m.post_id)
                .bind(&m.account)
                .bind(&m.text)
                .bind(encode_list(&m.matched_patterns)?)
                .bind(encode_list(&m.extracted_values)?)
                .bind(format_timestamp(m.created_at))
                .bind(&m.permalink)
                .bind(delivered as i64)
                .bind(encode_list(&m.notified_destinations)?)
                .execute(&mut *tx)
                .await?;

                result.last_insert_rowid()
            }
        };

        tx.commit().await?;
        Ok(id)
    }

    /// Look up a match by its natural key.
    pub async fn find_by_post_id(&self, post_id: &str) -> Result<Option<Match>, sqlx::Error> {
        let sql = format!("SELECT {} FROM matches WHERE post_id = ?", MATCH_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_match).transpose()
    }

    /// Record a successful delivery of match `match_id` to `destination`.
    /// Returns `false` if no such match exists. Repeating a call is a no-op.
    pub async fn mark_delivered(&self, match_id: i64, destination: &str) -> Result<bool, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT notified_destinations FROM matches WHERE id = ?")
            .bind(match_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let mut notified = decode_list(row.try_get("notified_destinations")?)?;
        if !notified.iter().any(|d| d == destination) {
            notified.push(destination.to_string());
        }

        sqlx::query("UPDATE matches SET delivered = 1, notified_destinations = ? WHERE id = ?")
            .bind(encode_list(&notified)?)
            .bind(match_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Most recent matches, newest first. Ties on `created_at` go to the
    /// later insert.
    pub async fn recent_matches(&self, limit: i64) -> Result<Vec<Match>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM matches ORDER BY created_at DESC, id DESC LIMIT ?",
            MATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_match).collect()
    }

    /// Like [`recent_matches`](Self::recent_matches), restricted to `accounts`.
    pub async fn matches_for_accounts(
        &self,
        accounts: &[String],
        limit: i64,
    ) -> Result<Vec<Match>, sqlx::Error> {
        if accounts.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; accounts.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM matches WHERE account IN ({}) ORDER BY created_at DESC, id DESC LIMIT ?",
            MATCH_COLUMNS, placeholders
        );

        let mut q = sqlx::query(&sql);
        for account in accounts {
            q = q.bind(account.trim_start_matches('@').to_string());
        }
        let rows = q.bind(limit.max(0)).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_match).collect()
    }

    /// Totals: all time, since UTC midnight, trailing 7 days, distinct accounts.
    pub async fn stats(&self) -> Result<MatchStats, sqlx::Error> {
        let now = Utc::now();
        let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
        let week_ago = now - Duration::days(7);

        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0) AS today,
                COALESCE(SUM(CASE WHEN created_at >= ? THEN 1 ELSE 0 END), 0) AS last_7_days,
                COUNT(DISTINCT account) AS unique_accounts
             FROM matches",
        )
        .bind(format_timestamp(midnight))
        .bind(format_timestamp(week_ago))
        .fetch_one(&self.pool)
        .await?;

        Ok(MatchStats {
            total: row.try_get("total")?,
            today: row.try_get("today")?,
            last_7_days: row.try_get("last_7_days")?,
            unique_accounts: row.try_get("unique_accounts")?,
        })
    }

    /// Delete the oldest matches beyond `max_rows`. Returns the number deleted.
    pub async fn trim(&self, max_rows: i64) -> Result<u64, sqlx::Error> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            "DELETE FROM matches WHERE id NOT IN (
                SELECT id FROM matches ORDER BY created_at DESC, id DESC LIMIT ?
             )",
        )
        .bind(max_rows.max(0))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- Application state ----

    /// Read `key`, falling back to `default` when it is missing or holds a
    /// value of another shape.
    pub async fn get_state<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, sqlx::Error> {
        let row = sqlx::query("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        let Some(raw) = row.map(|r| r.try_get::<Option<String>, _>("value")).transpose()?.flatten() else {
            return Ok(default);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!("app_state '{}' has unexpected shape, using default: {}", key, err);
                Ok(default)
            }
        }
    }

    /// Upsert `key`, refreshing its `updated_at`.
    pub async fn set_state<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), sqlx::Error> {
        let encoded = serde_json::to_string(value).map_err(encode_error)?;
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            "INSERT INTO app_state (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(encoded)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Fixed-width UTC timestamps so lexical order equals time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_list(values: &[String]) -> Result<String, sqlx::Error> {
    serde_json::to_string(values).map_err(encode_error)
}

fn encode_error(err: serde_json::Error) -> sqlx::Error {
    sqlx::Error::Protocol(format!("could not encode value: {}", err))
}

fn decode_list(raw: String) -> Result<Vec<String>, sqlx::Error> {
    serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn row_to_match(row: &SqliteRow) -> Result<Match, sqlx::Error> {
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
        .with_timezone(&Utc);
    let delivered: i64 = row.try_get("delivered")?;

    Ok(Match {
        id: Some(row.try_get("id")?),
        post_id: row.try_get("post_id")?,
        account: row.try_get("account")?,
        text: row.try_get("post_text")?,
        matched_patterns: decode_list(row.try_get("matched_patterns")?)?,
        extracted_values: decode_list(row.try_get("extracted_values")?)?,
        created_at,
        permalink: row.try_get("permalink")?,
        delivered: delivered != 0,
        notified_destinations: decode_list(row.try_get("notified_destinations")?)?,
    })
}
