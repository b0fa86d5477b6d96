use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use rusqlite::params;
use std::sync::Arc;
use tracing::error;

/// Presence flags with optional TTLs. A flag is either raised (and not yet
/// expired) or absent; it carries no payload. Worker heartbeats and
/// processor pause switches live here, so a crashed worker's flag simply
/// ages out. Expired rows are purged by the housekeeping sweep.
#[derive(Debug, Clone)]
pub struct FlagStore {
  sqlite_connection: Arc<SqliteConnection>,
}

impl FlagStore {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn raise(&self, flag: &str, ttl: Option<Duration>) -> Result<()> {
    let expires_at: Option<NaiveDateTime> =
      ttl.map(|ttl| chrono::Utc::now().naive_utc() + ttl);
    let flag = flag.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "
          INSERT OR REPLACE INTO runtime_flags (key, expires_at, updated_at)
          VALUES (?1, ?2, datetime('now'))
          ",
          params![flag, expires_at],
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to raise flag");
        anyhow!("Failed to raise flag")
      })??;
    Ok(())
  }

  /// Expiry is resolved in the query, so a stale flag reads as absent even
  /// before the sweep removes the row.
  pub async fn is_raised(&self, flag: &str) -> Result<bool> {
    let flag = flag.to_string();
    let count = self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "
          SELECT COUNT(*) FROM runtime_flags
          WHERE key = ?1 AND (expires_at IS NULL OR expires_at > datetime('now'))
          ",
          params![flag],
          |row| row.get::<_, u32>(0),
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to read flag");
        anyhow!("Failed to read flag")
      })??;
    Ok(count > 0)
  }

  pub async fn clear(&self, flag: &str) -> Result<()> {
    let flag = flag.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| conn.execute("DELETE FROM runtime_flags WHERE key = ?1", params![flag]))
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to clear flag");
        anyhow!("Failed to clear flag")
      })??;
    Ok(())
  }

  pub async fn purge_expired(&self) -> Result<usize> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(|conn| {
        conn.execute(
          "DELETE FROM runtime_flags WHERE expires_at IS NOT NULL AND expires_at < datetime('now')",
          [],
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to purge expired flags");
        anyhow!("Failed to purge expired flags")
      })?
      .map_err(|e| anyhow!(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::helpers::test::sqlite_connection;

  #[tokio::test]
  async fn test_raise_read_clear() {
    let (_guard, sqlite) = sqlite_connection().await;
    let flags = FlagStore::new(sqlite);

    assert!(!flags.is_raised("paused:conversion").await.unwrap());
    flags.raise("paused:conversion", None).await.unwrap();
    assert!(flags.is_raised("paused:conversion").await.unwrap());

    // Raising an already-raised flag is idempotent.
    flags.raise("paused:conversion", None).await.unwrap();
    assert!(flags.is_raised("paused:conversion").await.unwrap());

    flags.clear("paused:conversion").await.unwrap();
    assert!(!flags.is_raised("paused:conversion").await.unwrap());
  }

  #[tokio::test]
  async fn test_expired_flags_read_as_absent_and_purge() {
    let (_guard, sqlite) = sqlite_connection().await;
    let flags = FlagStore::new(sqlite);

    flags
      .raise("heartbeat:a", Duration::try_seconds(-5))
      .await
      .unwrap();
    flags
      .raise("heartbeat:b", Duration::try_hours(1))
      .await
      .unwrap();

    assert!(!flags.is_raised("heartbeat:a").await.unwrap());
    assert!(flags.is_raised("heartbeat:b").await.unwrap());

    assert_eq!(flags.purge_expired().await.unwrap(), 1);
    assert!(flags.is_raised("heartbeat:b").await.unwrap());
  }
}
