use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime};
use rusqlite::params;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{error, instrument};

#[derive(Debug)]
pub struct Document<T> {
  pub id: u64,
  pub collection: String,
  pub key: String,
  pub document: T,
  pub created_at: NaiveDateTime,
}

/**
 * DocumentStore is a lightweight helper for interacting with jsonb documents in the sqlite database
 * as if it were a document store. It backs the progress indexer's append-only streams, where a
 * rigid relational schema is not wanted and advanced querying is not needed.
 */
#[derive(Debug, Clone)]
pub struct DocumentStore {
  sqlite_connection: Arc<SqliteConnection>,
}

impl DocumentStore {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip(self, entries))]
  pub async fn put_many<T: Serialize + Send + Sync>(
    &self,
    collection: &str,
    entries: Vec<(String, T, Option<Duration>)>,
  ) -> Result<()> {
    let collection = collection.to_string();
    let entries = entries
      .into_iter()
      .map(|(key, document, ttl)| {
        let expires_at = ttl.map(|ttl| chrono::Utc::now().naive_utc() + ttl);
        Ok((key, serde_json::to_string(&document)?, expires_at))
      })
      .collect::<Result<Vec<(String, String, Option<NaiveDateTime>)>>>()?;

    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut statement = tx.prepare(
            "
            INSERT INTO document_store (collection, key, json, expires_at)
            VALUES (?1, ?2, jsonb(?3), ?4)
            ON CONFLICT (collection, key) DO UPDATE SET
              json = excluded.json,
              expires_at = excluded.expires_at,
              updated_at = CURRENT_TIMESTAMP
            ",
          )?;
          for (key, json, expires_at) in entries {
            statement.execute(params![collection, key, json, expires_at])?;
          }
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to put documents");
        anyhow!("Failed to put documents")
      })??;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn read_collection<T: DeserializeOwned + Send + Sync + 'static>(
    &self,
    collection: &str,
    id_cursor: Option<u64>,
    limit: usize,
  ) -> Result<Vec<Document<T>>> {
    let collection = collection.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          SELECT id, collection, key, json(json), created_at
          FROM document_store
          WHERE collection = ?1
            AND id > ?2
            AND (expires_at IS NULL OR expires_at > datetime('now'))
          ORDER BY id
          LIMIT ?3
          ",
        )?;
        let rows = statement
          .query_map(
            params![collection, id_cursor.unwrap_or(0), limit],
            |row| {
              Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, NaiveDateTime>(4)?,
              ))
            },
          )?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to read documents");
        anyhow!("Failed to read documents")
      })??
      .into_iter()
      .map(|(id, collection, key, json, created_at)| {
        Ok(Document {
          id,
          collection,
          key,
          document: serde_json::from_str(&json)?,
          created_at,
        })
      })
      .collect()
  }

  pub async fn count(&self, collection: &str) -> Result<usize> {
    let collection = collection.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "SELECT COUNT(*) FROM document_store WHERE collection = ?1",
          params![collection],
          |row| row.get::<_, usize>(0),
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to count documents");
        anyhow!("Failed to count documents")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Deletes documents past their TTL. Ran by the housekeeping sweep.
  pub async fn delete_expired(&self) -> Result<usize> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(|conn| {
        conn.execute(
          "DELETE FROM document_store WHERE expires_at IS NOT NULL AND expires_at < datetime('now')",
          [],
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to delete expired documents");
        anyhow!("Failed to delete expired documents")
      })?
      .map_err(|e| anyhow!(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::helpers::test::sqlite_connection;
  use serde_json::json;

  #[tokio::test]
  async fn test_put_and_read_round_trip() {
    let (_guard, sqlite) = sqlite_connection().await;
    let store = DocumentStore::new(sqlite);

    store
      .put_many(
        "execution-metrics-2026.08.01",
        vec![
          ("a".to_string(), json!({"progress": 10}), None),
          ("b".to_string(), json!({"progress": 20}), None),
        ],
      )
      .await
      .unwrap();

    let documents = store
      .read_collection::<serde_json::Value>("execution-metrics-2026.08.01", None, 10)
      .await
      .unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0].document["progress"], 10);
    assert!(documents[0].id < documents[1].id);

    // Re-writing the same key is idempotent.
    store
      .put_many(
        "execution-metrics-2026.08.01",
        vec![("a".to_string(), json!({"progress": 15}), None)],
      )
      .await
      .unwrap();
    assert_eq!(store.count("execution-metrics-2026.08.01").await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_expired_documents_are_hidden_and_swept() {
    let (_guard, sqlite) = sqlite_connection().await;
    let store = DocumentStore::new(sqlite);

    store
      .put_many(
        "retry-metrics-2026.08.01",
        vec![
          ("live".to_string(), json!({"x": 1}), Duration::try_days(1)),
          ("dead".to_string(), json!({"x": 2}), Duration::try_seconds(-5)),
        ],
      )
      .await
      .unwrap();

    let documents = store
      .read_collection::<serde_json::Value>("retry-metrics-2026.08.01", None, 10)
      .await
      .unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].key, "live");

    assert_eq!(store.delete_expired().await.unwrap(), 1);
  }
}
