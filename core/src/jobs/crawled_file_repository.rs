use super::job::{CrawledFile, CrawledFileStatus};
use crate::sqlite::SqliteConnection;
use anyhow::{anyhow, Result};
use rusqlite::{params, Row};
use std::{str::FromStr, sync::Arc};
use tracing::{error, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct CrawledFileRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

fn row_to_crawled_file(row: &Row<'_>) -> rusqlite::Result<CrawledFile> {
  Ok(CrawledFile {
    id: Uuid::from_str(row.get::<_, String>(0)?.as_str()).unwrap(),
    execution_id: Uuid::from_str(row.get::<_, String>(1)?.as_str()).unwrap(),
    url: row.get(2)?,
    filename: row.get(3)?,
    file_type: row.get(4)?,
    mime_type: row.get(5)?,
    size_bytes: row.get(6)?,
    minio_path: row.get(7)?,
    public_url: row.get(8)?,
    status: CrawledFileStatus::from_str(row.get::<_, String>(9)?.as_str()).unwrap(),
    error: row.get(10)?,
    downloaded_at: row.get(11)?,
  })
}

const CRAWLED_FILE_COLUMNS: &str = "
  id, execution_id, url, filename, file_type, mime_type, size_bytes, minio_path, public_url,
  status, error, downloaded_at
";

impl CrawledFileRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip_all)]
  pub async fn upsert(&self, file: CrawledFile) -> Result<()> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          INSERT INTO crawled_files (
            id, execution_id, url, filename, file_type, mime_type, size_bytes, minio_path,
            public_url, status, error, downloaded_at
          )
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
          ON CONFLICT (id) DO UPDATE SET
            mime_type = excluded.mime_type,
            size_bytes = excluded.size_bytes,
            minio_path = excluded.minio_path,
            public_url = excluded.public_url,
            status = excluded.status,
            error = excluded.error,
            downloaded_at = excluded.downloaded_at
          ",
        )?;
        statement.execute(params![
          file.id.to_string(),
          file.execution_id.to_string(),
          file.url,
          file.filename,
          file.file_type,
          file.mime_type,
          file.size_bytes,
          file.minio_path,
          file.public_url,
          file.status.to_string(),
          file.error,
          file.downloaded_at,
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to upsert crawled file");
        anyhow!("Failed to upsert crawled file")
      })?
  }

  /// Records the published blob path and public URL after upload.
  pub async fn set_published(
    &self,
    id: Uuid,
    minio_path: &str,
    public_url: Option<&str>,
  ) -> Result<()> {
    let id = id.to_string();
    let minio_path = minio_path.to_string();
    let public_url = public_url.map(|url| url.to_string());
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE crawled_files
          SET minio_path = ?2, public_url = ?3
          WHERE id = ?1
          ",
        )?;
        statement.execute(params![id, minio_path, public_url])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set published path");
        anyhow!("Failed to set published path")
      })?
  }

  pub async fn list_by_execution(&self, execution_id: Uuid) -> Result<Vec<CrawledFile>> {
    let execution_id = execution_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {} FROM crawled_files
          WHERE execution_id = ?
          ORDER BY downloaded_at, id
          ",
          CRAWLED_FILE_COLUMNS
        ))?;
        let rows = statement
          .query_map([execution_id], row_to_crawled_file)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to list crawled files");
        anyhow!("Failed to list crawled files")
      })?
      .map_err(|e| anyhow!(e))
  }
}
