use super::job::{Page, PageStatus};
use crate::{errors::CoreError, sqlite::SqliteConnection};
use anyhow::{anyhow, Result};
use rusqlite::{params, Row};
use std::{str::FromStr, sync::Arc};
use tracing::{error, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct PageRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

fn row_to_page(row: &Row<'_>) -> rusqlite::Result<Page> {
  Ok(Page {
    id: Uuid::from_str(row.get::<_, String>(0)?.as_str()).unwrap(),
    job_id: Uuid::from_str(row.get::<_, String>(1)?.as_str()).unwrap(),
    page_number: row.get(2)?,
    status: PageStatus::from_str(row.get::<_, String>(3)?.as_str()).unwrap(),
    minio_page_path: row.get(4)?,
    minio_markdown_path: row.get(5)?,
    markdown_content: row.get(6)?,
    error: row.get(7)?,
    retry_count: row.get(8)?,
    updated_at: row.get(9)?,
  })
}

const PAGE_COLUMNS: &str = "
  id, job_id, page_number, status, minio_page_path, minio_markdown_path, markdown_content,
  error, retry_count, updated_at
";

impl PageRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip_all)]
  pub async fn upsert_pages(&self, pages: Vec<Page>) -> Result<()> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut statement = tx.prepare(
            "
            INSERT INTO pages (
              id, job_id, page_number, status, minio_page_path, minio_markdown_path,
              markdown_content, error, retry_count, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
            ON CONFLICT (id) DO UPDATE SET
              status = excluded.status,
              minio_page_path = excluded.minio_page_path,
              minio_markdown_path = excluded.minio_markdown_path,
              markdown_content = excluded.markdown_content,
              error = excluded.error,
              retry_count = excluded.retry_count,
              updated_at = datetime('now')
            ",
          )?;
          for page in &pages {
            statement.execute(params![
              page.id.to_string(),
              page.job_id.to_string(),
              page.page_number,
              page.status.to_string(),
              page.minio_page_path,
              page.minio_markdown_path,
              page.markdown_content,
              page.error,
              page.retry_count,
            ])?;
          }
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to upsert pages");
        anyhow!("Failed to upsert pages")
      })??;
    Ok(())
  }

  pub async fn find(&self, id: Uuid) -> Result<Option<Page>> {
    let id = id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement =
          conn.prepare(&format!("SELECT {} FROM pages WHERE id = ?", PAGE_COLUMNS))?;
        let mut rows = statement.query_map([id], row_to_page)?;
        rows.next().transpose()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get page");
        anyhow!("Failed to get page")
      })?
      .map_err(|e| anyhow!(e))
  }

  pub async fn get(&self, id: Uuid) -> Result<Page> {
    self
      .find(id)
      .await?
      .ok_or_else(|| CoreError::NotFound(format!("page {}", id)).into())
  }

  /// Page owned by the given page job.
  pub async fn find_by_job(&self, page_job_id: Uuid) -> Result<Option<Page>> {
    let page_job_id = page_job_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {} FROM pages WHERE job_id = ?",
          PAGE_COLUMNS
        ))?;
        let mut rows = statement.query_map([page_job_id], row_to_page)?;
        rows.next().transpose()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get page by job");
        anyhow!("Failed to get page by job")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// All page rows belonging to a main job, in page order. Retried pages
  /// produce multiple rows per page number; ordering puts the most recent
  /// row last within a number.
  #[instrument(skip(self))]
  pub async fn get_pages(&self, main_job_id: Uuid, limit: u32, offset: u32) -> Result<Vec<Page>> {
    let main_job_id = main_job_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {} FROM pages
          WHERE job_id IN (SELECT id FROM jobs WHERE parent_job_id = ?1 AND job_type = 'page')
          ORDER BY page_number, updated_at, id
          LIMIT ?2 OFFSET ?3
          ",
          PAGE_COLUMNS
        ))?;
        let limit = if limit == 0 { u32::MAX } else { limit };
        let rows = statement
          .query_map(params![main_job_id, limit, offset], row_to_page)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get pages");
        anyhow!("Failed to get pages")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// One row per page number: the completed row when any attempt succeeded,
  /// otherwise the most recent attempt. This is the merge worker's view.
  pub async fn effective_pages(&self, main_job_id: Uuid) -> Result<Vec<Page>> {
    let rows = self.get_pages(main_job_id, 0, 0).await?;
    let mut by_number: std::collections::BTreeMap<u32, Page> = std::collections::BTreeMap::new();
    for page in rows {
      match by_number.get(&page.page_number) {
        Some(existing) if existing.status == PageStatus::Completed => {}
        Some(existing)
          if page.status != PageStatus::Completed && page.updated_at < existing.updated_at => {}
        _ => {
          by_number.insert(page.page_number, page);
        }
      }
    }
    Ok(by_number.into_values().collect())
  }

  pub async fn increment_retry_count(&self, id: Uuid) -> Result<()> {
    let id = id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE pages
          SET retry_count = MIN(retry_count + 1, 3), updated_at = datetime('now')
          WHERE id = ?
          ",
        )?;
        statement.execute([id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to increment retry count");
        anyhow!("Failed to increment retry count")
      })?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    helpers::test::sqlite_connection,
    jobs::{
      job::{JobBuilder, JobStatus, JobType, SourceType},
      job_repository::JobRepository,
    },
  };

  async fn seed_main_with_pages(
    job_repository: &JobRepository,
    page_repository: &PageRepository,
    statuses: &[PageStatus],
  ) -> (Uuid, Vec<Page>) {
    let main = JobBuilder::default()
      .user_id("u1")
      .job_type(JobType::Main)
      .status(JobStatus::Processing)
      .source_type(SourceType::File)
      .name("doc.pdf")
      .build()
      .unwrap();
    job_repository.insert(main.clone()).await.unwrap();

    let mut pages = Vec::new();
    for (index, status) in statuses.iter().enumerate() {
      let page_job = JobBuilder::default()
        .user_id("u1")
        .job_type(JobType::Page)
        .status(JobStatus::Queued)
        .source_type(SourceType::File)
        .name(format!("page {}", index + 1))
        .parent_job_id(main.id)
        .build()
        .unwrap();
      job_repository.insert(page_job.clone()).await.unwrap();
      pages.push(Page {
        id: Uuid::new_v4(),
        job_id: page_job.id,
        page_number: index as u32 + 1,
        status: *status,
        minio_page_path: Some(format!("{}/page_{:04}.pdf", main.id, index + 1)),
        minio_markdown_path: None,
        markdown_content: None,
        error: None,
        retry_count: 0,
        updated_at: chrono::Utc::now().naive_utc(),
      });
    }
    page_repository.upsert_pages(pages.clone()).await.unwrap();
    (main.id, pages)
  }

  #[tokio::test]
  async fn test_get_pages_in_page_order() {
    let (_guard, sqlite) = sqlite_connection().await;
    let job_repository = JobRepository::new(Arc::clone(&sqlite));
    let page_repository = PageRepository::new(sqlite);
    let (main_id, _) = seed_main_with_pages(
      &job_repository,
      &page_repository,
      &[PageStatus::Completed, PageStatus::Failed, PageStatus::Queued],
    )
    .await;

    let pages = page_repository.get_pages(main_id, 0, 0).await.unwrap();
    assert_eq!(pages.len(), 3);
    assert_eq!(
      pages.iter().map(|page| page.page_number).collect::<Vec<_>>(),
      vec![1, 2, 3]
    );

    let paged = page_repository.get_pages(main_id, 2, 1).await.unwrap();
    assert_eq!(paged.len(), 2);
    assert_eq!(paged[0].page_number, 2);
  }

  #[tokio::test]
  async fn test_effective_pages_prefers_completed_retry_rows() {
    let (_guard, sqlite) = sqlite_connection().await;
    let job_repository = JobRepository::new(Arc::clone(&sqlite));
    let page_repository = PageRepository::new(sqlite);
    let (main_id, pages) = seed_main_with_pages(
      &job_repository,
      &page_repository,
      &[PageStatus::Completed, PageStatus::Failed],
    )
    .await;

    // Retry of page 2 lands as a second row under a fresh page job.
    let retry_job = JobBuilder::default()
      .user_id("u1")
      .job_type(JobType::Page)
      .status(JobStatus::Completed)
      .source_type(SourceType::File)
      .name("page 2 retry 1")
      .parent_job_id(main_id)
      .build()
      .unwrap();
    job_repository.insert(retry_job.clone()).await.unwrap();
    page_repository
      .upsert_pages(vec![Page {
        id: Uuid::new_v4(),
        job_id: retry_job.id,
        page_number: 2,
        status: PageStatus::Completed,
        minio_page_path: pages[1].minio_page_path.clone(),
        minio_markdown_path: None,
        markdown_content: Some("recovered".to_string()),
        error: None,
        retry_count: 1,
        updated_at: chrono::Utc::now().naive_utc(),
      }])
      .await
      .unwrap();

    let effective = page_repository.effective_pages(main_id).await.unwrap();
    assert_eq!(effective.len(), 2);
    assert_eq!(effective[1].page_number, 2);
    assert_eq!(effective[1].status, PageStatus::Completed);
    assert_eq!(effective[1].markdown_content.as_deref(), Some("recovered"));
  }

  #[tokio::test]
  async fn test_retry_count_is_capped() {
    let (_guard, sqlite) = sqlite_connection().await;
    let job_repository = JobRepository::new(Arc::clone(&sqlite));
    let page_repository = PageRepository::new(sqlite);
    let (_, pages) = seed_main_with_pages(
      &job_repository,
      &page_repository,
      &[PageStatus::Failed],
    )
    .await;

    for _ in 0..5 {
      page_repository.increment_retry_count(pages[0].id).await.unwrap();
    }
    let page = page_repository.get(pages[0].id).await.unwrap();
    assert_eq!(page.retry_count, 3);
  }
}
