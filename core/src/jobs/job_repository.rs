use super::job::{Job, JobStatus, JobType};
use crate::{errors::CoreError, sqlite::SqliteConnection};
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Row};
use std::{str::FromStr, sync::Arc};
use tracing::{error, instrument};
use uuid::Uuid;

pub const SIMILARITY_MAX_DISTANCE: usize = 2;

#[derive(Debug, Clone, Default)]
pub struct JobListFilters {
  pub status: Option<JobStatus>,
  pub job_type: Option<JobType>,
  pub limit: u32,
  pub offset: u32,
}

#[derive(Clone)]
pub struct JobRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
  Ok(Job {
    id: Uuid::from_str(row.get::<_, String>(0)?.as_str()).unwrap(),
    user_id: row.get(1)?,
    job_type: JobType::from_str(row.get::<_, String>(2)?.as_str()).unwrap(),
    status: JobStatus::from_str(row.get::<_, String>(3)?.as_str()).unwrap(),
    progress: row.get(4)?,
    source_type: super::job::SourceType::from_str(row.get::<_, String>(5)?.as_str()).unwrap(),
    source_url: row.get(6)?,
    url_pattern: row.get(7)?,
    name: row.get(8)?,
    parent_job_id: row
      .get::<_, Option<String>>(9)?
      .map(|id| Uuid::from_str(id.as_str()).unwrap()),
    error: row.get(10)?,
    total_pages: row.get(11)?,
    pages_completed: row.get(12)?,
    pages_failed: row.get(13)?,
    minio_upload_path: row.get(14)?,
    minio_result_path: row.get(15)?,
    crawler_config: row
      .get::<_, Option<Vec<u8>>>(16)?
      .map(|blob| serde_json::from_slice(&blob).unwrap()),
    crawler_schedule: row
      .get::<_, Option<Vec<u8>>>(17)?
      .map(|blob| serde_json::from_slice(&blob).unwrap()),
    engine_used: row
      .get::<_, Option<String>>(18)?
      .map(|e| super::job::EngineKind::from_str(e.as_str()).unwrap()),
    proxy_used: row.get(19)?,
    retry_history: row
      .get::<_, Option<Vec<u8>>>(20)?
      .map(|blob| serde_json::from_slice(&blob).unwrap())
      .unwrap_or_default(),
    fire_instant: row.get(21)?,
    version: row.get(22)?,
    created_at: row.get(23)?,
    started_at: row.get(24)?,
    completed_at: row.get(25)?,
    updated_at: row.get(26)?,
  })
}

const JOB_COLUMNS: &str = "
  id, user_id, job_type, status, progress, source_type, source_url, url_pattern, name,
  parent_job_id, error, total_pages, pages_completed, pages_failed, minio_upload_path,
  minio_result_path, crawler_config, crawler_schedule, engine_used, proxy_used, retry_history,
  fire_instant, version, created_at, started_at, completed_at, updated_at
";

fn insert_job(conn: &rusqlite::Connection, job: &Job) -> rusqlite::Result<()> {
  let mut statement = conn.prepare(
    "
    INSERT INTO jobs (
      id, user_id, job_type, status, progress, source_type, source_url, url_pattern, name,
      parent_job_id, error, total_pages, pages_completed, pages_failed, minio_upload_path,
      minio_result_path, crawler_config, crawler_schedule, engine_used, proxy_used,
      retry_history, fire_instant, version, created_at, started_at, completed_at, updated_at
    )
    VALUES (
      ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
      ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
    )
    ",
  )?;
  statement.execute(params![
    job.id.to_string(),
    job.user_id,
    job.job_type.to_string(),
    job.status.to_string(),
    job.progress,
    job.source_type.to_string(),
    job.source_url,
    job.url_pattern,
    job.name,
    job.parent_job_id.map(|id| id.to_string()),
    job.error,
    job.total_pages,
    job.pages_completed,
    job.pages_failed,
    job.minio_upload_path,
    job.minio_result_path,
    job
      .crawler_config
      .as_ref()
      .map(|c| serde_json::to_vec(c).unwrap()),
    job
      .crawler_schedule
      .as_ref()
      .map(|s| serde_json::to_vec(s).unwrap()),
    job.engine_used.map(|e| e.to_string()),
    job.proxy_used,
    serde_json::to_vec(&job.retry_history).unwrap(),
    job.fire_instant,
    job.version,
    job.created_at,
    job.started_at,
    job.completed_at,
    job.updated_at,
  ])?;
  Ok(())
}

impl JobRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  pub async fn insert(&self, job: Job) -> Result<()> {
    self.insert_many(vec![job]).await
  }

  #[instrument(skip_all)]
  pub async fn insert_many(&self, jobs: Vec<Job>) -> Result<()> {
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let tx = conn.transaction()?;
        for job in &jobs {
          insert_job(&tx, job)?;
        }
        tx.commit()?;
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to insert jobs");
        anyhow!("Failed to insert jobs")
      })??;
    Ok(())
  }

  pub async fn find(&self, id: Uuid) -> Result<Option<Job>> {
    let id = id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement =
          conn.prepare(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))?;
        let mut rows = statement.query_map([id], row_to_job)?;
        rows.next().transpose()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get job");
        anyhow!("Failed to get job")
      })?
      .map_err(|e| anyhow!(e))
  }

  pub async fn get(&self, id: Uuid) -> Result<Job> {
    self
      .find(id)
      .await?
      .ok_or_else(|| CoreError::NotFound(format!("job {}", id)).into())
  }

  pub async fn delete(&self, id: Uuid) -> Result<()> {
    let id = id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare("DELETE FROM jobs WHERE id = ?")?;
        statement.execute([id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to delete job");
        anyhow!("Failed to delete job")
      })?
  }

  /// Persists the given job over its stored version. Fails with `Conflict`
  /// when another writer got there first; callers go through
  /// `update_with_retry` for the read-modify-write loop.
  pub async fn update(&self, job: &Job) -> Result<()> {
    let job = job.clone();
    let updated = self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE jobs SET
            status = ?3,
            progress = ?4,
            url_pattern = ?5,
            name = ?6,
            error = ?7,
            total_pages = ?8,
            pages_completed = ?9,
            pages_failed = ?10,
            minio_upload_path = ?11,
            minio_result_path = ?12,
            crawler_config = ?13,
            crawler_schedule = ?14,
            engine_used = ?15,
            proxy_used = ?16,
            retry_history = ?17,
            fire_instant = ?18,
            version = version + 1,
            started_at = ?19,
            completed_at = ?20,
            updated_at = datetime('now')
          WHERE id = ?1 AND version = ?2
          ",
        )?;
        statement.execute(params![
          job.id.to_string(),
          job.version,
          job.status.to_string(),
          job.progress,
          job.url_pattern,
          job.name,
          job.error,
          job.total_pages,
          job.pages_completed,
          job.pages_failed,
          job.minio_upload_path,
          job.minio_result_path,
          job
            .crawler_config
            .as_ref()
            .map(|c| serde_json::to_vec(c).unwrap()),
          job
            .crawler_schedule
            .as_ref()
            .map(|s| serde_json::to_vec(s).unwrap()),
          job.engine_used.map(|e| e.to_string()),
          job.proxy_used,
          serde_json::to_vec(&job.retry_history).unwrap(),
          job.fire_instant,
          job.started_at,
          job.completed_at,
        ])
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to update job");
        anyhow!("Failed to update job")
      })??;

    if updated == 0 {
      return Err(CoreError::Conflict(format!("job {} version {}", job.id, job.version)).into());
    }
    Ok(())
  }

  /// Monotonic progress write; bypasses the version column since the value
  /// only ever ratchets upward within an execution.
  pub async fn update_progress(&self, id: Uuid, progress: f64) -> Result<()> {
    let id = id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE jobs
          SET progress = MAX(progress, ?2), updated_at = datetime('now')
          WHERE id = ?1
          ",
        )?;
        statement.execute(params![id, progress])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to update job progress");
        anyhow!("Failed to update job progress")
      })?
  }

  #[instrument(skip(self))]
  pub async fn list_by_user(&self, user_id: &str, filters: JobListFilters) -> Result<Vec<Job>> {
    let user_id = user_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut sql = format!("SELECT {} FROM jobs WHERE user_id = ?", JOB_COLUMNS);
        let mut args: Vec<String> = vec![user_id];
        if let Some(status) = filters.status {
          sql.push_str(" AND status = ?");
          args.push(status.to_string());
        }
        if let Some(job_type) = filters.job_type {
          sql.push_str(" AND job_type = ?");
          args.push(job_type.to_string());
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        let limit = if filters.limit == 0 { 50 } else { filters.limit };
        args.push(limit.to_string());
        args.push(filters.offset.to_string());

        let mut statement = conn.prepare(&sql)?;
        let rows = statement
          .query_map(params_from_iter(args), row_to_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to list jobs");
        anyhow!("Failed to list jobs")
      })?
      .map_err(|e| anyhow!(e))
  }

  pub async fn find_crawler_jobs(&self, user_id: &str, filters: JobListFilters) -> Result<Vec<Job>> {
    self
      .list_by_user(
        user_id,
        JobListFilters {
          job_type: Some(JobType::Crawler),
          ..filters
        },
      )
      .await
  }

  /// Scheduler rehydration: every crawler job currently registered to fire.
  pub async fn find_active_crawlers(&self) -> Result<Vec<Job>> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {} FROM jobs WHERE job_type = 'crawler' AND status = 'active'",
          JOB_COLUMNS
        ))?;
        let rows = statement
          .query_map([], row_to_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find active crawlers");
        anyhow!("Failed to find active crawlers")
      })?
      .map_err(|e| anyhow!(e))
  }

  pub async fn find_children(&self, parent_id: Uuid, job_type: Option<JobType>) -> Result<Vec<Job>> {
    let parent_id = parent_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut sql = format!("SELECT {} FROM jobs WHERE parent_job_id = ?", JOB_COLUMNS);
        let mut args = vec![parent_id];
        if let Some(job_type) = job_type {
          sql.push_str(" AND job_type = ?");
          args.push(job_type.to_string());
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        let mut statement = conn.prepare(&sql)?;
        let rows = statement
          .query_map(params_from_iter(args), row_to_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find child jobs");
        anyhow!("Failed to find child jobs")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Executions of a crawler, newest first.
  pub async fn find_crawler_executions(&self, crawler_job_id: Uuid) -> Result<Vec<Job>> {
    self.find_children(crawler_job_id, Some(JobType::Main)).await
  }

  /// Duplicate-trigger guard: an execution already created for this crawler
  /// and intended fire instant, whatever its status.
  pub async fn find_execution_by_fire_instant(
    &self,
    crawler_job_id: Uuid,
    fire_instant: NaiveDateTime,
  ) -> Result<Option<Job>> {
    let crawler_job_id = crawler_job_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {} FROM jobs WHERE parent_job_id = ? AND fire_instant = ?",
          JOB_COLUMNS
        ))?;
        let mut rows = statement.query_map(params![crawler_job_id, fire_instant], row_to_job)?;
        rows.next().transpose()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find execution");
        anyhow!("Failed to find execution")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Completed jobs whose result blob has outlived its retention window.
  pub async fn find_expired_results(&self, cutoff: NaiveDateTime) -> Result<Vec<Job>> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {} FROM jobs
          WHERE minio_result_path IS NOT NULL AND completed_at < ?
          ",
          JOB_COLUMNS
        ))?;
        let rows = statement
          .query_map(params![cutoff], row_to_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find expired results");
        anyhow!("Failed to find expired results")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Non-terminal jobs whose stored pattern matches exactly or within a
  /// Levenshtein distance of 2. Advisory only; creation is never blocked.
  #[instrument(skip(self))]
  pub async fn find_similar(&self, url_pattern: &str) -> Result<Vec<Job>> {
    let candidates = self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "
          SELECT {} FROM jobs
          WHERE url_pattern IS NOT NULL
            AND status NOT IN ('completed', 'failed', 'cancelled', 'stopped')
          ",
          JOB_COLUMNS
        ))?;
        let rows = statement
          .query_map([], row_to_job)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to find similar jobs");
        anyhow!("Failed to find similar jobs")
      })??;

    let base = url_pattern.split('?').next().unwrap_or(url_pattern);
    Ok(
      candidates
        .into_iter()
        .filter(|job| {
          job
            .url_pattern
            .as_ref()
            .map(|pattern| {
              pattern == url_pattern
                || pattern.split('?').next() == Some(base)
                || strsim::levenshtein(pattern, url_pattern) <= SIMILARITY_MAX_DISTANCE
            })
            .unwrap_or(false)
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    helpers::test::sqlite_connection,
    jobs::job::{CrawlMode, CrawlerConfig, JobBuilder, SourceType},
  };

  fn crawler_config() -> CrawlerConfig {
    CrawlerConfig {
      mode: CrawlMode::PageWithFiltered,
      engine: Default::default(),
      use_proxy: false,
      proxy: None,
      asset_types: vec![],
      file_extensions: vec!["pdf".to_string()],
      pdf_handling: Default::default(),
      max_depth: 1,
      follow_external_links: false,
      retry_enabled: false,
      max_retries: 3,
      retry_strategy: vec![],
      retry_strategy_name: None,
    }
  }

  fn crawler_job(user_id: &str, pattern: &str) -> Job {
    JobBuilder::default()
      .user_id(user_id)
      .job_type(JobType::Crawler)
      .status(JobStatus::Active)
      .source_type(SourceType::Crawler)
      .source_url("https://example.com/docs".to_string())
      .url_pattern(pattern.to_string())
      .name("docs crawler")
      .crawler_config(crawler_config())
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_insert_and_get_round_trip() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    let job = crawler_job("u1", "https://example.com/docs");
    repository.insert(job.clone()).await.unwrap();

    let loaded = repository.get(job.id).await.unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.job_type, JobType::Crawler);
    assert_eq!(loaded.status, JobStatus::Active);
    assert_eq!(
      loaded.crawler_config.unwrap().file_extensions,
      vec!["pdf".to_string()]
    );
    assert_eq!(loaded.version, 0);

    assert!(repository.find(uuid::Uuid::new_v4()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_optimistic_concurrency_conflict() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    let job = crawler_job("u1", "https://example.com/docs");
    repository.insert(job.clone()).await.unwrap();

    let mut first = repository.get(job.id).await.unwrap();
    let mut second = repository.get(job.id).await.unwrap();

    first.name = "renamed".to_string();
    repository.update(&first).await.unwrap();

    second.name = "stale write".to_string();
    let error = repository.update(&second).await.unwrap_err();
    assert!(matches!(
      error.downcast_ref::<CoreError>(),
      Some(CoreError::Conflict(_))
    ));

    let loaded = repository.get(job.id).await.unwrap();
    assert_eq!(loaded.name, "renamed");
    assert_eq!(loaded.version, 1);
  }

  #[tokio::test]
  async fn test_progress_is_monotonic() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    let job = crawler_job("u1", "https://example.com/docs");
    repository.insert(job.clone()).await.unwrap();

    repository.update_progress(job.id, 40.0).await.unwrap();
    repository.update_progress(job.id, 10.0).await.unwrap();
    assert_eq!(repository.get(job.id).await.unwrap().progress, 40.0);
  }

  #[tokio::test]
  async fn test_find_similar() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    repository
      .insert(crawler_job("u1", "https://example.com/a?x=*"))
      .await
      .unwrap();

    // Same pattern, different original query values.
    let matches = repository.find_similar("https://example.com/a?x=*").await.unwrap();
    assert_eq!(matches.len(), 1);

    // Same path with an extra tracking parameter still warns.
    let matches = repository
      .find_similar("https://example.com/a?ref=*&x=*")
      .await
      .unwrap();
    assert_eq!(matches.len(), 1);

    let matches = repository
      .find_similar("https://other.example.com/completely/different")
      .await
      .unwrap();
    assert!(matches.is_empty());

    // Terminal jobs never count as duplicates.
    let mut stopped = crawler_job("u1", "https://example.com/b?x=*");
    stopped.status = JobStatus::Stopped;
    repository.insert(stopped).await.unwrap();
    let matches = repository.find_similar("https://example.com/b?x=*").await.unwrap();
    assert!(matches.is_empty());
  }

  #[tokio::test]
  async fn test_find_active_crawlers_for_rehydration() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    repository
      .insert(crawler_job("u1", "https://example.com/a"))
      .await
      .unwrap();
    let mut paused = crawler_job("u1", "https://example.com/b");
    paused.status = JobStatus::Paused;
    repository.insert(paused).await.unwrap();

    let active = repository.find_active_crawlers().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].status, JobStatus::Active);
  }

  #[tokio::test]
  async fn test_one_execution_row_per_fire_instant() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = JobRepository::new(sqlite);
    let crawler = crawler_job("u1", "https://example.com/docs");
    repository.insert(crawler.clone()).await.unwrap();

    let fire_instant = chrono::Utc::now().naive_utc();
    let execution = |name: &str| {
      JobBuilder::default()
        .user_id("u1")
        .job_type(JobType::Main)
        .status(JobStatus::Processing)
        .source_type(SourceType::Crawler)
        .name(name)
        .parent_job_id(crawler.id)
        .fire_instant(fire_instant)
        .build()
        .unwrap()
    };
    repository.insert(execution("first")).await.unwrap();
    assert!(repository.insert(execution("duplicate")).await.is_err());

    let found = repository
      .find_execution_by_fire_instant(crawler.id, fire_instant)
      .await
      .unwrap();
    assert_eq!(found.unwrap().name, "first");

    let executions = repository.find_crawler_executions(crawler.id).await.unwrap();
    assert_eq!(executions.len(), 1);
  }
}
