use crate::{
  jobs::{
    crawled_file_repository::CrawledFileRepository,
    job::{CrawledFile, CrawledFileStatus, Job, JobStatus},
    job_repository::JobRepository,
  },
  tasks::{task::TaskQueue, task_repository::TaskRepository},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

pub struct CrawlerMonitor {
  pub status: JobStatus,
  pub queue_depth: u32,
  pub executions_succeeded: u32,
  pub executions_failed: u32,
  pub recent_executions: Vec<Job>,
  pub files_downloaded: u32,
  pub files_failed: u32,
}

/// Read-side view over a crawler job: status, queue pressure, recent
/// executions and their file outcomes.
pub struct CrawlerInteractor {
  job_repository: Arc<JobRepository>,
  crawled_file_repository: Arc<CrawledFileRepository>,
  task_repository: Arc<TaskRepository>,
}

impl CrawlerInteractor {
  pub fn new(
    job_repository: Arc<JobRepository>,
    crawled_file_repository: Arc<CrawledFileRepository>,
    task_repository: Arc<TaskRepository>,
  ) -> Self {
    Self {
      job_repository,
      crawled_file_repository,
      task_repository,
    }
  }

  pub async fn list_files(&self, execution_id: Uuid) -> Result<Vec<CrawledFile>> {
    self.crawled_file_repository.list_by_execution(execution_id).await
  }

  #[instrument(skip(self))]
  pub async fn get_monitor(&self, crawler_job_id: Uuid) -> Result<CrawlerMonitor> {
    let crawler = self.job_repository.get(crawler_job_id).await?;
    let queue_depth = self.task_repository.queue_depth(TaskQueue::Crawler).await?;
    let recent_executions = self
      .job_repository
      .find_crawler_executions(crawler_job_id)
      .await?
      .into_iter()
      .take(10)
      .collect::<Vec<_>>();

    let mut files_downloaded = 0;
    let mut files_failed = 0;
    for execution in &recent_executions {
      for file in self
        .crawled_file_repository
        .list_by_execution(execution.id)
        .await?
      {
        match file.status {
          CrawledFileStatus::Downloaded => files_downloaded += 1,
          CrawledFileStatus::Failed => files_failed += 1,
          CrawledFileStatus::Skipped => {}
        }
      }
    }

    Ok(CrawlerMonitor {
      status: crawler.status,
      queue_depth,
      executions_succeeded: crawler.pages_completed,
      executions_failed: crawler.pages_failed,
      recent_executions,
      files_downloaded,
      files_failed,
    })
  }
}
