use crate::{
  context::ApplicationContext,
  errors::{is_retryable, CoreError},
  files::content_store::{result_key, StoreBucket},
  jobs::{
    job::{Job, JobBuilder, JobStatus, JobType, Page, PageStatus},
    job_interactor::PAGE_RETRY_LIMIT,
  },
  tasks::task::{MergePayload, Task, TaskKind, TaskParametersBuilder},
};
use anyhow::Result;
use chrono::TimeDelta;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Aggregates page markdown in page order once every page is terminal.
/// Deferred while pages are still pending or retry headroom remains, up to
/// the grace period; after that, stragglers count as failed.
#[instrument(skip(task, app_context))]
pub async fn merge(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  let payload: MergePayload = task.payload_as()?;
  let main = match app_context.job_repository.find(payload.main_job_id).await? {
    Some(main) => main,
    None => return Ok(()),
  };
  if matches!(
    main.status,
    JobStatus::Failed | JobStatus::Cancelled | JobStatus::Stopped
  ) {
    return Ok(());
  }

  let pages = app_context
    .page_repository
    .effective_pages(main.id)
    .await?;
  let now = chrono::Utc::now().naive_utc();

  let pending = pages.iter().any(|page| !page.status.is_terminal())
    || (pages.len() as u32) < main.total_pages;
  let retry_headroom = pages
    .iter()
    .any(|page| page.status == PageStatus::Failed && page.retry_count < PAGE_RETRY_LIMIT);

  let mut grace_expired = false;
  if pending || (retry_headroom && main.status == JobStatus::Processing) {
    let last_terminal = pages
      .iter()
      .filter(|page| page.status.is_terminal())
      .map(|page| page.updated_at)
      .max()
      .or(main.started_at)
      .unwrap_or(now);
    let grace = TimeDelta::seconds(app_context.settings.pipeline.merge_grace_seconds as i64);
    if now - last_terminal < grace {
      return defer(&app_context, &task, &payload).await;
    }
    grace_expired = pending;
  }

  let result = run_merge(&app_context, &main, &pages, grace_expired).await;
  match result {
    Ok(()) => Ok(()),
    Err(e) if is_retryable(&e) => Err(e),
    Err(e) => {
      app_context
        .job_interactor
        .record_job_failure(main.id, &e.to_string())
        .await;
      Ok(())
    }
  }
}

/// Re-enqueues the merge check under a fresh id; the current task is acked.
async fn defer(
  app_context: &Arc<ApplicationContext>,
  task: &Task,
  payload: &MergePayload,
) -> Result<()> {
  let delay = app_context.settings.pipeline.merge_retry_delay_seconds as i64;
  let next_execution = chrono::Utc::now().naive_utc() + TimeDelta::seconds(delay.max(1));
  app_context
    .task_repository
    .enqueue(
      TaskParametersBuilder::default()
        .kind(TaskKind::Merge)
        .id(format!(
          "merge:{}:defer:{}",
          payload.main_job_id,
          next_execution.and_utc().timestamp()
        ))
        .payload(task.payload.clone())
        .next_execution(next_execution)
        .overwrite_existing(false)
        .build()?,
    )
    .await
}

async fn find_or_create_merge_job(
  app_context: &Arc<ApplicationContext>,
  main: &Job,
) -> Result<Job> {
  let existing = app_context
    .job_repository
    .find_children(main.id, Some(JobType::Merge))
    .await?;
  if let Some(job) = existing.into_iter().find(|job| !job.status.is_terminal()) {
    return Ok(job);
  }
  let merge_job = JobBuilder::default()
    .user_id(main.user_id.clone())
    .job_type(JobType::Merge)
    .status(JobStatus::Processing)
    .source_type(main.source_type)
    .name(format!("merge {}", main.name))
    .parent_job_id(main.id)
    .started_at(chrono::Utc::now().naive_utc())
    .build()?;
  app_context.job_repository.insert(merge_job.clone()).await?;
  Ok(merge_job)
}

async fn page_markdown(app_context: &Arc<ApplicationContext>, page: &Page) -> Result<String> {
  if let Some(markdown) = &page.markdown_content {
    return Ok(markdown.clone());
  }
  let path = page
    .minio_markdown_path
    .as_ref()
    .ok_or_else(|| CoreError::Fatal(format!("completed page {} has no markdown", page.id)))?;
  let bytes = app_context
    .content_store
    .get(StoreBucket::Pages, path)
    .await
    .map_err(|e| CoreError::Transient(format!("fetching markdown blob: {}", e)))?;
  Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn run_merge(
  app_context: &Arc<ApplicationContext>,
  main: &Job,
  pages: &[Page],
  grace_expired: bool,
) -> Result<()> {
  let merge_job = find_or_create_merge_job(app_context, main).await?;

  let mut parts = Vec::new();
  let mut pages_completed = 0u32;
  for page in pages {
    if page.status == PageStatus::Completed {
      parts.push(page_markdown(app_context, page).await?);
      pages_completed += 1;
    }
  }
  let pages_failed = main.total_pages.saturating_sub(pages_completed);

  let result_path = result_key(main.id);
  if pages_completed > 0 {
    app_context
      .content_store
      .put(
        StoreBucket::Results,
        &result_path,
        parts.join("\n\n").as_bytes(),
        "text/markdown",
      )
      .await
      .map_err(|e| CoreError::Transient(format!("storing merge result: {}", e)))?;
  }

  if grace_expired {
    warn!(
      main_job_id = main.id.to_string().as_str(),
      "Merge grace period expired with pages still pending"
    );
  }

  let updated = app_context
    .job_interactor
    .update_with_retry(main.id, |job| {
      job.pages_completed = pages_completed;
      job.pages_failed = pages_failed;
      if pages_completed > 0 {
        job.minio_result_path = Some(result_path.clone());
      }
      if grace_expired {
        job.error = Some("some pages never reached a terminal status before the merge grace period expired; they were counted as failed".to_string());
      }
      if job.status == JobStatus::Processing {
        // Partial page failure still completes the main; only a whole
        // pipeline wipeout fails it.
        job.status = if pages_completed > 0 {
          JobStatus::Completed
        } else {
          JobStatus::Failed
        };
        if job.status == JobStatus::Failed {
          job.error = Some("all pages failed".to_string());
        }
        job.completed_at = Some(chrono::Utc::now().naive_utc());
      }
      Ok(())
    })
    .await?;
  app_context.job_repository.update_progress(main.id, 100.0).await?;

  let mut merge_job = merge_job;
  merge_job.status = JobStatus::Completed;
  merge_job.completed_at = Some(chrono::Utc::now().naive_utc());
  app_context.job_repository.update(&merge_job).await?;

  app_context.job_interactor.emit_job_event(&updated).await;
  info!(
    main_job_id = main.id.to_string().as_str(),
    pages_completed, pages_failed, "Merge complete"
  );
  Ok(())
}
