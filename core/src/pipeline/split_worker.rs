use super::pdf;
use crate::{
  context::ApplicationContext,
  errors::{is_retryable, CoreError},
  files::content_store::{page_pdf_key, StoreBucket},
  jobs::job::{Job, JobBuilder, JobStatus, JobType, Page, PageStatus},
  tasks::{
    heartbeat,
    task::{ConvertPagePayload, MergePayload, SplitPdfPayload, Task, TaskKind, TaskParametersBuilder, TaskQueue},
  },
};
use anyhow::Result;
use chrono::TimeDelta;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Splits the uploaded PDF into per-page blobs, creates the page jobs and
/// rows, and fans out one conversion task per page plus the gated merge.
#[instrument(skip(task, app_context))]
pub async fn split_pdf(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  let payload: SplitPdfPayload = task.payload_as()?;
  let main = match app_context.job_repository.find(payload.main_job_id).await? {
    Some(main) => main,
    None => return Ok(()),
  };
  if main.status.is_terminal() {
    return Ok(());
  }
  if main.status == JobStatus::Processing && heartbeat::is_fresh(&app_context.flags, main.id).await? {
    return Ok(());
  }

  let main = app_context
    .job_interactor
    .update_with_retry(main.id, |job| {
      if job.status == JobStatus::Queued {
        job.status = JobStatus::Processing;
        job.started_at = Some(chrono::Utc::now().naive_utc());
      }
      Ok(())
    })
    .await?;
  heartbeat::beat(&app_context.flags, main.id).await?;

  let result = run_split(&app_context, &main).await;
  heartbeat::clear(&app_context.flags, main.id).await.ok();
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

async fn run_split(app_context: &Arc<ApplicationContext>, main: &Job) -> Result<()> {
  // Redelivery after a partial run: the pages already exist, so only the
  // remaining fan-out is repeated. Task ids dedupe the re-enqueues.
  let existing = app_context.page_repository.get_pages(main.id, 0, 0).await?;
  if !existing.is_empty() {
    for page in &existing {
      if !page.status.is_terminal() {
        app_context
          .task_repository
          .enqueue(
            TaskParametersBuilder::default()
              .kind(TaskKind::ConvertPage)
              .id(format!("convert_page:{}", page.job_id))
              .payload(serde_json::to_vec(&ConvertPagePayload {
                page_job_id: page.job_id,
                main_job_id: main.id,
              })?)
              .overwrite_existing(false)
              .build()?,
          )
          .await?;
      }
    }
    return enqueue_merge(app_context, main).await;
  }

  let upload_path = main
    .minio_upload_path
    .clone()
    .ok_or_else(|| CoreError::Fatal("main job has no upload path".to_string()))?;
  let bytes = app_context
    .content_store
    .get(StoreBucket::Uploads, &upload_path)
    .await
    .map_err(|e| CoreError::Transient(format!("fetching upload: {}", e)))?;

  let total_pages =
    pdf::page_count(&bytes).map_err(|e| CoreError::Fatal(format!("corrupt_input: {}", e)))?;
  if total_pages == 0 {
    return Err(CoreError::Fatal("corrupt_input: document has no pages".to_string()).into());
  }
  let max_pages = app_context.settings.pipeline.max_pages_per_document;
  if total_pages > max_pages {
    return Err(
      CoreError::InvalidInput(format!(
        "document has {} pages, the limit is {}",
        total_pages, max_pages
      ))
      .into(),
    );
  }

  let split_job = JobBuilder::default()
    .user_id(main.user_id.clone())
    .job_type(JobType::Split)
    .status(JobStatus::Processing)
    .source_type(main.source_type)
    .name(format!("split {}", main.name))
    .parent_job_id(main.id)
    .started_at(chrono::Utc::now().naive_utc())
    .build()?;
  app_context.job_repository.insert(split_job.clone()).await?;

  let mut page_jobs = Vec::with_capacity(total_pages as usize);
  let mut pages = Vec::with_capacity(total_pages as usize);
  for page_number in 1..=total_pages {
    let page_bytes = pdf::extract_page(&bytes, page_number)
      .map_err(|e| CoreError::Fatal(format!("corrupt_input: {}", e)))?;
    let key = page_pdf_key(main.id, page_number);
    app_context
      .content_store
      .put(StoreBucket::Pages, &key, &page_bytes, "application/pdf")
      .await
      .map_err(|e| CoreError::Transient(format!("storing page blob: {}", e)))?;

    let page_job = JobBuilder::default()
      .user_id(main.user_id.clone())
      .job_type(JobType::Page)
      .status(JobStatus::Queued)
      .source_type(main.source_type)
      .name(format!("page {}", page_number))
      .parent_job_id(main.id)
      .build()?;
    pages.push(Page {
      id: Uuid::new_v4(),
      job_id: page_job.id,
      page_number,
      status: PageStatus::Queued,
      minio_page_path: Some(key),
      minio_markdown_path: None,
      markdown_content: None,
      error: None,
      retry_count: 0,
      updated_at: chrono::Utc::now().naive_utc(),
    });
    page_jobs.push(page_job);
  }
  app_context.job_repository.insert_many(page_jobs.clone()).await?;
  app_context.page_repository.upsert_pages(pages).await?;

  app_context
    .job_interactor
    .update_with_retry(main.id, |job| {
      job.total_pages = total_pages;
      Ok(())
    })
    .await?;
  app_context.job_repository.update_progress(main.id, 10.0).await?;

  // Backpressure: a deep conversion queue spreads the fan-out instead of
  // dumping every page at once.
  let depth = app_context
    .task_repository
    .queue_depth(TaskQueue::Conversion)
    .await?;
  let stagger = depth > app_context.settings.pipeline.queue_backpressure_threshold;
  let now = chrono::Utc::now().naive_utc();
  for (index, page_job) in page_jobs.iter().enumerate() {
    let next_execution = if stagger {
      now + TimeDelta::seconds(index as i64)
    } else {
      now
    };
    app_context
      .task_repository
      .enqueue(
        TaskParametersBuilder::default()
          .kind(TaskKind::ConvertPage)
          .id(format!("convert_page:{}", page_job.id))
          .payload(serde_json::to_vec(&ConvertPagePayload {
            page_job_id: page_job.id,
            main_job_id: main.id,
          })?)
          .next_execution(next_execution)
          .overwrite_existing(false)
          .build()?,
      )
      .await?;
  }

  let mut split_job = split_job;
  split_job.status = JobStatus::Completed;
  split_job.completed_at = Some(chrono::Utc::now().naive_utc());
  app_context.job_repository.update(&split_job).await?;

  // The merge is gated on every page reaching a terminal status; the worker
  // defers itself until then.
  enqueue_merge(app_context, main).await?;

  info!(
    main_job_id = main.id.to_string().as_str(),
    total_pages, "Split fan-out complete"
  );
  Ok(())
}

async fn enqueue_merge(app_context: &Arc<ApplicationContext>, main: &Job) -> Result<()> {
  app_context
    .task_repository
    .enqueue(
      TaskParametersBuilder::default()
        .kind(TaskKind::Merge)
        .id(format!("merge:{}", main.id))
        .payload(serde_json::to_vec(&MergePayload {
          main_job_id: main.id,
        })?)
        .next_execution(chrono::Utc::now().naive_utc() + TimeDelta::seconds(5))
        .overwrite_existing(false)
        .build()?,
    )
    .await
}
