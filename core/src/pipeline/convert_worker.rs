use super::converter::ConverterError;
use crate::{
  context::ApplicationContext,
  errors::{is_retryable, CoreError},
  files::content_store::{page_markdown_key, StoreBucket},
  jobs::job::{JobStatus, Page, PageStatus},
  tasks::task::{ConvertPagePayload, MergePayload, Task, TaskKind, TaskParametersBuilder},
};
use anyhow::Result;
use std::sync::Arc;
use tracing::instrument;

const CONVERT_TRANSIENT_ATTEMPTS: u32 = 3;

/// Converts a single page blob to markdown. Short output is inlined on the
/// page row; long output goes to the blob store with the row holding the
/// pointer.
#[instrument(skip(task, app_context))]
pub async fn convert_page(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  let payload: ConvertPagePayload = task.payload_as()?;
  let page = match app_context
    .page_repository
    .find_by_job(payload.page_job_id)
    .await?
  {
    Some(page) => page,
    None => return Ok(()),
  };
  if page.status.is_terminal() {
    return Ok(());
  }

  app_context
    .job_interactor
    .update_with_retry(payload.page_job_id, |job| {
      if job.status == JobStatus::Queued {
        job.status = JobStatus::Processing;
        job.started_at = Some(chrono::Utc::now().naive_utc());
      }
      Ok(())
    })
    .await?;

  let mut page = page;
  page.status = PageStatus::Processing;
  app_context.page_repository.upsert_pages(vec![page.clone()]).await?;

  let result = run_conversion(&app_context, &task, &mut page).await;
  match result {
    Ok(()) => {}
    Err(e) if is_retryable(&e) => {
      // Put the page back for redelivery before surfacing the error.
      page.status = PageStatus::Queued;
      app_context.page_repository.upsert_pages(vec![page]).await?;
      return Err(e);
    }
    Err(e) => {
      page.status = PageStatus::Failed;
      page.error = Some(e.to_string());
      app_context.page_repository.upsert_pages(vec![page.clone()]).await?;
    }
  }

  let terminal_status = match page.status {
    PageStatus::Completed => JobStatus::Completed,
    _ => JobStatus::Failed,
  };
  app_context
    .job_interactor
    .update_with_retry(payload.page_job_id, |job| {
      if job.status.can_transition_to(terminal_status) {
        job.status = terminal_status;
        job.completed_at = Some(chrono::Utc::now().naive_utc());
        job.error = page.error.clone();
      }
      Ok(())
    })
    .await?;

  update_main_progress(&app_context, payload.main_job_id).await?;

  // A page reaching a terminal status re-arms the merge check.
  app_context
    .task_repository
    .enqueue(
      TaskParametersBuilder::default()
        .kind(TaskKind::Merge)
        .id(format!("merge:{}:{}", payload.main_job_id, payload.page_job_id))
        .payload(serde_json::to_vec(&MergePayload {
          main_job_id: payload.main_job_id,
        })?)
        .overwrite_existing(false)
        .build()?,
    )
    .await?;

  Ok(())
}

async fn run_conversion(
  app_context: &Arc<ApplicationContext>,
  task: &Task,
  page: &mut Page,
) -> Result<()> {
  let page_path = page
    .minio_page_path
    .clone()
    .ok_or_else(|| CoreError::Fatal("page has no source blob".to_string()))?;
  let bytes = app_context
    .content_store
    .get(StoreBucket::Pages, &page_path)
    .await
    .map_err(|e| CoreError::Transient(format!("fetching page blob: {}", e)))?;

  let conversion = match app_context.converter.convert(&bytes, Some("pdf")).await {
    Ok(conversion) => conversion,
    Err(ConverterError::Timeout) if task.attempts < CONVERT_TRANSIENT_ATTEMPTS => {
      return Err(CoreError::Transient("converter timed out".to_string()).into());
    }
    Err(ConverterError::Timeout) => {
      return Err(CoreError::Fatal("timeout: converter kept timing out".to_string()).into());
    }
    Err(ConverterError::UnsupportedFormat(format)) => {
      return Err(CoreError::Fatal(format!("unsupported_format: {}", format)).into());
    }
    Err(ConverterError::CorruptInput(message)) => {
      return Err(CoreError::Fatal(format!("corrupt_input: {}", message)).into());
    }
  };

  let inline_limit = app_context.settings.pipeline.inline_markdown_max_bytes as usize;
  if conversion.markdown.len() <= inline_limit {
    page.markdown_content = Some(conversion.markdown);
    page.minio_markdown_path = None;
  } else {
    let page_job = app_context.job_repository.get(page.job_id).await?;
    let main_job_id = page_job
      .parent_job_id
      .ok_or_else(|| CoreError::Fatal("page job has no parent".to_string()))?;
    let key = page_markdown_key(main_job_id, page.page_number);
    app_context
      .content_store
      .put(
        StoreBucket::Pages,
        &key,
        conversion.markdown.as_bytes(),
        "text/markdown",
      )
      .await
      .map_err(|e| CoreError::Transient(format!("storing markdown blob: {}", e)))?;
    page.markdown_content = None;
    page.minio_markdown_path = Some(key);
  }
  page.status = PageStatus::Completed;
  page.error = None;
  app_context.page_repository.upsert_pages(vec![page.clone()]).await?;
  Ok(())
}

async fn update_main_progress(
  app_context: &Arc<ApplicationContext>,
  main_job_id: uuid::Uuid,
) -> Result<()> {
  let main = match app_context.job_repository.find(main_job_id).await? {
    Some(main) => main,
    None => return Ok(()),
  };
  if main.total_pages == 0 {
    return Ok(());
  }
  let pages = app_context.page_repository.effective_pages(main_job_id).await?;
  let terminal = pages.iter().filter(|page| page.status.is_terminal()).count();
  let progress = 10.0 + 85.0 * terminal as f64 / main.total_pages as f64;
  app_context
    .job_repository
    .update_progress(main_job_id, progress.min(95.0))
    .await
}
