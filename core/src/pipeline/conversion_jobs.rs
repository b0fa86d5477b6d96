use super::{convert_worker, merge_worker, split_worker};
use crate::{
  context::ApplicationContext,
  files::content_store::StoreBucket,
  task_executor,
  tasks::{
    task::{Task, TaskKind, TaskParametersBuilder, TaskQueue},
    task_processor::TaskProcessorBuilder,
  },
};
use anyhow::{bail, Result};
use chrono::TimeDelta;
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument};

async fn run_conversion_task(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  match task.kind {
    TaskKind::SplitPdf => split_worker::split_pdf(task, app_context).await,
    TaskKind::ConvertPage => convert_worker::convert_page(task, app_context).await,
    TaskKind::Merge => merge_worker::merge(task, app_context).await,
    TaskKind::Housekeeping => housekeeping(task, app_context).await,
    TaskKind::ExecuteCrawler => bail!("crawler tasks do not belong on the conversion queue"),
  }
}

/// Recurring sweep: expired metric documents, stale runtime flags, and
/// result blobs past their TTL.
#[instrument(skip_all)]
async fn housekeeping(_task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  let expired_documents = app_context.document_store.delete_expired().await?;
  let expired_flags = app_context.flags.purge_expired().await?;

  let ttl = TimeDelta::seconds(app_context.settings.pipeline.result_ttl_seconds as i64);
  let cutoff = chrono::Utc::now().naive_utc() - ttl;
  let expired_jobs = app_context.job_repository.find_expired_results(cutoff).await?;
  let expired_results = expired_jobs.len();
  for job in expired_jobs {
    if let Some(result_path) = &job.minio_result_path {
      app_context
        .content_store
        .delete(StoreBucket::Results, result_path)
        .await?;
    }
    app_context
      .job_interactor
      .update_with_retry(job.id, |job| {
        job.minio_result_path = None;
        Ok(())
      })
      .await?;
  }

  info!(
    expired_documents,
    expired_flags, expired_results, "Housekeeping sweep complete"
  );
  Ok(())
}

pub async fn setup_conversion_jobs(app_context: Arc<ApplicationContext>) -> Result<()> {
  let processor = Arc::new(
    TaskProcessorBuilder::default()
      .queue(TaskQueue::Conversion)
      .app_context(Arc::clone(&app_context))
      .executor(task_executor!(run_conversion_task))
      .concurrency(app_context.settings.pipeline.pool_size)
      .claim_duration(Duration::from_secs(
        app_context.settings.pipeline.claim_ttl_seconds as u64,
      ))
      .soft_timeout(Duration::from_secs(
        app_context.settings.tasks.soft_timeout_seconds as u64,
      ))
      .hard_timeout(Duration::from_secs(
        app_context.settings.tasks.hard_timeout_seconds as u64,
      ))
      .build()?,
  );
  processor
    .run(Arc::clone(&app_context.task_repository))
    .await?;

  let interval = TimeDelta::seconds(app_context.settings.pipeline.sweep_interval_seconds as i64);
  app_context
    .task_repository
    .enqueue(
      TaskParametersBuilder::default()
        .kind(TaskKind::Housekeeping)
        .id("housekeeping".to_string())
        .interval(interval)
        .next_execution(chrono::Utc::now().naive_utc() + interval)
        .overwrite_existing(false)
        .build()?,
    )
    .await?;
  Ok(())
}
