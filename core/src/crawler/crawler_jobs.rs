use super::crawler_worker;
use crate::{
  context::ApplicationContext,
  task_executor,
  tasks::{
    task::{Task, TaskKind, TaskQueue},
    task_processor::TaskProcessorBuilder,
  },
};
use anyhow::{bail, Result};
use std::{sync::Arc, time::Duration};

async fn run_crawler_task(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  match task.kind {
    TaskKind::ExecuteCrawler => crawler_worker::execute_crawler(task, app_context).await,
    _ => bail!("only crawler executions belong on the crawler queue"),
  }
}

pub async fn setup_crawler_jobs(app_context: Arc<ApplicationContext>) -> Result<()> {
  let processor = Arc::new(
    TaskProcessorBuilder::default()
      .queue(TaskQueue::Crawler)
      .app_context(Arc::clone(&app_context))
      .executor(task_executor!(run_crawler_task))
      .concurrency(app_context.settings.crawler.pool_size)
      .claim_duration(Duration::from_secs(
        app_context.settings.crawler.claim_ttl_seconds as u64,
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
  Ok(())
}
