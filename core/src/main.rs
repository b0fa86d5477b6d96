use anyhow::Result;
use dotenv::dotenv;
use mimalloc::MiMalloc;
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod context;
mod crawler;
mod errors;
mod files;
mod helpers;
mod jobs;
mod pipeline;
mod progress;
mod scheduler;
mod settings;
mod sqlite;
mod tasks;
mod tracing_setup;
mod urls;

use context::ApplicationContext;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
  dotenv().ok();
  let settings = Arc::new(Settings::new()?);
  tracing_setup::setup_tracing(&settings.tracing)?;

  let app_context = ApplicationContext::init(Arc::clone(&settings)).await?;

  app_context.progress_indexer.run();
  app_context.scheduler.hydrate().await?;
  app_context.scheduler.run();

  pipeline::conversion_jobs::setup_conversion_jobs(Arc::clone(&app_context)).await?;
  crawler::crawler_jobs::setup_crawler_jobs(Arc::clone(&app_context)).await?;

  info!("docmill core started");
  tokio::signal::ctrl_c().await?;
  info!("Shutting down");
  app_context.progress_indexer.flush_all().await?;
  Ok(())
}
