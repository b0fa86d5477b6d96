use super::{
  engine::{matches_extension, CrawlEngine, FetchError},
  headless_engine::HeadlessBrowserEngine,
  html_parser_engine::{file_name_for, HtmlParserEngine},
  progress_tracker::ProgressTracker,
  retry_engine::{resolve_strategy, run_with_strategy, AttemptFailure, RetryRun},
  robots::RobotsChecker,
};
use crate::{
  context::ApplicationContext,
  errors::{truncate_error_message, CoreError},
  files::content_store::{
    crawled_asset_key, crawled_file_key, crawled_merged_key, crawled_page_key, StoreBucket,
  },
  jobs::job::{
    CrawlMode, CrawledFile, CrawledFileStatus, EngineKind, Job, JobBuilder, JobStatus, JobType,
    PdfHandling, ProxyConfig, RetryStrategyEntry, SourceType,
  },
  pipeline::pdf,
  progress::progress_indexer::{MetricStream, RetryMetricDocument},
  settings::ProxySettings,
  tasks::{
    heartbeat,
    task::{ExecuteCrawlerPayload, Task},
  },
  urls,
};
use anyhow::Result;
use futures::StreamExt;
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

const PRESIGN_TTL_SECONDS: u32 = 7 * 24 * 3600;

impl From<ProxySettings> for ProxyConfig {
  fn from(settings: ProxySettings) -> Self {
    ProxyConfig {
      host: settings.host,
      port: settings.port,
      protocol: settings.protocol,
      username: settings.username,
      password: settings.password,
    }
  }
}

fn is_unique_violation(error: &anyhow::Error) -> bool {
  matches!(
    error.downcast_ref::<rusqlite::Error>(),
    Some(rusqlite::Error::SqliteFailure(failure, _))
      if failure.code == rusqlite::ErrorCode::ConstraintViolation
  )
}

#[derive(Debug, Default, Clone)]
struct CrawlStats {
  pages: u32,
  files_downloaded: u32,
  files_failed: u32,
  files_skipped: u32,
}

/// Runs one crawler execution end to end: attempt loop via the retry
/// engine, idempotent against duplicate triggers for the same fire instant.
#[instrument(skip(task, app_context))]
pub async fn execute_crawler(task: Task, app_context: Arc<ApplicationContext>) -> Result<()> {
  let payload: ExecuteCrawlerPayload = task.payload_as()?;
  let crawler = match app_context.job_repository.find(payload.crawler_job_id).await? {
    Some(crawler) => crawler,
    // Crawler deleted since the trigger was queued: discard.
    None => return Ok(()),
  };
  let runnable = match crawler.status {
    JobStatus::Active => true,
    JobStatus::Paused => payload.manual,
    _ => false,
  };
  if !runnable {
    info!(
      crawler_job_id = crawler.id.to_string().as_str(),
      status = crawler.status.to_string().as_str(),
      "Discarding trigger for inactive crawler"
    );
    return Ok(());
  }

  if app_context
    .job_repository
    .find_execution_by_fire_instant(crawler.id, payload.fire_instant)
    .await?
    .is_some()
  {
    return Ok(());
  }

  let execution = JobBuilder::default()
    .user_id(crawler.user_id.clone())
    .job_type(JobType::Main)
    .status(JobStatus::Processing)
    .source_type(SourceType::Crawler)
    .source_url(crawler.source_url.clone())
    .name(format!("{} @ {}", crawler.name, payload.fire_instant))
    .parent_job_id(crawler.id)
    .fire_instant(payload.fire_instant)
    .started_at(chrono::Utc::now().naive_utc())
    .build()?;
  if let Err(e) = app_context.job_repository.insert(execution.clone()).await {
    if is_unique_violation(&e) {
      // A concurrent duplicate won the race; this trigger has no effects.
      return Ok(());
    }
    return Err(e);
  }
  heartbeat::beat(&app_context.flags, execution.id).await?;

  let config = crawler
    .crawler_config
    .clone()
    .ok_or_else(|| CoreError::Fatal("crawler job without config".to_string()))?;
  let default_engine = app_context
    .settings
    .crawler
    .default_engine
    .parse::<EngineKind>()
    .unwrap_or_default();
  let strategy = resolve_strategy(
    &config,
    app_context.settings.crawler.max_retries,
    default_engine,
  );
  let tracker = Arc::new(ProgressTracker::new(
    execution.id,
    Arc::clone(&app_context.job_repository),
    Arc::clone(&app_context.progress_indexer),
  ));

  let run = run_with_strategy(
    &strategy,
    |entry| {
      let app_context = Arc::clone(&app_context);
      let execution = execution.clone();
      let config = config.clone();
      let tracker = Arc::clone(&tracker);
      async move { run_attempt(app_context, execution, config, entry, tracker).await }
    },
    || {
      let app_context = Arc::clone(&app_context);
      let execution_id = execution.id;
      async move { execution_cancelled(&app_context, execution_id).await }
    },
  )
  .await;

  finalize_execution(&app_context, &crawler, &execution, &run, &tracker).await?;
  heartbeat::clear(&app_context.flags, execution.id).await.ok();
  Ok(())
}

async fn execution_cancelled(app_context: &Arc<ApplicationContext>, execution_id: Uuid) -> bool {
  match app_context.job_repository.find(execution_id).await {
    Ok(Some(job)) => job.status == JobStatus::Cancelled,
    _ => false,
  }
}

async fn finalize_execution(
  app_context: &Arc<ApplicationContext>,
  crawler: &Job,
  execution: &Job,
  run: &RetryRun<CrawlStats>,
  tracker: &Arc<ProgressTracker>,
) -> Result<()> {
  let stats = run.outcome.clone().unwrap_or_default();
  if run.succeeded() {
    tracker.set_progress(100.0).await?;
  }
  tracker.finish().await?;

  for entry in &run.history {
    app_context
      .progress_indexer
      .publish(
        MetricStream::RetryMetrics,
        &RetryMetricDocument {
          execution_id: execution.id,
          attempt: entry.attempt,
          engine: entry.engine,
          use_proxy: entry.use_proxy,
          status: entry.status,
          error_type: entry.error_type,
          duration_seconds: entry.duration_seconds,
          timestamp: entry.completed_at,
        },
      )
      .await;
  }

  let history = run.history.clone();
  let engine_used = run.engine_used;
  let proxy_used = run.proxy_used;
  let succeeded = run.succeeded();
  let was_cancelled = run.cancelled;
  let files_skipped = stats.files_skipped;
  let failure_summary = truncate_error_message(&run.failure_summary());
  let updated = app_context
    .job_interactor
    .update_with_retry(execution.id, move |job| {
      job.retry_history = history.clone();
      job.engine_used = engine_used;
      job.proxy_used = proxy_used;
      job.total_pages = stats.pages;
      job.pages_completed = stats.files_downloaded;
      job.pages_failed = stats.files_failed;
      if job.status == JobStatus::Processing {
        job.status = if was_cancelled {
          JobStatus::Cancelled
        } else if succeeded {
          JobStatus::Completed
        } else {
          job.error = Some(failure_summary.clone());
          JobStatus::Failed
        };
        job.completed_at = Some(chrono::Utc::now().naive_utc());
      }
      Ok(())
    })
    .await?;

  app_context
    .job_interactor
    .update_with_retry(crawler.id, |job| {
      if succeeded {
        job.pages_completed += 1;
      } else if !was_cancelled {
        job.pages_failed += 1;
      }
      Ok(())
    })
    .await?;

  app_context.job_interactor.emit_job_event(&updated).await;
  if let Err(e) = app_context.progress_indexer.flush_all().await {
    warn!(message = e.to_string(), "Final metric flush failed");
  }
  info!(
    execution_id = execution.id.to_string().as_str(),
    status = updated.status.to_string().as_str(),
    attempts = updated.retry_history.len(),
    files_downloaded = updated.pages_completed,
    files_failed = updated.pages_failed,
    files_skipped,
    "Crawler execution finished"
  );
  Ok(())
}

async fn build_engine(
  app_context: &Arc<ApplicationContext>,
  config_proxy: Option<ProxyConfig>,
  entry: &RetryStrategyEntry,
) -> Result<Arc<dyn CrawlEngine>, FetchError> {
  let proxy = if entry.use_proxy {
    config_proxy.or_else(|| {
      app_context
        .settings
        .crawler
        .proxy
        .clone()
        .map(ProxyConfig::from)
    })
  } else {
    None
  };
  match entry.engine {
    EngineKind::HtmlParser => Ok(Arc::new(HtmlParserEngine::new(
      app_context.settings.crawler.clone(),
      proxy,
    )?)),
    EngineKind::HeadlessBrowser => Ok(Arc::new(
      HeadlessBrowserEngine::new(app_context.settings.crawler.clone(), proxy).await?,
    )),
  }
}

async fn run_attempt(
  app_context: Arc<ApplicationContext>,
  execution: Job,
  config: crate::jobs::job::CrawlerConfig,
  entry: RetryStrategyEntry,
  tracker: Arc<ProgressTracker>,
) -> Result<CrawlStats, AttemptFailure> {
  tracker.reset_for_attempt().await;
  let engine = build_engine(&app_context, config.proxy.clone(), &entry).await?;
  let result = crawl_once(&app_context, &execution, &config, engine.as_ref(), &tracker).await;
  engine.close().await.ok();
  result
}

struct DownloadedArtifact {
  row_id: Uuid,
  filename: String,
  local_path: PathBuf,
  is_pdf: bool,
}

async fn crawl_once(
  app_context: &Arc<ApplicationContext>,
  execution: &Job,
  config: &crate::jobs::job::CrawlerConfig,
  engine: &dyn CrawlEngine,
  tracker: &Arc<ProgressTracker>,
) -> Result<CrawlStats, AttemptFailure> {
  let temp_dir =
    tempfile::tempdir().map_err(|e| AttemptFailure::internal(format!("temp dir: {}", e)))?;
  let mut stats = CrawlStats::default();

  let seed_raw = execution
    .source_url
    .clone()
    .ok_or_else(|| AttemptFailure::internal("execution has no seed url".to_string()))?;
  let seed = Url::parse(&seed_raw)
    .map_err(|e| AttemptFailure::internal(format!("bad seed url: {}", e)))?;

  let robots_client = reqwest::Client::builder()
    .user_agent(app_context.settings.crawler.user_agent.clone())
    .build()
    .map_err(|e| AttemptFailure::internal(e.to_string()))?;
  let robots = RobotsChecker::new(
    robots_client,
    app_context.settings.crawler.user_agent.clone(),
    app_context.settings.crawler.respect_robots_txt,
  );

  let cancelled_guard = || async {
    if execution_cancelled(app_context, execution.id).await {
      Err(AttemptFailure::cancelled())
    } else {
      Ok(())
    }
  };

  // Discover: fetch pages, collect outgoing links and asset references.
  let mut pages: Vec<(Url, String)> = Vec::new();
  let mut discovered_links: Vec<Url> = Vec::new();
  let mut visited: HashSet<String> = HashSet::new();
  let mut frontier: std::collections::VecDeque<(Url, u32)> =
    std::collections::VecDeque::from([(seed.clone(), 0)]);
  let crawl_depth = match config.mode {
    CrawlMode::FullWebsite => config.max_depth,
    _ => 0,
  };

  while let Some((url, depth)) = frontier.pop_front() {
    cancelled_guard().await?;
    if !visited.insert(url.to_string()) {
      continue;
    }
    if !robots.allowed(&url).await {
      if url == seed {
        return Err(AttemptFailure::from(FetchError::Status(403)));
      }
      continue;
    }

    let page = match engine.crawl_page(&url, &[]).await {
      Ok(page) => page,
      Err(e) if url == seed => return Err(e.into()),
      Err(e) => {
        warn!(
          message = e.to_string(),
          url = url.to_string().as_str(),
          "Failed to crawl discovered page"
        );
        tracker.record_error().await.ok();
        continue;
      }
    };
    tracker.record_page().await.ok();
    stats.pages += 1;

    // Every discovered reference goes through the normalizer's rejection
    // list, not just the seed.
    let safe_links: Vec<Url> = page
      .links
      .iter()
      .filter_map(|link| urls::normalize(link.as_str()).ok())
      .filter_map(|normalized| Url::parse(&normalized).ok())
      .filter(|link| {
        config.follow_external_links || link.host_str() == seed.host_str()
      })
      .collect();

    if depth < crawl_depth {
      for link in &safe_links {
        if !matches_extension(link, &config.file_extensions) {
          frontier.push_back((link.clone(), depth + 1));
        }
      }
    }
    discovered_links.extend(safe_links);
    pages.push((url, page.html));
  }
  tracker.set_progress(10.0).await.ok();

  // Filter: restrict to the configured extensions and asset types.
  let mut file_targets: Vec<Url> = Vec::new();
  let mut seen_files: HashSet<String> = HashSet::new();
  if matches!(
    config.mode,
    CrawlMode::PageWithFiltered | CrawlMode::FullWebsite
  ) && !config.file_extensions.is_empty()
  {
    for link in &discovered_links {
      if matches_extension(link, &config.file_extensions) && seen_files.insert(link.to_string()) {
        file_targets.push(link.clone());
      }
    }
  }

  let asset_types = if matches!(config.mode, CrawlMode::PageWithAll | CrawlMode::FullWebsite) {
    if config.asset_types.is_empty() {
      vec![
        crate::jobs::job::AssetType::Css,
        crate::jobs::job::AssetType::Js,
        crate::jobs::job::AssetType::Images,
        crate::jobs::job::AssetType::Fonts,
        crate::jobs::job::AssetType::Videos,
        crate::jobs::job::AssetType::Documents,
      ]
    } else {
      config.asset_types.clone()
    }
  } else {
    vec![]
  };
  let mut asset_targets: std::collections::HashMap<crate::jobs::job::AssetType, Vec<Url>> =
    std::collections::HashMap::new();
  for (page_url, html) in &pages {
    for (asset_type, asset_urls) in engine.extract_assets(html, page_url, &asset_types) {
      let entry = asset_targets.entry(asset_type).or_default();
      for asset_url in asset_urls {
        let Ok(normalized) = urls::normalize(asset_url.as_str()) else {
          continue;
        };
        let Ok(asset_url) = Url::parse(&normalized) else {
          continue;
        };
        if !config.follow_external_links && asset_url.host_str() != seed.host_str() {
          continue;
        }
        if !entry.contains(&asset_url) {
          entry.push(asset_url);
        }
      }
    }
  }
  tracker.set_progress(20.0).await.ok();
  cancelled_guard().await?;

  // Download: bounded-concurrency fetch of the selected files.
  let files_dir = temp_dir.path().join("files");
  tokio::fs::create_dir_all(&files_dir)
    .await
    .map_err(|e| AttemptFailure::internal(e.to_string()))?;
  let mut artifacts: Vec<DownloadedArtifact> = Vec::new();

  let mut robots_allowed_targets = Vec::new();
  for url in file_targets {
    if robots.allowed(&url).await {
      robots_allowed_targets.push(url);
    } else {
      stats.files_skipped += 1;
      record_crawled_file(
        app_context,
        execution.id,
        &url,
        CrawledFileStatus::Skipped,
        None,
        Some("disallowed by robots.txt".to_string()),
      )
      .await;
    }
  }

  let downloads = futures::stream::iter(robots_allowed_targets.into_iter().enumerate())
    .map(|(index, url): (usize, Url)| {
      let dest = files_dir.join(format!("{:03}_{}", index, file_name_for(&url)));
      async move { (url.clone(), dest.clone(), engine.download(&url, &dest).await) }
    })
    .buffer_unordered(app_context.settings.crawler.max_concurrent_downloads.max(1) as usize)
    .collect::<Vec<_>>()
    .await;

  for (url, dest, result) in downloads {
    cancelled_guard().await?;
    match result {
      Ok(file) => {
        stats.files_downloaded += 1;
        tracker.record_file(file.size_bytes).await.ok();
        let row_id = record_crawled_file_row(
          app_context,
          execution.id,
          &url,
          CrawledFile {
            id: Uuid::new_v4(),
            execution_id: execution.id,
            url: url.to_string(),
            filename: file_name_for(&url),
            file_type: super::engine::classify_extension(&url),
            mime_type: file.mime_type.clone(),
            size_bytes: file.size_bytes,
            minio_path: None,
            public_url: None,
            status: CrawledFileStatus::Downloaded,
            error: None,
            downloaded_at: Some(chrono::Utc::now().naive_utc()),
          },
        )
        .await;
        if let Some(row_id) = row_id {
          artifacts.push(DownloadedArtifact {
            row_id,
            filename: file_name_for(&url),
            is_pdf: super::engine::classify_extension(&url) == "pdf",
            local_path: dest,
          });
        }
      }
      Err(e) => {
        stats.files_failed += 1;
        tracker.record_error().await.ok();
        record_crawled_file(
          app_context,
          execution.id,
          &url,
          CrawledFileStatus::Failed,
          None,
          Some(e.to_string()),
        )
        .await;
      }
    }
  }

  let assets_dir = temp_dir.path().join("assets");
  let downloaded_assets = if asset_targets.is_empty() {
    Default::default()
  } else {
    tokio::fs::create_dir_all(&assets_dir)
      .await
      .map_err(|e| AttemptFailure::internal(e.to_string()))?;
    engine.download_assets(&asset_targets, &assets_dir).await?
  };
  tracker.set_progress(70.0).await.ok();
  cancelled_guard().await?;

  // PDF handling: merge valid PDFs in discovery order with one bookmark per
  // source. Corrupt files are skipped inside the merge, never fatal.
  let mut merged_pdf: Option<PathBuf> = None;
  let pdf_artifacts: Vec<&DownloadedArtifact> =
    artifacts.iter().filter(|artifact| artifact.is_pdf).collect();
  if matches!(config.pdf_handling, PdfHandling::Combined | PdfHandling::Both)
    && !pdf_artifacts.is_empty()
  {
    let mut sources = Vec::new();
    for artifact in &pdf_artifacts {
      match tokio::fs::read(&artifact.local_path).await {
        Ok(bytes) => sources.push((artifact.filename.clone(), bytes)),
        Err(e) => warn!(
          message = e.to_string(),
          file = artifact.filename.as_str(),
          "Could not read downloaded pdf for merge"
        ),
      }
    }
    match pdf::merge_documents(sources) {
      Ok(merged) => {
        let path = temp_dir.path().join("merged.pdf");
        tokio::fs::write(&path, merged)
          .await
          .map_err(|e| AttemptFailure::internal(e.to_string()))?;
        merged_pdf = Some(path);
      }
      Err(e) => warn!(message = e.to_string(), "Pdf merge produced no output"),
    }
  }
  tracker.set_progress(80.0).await.ok();
  cancelled_guard().await?;

  // Publish: upload every artifact under crawled/{execution_id}/ and record
  // blob paths and public URLs.
  for (page_url, html) in &pages {
    let key = crawled_page_key(execution.id, &format!("{}.html", file_name_for(page_url)));
    app_context
      .content_store
      .put(StoreBucket::Crawled, &key, html.as_bytes(), "text/html")
      .await
      .map_err(|e| AttemptFailure::internal(format!("publishing page: {}", e)))?;
  }

  for (asset_type, paths) in &downloaded_assets {
    for path in paths {
      let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "asset".to_string());
      let key = crawled_asset_key(execution.id, &asset_type.to_string(), &name);
      let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AttemptFailure::internal(e.to_string()))?;
      app_context
        .content_store
        .put(StoreBucket::Crawled, &key, &bytes, "application/octet-stream")
        .await
        .map_err(|e| AttemptFailure::internal(format!("publishing asset: {}", e)))?;
    }
  }

  for artifact in &artifacts {
    let key = crawled_file_key(execution.id, &artifact.filename);
    let bytes = tokio::fs::read(&artifact.local_path)
      .await
      .map_err(|e| AttemptFailure::internal(e.to_string()))?;
    app_context
      .content_store
      .put(StoreBucket::Crawled, &key, &bytes, "application/octet-stream")
      .await
      .map_err(|e| AttemptFailure::internal(format!("publishing file: {}", e)))?;
    let public_url = app_context
      .content_store
      .presigned_get(StoreBucket::Crawled, &key, PRESIGN_TTL_SECONDS)
      .await
      .ok();
    publish_crawled_file(app_context, artifact.row_id, key, public_url).await;
  }

  if let Some(path) = &merged_pdf {
    let key = crawled_merged_key(execution.id, "combined");
    let bytes = tokio::fs::read(path)
      .await
      .map_err(|e| AttemptFailure::internal(e.to_string()))?;
    app_context
      .content_store
      .put(StoreBucket::Crawled, &key, &bytes, "application/pdf")
      .await
      .map_err(|e| AttemptFailure::internal(format!("publishing merged pdf: {}", e)))?;
  }
  tracker.set_progress(95.0).await.ok();

  Ok(stats)
}

async fn record_crawled_file(
  app_context: &Arc<ApplicationContext>,
  execution_id: Uuid,
  url: &Url,
  status: CrawledFileStatus,
  mime_type: Option<String>,
  error: Option<String>,
) {
  record_crawled_file_row(
    app_context,
    execution_id,
    url,
    CrawledFile {
      id: Uuid::new_v4(),
      execution_id,
      url: url.to_string(),
      filename: file_name_for(url),
      file_type: super::engine::classify_extension(url),
      mime_type,
      size_bytes: 0,
      minio_path: None,
      public_url: None,
      status,
      error,
      downloaded_at: None,
    },
  )
  .await;
}

async fn record_crawled_file_row(
  app_context: &Arc<ApplicationContext>,
  execution_id: Uuid,
  url: &Url,
  row: CrawledFile,
) -> Option<Uuid> {
  let row_id = row.id;
  match app_context.crawled_file_repository.upsert(row).await {
    Ok(()) => Some(row_id),
    Err(e) => {
      warn!(
        message = e.to_string(),
        execution_id = execution_id.to_string().as_str(),
        url = url.to_string().as_str(),
        "Failed to record crawled file"
      );
      None
    }
  }
}

async fn publish_crawled_file(
  app_context: &Arc<ApplicationContext>,
  row_id: Uuid,
  minio_path: String,
  public_url: Option<String>,
) {
  if let Err(e) = app_context
    .crawled_file_repository
    .set_published(row_id, &minio_path, public_url.as_deref())
    .await
  {
    warn!(
      message = e.to_string(),
      minio_path = minio_path.as_str(),
      "Failed to record published path"
    );
  }
}
