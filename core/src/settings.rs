#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct SqliteSettings {
  pub dir: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct ContentStoreSettings {
  pub endpoint: String,
  pub region: String,
  pub key: String,
  pub secret: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
  pub host: String,
  pub port: u16,
  pub protocol: String,
  pub username: Option<String>,
  pub password: Option<String>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CrawlerSettings {
  pub user_agent: String,
  pub max_concurrent_downloads: u32,
  pub max_concurrent_assets: u32,
  pub download_timeout_seconds: u32,
  pub respect_robots_txt: bool,
  pub rate_limit_per_second: u32,
  pub default_engine: String,
  pub headless_timeout_seconds: u32,
  pub max_retries: u32,
  pub retry_delay_base_seconds: u32,
  pub pool_size: u32,
  pub claim_ttl_seconds: u32,
  pub proxy: Option<ProxySettings>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct PipelineSettings {
  pub max_pages_per_document: u32,
  pub inline_markdown_max_bytes: u32,
  pub merge_grace_seconds: u32,
  pub merge_retry_delay_seconds: u32,
  pub queue_backpressure_threshold: u32,
  pub result_ttl_seconds: u32,
  pub sweep_interval_seconds: u32,
  pub pool_size: u32,
  pub claim_ttl_seconds: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct IndexerSettings {
  pub flush_max_docs: u32,
  pub flush_interval_seconds: u32,
  pub buffer_capacity: u32,
  pub metric_retention_days: u32,
  pub event_retention_days: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct SchedulerSettings {
  pub next_runs_window: u32,
  pub max_trigger_ttl_seconds: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct TaskSettings {
  pub soft_timeout_seconds: u32,
  pub hard_timeout_seconds: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct TracingSettings {
  pub otel_collector_endpoint: String,
  pub service_name: String,
  pub host_name: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct Settings {
  pub sqlite: SqliteSettings,
  pub content_store: ContentStoreSettings,
  pub crawler: CrawlerSettings,
  pub pipeline: PipelineSettings,
  pub indexer: IndexerSettings,
  pub scheduler: SchedulerSettings,
  pub tasks: TaskSettings,
  pub tracing: TracingSettings,
}

impl Settings {
  pub fn new() -> Result<Self, config::ConfigError> {
    let s = config::Config::builder()
      .add_source(config::Environment::default().separator("__"))
      .set_default("sqlite.dir", "./data")?
      .set_default("content_store.endpoint", "http://localhost:9000")?
      .set_default("content_store.region", "us-east-1")?
      .set_default("content_store.key", "")?
      .set_default("content_store.secret", "")?
      .set_default("crawler.user_agent", "docmill/0.1")?
      .set_default("crawler.max_concurrent_downloads", 5)?
      .set_default("crawler.max_concurrent_assets", 10)?
      .set_default("crawler.download_timeout_seconds", 60)?
      .set_default("crawler.respect_robots_txt", true)?
      .set_default("crawler.rate_limit_per_second", 2)?
      .set_default("crawler.default_engine", "html_parser")?
      .set_default("crawler.headless_timeout_seconds", 30)?
      .set_default("crawler.max_retries", 3)?
      .set_default("crawler.retry_delay_base_seconds", 2)?
      .set_default("crawler.pool_size", 2)?
      .set_default("crawler.claim_ttl_seconds", 3600)?
      .set_default("pipeline.max_pages_per_document", 2000)?
      .set_default("pipeline.inline_markdown_max_bytes", 65536)?
      .set_default("pipeline.merge_grace_seconds", 1800)?
      .set_default("pipeline.merge_retry_delay_seconds", 60)?
      .set_default("pipeline.queue_backpressure_threshold", 1000)?
      .set_default("pipeline.result_ttl_seconds", 604800)?
      .set_default("pipeline.sweep_interval_seconds", 3600)?
      .set_default("pipeline.pool_size", 4)?
      .set_default("pipeline.claim_ttl_seconds", 3600)?
      .set_default("indexer.flush_max_docs", 100)?
      .set_default("indexer.flush_interval_seconds", 5)?
      .set_default("indexer.buffer_capacity", 10000)?
      .set_default("indexer.metric_retention_days", 7)?
      .set_default("indexer.event_retention_days", 90)?
      .set_default("scheduler.next_runs_window", 5)?
      .set_default("scheduler.max_trigger_ttl_seconds", 3600)?
      .set_default("tasks.soft_timeout_seconds", 3300)?
      .set_default("tasks.hard_timeout_seconds", 3600)?
      .set_default("tracing.otel_collector_endpoint", "http://localhost:4317")?
      .set_default("tracing.service_name", "docmill")?
      .set_default("tracing.host_name", "localhost")?
      .build()?;

    Ok(s.try_deserialize()?)
  }
}
