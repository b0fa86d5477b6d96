use crate::errors::CoreError;
use chrono::NaiveDateTime;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
  Main,
  Split,
  Page,
  Merge,
  Crawler,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Processing,
  Completed,
  Failed,
  Cancelled,
  Active,
  Paused,
  Stopped,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Stopped
    )
  }

  /// The enumerated transition table. `Active`/`Paused`/`Stopped` are only
  /// reachable by crawler jobs; pipeline jobs move through the queued →
  /// processing → terminal path.
  pub fn can_transition_to(&self, next: JobStatus) -> bool {
    match (self, next) {
      (JobStatus::Queued, JobStatus::Processing) => true,
      (JobStatus::Queued, JobStatus::Cancelled) => true,
      (JobStatus::Processing, JobStatus::Completed) => true,
      (JobStatus::Processing, JobStatus::Failed) => true,
      (JobStatus::Processing, JobStatus::Cancelled) => true,
      (JobStatus::Active, JobStatus::Paused) => true,
      (JobStatus::Paused, JobStatus::Active) => true,
      (JobStatus::Active, JobStatus::Stopped) => true,
      (JobStatus::Paused, JobStatus::Stopped) => true,
      _ => false,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
  File,
  Url,
  Gdrive,
  Dropbox,
  Crawler,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
  Queued,
  Processing,
  Completed,
  Failed,
}

impl PageStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, PageStatus::Completed | PageStatus::Failed)
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrawledFileStatus {
  Downloaded,
  Failed,
  Skipped,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
  PageOnly,
  PageWithAll,
  PageWithFiltered,
  FullWebsite,
}

#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
  #[default]
  HtmlParser,
  HeadlessBrowser,
}

#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PdfHandling {
  #[default]
  Individual,
  Combined,
  Both,
}

#[derive(
  Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
  Css,
  Js,
  Images,
  Fonts,
  Videos,
  Documents,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
  OneTime,
  Recurring,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
  Timeout,
  Http4xx,
  Http5xx,
  JavascriptError,
  ProxyError,
  Other,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
  Success,
  Failed,
  Cancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
  pub host: String,
  pub port: u16,
  pub protocol: String,
  pub username: Option<String>,
  pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategyEntry {
  pub attempt: u32,
  pub engine: EngineKind,
  pub use_proxy: bool,
  pub delay_seconds: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrawlerConfig {
  pub mode: CrawlMode,
  /// Falls back to the configured default engine when omitted.
  #[serde(default)]
  pub engine: Option<EngineKind>,
  #[serde(default)]
  pub use_proxy: bool,
  #[serde(default)]
  pub proxy: Option<ProxyConfig>,
  #[serde(default)]
  pub asset_types: Vec<AssetType>,
  #[serde(default)]
  pub file_extensions: Vec<String>,
  #[serde(default)]
  pub pdf_handling: PdfHandling,
  #[serde(default = "default_max_depth")]
  pub max_depth: u32,
  #[serde(default)]
  pub follow_external_links: bool,
  #[serde(default)]
  pub retry_enabled: bool,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default)]
  pub retry_strategy: Vec<RetryStrategyEntry>,
  #[serde(default)]
  pub retry_strategy_name: Option<String>,
}

fn default_max_depth() -> u32 {
  1
}

fn default_max_retries() -> u32 {
  3
}

impl CrawlerConfig {
  pub fn validate(&self) -> Result<(), CoreError> {
    for (index, entry) in self.retry_strategy.iter().enumerate() {
      if entry.attempt != index as u32 {
        return Err(CoreError::InvalidInput(format!(
          "retry strategy attempts must be strictly increasing from 0, got {} at position {}",
          entry.attempt, index
        )));
      }
    }
    if let Some(name) = &self.retry_strategy_name {
      if !matches!(
        name.as_str(),
        "conservative" | "aggressive" | "proxy_first" | "balanced"
      ) {
        return Err(CoreError::InvalidInput(format!(
          "unknown retry strategy name: {}",
          name
        )));
      }
    }
    Ok(())
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CrawlerSchedule {
  #[serde(rename = "type")]
  pub schedule_type: ScheduleType,
  pub cron_expression: Option<String>,
  pub timezone: String,
  #[serde(default)]
  pub next_runs: Vec<NaiveDateTime>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryHistoryEntry {
  pub attempt: u32,
  pub engine: EngineKind,
  pub use_proxy: bool,
  pub started_at: NaiveDateTime,
  pub completed_at: NaiveDateTime,
  pub status: AttemptStatus,
  pub error_type: Option<ErrorType>,
  pub error_message: Option<String>,
  pub duration_seconds: f64,
}

#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct Job {
  #[builder(default = "Uuid::new_v4()")]
  pub id: Uuid,
  pub user_id: String,
  pub job_type: JobType,
  pub status: JobStatus,
  #[builder(default)]
  pub progress: f64,
  pub source_type: SourceType,
  #[builder(default)]
  pub source_url: Option<String>,
  #[builder(default)]
  pub url_pattern: Option<String>,
  pub name: String,
  #[builder(default)]
  pub parent_job_id: Option<Uuid>,
  #[builder(default)]
  pub error: Option<String>,
  #[builder(default)]
  pub total_pages: u32,
  #[builder(default)]
  pub pages_completed: u32,
  #[builder(default)]
  pub pages_failed: u32,
  #[builder(default)]
  pub minio_upload_path: Option<String>,
  #[builder(default)]
  pub minio_result_path: Option<String>,
  #[builder(default)]
  pub crawler_config: Option<CrawlerConfig>,
  #[builder(default)]
  pub crawler_schedule: Option<CrawlerSchedule>,
  #[builder(default)]
  pub engine_used: Option<EngineKind>,
  #[builder(default)]
  pub proxy_used: Option<bool>,
  #[builder(default)]
  pub retry_history: Vec<RetryHistoryEntry>,
  #[builder(default)]
  pub fire_instant: Option<NaiveDateTime>,
  #[builder(default)]
  pub version: u32,
  #[builder(default = "chrono::Utc::now().naive_utc()")]
  pub created_at: NaiveDateTime,
  #[builder(default)]
  pub started_at: Option<NaiveDateTime>,
  #[builder(default)]
  pub completed_at: Option<NaiveDateTime>,
  #[builder(default = "chrono::Utc::now().naive_utc()")]
  pub updated_at: NaiveDateTime,
}

impl Job {
  /// Crawler jobs must carry a valid config; every other type must not.
  pub fn validate(&self) -> Result<(), CoreError> {
    match self.job_type {
      JobType::Crawler => {
        let config = self.crawler_config.as_ref().ok_or_else(|| {
          CoreError::InvalidInput("crawler job requires a crawler_config".to_string())
        })?;
        config.validate()
      }
      _ => {
        if self.crawler_config.is_some() || self.crawler_schedule.is_some() {
          return Err(CoreError::InvalidInput(format!(
            "{} job must not carry crawler fields",
            self.job_type
          )));
        }
        Ok(())
      }
    }
  }
}

#[derive(Debug, Clone)]
pub struct Page {
  pub id: Uuid,
  pub job_id: Uuid,
  pub page_number: u32,
  pub status: PageStatus,
  pub minio_page_path: Option<String>,
  pub minio_markdown_path: Option<String>,
  pub markdown_content: Option<String>,
  pub error: Option<String>,
  pub retry_count: u32,
  pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct CrawledFile {
  pub id: Uuid,
  pub execution_id: Uuid,
  pub url: String,
  pub filename: String,
  pub file_type: String,
  pub mime_type: Option<String>,
  pub size_bytes: u64,
  pub minio_path: Option<String>,
  pub public_url: Option<String>,
  pub status: CrawledFileStatus,
  pub error: Option<String>,
  pub downloaded_at: Option<NaiveDateTime>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_transitions() {
    assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
    assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
    assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
    assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
    assert!(JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
    assert!(JobStatus::Active.can_transition_to(JobStatus::Paused));
    assert!(JobStatus::Paused.can_transition_to(JobStatus::Active));
    assert!(JobStatus::Active.can_transition_to(JobStatus::Stopped));
    assert!(JobStatus::Paused.can_transition_to(JobStatus::Stopped));

    assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
    assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
    assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
    assert!(!JobStatus::Stopped.can_transition_to(JobStatus::Active));
    assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Cancelled));
  }

  #[test]
  fn test_crawler_config_validation() {
    let mut config = CrawlerConfig {
      mode: CrawlMode::PageOnly,
      engine: Some(EngineKind::HtmlParser),
      use_proxy: false,
      proxy: None,
      asset_types: vec![],
      file_extensions: vec![],
      pdf_handling: PdfHandling::Individual,
      max_depth: 1,
      follow_external_links: false,
      retry_enabled: true,
      max_retries: 3,
      retry_strategy: vec![
        RetryStrategyEntry {
          attempt: 0,
          engine: EngineKind::HtmlParser,
          use_proxy: false,
          delay_seconds: 0,
        },
        RetryStrategyEntry {
          attempt: 1,
          engine: EngineKind::HeadlessBrowser,
          use_proxy: true,
          delay_seconds: 30,
        },
      ],
      retry_strategy_name: None,
    };
    assert!(config.validate().is_ok());

    config.retry_strategy[1].attempt = 3;
    assert!(config.validate().is_err());

    config.retry_strategy[1].attempt = 1;
    config.retry_strategy_name = Some("fearless".to_string());
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_job_validation_requires_config_for_crawlers() {
    let job = JobBuilder::default()
      .user_id("u1")
      .job_type(JobType::Crawler)
      .status(JobStatus::Active)
      .source_type(SourceType::Crawler)
      .name("crawler")
      .build()
      .unwrap();
    assert!(job.validate().is_err());

    let job = JobBuilder::default()
      .user_id("u1")
      .job_type(JobType::Main)
      .status(JobStatus::Queued)
      .source_type(SourceType::File)
      .name("doc.pdf")
      .build()
      .unwrap();
    assert!(job.validate().is_ok());
  }
}
