use crate::helpers::priority::Priority;
use chrono::{NaiveDateTime, TimeDelta, Timelike};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskQueue {
  Conversion,
  Crawler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
  SplitPdf,
  ConvertPage,
  Merge,
  ExecuteCrawler,
  Housekeeping,
}

impl TaskKind {
  pub fn queue(&self) -> TaskQueue {
    match self {
      TaskKind::SplitPdf | TaskKind::ConvertPage | TaskKind::Merge | TaskKind::Housekeeping => {
        TaskQueue::Conversion
      }
      TaskKind::ExecuteCrawler => TaskQueue::Crawler,
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SplitPdfPayload {
  pub main_job_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConvertPagePayload {
  pub page_job_id: Uuid,
  pub main_job_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MergePayload {
  pub main_job_id: Uuid,
}

/// An execution trigger. `fire_instant` is the intended wall-clock firing
/// time in UTC; `manual` marks run-now dispatches that bypass the scheduler.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecuteCrawlerPayload {
  pub crawler_job_id: Uuid,
  pub fire_instant: NaiveDateTime,
  #[serde(default)]
  pub manual: bool,
}

#[derive(Debug, Clone)]
pub struct Task {
  pub id: String,
  pub queue: TaskQueue,
  pub kind: TaskKind,
  pub payload: Option<Vec<u8>>,
  pub priority: Priority,
  pub next_execution: NaiveDateTime,
  pub last_execution: Option<NaiveDateTime>,
  pub interval_seconds: Option<u32>,
  pub claimed_at: Option<NaiveDateTime>,
  pub attempts: u32,
  pub expires_at: Option<NaiveDateTime>,
  pub created_at: NaiveDateTime,
}

impl Task {
  pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
    let payload = self
      .payload
      .as_ref()
      .ok_or_else(|| anyhow::anyhow!("Missing task payload"))?;
    Ok(serde_json::from_slice(payload)?)
  }
}

#[derive(Builder)]
#[builder(setter(into))]
pub struct TaskParameters {
  pub kind: TaskKind,
  #[builder(default, setter(into))]
  pub id: Option<String>,
  #[builder(default)]
  pub payload: Option<Vec<u8>>,
  #[builder(default)]
  pub priority: Priority,
  #[builder(default = "chrono::Utc::now().naive_utc()")]
  pub next_execution: NaiveDateTime,
  #[builder(default, setter(strip_option))]
  pub interval: Option<TimeDelta>,
  #[builder(default)]
  pub expires_at: Option<NaiveDateTime>,
  #[builder(default = "true")]
  pub overwrite_existing: bool,
}

/// Sub-second precision is dropped so stored instants compare cleanly with
/// sqlite's `datetime('now')`.
pub fn truncate_to_seconds(instant: NaiveDateTime) -> NaiveDateTime {
  instant.with_nanosecond(0).unwrap_or(instant)
}

impl From<TaskParameters> for Task {
  fn from(params: TaskParameters) -> Self {
    Task {
      id: params
        .id
        .unwrap_or_else(|| format!("{}:{}", params.kind, Uuid::new_v4())),
      queue: params.kind.queue(),
      kind: params.kind,
      payload: params.payload,
      priority: params.priority,
      next_execution: truncate_to_seconds(params.next_execution),
      last_execution: None,
      interval_seconds: params.interval.map(|d| d.num_seconds() as u32),
      claimed_at: None,
      attempts: 0,
      expires_at: params.expires_at,
      created_at: chrono::Utc::now().naive_utc(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_kind_routing() {
    assert_eq!(TaskKind::SplitPdf.queue(), TaskQueue::Conversion);
    assert_eq!(TaskKind::ConvertPage.queue(), TaskQueue::Conversion);
    assert_eq!(TaskKind::Merge.queue(), TaskQueue::Conversion);
    assert_eq!(TaskKind::ExecuteCrawler.queue(), TaskQueue::Crawler);
  }

  #[test]
  fn test_payload_round_trip() {
    let payload = ExecuteCrawlerPayload {
      crawler_job_id: Uuid::new_v4(),
      fire_instant: chrono::Utc::now().naive_utc(),
      manual: false,
    };
    let task: Task = TaskParametersBuilder::default()
      .kind(TaskKind::ExecuteCrawler)
      .payload(serde_json::to_vec(&payload).unwrap())
      .build()
      .unwrap()
      .into();
    let decoded: ExecuteCrawlerPayload = task.payload_as().unwrap();
    assert_eq!(decoded.crawler_job_id, payload.crawler_job_id);
  }
}
