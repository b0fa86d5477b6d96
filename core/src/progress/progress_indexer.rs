use crate::{
  helpers::document_store::DocumentStore,
  jobs::job::{AttemptStatus, EngineKind, ErrorType, JobStatus, JobType},
  settings::IndexerSettings,
};
use anyhow::Result;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
};
use tokio::{spawn, sync::Mutex, time::interval};
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricStream {
  JobEvents,
  ExecutionMetrics,
  RetryMetrics,
}

impl MetricStream {
  /// Metric streams are rolled daily; the event stream is a single
  /// long-retention collection.
  pub fn collection(&self, date: NaiveDate) -> String {
    match self {
      MetricStream::JobEvents => "job-events".to_string(),
      MetricStream::ExecutionMetrics => format!("execution-metrics-{}", date.format("%Y.%m.%d")),
      MetricStream::RetryMetrics => format!("retry-metrics-{}", date.format("%Y.%m.%d")),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JobEventDocument {
  pub job_id: Uuid,
  pub job_type: JobType,
  pub user_id: String,
  pub status: JobStatus,
  pub progress: f64,
  pub pages_completed: u32,
  pub pages_failed: u32,
  pub error: Option<String>,
  pub timestamp: NaiveDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ExecutionMetricSample {
  pub execution_id: Uuid,
  pub progress: f64,
  pub pages_processed: u32,
  pub files_processed: u32,
  pub bytes_downloaded: u64,
  pub download_speed_bps: f64,
  pub error_count: u32,
  pub timestamp: NaiveDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryMetricDocument {
  pub execution_id: Uuid,
  pub attempt: u32,
  pub engine: EngineKind,
  pub use_proxy: bool,
  pub status: AttemptStatus,
  pub error_type: Option<ErrorType>,
  pub duration_seconds: f64,
  pub timestamp: NaiveDateTime,
}

struct BufferedDocument {
  stream: MetricStream,
  key: String,
  value: serde_json::Value,
}

/// Append-only, near-real-time projection of progress and per-execution
/// metrics. Strictly observational: nothing here is ever consulted to decide
/// job progress or completion.
///
/// Writes are buffered and bulk-flushed when 100 documents accumulate or the
/// flush interval elapses, whichever comes first. The buffer is bounded;
/// overflow drops the oldest samples and counts them. A failed flush is
/// logged and the documents are retried on the next cycle.
pub struct ProgressIndexer {
  document_store: Arc<DocumentStore>,
  settings: IndexerSettings,
  buffer: Mutex<VecDeque<BufferedDocument>>,
  dropped_samples: AtomicU64,
}

impl ProgressIndexer {
  pub fn new(document_store: Arc<DocumentStore>, settings: IndexerSettings) -> Self {
    Self {
      document_store,
      settings,
      buffer: Mutex::new(VecDeque::new()),
      dropped_samples: AtomicU64::new(0),
    }
  }

  pub async fn publish<T: Serialize>(&self, stream: MetricStream, document: &T) {
    let value = match serde_json::to_value(document) {
      Ok(value) => value,
      Err(e) => {
        error!(message = e.to_string(), "Failed to serialize metric document");
        return;
      }
    };
    let mut buffer = self.buffer.lock().await;
    buffer.push_back(BufferedDocument {
      stream,
      key: Uuid::new_v4().to_string(),
      value,
    });
    while buffer.len() > self.settings.buffer_capacity as usize {
      buffer.pop_front();
      self.dropped_samples.fetch_add(1, Ordering::Relaxed);
    }
  }

  pub fn dropped_samples(&self) -> u64 {
    self.dropped_samples.load(Ordering::Relaxed)
  }

  fn ttl_for(&self, stream: MetricStream) -> Option<Duration> {
    match stream {
      MetricStream::JobEvents => Duration::try_days(self.settings.event_retention_days as i64),
      _ => Duration::try_days(self.settings.metric_retention_days as i64),
    }
  }

  /// Drains up to `flush_max_docs` buffered documents into the store.
  /// Failed batches go back on the front of the buffer for the next cycle.
  pub async fn flush(&self) -> Result<usize> {
    let batch: Vec<BufferedDocument> = {
      let mut buffer = self.buffer.lock().await;
      let take = buffer.len().min(self.settings.flush_max_docs as usize);
      buffer.drain(..take).collect()
    };
    if batch.is_empty() {
      return Ok(0);
    }

    let today = chrono::Utc::now().date_naive();
    let mut by_collection: std::collections::HashMap<
      String,
      Vec<(String, serde_json::Value, Option<Duration>)>,
    > = std::collections::HashMap::new();
    for doc in &batch {
      by_collection
        .entry(doc.stream.collection(today))
        .or_default()
        .push((doc.key.clone(), doc.value.clone(), self.ttl_for(doc.stream)));
    }

    let mut written = 0;
    for (collection, entries) in by_collection {
      let count = entries.len();
      if let Err(e) = self.document_store.put_many(&collection, entries).await {
        warn!(
          message = e.to_string(),
          collection = collection.as_str(),
          "Metric flush failed, retrying on next cycle"
        );
        let mut buffer = self.buffer.lock().await;
        for doc in batch {
          buffer.push_front(doc);
        }
        return Ok(written);
      }
      written += count;
    }
    Ok(written)
  }

  /// Drains everything; used on terminal transitions and in tests.
  pub async fn flush_all(&self) -> Result<usize> {
    let mut total = 0;
    loop {
      let written = self.flush().await?;
      if written == 0 {
        break;
      }
      total += written;
    }
    Ok(total)
  }

  pub fn run(self: &Arc<Self>) {
    let indexer = Arc::clone(self);
    spawn(async move {
      let mut ticker = interval(std::time::Duration::from_secs(
        indexer.settings.flush_interval_seconds.max(1) as u64,
      ));
      loop {
        ticker.tick().await;
        if let Err(e) = indexer.flush_all().await {
          warn!(message = e.to_string(), "Metric flush cycle failed");
        }
      }
    });
  }

  /// Read-side helper for monitors; sorted by insertion order (readers sort
  /// by timestamp across processes).
  pub async fn read_stream(
    &self,
    stream: MetricStream,
    date: NaiveDate,
    limit: usize,
  ) -> Result<Vec<serde_json::Value>> {
    let documents = self
      .document_store
      .read_collection::<serde_json::Value>(&stream.collection(date), None, limit)
      .await?;
    Ok(documents.into_iter().map(|d| d.document).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::helpers::test::{sqlite_connection, test_settings};

  fn sample(execution_id: Uuid, progress: f64) -> ExecutionMetricSample {
    ExecutionMetricSample {
      execution_id,
      progress,
      pages_processed: 1,
      files_processed: 0,
      bytes_downloaded: 1024,
      download_speed_bps: 512.0,
      error_count: 0,
      timestamp: chrono::Utc::now().naive_utc(),
    }
  }

  #[tokio::test]
  async fn test_flush_writes_buffered_documents() {
    let (_guard, sqlite) = sqlite_connection().await;
    let store = Arc::new(DocumentStore::new(sqlite));
    let indexer = ProgressIndexer::new(Arc::clone(&store), test_settings().indexer.clone());

    let execution_id = Uuid::new_v4();
    for step in 0..3 {
      indexer
        .publish(MetricStream::ExecutionMetrics, &sample(execution_id, step as f64 * 10.0))
        .await;
    }
    assert_eq!(indexer.flush_all().await.unwrap(), 3);

    let today = chrono::Utc::now().date_naive();
    let documents = indexer
      .read_stream(MetricStream::ExecutionMetrics, today, 10)
      .await
      .unwrap();
    assert_eq!(documents.len(), 3);

    // Nothing left to write.
    assert_eq!(indexer.flush_all().await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_bounded_buffer_drops_oldest() {
    let (_guard, sqlite) = sqlite_connection().await;
    let store = Arc::new(DocumentStore::new(sqlite));
    let mut settings = test_settings().indexer.clone();
    settings.buffer_capacity = 2;
    let indexer = ProgressIndexer::new(store, settings);

    let execution_id = Uuid::new_v4();
    for step in 0..5 {
      indexer
        .publish(MetricStream::ExecutionMetrics, &sample(execution_id, step as f64))
        .await;
    }
    assert_eq!(indexer.dropped_samples(), 3);
    assert_eq!(indexer.flush_all().await.unwrap(), 2);
  }

  #[test]
  fn test_stream_collections_roll_daily_except_events() {
    let date = chrono::NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
    assert_eq!(MetricStream::JobEvents.collection(date), "job-events");
    assert_eq!(
      MetricStream::ExecutionMetrics.collection(date),
      "execution-metrics-2026.08.01"
    );
    assert_eq!(
      MetricStream::RetryMetrics.collection(date),
      "retry-metrics-2026.08.01"
    );
  }
}
