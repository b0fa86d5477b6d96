use crate::{
  jobs::job_repository::JobRepository,
  progress::progress_indexer::{ExecutionMetricSample, MetricStream, ProgressIndexer},
};
use anyhow::Result;
use std::{
  sync::Arc,
  time::{Duration, Instant},
};
use tokio::sync::Mutex;
use uuid::Uuid;

const FLUSH_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct TrackerState {
  progress: f64,
  pages_processed: u32,
  files_processed: u32,
  bytes_downloaded: u64,
  error_count: u32,
  started: Instant,
  last_flush: Option<Instant>,
}

/// In-process progress tracker for one crawler execution. Job-row progress
/// writes and metric samples are debounced to one per five seconds; the
/// terminal transition always produces a final sample.
pub struct ProgressTracker {
  execution_id: Uuid,
  job_repository: Arc<JobRepository>,
  progress_indexer: Arc<ProgressIndexer>,
  state: Mutex<TrackerState>,
}

impl ProgressTracker {
  pub fn new(
    execution_id: Uuid,
    job_repository: Arc<JobRepository>,
    progress_indexer: Arc<ProgressIndexer>,
  ) -> Self {
    Self {
      execution_id,
      job_repository,
      progress_indexer,
      state: Mutex::new(TrackerState {
        progress: 0.0,
        pages_processed: 0,
        files_processed: 0,
        bytes_downloaded: 0,
        error_count: 0,
        started: Instant::now(),
        last_flush: None,
      }),
    }
  }

  /// Resets the in-attempt counters; execution-level progress observed by
  /// clients stays monotonic because the job row takes MAX(progress, new).
  pub async fn reset_for_attempt(&self) {
    let mut state = self.state.lock().await;
    state.progress = 0.0;
    state.pages_processed = 0;
    state.files_processed = 0;
    state.bytes_downloaded = 0;
    state.error_count = 0;
    state.started = Instant::now();
  }

  pub async fn set_progress(&self, progress: f64) -> Result<()> {
    {
      let mut state = self.state.lock().await;
      state.progress = progress.clamp(0.0, 100.0);
    }
    self.maybe_flush(false).await
  }

  pub async fn record_page(&self) -> Result<()> {
    {
      let mut state = self.state.lock().await;
      state.pages_processed += 1;
    }
    self.maybe_flush(false).await
  }

  pub async fn record_file(&self, bytes: u64) -> Result<()> {
    {
      let mut state = self.state.lock().await;
      state.files_processed += 1;
      state.bytes_downloaded += bytes;
    }
    self.maybe_flush(false).await
  }

  pub async fn record_error(&self) -> Result<()> {
    {
      let mut state = self.state.lock().await;
      state.error_count += 1;
    }
    self.maybe_flush(false).await
  }

  /// Final write on terminal transition: not debounced.
  pub async fn finish(&self) -> Result<()> {
    self.maybe_flush(true).await
  }

  async fn maybe_flush(&self, force: bool) -> Result<()> {
    let sample = {
      let mut state = self.state.lock().await;
      let due = force
        || state
          .last_flush
          .map(|last| last.elapsed() >= FLUSH_DEBOUNCE)
          .unwrap_or(true);
      if !due {
        return Ok(());
      }
      state.last_flush = Some(Instant::now());
      let elapsed = state.started.elapsed().as_secs_f64();
      ExecutionMetricSample {
        execution_id: self.execution_id,
        progress: state.progress,
        pages_processed: state.pages_processed,
        files_processed: state.files_processed,
        bytes_downloaded: state.bytes_downloaded,
        download_speed_bps: if elapsed > 0.0 {
          state.bytes_downloaded as f64 / elapsed
        } else {
          0.0
        },
        error_count: state.error_count,
        timestamp: chrono::Utc::now().naive_utc(),
      }
    };

    self
      .job_repository
      .update_progress(self.execution_id, sample.progress)
      .await?;
    self
      .progress_indexer
      .publish(MetricStream::ExecutionMetrics, &sample)
      .await;
    Ok(())
  }
}
