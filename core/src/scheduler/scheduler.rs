use super::cron as cron_eval;
use crate::{
  errors::CoreError,
  jobs::{
    job::{Job, JobType, ScheduleType},
    job_repository::JobRepository,
  },
  settings::SchedulerSettings,
  tasks::{
    task::{ExecuteCrawlerPayload, TaskKind, TaskParametersBuilder},
    task_repository::TaskRepository,
  },
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use ::cron::Schedule;
use std::{
  cmp::{Ordering, Reverse},
  collections::{BinaryHeap, HashMap},
  sync::Arc,
};
use tokio::{
  spawn,
  sync::{Mutex, Notify},
  time::sleep,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
struct ScheduleEntry {
  crawler_job_id: Uuid,
  generation: u64,
  next_fire: DateTime<Utc>,
  schedule: Option<Schedule>,
  timezone: Tz,
  one_time: bool,
}

impl PartialEq for ScheduleEntry {
  fn eq(&self, other: &Self) -> bool {
    self.next_fire == other.next_fire && self.crawler_job_id == other.crawler_job_id
  }
}

impl Eq for ScheduleEntry {}

impl PartialOrd for ScheduleEntry {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ScheduleEntry {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .next_fire
      .cmp(&other.next_fire)
      .then_with(|| self.crawler_job_id.cmp(&other.crawler_job_id))
  }
}

#[derive(Default)]
struct SchedulerState {
  heap: BinaryHeap<Reverse<ScheduleEntry>>,
  generations: HashMap<Uuid, u64>,
  next_generation: u64,
}

impl SchedulerState {
  fn is_current(&self, entry: &ScheduleEntry) -> bool {
    self
      .generations
      .get(&entry.crawler_job_id)
      .map(|generation| *generation == entry.generation)
      .unwrap_or(false)
  }
}

/// Owns the cron schedules of active crawlers. The min-heap keyed by next
/// fire time is the only ephemeral state; on restart it is rebuilt from
/// `find_active_crawlers`. Firing enqueues an execution trigger into the
/// crawler task queue with a TTL of min(cron period, one hour), so late
/// triggers are dropped rather than stacked.
pub struct Scheduler {
  job_repository: Arc<JobRepository>,
  task_repository: Arc<TaskRepository>,
  settings: SchedulerSettings,
  state: Mutex<SchedulerState>,
  notify: Notify,
}

impl Scheduler {
  pub fn new(
    job_repository: Arc<JobRepository>,
    task_repository: Arc<TaskRepository>,
    settings: SchedulerSettings,
  ) -> Self {
    Self {
      job_repository,
      task_repository,
      settings,
      state: Mutex::new(SchedulerState::default()),
      notify: Notify::new(),
    }
  }

  /// Rebuilds the in-memory schedule set from the job store.
  #[instrument(skip(self))]
  pub async fn hydrate(&self) -> Result<()> {
    let crawlers = self.job_repository.find_active_crawlers().await?;
    info!(count = crawlers.len(), "Hydrating scheduler");
    for job in crawlers {
      if let Err(e) = self.register_crawler(&job).await {
        warn!(
          message = e.to_string(),
          crawler_job_id = job.id.to_string().as_str(),
          "Skipping crawler with invalid schedule"
        );
      }
    }
    Ok(())
  }

  fn build_entry(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<ScheduleEntry>> {
    let schedule = match &job.crawler_schedule {
      Some(schedule) => schedule,
      None => return Ok(None),
    };
    cron_eval::validate_schedule(schedule)?;
    let timezone = cron_eval::parse_timezone(&schedule.timezone)?;
    let one_time = schedule.schedule_type == ScheduleType::OneTime;
    let parsed = schedule
      .cron_expression
      .as_deref()
      .map(cron_eval::parse_cron)
      .transpose()?;
    let next_fire = match &parsed {
      Some(parsed) => cron_eval::next_fire(parsed, timezone, now)
        .ok_or_else(|| CoreError::InvalidInput("schedule never fires".to_string()))?,
      // One-shot schedule with no cron expression fires immediately.
      None => now,
    };
    Ok(Some(ScheduleEntry {
      crawler_job_id: job.id,
      generation: 0,
      next_fire,
      schedule: parsed,
      timezone,
      one_time,
    }))
  }

  /// Installs (or replaces) the schedule entry for a crawler and persists
  /// the `next_runs` projection on the job row.
  #[instrument(skip(self, job))]
  pub async fn register_crawler(&self, job: &Job) -> Result<()> {
    if job.job_type != JobType::Crawler {
      return Err(CoreError::InvalidInput("only crawler jobs can be scheduled".to_string()).into());
    }
    let now = Utc::now();
    let mut entry = match self.build_entry(job, now)? {
      Some(entry) => entry,
      None => return Ok(()),
    };

    let next_runs = match &entry.schedule {
      Some(schedule) => cron_eval::upcoming(
        schedule,
        entry.timezone,
        now,
        self.settings.next_runs_window as usize,
      ),
      None => vec![entry.next_fire],
    };
    self.persist_next_runs(job.id, next_runs).await?;

    let mut state = self.state.lock().await;
    state.next_generation += 1;
    entry.generation = state.next_generation;
    state.generations.insert(job.id, entry.generation);
    state.heap.push(Reverse(entry));
    drop(state);
    self.notify.notify_one();
    Ok(())
  }

  pub async fn update_crawler(&self, job: &Job) -> Result<()> {
    self.register_crawler(job).await
  }

  /// Drops the entry; any queued trigger is discarded on dequeue by the
  /// worker's status check.
  pub async fn unregister_crawler(&self, crawler_job_id: Uuid) {
    let mut state = self.state.lock().await;
    state.generations.remove(&crawler_job_id);
    drop(state);
    self.notify.notify_one();
  }

  pub async fn pause_crawler(&self, crawler_job_id: Uuid) {
    self.unregister_crawler(crawler_job_id).await;
  }

  pub async fn registered_count(&self) -> usize {
    self.state.lock().await.generations.len()
  }

  async fn persist_next_runs(&self, job_id: Uuid, runs: Vec<DateTime<Utc>>) -> Result<()> {
    let runs: Vec<chrono::NaiveDateTime> = runs.into_iter().map(|dt| dt.naive_utc()).collect();
    for _ in 0..3 {
      let mut job = match self.job_repository.find(job_id).await? {
        Some(job) => job,
        None => return Ok(()),
      };
      let Some(schedule) = job.crawler_schedule.as_mut() else {
        return Ok(());
      };
      schedule.next_runs = runs.clone();
      match self.job_repository.update(&job).await {
        Ok(()) => return Ok(()),
        Err(e)
          if e
            .downcast_ref::<CoreError>()
            .map(|e| e.is_transient())
            .unwrap_or(false) =>
        {
          continue
        }
        Err(e) => return Err(e),
      }
    }
    Err(anyhow!(CoreError::Conflict(format!(
      "could not persist next_runs for {}",
      job_id
    ))))
  }

  async fn emit_trigger(&self, entry: &ScheduleEntry) -> Result<()> {
    let payload = ExecuteCrawlerPayload {
      crawler_job_id: entry.crawler_job_id,
      fire_instant: entry.next_fire.naive_utc(),
      manual: false,
    };
    let max_ttl = TimeDelta::seconds(self.settings.max_trigger_ttl_seconds as i64);
    let ttl = entry
      .schedule
      .as_ref()
      .and_then(|schedule| cron_eval::period(schedule, entry.timezone, entry.next_fire))
      .map(|period| period.min(max_ttl))
      .unwrap_or(max_ttl);

    self
      .task_repository
      .enqueue(
        TaskParametersBuilder::default()
          .kind(TaskKind::ExecuteCrawler)
          .id(format!(
            "execute_crawler:{}:{}",
            entry.crawler_job_id,
            entry.next_fire.timestamp()
          ))
          .payload(serde_json::to_vec(&payload)?)
          .expires_at(entry.next_fire.naive_utc() + ttl)
          .overwrite_existing(false)
          .build()?,
      )
      .await
  }

  /// One pass of the firing loop: emits triggers for every due entry and
  /// reschedules recurring ones. Returns the wait until the earliest
  /// remaining entry.
  pub async fn tick(&self, now: DateTime<Utc>) -> Result<Option<TimeDelta>> {
    let mut due = Vec::new();
    let wait = {
      let mut state = self.state.lock().await;
      loop {
        match state.heap.peek() {
          Some(Reverse(entry)) if !state.is_current(entry) => {
            state.heap.pop();
          }
          Some(Reverse(entry)) if entry.next_fire <= now => {
            let Reverse(entry) = state.heap.pop().unwrap();
            due.push(entry);
          }
          Some(Reverse(entry)) => break Some(entry.next_fire - now),
          None => break None,
        }
      }
    };

    for entry in due {
      if let Err(e) = self.emit_trigger(&entry).await {
        // Logged only; the entry is reinserted with an unchanged fire time
        // so the next wake retries it.
        error!(
          message = e.to_string(),
          crawler_job_id = entry.crawler_job_id.to_string().as_str(),
          "Failed to emit execution trigger"
        );
        let mut state = self.state.lock().await;
        if state.is_current(&entry) {
          state.heap.push(Reverse(entry));
        }
        continue;
      }

      if entry.one_time {
        // One-shot schedules auto-unregister after firing.
        self.unregister_crawler(entry.crawler_job_id).await;
        self.persist_next_runs(entry.crawler_job_id, vec![]).await?;
        continue;
      }

      let Some(schedule) = entry.schedule.clone() else {
        continue;
      };
      let next_fire = match cron_eval::next_fire(&schedule, entry.timezone, entry.next_fire) {
        Some(next_fire) => next_fire,
        None => {
          self.unregister_crawler(entry.crawler_job_id).await;
          continue;
        }
      };
      let next_runs = cron_eval::upcoming(
        &schedule,
        entry.timezone,
        entry.next_fire,
        self.settings.next_runs_window as usize,
      );
      self
        .persist_next_runs(entry.crawler_job_id, next_runs)
        .await?;
      let mut state = self.state.lock().await;
      if state.is_current(&entry) {
        state.heap.push(Reverse(ScheduleEntry { next_fire, ..entry }));
      }
    }

    Ok(wait)
  }

  pub fn run(self: &Arc<Self>) {
    let scheduler = Arc::clone(self);
    spawn(async move {
      loop {
        let wait = match scheduler.tick(Utc::now()).await {
          Ok(wait) => wait,
          Err(e) => {
            error!(message = e.to_string(), "Scheduler tick failed");
            Some(TimeDelta::seconds(5))
          }
        };
        let wait = wait
          .and_then(|wait| wait.to_std().ok())
          .unwrap_or(std::time::Duration::from_secs(60))
          .min(std::time::Duration::from_secs(60));
        tokio::select! {
          _ = sleep(wait) => {}
          _ = scheduler.notify.notified() => {}
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    helpers::test::{sqlite_connection, test_settings},
    jobs::job::{
      CrawlMode, CrawlerConfig, CrawlerSchedule, JobBuilder, JobStatus, ScheduleType, SourceType,
    },
    tasks::task::TaskQueue,
  };

  struct Fixture {
    _guard: tempfile::TempDir,
    job_repository: Arc<JobRepository>,
    task_repository: Arc<TaskRepository>,
    scheduler: Scheduler,
  }

  async fn fixture() -> Fixture {
    let (guard, sqlite) = sqlite_connection().await;
    let settings = test_settings();
    let job_repository = Arc::new(JobRepository::new(Arc::clone(&sqlite)));
    let task_repository = Arc::new(TaskRepository::new(Arc::clone(&sqlite)));
    let scheduler = Scheduler::new(
      Arc::clone(&job_repository),
      Arc::clone(&task_repository),
      settings.scheduler.clone(),
    );
    Fixture {
      _guard: guard,
      job_repository,
      task_repository,
      scheduler,
    }
  }

  async fn insert_crawler(fixture: &Fixture, schedule: CrawlerSchedule) -> Job {
    let job = JobBuilder::default()
      .user_id("u1")
      .job_type(JobType::Crawler)
      .status(JobStatus::Active)
      .source_type(SourceType::Crawler)
      .source_url("https://example.com/docs".to_string())
      .name("docs crawler")
      .crawler_config(CrawlerConfig {
        mode: CrawlMode::PageOnly,
        engine: Default::default(),
        use_proxy: false,
        proxy: None,
        asset_types: vec![],
        file_extensions: vec![],
        pdf_handling: Default::default(),
        max_depth: 1,
        follow_external_links: false,
        retry_enabled: false,
        max_retries: 3,
        retry_strategy: vec![],
        retry_strategy_name: None,
      })
      .crawler_schedule(schedule)
      .build()
      .unwrap();
    fixture.job_repository.insert(job.clone()).await.unwrap();
    job
  }

  fn recurring(cron_expression: &str, timezone: &str) -> CrawlerSchedule {
    CrawlerSchedule {
      schedule_type: ScheduleType::Recurring,
      cron_expression: Some(cron_expression.to_string()),
      timezone: timezone.to_string(),
      next_runs: vec![],
    }
  }

  #[tokio::test]
  async fn test_recurring_schedule_emits_six_triggers_in_thirty_minutes() {
    let fixture = fixture().await;
    let job = insert_crawler(&fixture, recurring("*/5 * * * *", "America/Sao_Paulo")).await;
    fixture.scheduler.register_crawler(&job).await.unwrap();

    let horizon = Utc::now() + TimeDelta::minutes(30);
    for _ in 0..6 {
      fixture.scheduler.tick(horizon).await.unwrap();
    }
    assert_eq!(
      fixture.task_repository.queue_depth(TaskQueue::Crawler).await.unwrap(),
      6
    );

    // The seventh fire lies beyond the horizon.
    let wait = fixture.scheduler.tick(horizon).await.unwrap();
    assert!(wait.is_some());
    assert_eq!(
      fixture.task_repository.queue_depth(TaskQueue::Crawler).await.unwrap(),
      6
    );
  }

  #[tokio::test]
  async fn test_paused_crawler_stops_firing() {
    let fixture = fixture().await;
    let job = insert_crawler(&fixture, recurring("* * * * *", "UTC")).await;
    fixture.scheduler.register_crawler(&job).await.unwrap();

    let horizon = Utc::now() + TimeDelta::minutes(3);
    fixture.scheduler.tick(horizon).await.unwrap();
    let fired = fixture.task_repository.queue_depth(TaskQueue::Crawler).await.unwrap();
    assert_eq!(fired, 1);

    fixture.scheduler.pause_crawler(job.id).await;
    assert_eq!(fixture.scheduler.registered_count().await, 0);

    fixture
      .scheduler
      .tick(Utc::now() + TimeDelta::minutes(30))
      .await
      .unwrap();
    assert_eq!(
      fixture.task_repository.queue_depth(TaskQueue::Crawler).await.unwrap(),
      fired
    );
  }

  #[tokio::test]
  async fn test_one_time_schedule_fires_once_and_unregisters() {
    let fixture = fixture().await;
    let job = insert_crawler(
      &fixture,
      CrawlerSchedule {
        schedule_type: ScheduleType::OneTime,
        cron_expression: None,
        timezone: "UTC".to_string(),
        next_runs: vec![],
      },
    )
    .await;
    fixture.scheduler.register_crawler(&job).await.unwrap();

    fixture
      .scheduler
      .tick(Utc::now() + TimeDelta::seconds(1))
      .await
      .unwrap();
    assert_eq!(
      fixture.task_repository.queue_depth(TaskQueue::Crawler).await.unwrap(),
      1
    );
    assert_eq!(fixture.scheduler.registered_count().await, 0);

    let loaded = fixture.job_repository.get(job.id).await.unwrap();
    assert!(loaded.crawler_schedule.unwrap().next_runs.is_empty());
  }

  #[tokio::test]
  async fn test_hydrate_restores_active_schedules() {
    let fixture = fixture().await;
    insert_crawler(&fixture, recurring("*/5 * * * *", "UTC")).await;
    let mut paused = insert_crawler(&fixture, recurring("*/5 * * * *", "UTC")).await;
    paused.status = JobStatus::Paused;
    fixture.job_repository.update(&paused).await.unwrap();

    fixture.scheduler.hydrate().await.unwrap();
    assert_eq!(fixture.scheduler.registered_count().await, 1);
  }
}
