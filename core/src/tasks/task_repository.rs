use super::task::{Task, TaskKind, TaskParameters, TaskQueue};
use crate::{helpers::priority::Priority, sqlite::SqliteConnection};
use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime, TimeDelta};
use rusqlite::{params, types::Value, Row};
use std::{rc::Rc, str::FromStr, sync::Arc};
use tracing::{error, info, instrument};

#[derive(Clone)]
pub struct TaskRepository {
  sqlite_connection: Arc<SqliteConnection>,
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
  Ok(Task {
    id: row.get(0)?,
    queue: TaskQueue::from_str(row.get::<_, String>(1)?.as_str()).unwrap(),
    kind: TaskKind::from_str(row.get::<_, String>(2)?.as_str()).unwrap(),
    payload: row.get(3)?,
    priority: Priority::try_from(row.get::<_, u32>(4)?).unwrap_or_default(),
    next_execution: row.get(5)?,
    last_execution: row.get(6)?,
    interval_seconds: row.get(7)?,
    claimed_at: row.get(8)?,
    attempts: row.get(9)?,
    expires_at: row.get(10)?,
    created_at: row.get(11)?,
  })
}

const TASK_COLUMNS: &str = "
  id, queue, kind, payload, priority, next_execution, last_execution, interval_seconds,
  claimed_at, attempts, expires_at, created_at
";

impl TaskRepository {
  pub fn new(sqlite_connection: Arc<SqliteConnection>) -> Self {
    Self { sqlite_connection }
  }

  #[instrument(skip(self, params))]
  pub async fn enqueue(&self, params: TaskParameters) -> Result<()> {
    let overwrite_existing = params.overwrite_existing;
    let record: Task = params.into();
    if !overwrite_existing && self.find(&record.id).await?.is_some() {
      info!(task_id = record.id.as_str(), "Task already enqueued, skipping");
      return Ok(());
    }
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          INSERT INTO task_queue (
            id, queue, kind, payload, priority, next_execution, last_execution,
            interval_seconds, expires_at, created_at
          )
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
          ON CONFLICT (id) DO UPDATE SET
            payload = excluded.payload,
            priority = excluded.priority,
            next_execution = excluded.next_execution,
            interval_seconds = excluded.interval_seconds,
            expires_at = excluded.expires_at
          ",
        )?;
        statement.execute(params![
          record.id,
          record.queue.to_string(),
          record.kind.to_string(),
          record.payload,
          record.priority as u32,
          record.next_execution,
          record.last_execution,
          record.interval_seconds,
          record.expires_at,
          record.created_at,
        ])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to enqueue task");
        anyhow!("Failed to enqueue task")
      })?
  }

  pub async fn find(&self, task_id: &str) -> Result<Option<Task>> {
    let task_id = task_id.to_string();
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(&format!(
          "SELECT {} FROM task_queue WHERE id = ?",
          TASK_COLUMNS
        ))?;
        let mut rows = statement.query_map([task_id], row_to_task)?;
        rows.next().transpose()
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get task");
        anyhow!("Failed to get task")
      })?
      .map_err(|e| anyhow!(e))
  }

  /// Claims the next due tasks in a queue. Expired triggers are dropped
  /// first; a claim that outlives its TTL is considered stale and the task
  /// is handed out again (late-ack redelivery).
  pub async fn claim_next_tasks(
    &self,
    queue: TaskQueue,
    count: u32,
    claim_duration: Duration,
  ) -> Result<Vec<Task>> {
    let oldest_claimed_at = chrono::Utc::now().naive_utc() - claim_duration;
    let tasks = self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        conn.execute(
          "DELETE FROM task_queue WHERE expires_at IS NOT NULL AND expires_at < datetime('now')",
          [],
        )?;
        let mut statement = conn.prepare(&format!(
          "
          SELECT {} FROM task_queue
          WHERE
            queue = ?
            AND next_execution <= datetime('now')
            AND (
              claimed_at IS NULL
              OR claimed_at < datetime(?)
            )
          ORDER BY priority, next_execution, id
          LIMIT ?
          ",
          TASK_COLUMNS
        ))?;
        let rows = statement
          .query_map(params![queue.to_string(), oldest_claimed_at, count], row_to_task)?
          .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(rows)
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to claim next tasks");
        anyhow!("Failed to claim next tasks")
      })??;

    if !tasks.is_empty() {
      self
        .set_many_claimed_at(
          tasks.iter().map(|task| task.id.clone()).collect(),
          chrono::Utc::now().naive_utc(),
        )
        .await?;
    }

    Ok(tasks)
  }

  pub async fn set_many_claimed_at(
    &self,
    task_ids: Vec<String>,
    claimed_at: NaiveDateTime,
  ) -> Result<()> {
    let ids = task_ids.into_iter().map(Value::from).collect::<Vec<_>>();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE task_queue
          SET claimed_at = ?, attempts = attempts + 1
          WHERE id IN rarray(?)
          ",
        )?;
        statement.execute(params![claimed_at, Rc::new(ids)])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to set claimed at");
        anyhow!("Failed to set claimed at")
      })?
  }

  /// Acknowledges a completed task. One-shot tasks are deleted; recurring
  /// housekeeping tasks are rescheduled one interval out.
  pub async fn ack(&self, task: &Task) -> Result<()> {
    let task_id = task.id.clone();
    let interval_seconds = task.interval_seconds;
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let last_execution = super::task::truncate_to_seconds(chrono::Utc::now().naive_utc());
        if let Some(interval_seconds) = interval_seconds {
          let next_execution = last_execution
            + TimeDelta::try_seconds(interval_seconds as i64).unwrap_or(TimeDelta::zero());
          let mut statement = conn.prepare(
            "
            UPDATE task_queue
            SET next_execution = ?, last_execution = ?, claimed_at = NULL, attempts = 0
            WHERE id = ?
            ",
          )?;
          statement.execute(params![next_execution, last_execution, task_id])?;
        } else {
          let mut statement = conn.prepare("DELETE FROM task_queue WHERE id = ?")?;
          statement.execute([task_id])?;
        }
        Ok::<_, rusqlite::Error>(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to ack task");
        anyhow!("Failed to ack task")
      })??;
    Ok(())
  }

  /// Releases a claim and pushes the task out for another attempt.
  pub async fn retry_later(&self, task_id: &str, delay: Duration) -> Result<()> {
    let task_id = task_id.to_string();
    let next_execution = super::task::truncate_to_seconds(chrono::Utc::now().naive_utc() + delay);
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare(
          "
          UPDATE task_queue
          SET claimed_at = NULL, next_execution = ?
          WHERE id = ?
          ",
        )?;
        statement.execute(params![next_execution, task_id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to reschedule task");
        anyhow!("Failed to reschedule task")
      })?
  }

  pub async fn delete(&self, task_id: &str) -> Result<()> {
    let task_id = task_id.to_string();
    self
      .sqlite_connection
      .write()
      .await?
      .interact(move |conn| {
        let mut statement = conn.prepare("DELETE FROM task_queue WHERE id = ?")?;
        statement.execute([task_id])?;
        Ok(())
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to delete task");
        anyhow!("Failed to delete task")
      })?
  }

  /// Conversion-queue depth drives split-enqueue backpressure.
  pub async fn queue_depth(&self, queue: TaskQueue) -> Result<u32> {
    self
      .sqlite_connection
      .read()
      .await?
      .interact(move |conn| {
        conn.query_row(
          "SELECT COUNT(*) FROM task_queue WHERE queue = ?",
          [queue.to_string()],
          |row| row.get::<_, u32>(0),
        )
      })
      .await
      .map_err(|e| {
        error!(message = e.to_string(), "Failed to get queue depth");
        anyhow!("Failed to get queue depth")
      })?
      .map_err(|e| anyhow!(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{helpers::test::sqlite_connection, tasks::task::TaskParametersBuilder};

  fn params(kind: TaskKind, id: &str) -> TaskParameters {
    TaskParametersBuilder::default()
      .kind(kind)
      .id(id.to_string())
      .payload(br#"{"x":1}"#.to_vec())
      .build()
      .unwrap()
  }

  #[tokio::test]
  async fn test_claim_ack_lifecycle() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    repository
      .enqueue(params(TaskKind::SplitPdf, "split_pdf:1"))
      .await
      .unwrap();

    let claimed = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_minutes(10).unwrap())
      .await
      .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "split_pdf:1");

    // Claimed tasks are invisible until the claim expires.
    let empty = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_minutes(10).unwrap())
      .await
      .unwrap();
    assert!(empty.is_empty());

    repository.ack(&claimed[0]).await.unwrap();
    assert_eq!(repository.queue_depth(TaskQueue::Conversion).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_expired_claims_are_redelivered() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    repository
      .enqueue(params(TaskKind::ConvertPage, "convert_page:1"))
      .await
      .unwrap();

    let first = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_seconds(-1).unwrap())
      .await
      .unwrap();
    assert_eq!(first.len(), 1);

    // A claim TTL in the past means the claim is immediately stale.
    let redelivered = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_seconds(-1).unwrap())
      .await
      .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].attempts, 1);
  }

  #[tokio::test]
  async fn test_expired_triggers_are_dropped() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    repository
      .enqueue(
        TaskParametersBuilder::default()
          .kind(TaskKind::ExecuteCrawler)
          .id("execute_crawler:stale".to_string())
          .expires_at(chrono::Utc::now().naive_utc() - Duration::try_minutes(5).unwrap())
          .build()
          .unwrap(),
      )
      .await
      .unwrap();

    let claimed = repository
      .claim_next_tasks(TaskQueue::Crawler, 1, Duration::try_minutes(10).unwrap())
      .await
      .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(repository.queue_depth(TaskQueue::Crawler).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_enqueue_deduplicates_on_id() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    let mut first = params(TaskKind::Merge, "merge:1");
    first.overwrite_existing = false;
    repository.enqueue(first).await.unwrap();

    let mut second = params(TaskKind::Merge, "merge:1");
    second.overwrite_existing = false;
    repository.enqueue(second).await.unwrap();

    assert_eq!(repository.queue_depth(TaskQueue::Conversion).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_recurring_task_reschedules_on_ack() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    repository
      .enqueue(
        TaskParametersBuilder::default()
          .kind(TaskKind::Housekeeping)
          .id("housekeeping".to_string())
          .interval(TimeDelta::try_hours(1).unwrap())
          .build()
          .unwrap(),
      )
      .await
      .unwrap();

    let claimed = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_minutes(10).unwrap())
      .await
      .unwrap();
    repository.ack(&claimed[0]).await.unwrap();

    let task = repository.find("housekeeping").await.unwrap().unwrap();
    assert!(task.last_execution.is_some());
    assert!(task.next_execution > chrono::Utc::now().naive_utc());
  }

  #[tokio::test]
  async fn test_retry_later_releases_claim() {
    let (_guard, sqlite) = sqlite_connection().await;
    let repository = TaskRepository::new(sqlite);
    repository
      .enqueue(params(TaskKind::SplitPdf, "split_pdf:2"))
      .await
      .unwrap();
    let claimed = repository
      .claim_next_tasks(TaskQueue::Conversion, 1, Duration::try_minutes(10).unwrap())
      .await
      .unwrap();
    repository
      .retry_later(&claimed[0].id, Duration::try_hours(1).unwrap())
      .await
      .unwrap();

    let task = repository.find("split_pdf:2").await.unwrap().unwrap();
    assert!(task.claimed_at.is_none());
    assert!(task.next_execution > chrono::Utc::now().naive_utc());
  }
}
