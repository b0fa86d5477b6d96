use super::{
  task::{Task, TaskQueue},
  task_repository::TaskRepository,
};
use crate::{
  context::ApplicationContext,
  errors::{classify, is_retryable},
  helpers::{flag_store::FlagStore, ThreadSafeAsyncFn},
};
use anyhow::Result;
use chrono::TimeDelta;
use derive_builder::Builder;
use std::{sync::Arc, time::Duration};
use tokio::{
  spawn,
  sync::{mpsc::unbounded_channel, oneshot},
  time::{sleep, timeout},
};
use tracing::{error, warn};

pub enum TaskProcessorStatus {
  Running,
  Paused,
}

pub type TaskExecutorFn = ThreadSafeAsyncFn<(Task, Arc<ApplicationContext>)>;

#[macro_export]
macro_rules! task_executor {
  ($f: expr) => {{
    fn f(
      (task, app_context): (
        $crate::tasks::task::Task,
        std::sync::Arc<$crate::context::ApplicationContext>,
      ),
    ) -> impl futures::Future<Output = Result<(), anyhow::Error>> + Send + 'static {
      $f(task, app_context)
    }
    $crate::helpers::async_callback(f)
  }};
}

pub struct TaskProcessorStatusRepository {
  flags: Arc<FlagStore>,
}

impl TaskProcessorStatusRepository {
  pub fn new(flags: Arc<FlagStore>) -> Self {
    Self { flags }
  }

  fn pause_flag(queue: &TaskQueue) -> String {
    format!("task_processor_paused:{}", queue)
  }

  pub async fn get(&self, queue: &TaskQueue) -> Result<TaskProcessorStatus> {
    match self.flags.is_raised(&Self::pause_flag(queue)).await? {
      true => Ok(TaskProcessorStatus::Paused),
      false => Ok(TaskProcessorStatus::Running),
    }
  }

  pub async fn set(&self, queue: &TaskQueue, status: TaskProcessorStatus) -> Result<()> {
    match status {
      TaskProcessorStatus::Paused => self.flags.raise(&Self::pause_flag(queue), None).await,
      TaskProcessorStatus::Running => self.flags.clear(&Self::pause_flag(queue)).await,
    }
  }
}

/// A worker pool over one queue. Claims are leased: a task is only removed
/// from the queue after its effects are committed, so a crashed worker's
/// claim expires and the task is redelivered.
#[derive(Builder)]
pub struct TaskProcessor {
  pub queue: TaskQueue,
  pub app_context: Arc<ApplicationContext>,
  pub executor: TaskExecutorFn,
  #[builder(default = "1")]
  pub concurrency: u32,
  #[builder(default = "Duration::from_secs(3600)")]
  pub claim_duration: Duration,
  #[builder(default = "Duration::from_secs(3300)")]
  pub soft_timeout: Duration,
  #[builder(default = "Duration::from_secs(3600)")]
  pub hard_timeout: Duration,
  #[builder(default = "Duration::from_secs(1)")]
  pub heartbeat: Duration,
  #[builder(default = "5")]
  pub max_attempts: u32,
  #[builder(setter(skip), default = "self.get_status_repo()?")]
  pub status_repository: Arc<TaskProcessorStatusRepository>,
}

impl TaskProcessorBuilder {
  fn get_status_repo(&self) -> Result<Arc<TaskProcessorStatusRepository>, String> {
    match &self.app_context {
      Some(app_context) => Ok(Arc::new(TaskProcessorStatusRepository::new(Arc::clone(
        &app_context.flags,
      )))),
      None => Err("App context is required".to_string()),
    }
  }
}

impl TaskProcessor {
  async fn handle_result(
    &self,
    task: &Task,
    result: Result<Result<()>, tokio::time::error::Elapsed>,
    task_repository: &TaskRepository,
  ) {
    match result {
      Ok(Ok(())) => {
        if let Err(e) = task_repository.ack(task).await {
          error!(message = e.to_string(), "Failed to ack task");
        }
      }
      Ok(Err(e)) => {
        let retryable = is_retryable(&e) && task.attempts < self.max_attempts;
        warn!(
          message = e.to_string(),
          task_id = task.id.as_str(),
          kind = classify(&e),
          attempts = task.attempts,
          retryable,
          "Task execution failed"
        );
        if retryable {
          let delay = TimeDelta::seconds(30 * 2_i64.pow(task.attempts.min(6)));
          if let Err(e) = task_repository.retry_later(&task.id, delay).await {
            error!(message = e.to_string(), "Failed to reschedule task");
          }
        } else if let Err(e) = task_repository.ack(task).await {
          // Acked despite the failure to avoid hot-looping; the executor has
          // already recorded the failure on the owning job.
          error!(message = e.to_string(), "Failed to ack failed task");
        }
      }
      Err(_) => {
        warn!(
          task_id = task.id.as_str(),
          "Task hit its hard timeout, releasing claim"
        );
        if let Err(e) = task_repository
          .retry_later(&task.id, TimeDelta::seconds(60))
          .await
        {
          error!(message = e.to_string(), "Failed to requeue timed out task");
        }
      }
    }
  }

  pub async fn run(self: Arc<Self>, task_repository: Arc<TaskRepository>) -> Result<()> {
    let (tx, mut rx) = unbounded_channel::<oneshot::Sender<Vec<Task>>>();
    let queue = self.queue;
    let claim_duration = self.claim_duration;
    let repo = Arc::clone(&task_repository);
    spawn(async move {
      while let Some(response_channel) = rx.recv().await {
        let tasks = repo
          .claim_next_tasks(queue, 1, TimeDelta::from_std(claim_duration)?)
          .await?;
        if let Err(t) = response_channel.send(tasks) {
          error!(message = format!("{:?}", t), "Failed to send task to worker");
        }
      }
      Ok::<_, anyhow::Error>(())
    });

    for _ in 0..self.concurrency {
      let tx = tx.clone();
      let processor = Arc::clone(&self);
      let task_repository = Arc::clone(&task_repository);

      spawn(async move {
        loop {
          match processor.status_repository.get(&processor.queue).await {
            Ok(TaskProcessorStatus::Paused) => {
              sleep(processor.heartbeat).await;
              continue;
            }
            Err(e) => {
              error!(message = e.to_string(), "Failed to get processor status");
              sleep(processor.heartbeat).await;
              continue;
            }
            _ => {}
          }

          let (task_sender, task_receiver) = oneshot::channel();
          if let Err(e) = tx.send(task_sender) {
            error!(message = format!("{:?}", e), "Failed to send claim request");
          }
          match task_receiver.await {
            Ok(tasks) => {
              for task in tasks {
                // The soft timeout surfaces a retryable error so the task is
                // redelivered against its checkpointed state; the hard
                // timeout is the backstop that kills the future outright.
                let soft_timeout = processor.soft_timeout;
                let result = timeout(processor.hard_timeout, async {
                  tokio::select! {
                    result = (processor.executor)((task.clone(), Arc::clone(&processor.app_context))) => result,
                    _ = sleep(soft_timeout) => Err(
                      crate::errors::CoreError::Transient(
                        "task exceeded its soft timeout".to_string(),
                      )
                      .into(),
                    ),
                  }
                })
                .await;
                processor.handle_result(&task, result, &task_repository).await;
              }
            }
            Err(e) => {
              error!(message = e.to_string(), "Failed to receive task");
            }
          }
          sleep(processor.heartbeat).await;
        }
      });
    }
    Ok(())
  }
}
