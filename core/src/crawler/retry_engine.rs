use super::engine::FetchError;
use crate::jobs::job::{
  AttemptStatus, CrawlerConfig, EngineKind, ErrorType, RetryHistoryEntry, RetryStrategyEntry,
};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AttemptFailure {
  pub error_type: ErrorType,
  pub message: String,
  pub cancelled: bool,
}

impl AttemptFailure {
  pub fn cancelled() -> Self {
    Self {
      error_type: ErrorType::Other,
      message: "execution cancelled".to_string(),
      cancelled: true,
    }
  }

  pub fn internal(message: String) -> Self {
    Self {
      error_type: ErrorType::Other,
      message,
      cancelled: false,
    }
  }
}

impl From<FetchError> for AttemptFailure {
  fn from(error: FetchError) -> Self {
    Self {
      error_type: error.error_type(),
      message: error.to_string(),
      cancelled: false,
    }
  }
}

#[derive(Debug)]
pub struct RetryRun<T> {
  pub outcome: Option<T>,
  pub history: Vec<RetryHistoryEntry>,
  pub engine_used: Option<EngineKind>,
  pub proxy_used: Option<bool>,
  pub cancelled: bool,
}

impl<T> RetryRun<T> {
  pub fn succeeded(&self) -> bool {
    self.outcome.is_some()
  }

  pub fn failure_summary(&self) -> String {
    self
      .history
      .iter()
      .map(|entry| {
        format!(
          "attempt {} ({}{}): {} {}",
          entry.attempt,
          entry.engine,
          if entry.use_proxy { ", proxy" } else { "" },
          entry.status,
          entry.error_message.as_deref().unwrap_or("")
        )
      })
      .collect::<Vec<_>>()
      .join("; ")
  }
}

pub fn builtin_strategy(name: &str) -> Option<Vec<RetryStrategyEntry>> {
  let entry = |attempt, engine, use_proxy, delay_seconds| RetryStrategyEntry {
    attempt,
    engine,
    use_proxy,
    delay_seconds,
  };
  match name {
    "conservative" => Some(vec![
      entry(0, EngineKind::HtmlParser, false, 0),
      entry(1, EngineKind::HtmlParser, false, 30),
      entry(2, EngineKind::HeadlessBrowser, false, 60),
    ]),
    "aggressive" => Some(vec![
      entry(0, EngineKind::HeadlessBrowser, false, 0),
      entry(1, EngineKind::HeadlessBrowser, true, 5),
      entry(2, EngineKind::HtmlParser, true, 15),
    ]),
    "proxy_first" => Some(vec![
      entry(0, EngineKind::HtmlParser, true, 0),
      entry(1, EngineKind::HeadlessBrowser, true, 15),
      entry(2, EngineKind::HeadlessBrowser, false, 45),
    ]),
    "balanced" => Some(vec![
      entry(0, EngineKind::HtmlParser, false, 0),
      entry(1, EngineKind::HtmlParser, true, 10),
      entry(2, EngineKind::HeadlessBrowser, false, 30),
      entry(3, EngineKind::HeadlessBrowser, true, 60),
    ]),
    _ => None,
  }
}

/// Materializes the attempt list for a crawler config. The explicit strategy
/// wins, then a named built-in, then `balanced` when retries are enabled; a
/// retry-disabled config gets exactly one attempt with its own engine (or the
/// default engine when omitted). The global retry cap truncates longer lists.
pub fn resolve_strategy(
  config: &CrawlerConfig,
  global_max_retries: u32,
  default_engine: EngineKind,
) -> Vec<RetryStrategyEntry> {
  let single = vec![RetryStrategyEntry {
    attempt: 0,
    engine: config.engine.unwrap_or(default_engine),
    use_proxy: config.use_proxy,
    delay_seconds: 0,
  }];
  if !config.retry_enabled {
    return single;
  }

  let mut strategy = if !config.retry_strategy.is_empty() {
    config.retry_strategy.clone()
  } else if let Some(name) = &config.retry_strategy_name {
    builtin_strategy(name).unwrap_or_else(|| single.clone())
  } else {
    builtin_strategy("balanced").expect("balanced is a built-in")
  };

  let max_attempts = (config.max_retries.min(global_max_retries) + 1) as usize;
  strategy.truncate(max_attempts.max(1));
  strategy
}

/// The per-attempt coordinator: walks the strategy in order, sleeping each
/// entry's delay, invoking the attempt with that entry's engine/proxy, and
/// recording one history entry per attempt. Cancellation between attempts
/// aborts before the next sleep.
pub async fn run_with_strategy<T, F, Fut, C, CFut>(
  strategy: &[RetryStrategyEntry],
  attempt_fn: F,
  is_cancelled: C,
) -> RetryRun<T>
where
  F: Fn(RetryStrategyEntry) -> Fut,
  Fut: Future<Output = Result<T, AttemptFailure>>,
  C: Fn() -> CFut,
  CFut: Future<Output = bool>,
{
  let mut run = RetryRun {
    outcome: None,
    history: Vec::with_capacity(strategy.len()),
    engine_used: None,
    proxy_used: None,
    cancelled: false,
  };

  for entry in strategy {
    if is_cancelled().await {
      run.cancelled = true;
      run.history.push(RetryHistoryEntry {
        attempt: entry.attempt,
        engine: entry.engine,
        use_proxy: entry.use_proxy,
        started_at: chrono::Utc::now().naive_utc(),
        completed_at: chrono::Utc::now().naive_utc(),
        status: AttemptStatus::Cancelled,
        error_type: None,
        error_message: None,
        duration_seconds: 0.0,
      });
      break;
    }

    if entry.delay_seconds > 0 {
      sleep(Duration::from_secs(entry.delay_seconds as u64)).await;
    }

    let started_at = chrono::Utc::now().naive_utc();
    let started = std::time::Instant::now();
    let result = attempt_fn(*entry).await;
    let completed_at = chrono::Utc::now().naive_utc();
    let duration_seconds = started.elapsed().as_secs_f64();

    run.engine_used = Some(entry.engine);
    run.proxy_used = Some(entry.use_proxy);

    match result {
      Ok(outcome) => {
        run.history.push(RetryHistoryEntry {
          attempt: entry.attempt,
          engine: entry.engine,
          use_proxy: entry.use_proxy,
          started_at,
          completed_at,
          status: AttemptStatus::Success,
          error_type: None,
          error_message: None,
          duration_seconds,
        });
        run.outcome = Some(outcome);
        info!(attempt = entry.attempt, "Crawl attempt succeeded");
        break;
      }
      Err(failure) => {
        let status = if failure.cancelled {
          AttemptStatus::Cancelled
        } else {
          AttemptStatus::Failed
        };
        warn!(
          attempt = entry.attempt,
          error = failure.message.as_str(),
          "Crawl attempt failed"
        );
        run.history.push(RetryHistoryEntry {
          attempt: entry.attempt,
          engine: entry.engine,
          use_proxy: entry.use_proxy,
          started_at,
          completed_at,
          status,
          error_type: Some(failure.error_type),
          error_message: Some(failure.message),
          duration_seconds,
        });
        if failure.cancelled {
          run.cancelled = true;
          break;
        }
      }
    }
  }

  run
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  };

  fn config_with(entries: Vec<RetryStrategyEntry>) -> CrawlerConfig {
    CrawlerConfig {
      mode: crate::jobs::job::CrawlMode::PageOnly,
      engine: Some(EngineKind::HtmlParser),
      use_proxy: false,
      proxy: None,
      asset_types: vec![],
      file_extensions: vec![],
      pdf_handling: crate::jobs::job::PdfHandling::Individual,
      max_depth: 1,
      follow_external_links: false,
      retry_enabled: true,
      max_retries: 3,
      retry_strategy: entries,
      retry_strategy_name: None,
    }
  }

  fn entry(
    attempt: u32,
    engine: EngineKind,
    use_proxy: bool,
    delay_seconds: u32,
  ) -> RetryStrategyEntry {
    RetryStrategyEntry {
      attempt,
      engine,
      use_proxy,
      delay_seconds,
    }
  }

  #[test]
  fn test_resolve_strategy() {
    let mut config = config_with(vec![]);
    assert_eq!(resolve_strategy(&config, 3, EngineKind::HtmlParser).len(), 4);

    config.retry_enabled = false;
    let single = resolve_strategy(&config, 3, EngineKind::HtmlParser);
    assert_eq!(single.len(), 1);
    assert_eq!(single[0].engine, EngineKind::HtmlParser);
    assert!(!single[0].use_proxy);

    config.retry_enabled = true;
    config.retry_strategy_name = Some("aggressive".to_string());
    let aggressive = resolve_strategy(&config, 3, EngineKind::HtmlParser);
    assert_eq!(aggressive[0].engine, EngineKind::HeadlessBrowser);

    // The global cap truncates longer strategies.
    config.retry_strategy_name = None;
    let capped = resolve_strategy(&config, 1, EngineKind::HtmlParser);
    assert_eq!(capped.len(), 2);
  }

  #[tokio::test]
  async fn test_engine_fallback_succeeds_on_third_attempt() {
    let strategy = vec![
      entry(0, EngineKind::HtmlParser, false, 0),
      entry(1, EngineKind::HtmlParser, true, 0),
      entry(2, EngineKind::HeadlessBrowser, false, 0),
    ];
    let calls = Arc::new(AtomicU32::new(0));
    let attempt_calls = Arc::clone(&calls);

    let run = run_with_strategy(
      &strategy,
      move |entry| {
        let calls = Arc::clone(&attempt_calls);
        async move {
          match calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(AttemptFailure::from(FetchError::Status(403))),
            1 => Err(AttemptFailure::from(FetchError::Timeout)),
            _ => Ok(entry.engine),
          }
        }
      },
      || async { false },
    )
    .await;

    assert!(run.succeeded());
    assert_eq!(run.history.len(), 3);
    assert_eq!(run.history[0].status, AttemptStatus::Failed);
    assert_eq!(run.history[0].error_type, Some(ErrorType::Http4xx));
    assert_eq!(run.history[1].error_type, Some(ErrorType::Timeout));
    assert_eq!(run.history[2].status, AttemptStatus::Success);
    assert_eq!(run.engine_used, Some(EngineKind::HeadlessBrowser));
    assert_eq!(run.proxy_used, Some(false));
  }

  #[tokio::test]
  async fn test_single_entry_failure_surfaces_that_error() {
    let strategy = vec![entry(0, EngineKind::HtmlParser, false, 0)];
    let run: RetryRun<()> = run_with_strategy(
      &strategy,
      |_| async { Err(AttemptFailure::from(FetchError::Status(500))) },
      || async { false },
    )
    .await;

    assert!(!run.succeeded());
    assert_eq!(run.history.len(), 1);
    assert_eq!(run.engine_used, Some(EngineKind::HtmlParser));
    assert_eq!(run.proxy_used, Some(false));
    assert!(run.failure_summary().contains("http status 500"));
  }

  #[tokio::test]
  async fn test_cancellation_between_attempts() {
    let strategy = vec![
      entry(0, EngineKind::HtmlParser, false, 0),
      entry(1, EngineKind::HeadlessBrowser, false, 0),
    ];
    let calls = Arc::new(AtomicU32::new(0));
    let attempt_calls = Arc::clone(&calls);
    let cancel_calls = Arc::clone(&calls);

    let run: RetryRun<()> = run_with_strategy(
      &strategy,
      move |_| {
        let calls = Arc::clone(&attempt_calls);
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err(AttemptFailure::from(FetchError::Timeout))
        }
      },
      move || {
        let calls = Arc::clone(&cancel_calls);
        async move { calls.load(Ordering::SeqCst) > 0 }
      },
    )
    .await;

    assert!(run.cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.history.len(), 2);
    assert_eq!(run.history[1].status, AttemptStatus::Cancelled);
  }

  #[test]
  fn test_builtin_strategies_are_well_formed() {
    for name in ["conservative", "aggressive", "proxy_first", "balanced"] {
      let strategy = builtin_strategy(name).unwrap();
      for (index, entry) in strategy.iter().enumerate() {
        assert_eq!(entry.attempt, index as u32);
      }
      assert_eq!(strategy[0].delay_seconds, 0);
    }
    assert!(builtin_strategy("bold").is_none());
  }
}
