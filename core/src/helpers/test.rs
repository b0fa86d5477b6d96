use crate::{settings::Settings, sqlite::SqliteConnection};
use std::sync::Arc;
use tempfile::TempDir;

/// Fresh migrated database in a temp directory. The directory guard must be
/// kept alive for the duration of the test.
pub async fn sqlite_connection() -> (TempDir, Arc<SqliteConnection>) {
  let dir = tempfile::tempdir().unwrap();
  let connection = SqliteConnection::new_at_dir(dir.path().to_str().unwrap())
    .await
    .unwrap();
  (dir, Arc::new(connection))
}

pub fn test_settings() -> Arc<Settings> {
  let mut settings = Settings::default();
  settings.content_store.endpoint = "http://localhost:9000".to_string();
  settings.content_store.region = "us-east-1".to_string();
  settings.crawler.user_agent = "docmill-test".to_string();
  settings.crawler.max_retries = 3;
  settings.pipeline.max_pages_per_document = 2000;
  settings.pipeline.inline_markdown_max_bytes = 65536;
  settings.indexer.flush_max_docs = 100;
  settings.indexer.flush_interval_seconds = 5;
  settings.indexer.buffer_capacity = 10000;
  settings.indexer.metric_retention_days = 7;
  settings.indexer.event_retention_days = 90;
  settings.scheduler.next_runs_window = 5;
  settings.scheduler.max_trigger_ttl_seconds = 3600;
  Arc::new(settings)
}
