use crate::{
  crawler::crawler_interactor::CrawlerInteractor,
  files::content_store::ContentStore,
  helpers::{document_store::DocumentStore, flag_store::FlagStore},
  jobs::{
    crawled_file_repository::CrawledFileRepository, job_interactor::JobInteractor,
    job_repository::JobRepository, page_repository::PageRepository,
  },
  pipeline::converter::{Converter, PdfConverter},
  progress::progress_indexer::ProgressIndexer,
  scheduler::scheduler::Scheduler,
  settings::Settings,
  sqlite::SqliteConnection,
  tasks::task_repository::TaskRepository,
};
use anyhow::Result;
use std::sync::Arc;

pub struct ApplicationContext {
  pub settings: Arc<Settings>,
  pub sqlite_connection: Arc<SqliteConnection>,
  pub flags: Arc<FlagStore>,
  pub document_store: Arc<DocumentStore>,
  pub content_store: Arc<ContentStore>,
  pub progress_indexer: Arc<ProgressIndexer>,
  pub job_repository: Arc<JobRepository>,
  pub page_repository: Arc<PageRepository>,
  pub crawled_file_repository: Arc<CrawledFileRepository>,
  pub task_repository: Arc<TaskRepository>,
  pub scheduler: Arc<Scheduler>,
  pub job_interactor: Arc<JobInteractor>,
  pub crawler_interactor: Arc<CrawlerInteractor>,
  pub converter: Arc<dyn Converter>,
}

impl ApplicationContext {
  pub async fn init(settings: Arc<Settings>) -> Result<Arc<ApplicationContext>> {
    let sqlite_connection = Arc::new(SqliteConnection::new(Arc::clone(&settings)).await?);
    Self::init_with_sqlite(settings, sqlite_connection).await
  }

  pub async fn init_with_sqlite(
    settings: Arc<Settings>,
    sqlite_connection: Arc<SqliteConnection>,
  ) -> Result<Arc<ApplicationContext>> {
    let flags = Arc::new(FlagStore::new(Arc::clone(&sqlite_connection)));
    let document_store = Arc::new(DocumentStore::new(Arc::clone(&sqlite_connection)));
    let content_store = Arc::new(ContentStore::new(&settings.content_store)?);
    let progress_indexer = Arc::new(ProgressIndexer::new(
      Arc::clone(&document_store),
      settings.indexer.clone(),
    ));
    let job_repository = Arc::new(JobRepository::new(Arc::clone(&sqlite_connection)));
    let page_repository = Arc::new(PageRepository::new(Arc::clone(&sqlite_connection)));
    let crawled_file_repository =
      Arc::new(CrawledFileRepository::new(Arc::clone(&sqlite_connection)));
    let task_repository = Arc::new(TaskRepository::new(Arc::clone(&sqlite_connection)));
    let scheduler = Arc::new(Scheduler::new(
      Arc::clone(&job_repository),
      Arc::clone(&task_repository),
      settings.scheduler.clone(),
    ));
    let job_interactor = Arc::new(JobInteractor::new(
      Arc::clone(&job_repository),
      Arc::clone(&page_repository),
      Arc::clone(&task_repository),
      Arc::clone(&content_store),
      Arc::clone(&scheduler),
      Arc::clone(&progress_indexer),
    ));
    let crawler_interactor = Arc::new(CrawlerInteractor::new(
      Arc::clone(&job_repository),
      Arc::clone(&crawled_file_repository),
      Arc::clone(&task_repository),
    ));

    Ok(Arc::new(ApplicationContext {
      settings,
      sqlite_connection,
      flags,
      document_store,
      content_store,
      progress_indexer,
      job_repository,
      page_repository,
      crawled_file_repository,
      task_repository,
      scheduler,
      job_interactor,
      crawler_interactor,
      converter: Arc::new(PdfConverter),
    }))
  }
}
