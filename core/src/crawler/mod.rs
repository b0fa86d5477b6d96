pub mod crawler_interactor;
pub mod crawler_jobs;
pub mod engine;
pub mod headless_engine;
pub mod html_parser_engine;
pub mod retry_engine;

mod crawler_worker;
mod progress_tracker;
mod robots;
