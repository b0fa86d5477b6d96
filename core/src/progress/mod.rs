pub mod progress_indexer;
