pub mod fetcher;
pub mod links;
pub mod processor;
pub mod scope;
pub mod task;

// Re-export common types
pub use fetcher::PageFetcher;
pub use processor::CrawlProcessor;
pub use task::CrawlTask;
