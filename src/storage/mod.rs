pub mod documents;
pub mod queue;

// Re-export common types
pub use documents::{DocumentStore, MongoDocumentStore};
pub use queue::RedisQueue;
