use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{QueueError, TaskKind};
use crate::error::CrawlError;

/// Executes the payload of one task kind
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> Result<(), CrawlError>;
}

/// Task kind -> handler mapping, fixed before the workers start
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a task kind name
    ///
    /// Unknown names and duplicate registrations are configuration errors.
    pub fn register(&mut self, kind: &str, handler: Arc<dyn TaskHandler>) -> Result<TaskKind, QueueError> {
        let kind: TaskKind = kind.parse()?;

        if self.handlers.contains_key(&kind) {
            return Err(QueueError::DuplicateHandler(kind));
        }

        debug!("Registered handler for {}", kind);
        self.handlers.insert(kind, handler);

        Ok(kind)
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().copied().collect()
    }
}
