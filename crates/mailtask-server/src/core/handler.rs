use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::item::{Destination, ParsedMessage, RetryableItem};

/// What a downstream handler receives for one dispatch attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub mailbox: String,
    pub source_id: u32,
    pub destination: Destination,
    /// 1 for the first dispatch, incremented on every retry.
    pub attempt: u32,
    pub received_at_unix: u64,
    pub message: Arc<ParsedMessage>
}

impl TaskEnvelope {
    pub fn for_item(item: &RetryableItem) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            mailbox: item.mailbox().to_string(),
            source_id: item.source_id(),
            destination: item.destination().clone(),
            attempt: item.attempt_count().saturating_add(1),
            received_at_unix: item.received_at_unix(),
            message: Arc::clone(item.payload())
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler unavailable: {0}")]
    Unavailable(String),
    #[error("handler rejected task: {0}")]
    Rejected(String),
    #[error("handler timed out after {0}s")]
    Timeout(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error)
}

impl HandlerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Rejected(_) => "REJECTED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Other(_) => "OTHER"
        }
    }
}

/// Opaque downstream consumer for one destination.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        task: &TaskEnvelope
    ) -> Result<(), HandlerError>;
}

/// Destination name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        destination: impl Into<String>,
        handler: Arc<dyn TaskHandler>
    ) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.insert(destination.into(), handler)
    }

    pub fn get(
        &self,
        destination: &Destination
    ) -> Option<&Arc<dyn TaskHandler>> {
        destination.name().and_then(|name| self.handlers.get(name))
    }

    pub fn destinations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
