//! Lifecycle callbacks fired after gateway operations complete.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShardEvent {
    Fetched { entity: String, partition: u32, rows: usize },
    Saved { entity: String, partition: u32, pk: Value, created: bool },
}

impl ShardEvent {
    pub fn entity(&self) -> &str {
        match self {
            ShardEvent::Fetched { entity, .. } | ShardEvent::Saved { entity, .. } => entity,
        }
    }

    pub fn partition(&self) -> u32 {
        match self {
            ShardEvent::Fetched { partition, .. } | ShardEvent::Saved { partition, .. } => *partition,
        }
    }
}

/// Registered on a topology; every partition reports through its parent.
pub trait LifecycleObserver: Send + Sync {
    fn on_event(&self, event: &ShardEvent);
}

impl<F> LifecycleObserver for F
where
    F: Fn(&ShardEvent) + Send + Sync,
{
    fn on_event(&self, event: &ShardEvent) { self(event) }
}
