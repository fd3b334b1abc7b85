//! Error taxonomy shared by every layer that routes or assembles IDs.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardError {
    /// Bad cluster or entity declaration. Surfaced at startup, never retried.
    #[error("configuration: {0}")]
    Configuration(String),
    /// Caller did not supply every routing key field.
    #[error("you must filter on {fields:?} before querying {entity}")]
    MissingRoutingKey { entity: String, fields: Vec<String> },
    #[error("routing key field {field} is not integer-compatible: {value}")]
    InvalidRoutingKey { field: String, value: String },
    #[error("invalid lookup: {0}")]
    InvalidLookup(String),
    #[error("unknown cluster: {0}")]
    UnknownCluster(String),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("shard {index} does not exist on {entity} ({num_shards} partitions)")]
    ShardNotFound { entity: String, index: u64, num_shards: u32 },
    /// Local clock is behind the epoch or moved backwards between two calls.
    #[error("clock skew: now={now_ms}ms is behind floor={floor_ms}ms")]
    ClockSkew { now_ms: i64, floor_ms: i64 },
    #[error("id space exhausted: {0}")]
    IdSpaceExhausted(String),
}

impl ShardError {
    pub(crate) fn config(msg: impl Into<String>) -> Self { ShardError::Configuration(msg.into()) }
}

pub type ShardResult<T> = Result<T, ShardError>;
