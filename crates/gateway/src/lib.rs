//! Shardkit gateway: keyed operations over a partitioned entity.
//!
//! Every operation derives the routing key from its arguments, resolves one
//! partition and runs against that partition's connection only. Frontends
//! (the CLI, services embedding shardkit) depend on this crate, not on the
//! storage backends directly.

#![forbid(unsafe_code)]

use shardkit_core::{ConnectionAlias, ShardError};
use shardkit_store::{Storage, StoreError};
use tracing::warn;

mod manager;
pub mod op;

pub use manager::{PartitionedManager, ShardHandle};
pub use op::{OpKind, PendingOp, RoutedOp};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{entity} matching query does not exist")]
    NotFound { entity: String },
    #[error("get() returned more than one {entity}: it returned {count}")]
    MultipleReturned { entity: String, count: usize },
    /// Manual id strategy and no primary key in the row.
    #[error("{entity}.{field} must be supplied")]
    MissingPrimaryKey { entity: String, field: String },
    /// Create-if-absent hit a unique violation and the retried lookup still found nothing.
    #[error("{entity}: create lost a race but the conflicting row is not visible")]
    RaceCondition {
        entity: String,
        #[source]
        source: StoreError,
    },
}

impl GatewayError {
    pub fn is_missing_routing_key(&self) -> bool {
        matches!(self, GatewayError::Shard(ShardError::MissingRoutingKey { .. }))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Run `f` inside one outer unit of work on `conn`: committed when `f`
/// succeeds, rolled back otherwise.
pub fn atomic<S, T, F>(store: &S, conn: &ConnectionAlias, f: F) -> GatewayResult<T>
where
    S: Storage + ?Sized,
    F: FnOnce() -> GatewayResult<T>,
{
    store.begin(conn)?;
    match f() {
        Ok(v) => {
            store.commit(conn)?;
            Ok(v)
        }
        Err(e) => {
            if let Err(rb) = store.rollback(conn) {
                warn!(conn = %conn, error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardkit_core::{Filter, Record};
    use shardkit_store::{MemoryStore, TableSpec};

    fn rec(v: serde_json::Value) -> Record { v.as_object().cloned().unwrap() }

    #[test]
    fn atomic_rolls_back_on_error() {
        let store = MemoryStore::new();
        let conn = ConnectionAlias::from("sharded.shard0");
        let spec = TableSpec { name: "t".into(), columns: vec![], primary_key: "id".into(), unique_together: vec![], check: None };
        store.ensure_table(&conn, &spec).unwrap();

        let err = atomic(&store, &conn, || {
            store.insert(&conn, "t", &rec(json!({"id": 1})))?;
            Err::<(), _>(GatewayError::NotFound { entity: "T".into() })
        })
        .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
        assert!(store.select(&conn, "t", &Filter::new()).unwrap().is_empty());

        atomic(&store, &conn, || Ok(store.insert(&conn, "t", &rec(json!({"id": 2})))?)).unwrap();
        assert_eq!(store.select(&conn, "t", &Filter::new()).unwrap().len(), 1);
    }
}
