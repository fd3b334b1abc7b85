//! Lifecycle of one gateway operation, as types.
//!
//! A [`PendingOp`] holds no partition yet. Routing either fails (missing or
//! invalid key) or yields a [`RoutedOp`], and only a routed op can reach
//! storage: [`RoutedOp::execute`] runs the storage work and ends the
//! lifecycle as completed or failed.

use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use shardkit_core::router;
use shardkit_core::{ConnectionAlias, FieldSource, PartitionDescriptor, ShardTopology};
use tracing::{debug, trace};

use crate::GatewayResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Filter,
    Get,
    Create,
    GetOrCreate,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Filter => "filter",
            OpKind::Get => "get",
            OpKind::Create => "create",
            OpKind::GetOrCreate => "get_or_create",
        }
    }
}

fn finish(kind: OpKind, outcome: &'static str, started: Instant) {
    counter!("gateway_ops_total", 1u64, "op" => kind.as_str(), "outcome" => outcome);
    histogram!("gateway_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => kind.as_str());
}

/// Arguments captured, routing key not yet resolved.
#[derive(Debug)]
pub struct PendingOp<'t> {
    topology: &'t ShardTopology,
    kind: OpKind,
    started: Instant,
}

impl<'t> PendingOp<'t> {
    pub fn new(topology: &'t ShardTopology, kind: OpKind) -> Self { Self { topology, kind, started: Instant::now() } }

    /// Compute the routing key from `values` and pick the partition.
    pub fn route<V: FieldSource + ?Sized>(self, values: &V, replica: bool) -> GatewayResult<RoutedOp<'t>> {
        let routed = self
            .topology
            .key_from_values(values)
            .and_then(|key| router::partition_for(self.topology, key).map(|p| (key, p)));
        match routed {
            Ok((key, partition)) => {
                let conn = partition.connection(replica).clone();
                debug!(
                    entity = %self.topology.entity(),
                    op = self.kind.as_str(),
                    key,
                    partition = partition.index,
                    conn = %conn,
                    "routed"
                );
                Ok(RoutedOp { kind: self.kind, key: Some(key), partition, conn, started: self.started })
            }
            Err(e) => {
                debug!(entity = %self.topology.entity(), op = self.kind.as_str(), error = %e, "routing failed");
                finish(self.kind, "failed", self.started);
                Err(e.into())
            }
        }
    }

    /// The caller already holds a partition; no key is needed.
    pub fn at(self, partition: &'t PartitionDescriptor, replica: bool) -> RoutedOp<'t> {
        RoutedOp {
            kind: self.kind,
            key: None,
            partition,
            conn: partition.connection(replica).clone(),
            started: self.started,
        }
    }
}

/// Bound to exactly one partition and connection.
#[derive(Debug)]
pub struct RoutedOp<'t> {
    kind: OpKind,
    key: Option<i64>,
    partition: &'t PartitionDescriptor,
    conn: ConnectionAlias,
    started: Instant,
}

impl<'t> RoutedOp<'t> {
    pub fn kind(&self) -> OpKind { self.kind }
    /// `None` when the op was addressed to a partition directly.
    pub fn key(&self) -> Option<i64> { self.key }
    pub fn partition(&self) -> &'t PartitionDescriptor { self.partition }
    pub fn conn(&self) -> &ConnectionAlias { &self.conn }

    pub fn execute<T, F>(self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&'t PartitionDescriptor, &ConnectionAlias) -> GatewayResult<T>,
    {
        trace!(op = self.kind.as_str(), partition = self.partition.index, conn = %self.conn, "executing");
        let out = f(self.partition, &self.conn);
        finish(self.kind, if out.is_ok() { "completed" } else { "failed" }, self.started);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayError;
    use shardkit_core::{ClusterRegistry, EntitySpec, Filter, ShardError};

    fn topology() -> ShardTopology {
        let mut reg = ClusterRegistry::new();
        reg.register("sharded", 2).unwrap();
        ShardTopology::declare(EntitySpec::new("Choice", "sharded", 4, &["poll_id"]), &reg).unwrap()
    }

    #[test]
    fn routes_to_partition_and_physical_shard() {
        let t = topology();
        let op = PendingOp::new(&t, OpKind::Filter).route(&Filter::new().eq("poll_id", 7), true).unwrap();
        assert_eq!(op.key(), Some(7));
        assert_eq!(op.partition().index, 3);
        assert_eq!(op.conn().as_str(), "sharded.slave.shard1");
    }

    #[test]
    fn missing_key_never_executes() {
        let t = topology();
        let err = PendingOp::new(&t, OpKind::Get).route(&Filter::new().eq("id", 1), false).unwrap_err();
        assert!(matches!(err, GatewayError::Shard(ShardError::MissingRoutingKey { ref fields, .. }) if fields == &["poll_id"]));
        // suffixed lookups never count toward the key
        let gte = Filter::new().op("poll_id", shardkit_core::LookupOp::Gte, 1);
        assert!(PendingOp::new(&t, OpKind::Filter).route(&gte, false).unwrap_err().is_missing_routing_key());
    }

    #[test]
    fn direct_ops_have_no_key() {
        let t = topology();
        let op = PendingOp::new(&t, OpKind::Filter).at(&t.partitions()[2], false);
        assert_eq!(op.key(), None);
        assert_eq!(op.conn().as_str(), "sharded.shard0");
        let index = op.execute(|p, _| Ok(p.index)).unwrap();
        assert_eq!(index, 2);
    }
}
