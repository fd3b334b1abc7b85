//! Key router: routing key → partition → connection alias.

use tracing::debug;

use crate::cluster::{ClusterRegistry, ConnectionAlias};
use crate::error::ShardResult;
use crate::topology::{PartitionDescriptor, ShardTopology};

/// `key mod num_shards`, always in `[0, num_shards)` (negative keys wrap Euclidean).
pub fn shard_index_for(topology: &ShardTopology, key: i64) -> u32 {
    key.rem_euclid(i64::from(topology.num_shards())) as u32
}

pub fn partition_for(topology: &ShardTopology, key: i64) -> ShardResult<&PartitionDescriptor> {
    topology.partition(u64::from(shard_index_for(topology, key)))
}

/// Resolve through the registry using the partition's physical shard, not its logical index.
pub fn connection_for(
    registry: &ClusterRegistry,
    topology: &ShardTopology,
    key: i64,
    replica: bool,
) -> ShardResult<ConnectionAlias> {
    let partition = partition_for(topology, key)?;
    let conn = registry.resolve_connection(topology.cluster(), u64::from(partition.shard), replica)?;
    debug!(entity = %topology.entity(), key, partition = partition.index, conn = %conn, "routed");
    Ok(conn)
}
