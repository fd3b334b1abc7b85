//! Cluster registry: named groups of physical shard connections.
//!
//! A cluster `sharded` of size 2 owns the primary aliases `sharded.shard0`,
//! `sharded.shard1` and the replica aliases `sharded.slave.shard0`,
//! `sharded.slave.shard1`. The registry is filled once at startup and then
//! shared read-only.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ShardError, ShardResult};

const REPLICA_SEGMENT: &str = ".slave";

/// Name of a concrete database connection, e.g. `sharded.slave.shard1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionAlias(String);

impl ConnectionAlias {
    pub fn new(alias: impl Into<String>) -> Self { Self(alias.into()) }

    /// Format `{cluster}[.slave].shard{shard}`.
    pub fn format(cluster: &str, shard: u32, replica: bool) -> Self {
        let mut s = String::with_capacity(cluster.len() + 16);
        s.push_str(cluster);
        if replica { s.push_str(REPLICA_SEGMENT); }
        s.push_str(".shard");
        s.push_str(&shard.to_string());
        Self(s)
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn is_replica(&self) -> bool { self.0.contains(".slave.shard") }

    /// The primary alias this alias mirrors (itself when already primary).
    pub fn primary(&self) -> ConnectionAlias {
        if self.is_replica() { Self(self.0.replacen(".slave.shard", ".shard", 1)) } else { self.clone() }
    }
}

impl fmt::Display for ConnectionAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl AsRef<str> for ConnectionAlias {
    fn as_ref(&self) -> &str { &self.0 }
}

impl From<&str> for ConnectionAlias {
    fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl From<String> for ConnectionAlias {
    fn from(v: String) -> Self { Self(v) }
}

/// One physical shard of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardSlot {
    pub shard: u32,
    pub primary: ConnectionAlias,
    pub replica: ConnectionAlias,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    name: String,
    slots: Vec<ShardSlot>,
}

impl Cluster {
    fn new(name: &str, size: u32) -> Self {
        let slots = (0..size)
            .map(|shard| ShardSlot {
                shard,
                primary: ConnectionAlias::format(name, shard, false),
                replica: ConnectionAlias::format(name, shard, true),
            })
            .collect();
        Self { name: name.to_string(), slots }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn size(&self) -> u32 { self.slots.len() as u32 }
    pub fn slots(&self) -> &[ShardSlot] { &self.slots }

    /// Slot owning `shard_index` after wrapping it onto the physical shard count.
    pub fn slot(&self, shard_index: u64) -> &ShardSlot {
        &self.slots[(shard_index % self.slots.len() as u64) as usize]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: FxHashMap<String, Cluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self { Self::default() }

    /// Declare a cluster. Re-registering with the same size is a no-op.
    pub fn register(&mut self, name: &str, size: u32) -> ShardResult<&Cluster> {
        if name.is_empty() {
            return Err(ShardError::config("cluster name must not be empty"));
        }
        if size == 0 {
            return Err(ShardError::config(format!("cluster {} cannot be empty", name)));
        }
        if let Some(existing) = self.clusters.get(name) {
            if existing.size() != size {
                return Err(ShardError::config(format!(
                    "cluster {} already registered with {} shards (got {})",
                    name, existing.size(), size
                )));
            }
        } else {
            info!(cluster = %name, size, "cluster registered");
            self.clusters.insert(name.to_string(), Cluster::new(name, size));
        }
        Ok(&self.clusters[name])
    }

    /// Build a registry from configured connection names of the form `<cluster>.shard<N>`.
    pub fn discover<I, S>(names: I) -> ShardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut reg = Self::new();
        reg.discover_into(names)?;
        Ok(reg)
    }

    /// Count primary aliases per cluster prefix and register each cluster.
    /// Indices must be contiguous from zero; replica aliases never declare a cluster.
    pub fn discover_into<I, S>(&mut self, names: I) -> ShardResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let re = Regex::new(r"^(?P<cluster>.+?)(?P<replica>\.slave)?\.shard(?P<num>\d+)$")
            .map_err(|e| ShardError::config(e.to_string()))?;
        let mut found: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let Some(caps) = re.captures(name) else {
                debug!(conn = %name, "connection is not a shard alias; skipped");
                continue;
            };
            if caps.name("replica").is_some() {
                continue;
            }
            let num: u32 = caps["num"]
                .parse()
                .map_err(|_| ShardError::config(format!("shard number out of range in {}", name)))?;
            if !found.entry(caps["cluster"].to_string()).or_default().insert(num) {
                warn!(conn = %name, "duplicate shard alias");
            }
        }
        for (cluster, nums) in found {
            let size = nums.len() as u32;
            if let Some(gap) = (0..size).find(|n| !nums.contains(n)) {
                return Err(ShardError::config(format!(
                    "cluster {} has a gap at shard{} ({} aliases found)",
                    cluster, gap, size
                )));
            }
            self.register(&cluster, size)?;
        }
        Ok(())
    }

    pub fn cluster(&self, name: &str) -> ShardResult<&Cluster> {
        self.clusters.get(name).ok_or_else(|| ShardError::UnknownCluster(name.to_string()))
    }

    pub fn size(&self, name: &str) -> ShardResult<u32> { self.cluster(name).map(Cluster::size) }

    pub fn contains(&self, name: &str) -> bool { self.clusters.contains_key(name) }

    /// `{cluster}[.slave].shard{shard_index % size}`.
    pub fn resolve_connection(&self, name: &str, shard_index: u64, replica: bool) -> ShardResult<ConnectionAlias> {
        let slot = self.cluster(name)?.slot(shard_index);
        Ok(if replica { slot.replica.clone() } else { slot.primary.clone() })
    }

    /// Clusters ordered by name.
    pub fn clusters(&self) -> Vec<&Cluster> {
        let mut v: Vec<_> = self.clusters.values().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_zero_and_conflicting_sizes() {
        let mut reg = ClusterRegistry::new();
        assert!(matches!(reg.register("sharded", 0), Err(ShardError::Configuration(_))));
        reg.register("sharded", 2).unwrap();
        reg.register("sharded", 2).unwrap();
        assert!(matches!(reg.register("sharded", 3), Err(ShardError::Configuration(_))));
        assert_eq!(reg.size("sharded").unwrap(), 2);
    }

    #[test]
    fn unknown_cluster() {
        let reg = ClusterRegistry::new();
        assert_eq!(reg.size("nope"), Err(ShardError::UnknownCluster("nope".into())));
        assert!(reg.resolve_connection("nope", 0, false).is_err());
    }

    #[test]
    fn resolve_wraps_onto_physical_shards() {
        let mut reg = ClusterRegistry::new();
        reg.register("sharded", 3).unwrap();
        for i in 0..20u64 {
            assert_eq!(reg.resolve_connection("sharded", i, false).unwrap(), reg.resolve_connection("sharded", i + 3, false).unwrap());
            assert_eq!(reg.resolve_connection("sharded", i, true).unwrap(), reg.resolve_connection("sharded", i + 3, true).unwrap());
        }
        assert_eq!(reg.resolve_connection("sharded", 4, false).unwrap().as_str(), "sharded.shard1");
        assert_eq!(reg.resolve_connection("sharded", 4, true).unwrap().as_str(), "sharded.slave.shard1");
    }

    #[test]
    fn discover_counts_primaries_per_prefix() {
        let reg = ClusterRegistry::discover([
            "default",
            "sharded.shard0",
            "sharded.shard1",
            "sharded.slave.shard0",
            "sharded.slave.shard1",
            "eu.west.shard0",
        ])
        .unwrap();
        assert_eq!(reg.size("sharded").unwrap(), 2);
        assert_eq!(reg.size("eu.west").unwrap(), 1);
        assert!(!reg.contains("sharded.slave"));
        assert!(!reg.contains("default"));
    }

    #[test]
    fn discover_rejects_gaps() {
        let err = ClusterRegistry::discover(["c.shard0", "c.shard2"]).unwrap_err();
        assert!(matches!(err, ShardError::Configuration(_)));
    }

    #[test]
    fn alias_primary_of_replica() {
        let a = ConnectionAlias::format("sharded", 1, true);
        assert!(a.is_replica());
        assert_eq!(a.primary().as_str(), "sharded.shard1");
        assert_eq!(a.primary().primary(), a.primary());
    }
}
