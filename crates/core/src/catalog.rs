//! Process-wide catalog of declared entities.
//!
//! Declarations happen at startup; lookups afterwards are lock-free reads of
//! an `ArcSwap` snapshot.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::cluster::{ClusterRegistry, ConnectionAlias};
use crate::error::{ShardError, ShardResult};
use crate::router;
use crate::topology::{EntitySpec, ShardTopology};

type EntityMap = FxHashMap<String, Arc<ShardTopology>>;

pub struct Catalog {
    registry: Arc<ClusterRegistry>,
    entities: ArcSwap<EntityMap>,
    declare_lock: Mutex<()>,
}

impl Catalog {
    pub fn new(registry: ClusterRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            entities: ArcSwap::from_pointee(EntityMap::default()),
            declare_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &ClusterRegistry { &self.registry }

    /// Declare an entity once. Repeating an identical declaration returns the
    /// existing topology; a different declaration under the same name fails.
    pub fn declare(&self, spec: EntitySpec) -> ShardResult<Arc<ShardTopology>> {
        let _guard = self.declare_lock.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.entities.load();
        if let Some(existing) = current.get(&spec.name) {
            if existing.spec() == &spec {
                return Ok(Arc::clone(existing));
            }
            warn!(entity = %spec.name, "conflicting redeclaration rejected");
            return Err(ShardError::Configuration(format!("{} is already declared with different options", spec.name)));
        }
        let topology = Arc::new(ShardTopology::declare(spec, &self.registry)?);
        if let Some(clash) = current.values().find(|t| t.table() == topology.table()) {
            return Err(ShardError::Configuration(format!(
                "{} and {} share storage name {}",
                clash.entity(), topology.entity(), topology.table()
            )));
        }
        let mut next: EntityMap = (**current).clone();
        next.insert(topology.entity().to_string(), Arc::clone(&topology));
        self.entities.store(Arc::new(next));
        info!(
            entity = %topology.entity(),
            cluster = %topology.cluster(),
            num_shards = topology.num_shards(),
            key = ?topology.key(),
            "entity declared"
        );
        Ok(topology)
    }

    pub fn topology(&self, entity: &str) -> ShardResult<Arc<ShardTopology>> {
        self.entities.load().get(entity).cloned().ok_or_else(|| ShardError::UnknownEntity(entity.to_string()))
    }

    /// Declared entities ordered by name.
    pub fn entities(&self) -> Vec<Arc<ShardTopology>> {
        let mut v: Vec<_> = self.entities.load().values().cloned().collect();
        v.sort_by(|a, b| a.entity().cmp(b.entity()));
        v
    }

    /// Map a storage name (the entity table or one of its partition tables)
    /// back to the declaring entity.
    pub fn canonical_entity(&self, table: &str) -> Option<Arc<ShardTopology>> {
        let map = self.entities.load();
        map.values()
            .find(|t| {
                t.table() == table
                    || table
                        .strip_prefix(t.table())
                        .and_then(|rest| rest.strip_prefix('_'))
                        .and_then(|n| n.parse::<u64>().ok())
                        .map_or(false, |n| t.partition(n).map_or(false, |p| p.table == table))
            })
            .cloned()
    }

    pub fn is_partitioned(&self, table: &str) -> bool { self.canonical_entity(table).is_some() }

    pub fn connection_for(&self, entity: &str, key: i64, replica: bool) -> ShardResult<ConnectionAlias> {
        let t = self.topology(entity)?;
        router::connection_for(&self.registry, &t, key, replica)
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("clusters", &self.registry.clusters().len())
            .field("entities", &self.entities.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        let mut reg = ClusterRegistry::new();
        reg.register("sharded", 2).unwrap();
        Catalog::new(reg)
    }

    #[test]
    fn redeclaration_is_idempotent() {
        let c = catalog();
        let a = c.declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"])).unwrap();
        let b = c.declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"])).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(c.entities().len(), 1);
        assert!(matches!(
            c.declare(EntitySpec::new("Choice", "sharded", 4, &["poll_id"])),
            Err(ShardError::Configuration(_))
        ));
        assert!(Arc::ptr_eq(&a, &c.topology("Choice").unwrap()));
    }

    #[test]
    fn canonical_entity_of_partition_tables() {
        let c = catalog();
        c.declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"])).unwrap();
        assert_eq!(c.canonical_entity("choice").unwrap().entity(), "Choice");
        assert_eq!(c.canonical_entity("choice_1").unwrap().entity(), "Choice");
        assert!(c.canonical_entity("choice_2").is_none());
        assert!(c.canonical_entity("poll").is_none());
        assert!(c.is_partitioned("choice_0"));
        assert!(!c.is_partitioned("choicex_0"));
    }

    #[test]
    fn unknown_entity() {
        let c = catalog();
        assert!(matches!(c.topology("Nope"), Err(ShardError::UnknownEntity(_))));
    }
}
