#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};

use shardkit_core::router::{connection_for, partition_for, shard_index_for};
use shardkit_core::{ClusterRegistry, EntitySpec, ShardConfig, ShardError};

fn config_yamlish() -> ShardConfig {
    serde_json::from_value(serde_json::json!({
        "connections": ["default", "sharded.shard0", "sharded.shard1", "sharded.slave.shard0", "sharded.slave.shard1"],
        "entities": [
            {"name": "TestModel", "cluster": "sharded", "num_shards": 2, "key": ["id"]},
            {"name": "CompositeTestModel", "cluster": "sharded", "num_shards": 2, "key": ["key", "foo"]}
        ]
    }))
    .unwrap()
}

#[test]
fn end_to_end_two_by_two() {
    let d = config_yamlish().build().unwrap();
    let t = d.catalog.topology("TestModel").unwrap();
    let reg = d.catalog.registry();
    assert_eq!(shard_index_for(&t, 2), 0);
    assert_eq!(shard_index_for(&t, 3), 1);
    assert_eq!(connection_for(reg, &t, 2, false).unwrap().as_str(), "sharded.shard0");
    assert_eq!(connection_for(reg, &t, 2, true).unwrap().as_str(), "sharded.slave.shard0");
    assert_eq!(d.catalog.connection_for("TestModel", 3, true).unwrap().as_str(), "sharded.slave.shard1");
    assert_eq!(partition_for(&t, 3).unwrap(), &t.partitions()[1]);
}

#[test]
fn key_sum_ignores_iteration_order() {
    let d = config_yamlish().build().unwrap();
    let t = d.catalog.topology("CompositeTestModel").unwrap();
    let mut hashed: HashMap<String, i64> = HashMap::new();
    let mut ordered: BTreeMap<String, i64> = BTreeMap::new();
    for (k, v) in [("foo", 40), ("key", 2), ("unrelated", 1000)] {
        hashed.insert(k.to_string(), v);
        ordered.insert(k.to_string(), v);
    }
    assert_eq!(t.key_from_values(&hashed).unwrap(), 42);
    assert_eq!(t.key_from_values(&ordered).unwrap(), 42);
}

#[test]
fn composite_sums_collide() {
    // Sum routing is not injective: (3, 0) and (1, 2) share a partition.
    let d = config_yamlish().build().unwrap();
    let t = d.catalog.topology("CompositeTestModel").unwrap();
    let a: &[(&str, i64)] = &[("key", 3), ("foo", 0)];
    let b: &[(&str, i64)] = &[("key", 1), ("foo", 2)];
    assert_eq!(t.key_from_values(a).unwrap(), t.key_from_values(b).unwrap());
}

#[test]
fn wraparound_aliases_agree() {
    let mut reg = ClusterRegistry::new();
    reg.register("c", 5).unwrap();
    for i in 0..100u64 {
        assert_eq!(reg.resolve_connection("c", i, false).unwrap(), reg.resolve_connection("c", i + 5, false).unwrap());
    }
}

#[test]
fn declaring_against_unknown_cluster_fails() {
    let d = config_yamlish().build().unwrap();
    let err = d.catalog.declare(EntitySpec::new("Other", "missing", 2, &["id"])).unwrap_err();
    assert_eq!(err, ShardError::UnknownCluster("missing".into()));
}
