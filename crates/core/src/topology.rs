//! Shard topology of one logical entity and its partition descriptors.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Deserializer, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::cluster::{ClusterRegistry, ConnectionAlias};
use crate::error::{ShardError, ShardResult};
use crate::id::MAX_SHARD;
use crate::observer::{LifecycleObserver, ShardEvent};
use crate::query::{as_key_int, key_ints_in_place, FieldSource, Filter, Record};

/// How new primary keys are produced. Chosen once, at declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdStrategy {
    /// Timestamp | partition | sequence packed into 64 bits.
    #[default]
    Packed,
    /// Raw next value of the partition's counter.
    Sequence,
    /// Caller supplies the primary key.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Text,
    Real,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self { Self { name: name.to_string(), kind } }
}

fn default_pk() -> String { "id".to_string() }

/// Accept `key: poll_id` as well as `key: [a, b]`.
fn one_or_many<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Declaration of a sharded entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    /// Canonical storage name; defaults to the lowercased entity name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_pk")]
    pub primary_key: String,
    pub cluster: String,
    pub num_shards: u32,
    #[serde(deserialize_with = "one_or_many")]
    pub key: Vec<String>,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    #[serde(default)]
    pub id_strategy: IdStrategy,
}

impl EntitySpec {
    pub fn new(name: &str, cluster: &str, num_shards: u32, key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            primary_key: default_pk(),
            cluster: cluster.to_string(),
            num_shards,
            key: key.iter().map(|k| k.to_string()).collect(),
            sequence: None,
            fields: Vec::new(),
            unique_together: Vec::new(),
            id_strategy: IdStrategy::default(),
        }
    }

    pub fn table(mut self, table: &str) -> Self { self.table = Some(table.to_string()); self }
    pub fn primary_key(mut self, pk: &str) -> Self { self.primary_key = pk.to_string(); self }
    pub fn sequence(mut self, name: &str) -> Self { self.sequence = Some(name.to_string()); self }
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self { self.fields.push(FieldSpec::new(name, kind)); self }
    pub fn unique_together(mut self, cols: &[&str]) -> Self {
        self.unique_together.push(cols.iter().map(|c| c.to_string()).collect());
        self
    }
    pub fn id_strategy(mut self, s: IdStrategy) -> Self { self.id_strategy = s; self }

    fn table_name(&self) -> String { self.table.clone().unwrap_or_else(|| self.name.to_lowercase()) }
}

pub(crate) fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One physical subdivision of an entity. Carries data only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDescriptor {
    /// Parent entity name; the topology owns the descriptor, not the other way round.
    pub entity: String,
    pub index: u32,
    /// Physical shard of the owning cluster (`index % cluster size`).
    pub shard: u32,
    pub table: String,
    pub sequence: String,
    pub primary: ConnectionAlias,
    pub replica: ConnectionAlias,
}

impl PartitionDescriptor {
    pub fn connection(&self, replica: bool) -> &ConnectionAlias {
        if replica { &self.replica } else { &self.primary }
    }

    pub fn all_connections(&self) -> (&ConnectionAlias, &ConnectionAlias) { (&self.primary, &self.replica) }
}

#[derive(Default)]
struct Observers(RwLock<Vec<Arc<dyn LifecycleObserver>>>);

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.read().map(|v| v.len()).unwrap_or(0);
        write!(f, "Observers({})", n)
    }
}

#[derive(Debug)]
pub struct ShardTopology {
    spec: EntitySpec,
    table: String,
    cluster_size: u32,
    key: SmallVec<[String; 2]>,
    sequence_name: String,
    partitions: Vec<PartitionDescriptor>,
    observers: Observers,
}

impl ShardTopology {
    /// Validate a declaration and materialize its `num_shards` partitions.
    pub fn declare(spec: EntitySpec, registry: &ClusterRegistry) -> ShardResult<Self> {
        let cfg = |msg: String| ShardError::Configuration(format!("{}: {}", spec.name, msg));
        if spec.name.is_empty() {
            return Err(ShardError::Configuration("entity name must not be empty".into()));
        }
        if spec.cluster.is_empty() {
            return Err(cfg("missing shard configuration value for cluster".into()));
        }
        let cluster_size = registry.size(&spec.cluster)?;
        if spec.num_shards == 0 {
            return Err(cfg("num_shards must be positive".into()));
        }
        if spec.key.is_empty() {
            return Err(cfg("missing shard configuration value for key".into()));
        }
        let table = spec.table_name();
        for name in std::iter::once(&table).chain(&spec.key).chain(std::iter::once(&spec.primary_key)) {
            if !is_ident(name) {
                return Err(cfg(format!("{:?} is not a valid identifier", name)));
            }
        }
        if let Some(seq) = &spec.sequence {
            if !is_ident(seq) {
                return Err(cfg(format!("sequence {:?} is not a valid identifier", seq)));
            }
        }
        for (i, k) in spec.key.iter().enumerate() {
            if spec.key[..i].contains(k) {
                return Err(cfg(format!("key field {} listed twice", k)));
            }
        }
        if spec.id_strategy == IdStrategy::Packed && spec.num_shards > MAX_SHARD + 1 {
            return Err(cfg(format!("packed ids address at most {} partitions", MAX_SHARD + 1)));
        }
        if !spec.fields.is_empty() {
            for f in &spec.fields {
                if !is_ident(&f.name) {
                    return Err(cfg(format!("{:?} is not a valid identifier", f.name)));
                }
            }
            let kind_of = |n: &str| spec.fields.iter().find(|f| f.name == n).map(|f| f.kind);
            for k in &spec.key {
                match kind_of(k) {
                    Some(FieldKind::Integer) => {}
                    Some(other) => return Err(cfg(format!("key field {} must be integer, is {:?}", k, other))),
                    None => return Err(cfg(format!("key field {} is not a declared field", k))),
                }
            }
            if spec.id_strategy != IdStrategy::Manual {
                if let Some(kind) = kind_of(&spec.primary_key) {
                    if kind != FieldKind::Integer {
                        return Err(cfg(format!("generated primary key {} must be integer", spec.primary_key)));
                    }
                }
            }
            for group in &spec.unique_together {
                for col in group {
                    if kind_of(col).is_none() && *col != spec.primary_key {
                        return Err(cfg(format!("unique_together names unknown field {}", col)));
                    }
                }
            }
        }
        for group in &spec.unique_together {
            if group.is_empty() {
                return Err(cfg("unique_together group must not be empty".into()));
            }
        }

        let sequence_name = spec
            .sequence
            .clone()
            .unwrap_or_else(|| format!("{}_{}_seq", table, spec.primary_key));
        let partitions = (0..spec.num_shards)
            .map(|index| {
                let shard = index % cluster_size;
                let ptable = format!("{}_{}", table, index);
                let sequence = match &spec.sequence {
                    Some(s) => format!("{}_{}", s, index),
                    None => format!("{}_{}_seq", ptable, spec.primary_key),
                };
                Ok(PartitionDescriptor {
                    entity: spec.name.clone(),
                    index,
                    shard,
                    table: ptable,
                    sequence,
                    primary: registry.resolve_connection(&spec.cluster, u64::from(index), false)?,
                    replica: registry.resolve_connection(&spec.cluster, u64::from(index), true)?,
                })
            })
            .collect::<ShardResult<Vec<_>>>()?;
        debug!(entity = %spec.name, partitions = partitions.len(), cluster = %spec.cluster, "topology materialized");

        Ok(Self {
            key: spec.key.iter().cloned().collect(),
            spec,
            table,
            cluster_size,
            sequence_name,
            partitions,
            observers: Observers::default(),
        })
    }

    pub fn spec(&self) -> &EntitySpec { &self.spec }
    pub fn entity(&self) -> &str { &self.spec.name }
    pub fn table(&self) -> &str { &self.table }
    pub fn primary_key(&self) -> &str { &self.spec.primary_key }
    pub fn cluster(&self) -> &str { &self.spec.cluster }
    pub fn cluster_size(&self) -> u32 { self.cluster_size }
    pub fn num_shards(&self) -> u32 { self.spec.num_shards }
    pub fn key(&self) -> &[String] { &self.key }
    pub fn sequence_name(&self) -> &str { &self.sequence_name }
    pub fn id_strategy(&self) -> IdStrategy { self.spec.id_strategy }
    pub fn unique_together(&self) -> &[Vec<String>] { &self.spec.unique_together }
    pub fn partitions(&self) -> &[PartitionDescriptor] { &self.partitions }

    /// Partition by logical index.
    pub fn partition(&self, index: u64) -> ShardResult<&PartitionDescriptor> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.partitions.get(i))
            .ok_or_else(|| ShardError::ShardNotFound {
                entity: self.spec.name.clone(),
                index,
                num_shards: self.spec.num_shards,
            })
    }

    /// Columns for provisioning: primary key, key fields, then declared fields.
    pub fn columns(&self) -> Vec<FieldSpec> {
        let mut cols: Vec<FieldSpec> = Vec::with_capacity(self.spec.fields.len() + 2);
        let pk_kind = self
            .spec
            .fields
            .iter()
            .find(|f| f.name == self.spec.primary_key)
            .map(|f| f.kind)
            .unwrap_or(FieldKind::Integer);
        cols.push(FieldSpec::new(&self.spec.primary_key, pk_kind));
        for k in self.key.iter() {
            if !cols.iter().any(|c| &c.name == k) {
                cols.push(FieldSpec::new(k, FieldKind::Integer));
            }
        }
        for f in &self.spec.fields {
            if !cols.iter().any(|c| c.name == f.name) {
                cols.push(f.clone());
            }
        }
        cols
    }

    /// Sum of the integer values of every key field.
    pub fn key_from_values<S: FieldSource + ?Sized>(&self, values: &S) -> ShardResult<i64> {
        let mut missing = Vec::new();
        let mut sum: i64 = 0;
        for field in self.key.iter() {
            match values.field_value(field) {
                None => missing.push(field.clone()),
                Some(v) => {
                    let n = as_key_int(field, &v)?;
                    sum = sum.checked_add(n).ok_or_else(|| ShardError::InvalidRoutingKey {
                        field: field.clone(),
                        value: "sum overflows 64 bits".into(),
                    })?;
                }
            }
        }
        if !missing.is_empty() {
            return Err(ShardError::MissingRoutingKey { entity: self.spec.name.clone(), fields: missing });
        }
        Ok(sum)
    }

    pub fn key_from_instance(&self, entity: &Record) -> ShardResult<i64> { self.key_from_values(entity) }

    /// `filter` with key field values stored as integers, so `"3"` and `3`
    /// select the same rows on every backend.
    pub fn normalize_filter(&self, filter: &Filter) -> ShardResult<Filter> { filter.with_key_ints(&self.key) }

    pub fn normalize_record(&self, record: &mut Record) -> ShardResult<()> { key_ints_in_place(record, &self.key) }

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        let mut list = self.observers.0.write().unwrap_or_else(|p| p.into_inner());
        list.push(observer);
    }

    pub fn notify(&self, event: &ShardEvent) {
        let list = self.observers.0.read().unwrap_or_else(|p| p.into_inner());
        for o in list.iter() {
            o.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ClusterRegistry {
        let mut r = ClusterRegistry::new();
        r.register("sharded", 2).unwrap();
        r
    }

    #[test]
    fn declare_materializes_partitions() {
        let t = ShardTopology::declare(EntitySpec::new("TestModel", "sharded", 4, &["key"]), &registry()).unwrap();
        assert_eq!(t.table(), "testmodel");
        assert_eq!(t.sequence_name(), "testmodel_id_seq");
        assert_eq!(t.partitions().len(), 4);
        let p3 = t.partition(3).unwrap();
        assert_eq!(p3.index, 3);
        assert_eq!(p3.shard, 1);
        assert_eq!(p3.table, "testmodel_3");
        assert_eq!(p3.sequence, "testmodel_3_id_seq");
        assert_eq!(p3.all_connections().0.as_str(), "sharded.shard1");
        assert_eq!(p3.all_connections().1.as_str(), "sharded.slave.shard1");
        assert!(matches!(t.partition(4), Err(ShardError::ShardNotFound { index: 4, .. })));
    }

    #[test]
    fn partitions_serialize() {
        let t = ShardTopology::declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"]), &registry()).unwrap();
        let v = serde_json::to_value(t.partition(1).unwrap()).unwrap();
        assert_eq!(v["entity"], json!("Choice"));
        assert_eq!(v["table"], json!("choice_1"));
        assert_eq!(v["replica"], json!("sharded.slave.shard1"));
    }

    #[test]
    fn key_values_normalize_to_integers() {
        let t = ShardTopology::declare(EntitySpec::new("Composite", "sharded", 2, &["key", "foo"]), &registry()).unwrap();
        let mut r = json!({"key": "1", "foo": true, "note": "5"}).as_object().cloned().unwrap();
        t.normalize_record(&mut r).unwrap();
        assert_eq!(r, json!({"key": 1, "foo": 1, "note": "5"}).as_object().cloned().unwrap());
        let f = t.normalize_filter(&Filter::new().eq("key", "2").eq("note", "5")).unwrap();
        assert_eq!(f.exact("key"), Some(&json!(2)));
        assert_eq!(f.exact("note"), Some(&json!("5")));
    }

    #[test]
    fn explicit_sequence_is_suffixed_per_partition() {
        let t = ShardTopology::declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"]).sequence("choice_ids"), &registry()).unwrap();
        assert_eq!(t.sequence_name(), "choice_ids");
        assert_eq!(t.partition(1).unwrap().sequence, "choice_ids_1");
    }

    #[test]
    fn declare_validation() {
        let reg = registry();
        let bad = |spec: EntitySpec| ShardTopology::declare(spec, &reg).unwrap_err();
        assert!(matches!(bad(EntitySpec::new("A", "sharded", 0, &["k"])), ShardError::Configuration(_)));
        assert!(matches!(bad(EntitySpec::new("A", "sharded", 2, &[])), ShardError::Configuration(_)));
        assert!(matches!(bad(EntitySpec::new("A", "other", 2, &["k"])), ShardError::UnknownCluster(_)));
        assert!(matches!(bad(EntitySpec::new("A", "sharded", 2, &["k"]).field("k", FieldKind::Text)), ShardError::Configuration(_)));
        assert!(matches!(bad(EntitySpec::new("A", "sharded", 2, &["k"]).table("a; drop")), ShardError::Configuration(_)));
        assert!(matches!(bad(EntitySpec::new("A", "sharded", 9000, &["k"])), ShardError::Configuration(_)));
        ShardTopology::declare(EntitySpec::new("A", "sharded", 9000, &["k"]).id_strategy(IdStrategy::Sequence), &reg).unwrap();
    }

    #[test]
    fn composite_key_sums_fields() {
        let t = ShardTopology::declare(EntitySpec::new("Composite", "sharded", 2, &["key", "foo"]), &registry()).unwrap();
        let rec = json!({"key": 1, "foo": 2, "other": "x"}).as_object().cloned().unwrap();
        assert_eq!(t.key_from_instance(&rec).unwrap(), 3);
        let pairs: &[(&str, i64)] = &[("foo", 2), ("key", 1)];
        assert_eq!(t.key_from_values(pairs).unwrap(), 3);
        let partial = json!({"key": 1}).as_object().cloned().unwrap();
        match t.key_from_values(&partial).unwrap_err() {
            ShardError::MissingRoutingKey { fields, .. } => assert_eq!(fields, vec!["foo".to_string()]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn columns_put_pk_and_key_first() {
        let t = ShardTopology::declare(
            EntitySpec::new("Choice", "sharded", 2, &["poll_id"]).field("choice_text", FieldKind::Text).field("poll_id", FieldKind::Integer),
            &registry(),
        )
        .unwrap();
        let names: Vec<_> = t.columns().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["id", "poll_id", "choice_text"]);
    }

    #[test]
    fn spec_deserializes_single_key() {
        let spec: EntitySpec = serde_json::from_value(json!({
            "name": "Choice", "cluster": "sharded", "num_shards": 2, "key": "poll_id"
        }))
        .unwrap();
        assert_eq!(spec.key, vec!["poll_id".to_string()]);
        assert_eq!(spec.primary_key, "id");
        assert_eq!(spec.id_strategy, IdStrategy::Packed);
    }
}
