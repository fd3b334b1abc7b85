//! Shardkit storage: the narrow interface the gateway drives, plus an in-RAM backend.
//!
//! Backends own tables, per-partition counters and nested units of work. The
//! gateway never issues SQL; it calls these methods against a resolved
//! connection alias.

#![forbid(unsafe_code)]

use serde::Serialize;
use shardkit_core::{ConnectionAlias, FieldSpec, Filter, PartitionDescriptor, Record, ShardTopology};

mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table} ({columns:?})")]
    UniqueViolation { table: String, columns: Vec<String> },
    #[error("check constraint {constraint} violated on {table}")]
    CheckViolation { table: String, constraint: String },
    #[error("{table}.{column} must not be null")]
    NotNull { table: String, column: String },
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("no such sequence: {0}")]
    NoSuchSequence(String),
    #[error("no transaction or savepoint open on {0}")]
    NoTransaction(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unique_violation(&self) -> bool { matches!(self, StoreError::UniqueViolation { .. }) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// `sum(key) mod modulus = remainder`, the invariant every partition table holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionCheck {
    pub name: String,
    pub key: Vec<String>,
    pub modulus: u32,
    pub remainder: u32,
}

impl PartitionCheck {
    /// Rows whose key is absent or not an integer fail the check.
    pub fn holds(&self, record: &Record) -> bool {
        let mut sum: i64 = 0;
        for k in &self.key {
            match record.get(k).and_then(|v| shardkit_core::query::as_key_int(k, v).ok()) {
                Some(n) => match sum.checked_add(n) {
                    Some(s) => sum = s,
                    None => return false,
                },
                None => return false,
            }
        }
        sum.rem_euclid(i64::from(self.modulus)) == i64::from(self.remainder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<FieldSpec>,
    pub primary_key: String,
    pub unique_together: Vec<Vec<String>>,
    pub check: Option<PartitionCheck>,
}

impl TableSpec {
    /// Storage layout of one partition of `topology`.
    pub fn for_partition(topology: &ShardTopology, partition: &PartitionDescriptor) -> Self {
        let key = topology.key().to_vec();
        let key_repr = key.join("_");
        Self {
            name: partition.table.clone(),
            columns: topology.columns(),
            primary_key: topology.primary_key().to_string(),
            unique_together: topology.unique_together().to_vec(),
            check: Some(PartitionCheck {
                name: format!("{}_{}_check_modulo", partition.table, key_repr),
                key,
                modulus: topology.num_shards(),
                remainder: partition.index,
            }),
        }
    }

    /// Column groups that must be unique, primary key first.
    pub fn unique_groups(&self) -> Vec<Vec<String>> {
        let mut groups = vec![vec![self.primary_key.clone()]];
        groups.extend(self.unique_together.iter().cloned());
        groups
    }
}

/// Handle to an open nested unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    pub name: String,
}

/// Storage collaborator. Units of work are scoped to the calling thread, the
/// way a per-thread database session is.
pub trait Storage: Send + Sync {
    /// Create the table if missing. Idempotent.
    fn ensure_table(&self, conn: &ConnectionAlias, spec: &TableSpec) -> StoreResult<()>;
    /// Create the counter if missing. Idempotent; an existing counter keeps its value.
    fn ensure_sequence(&self, conn: &ConnectionAlias, name: &str) -> StoreResult<()>;
    /// Increment and return in one atomic step. Never rolled back.
    fn next_value(&self, conn: &ConnectionAlias, sequence: &str) -> StoreResult<i64>;

    fn select(&self, conn: &ConnectionAlias, table: &str, filter: &Filter) -> StoreResult<Vec<Record>>;
    fn insert(&self, conn: &ConnectionAlias, table: &str, record: &Record) -> StoreResult<()>;

    fn begin(&self, conn: &ConnectionAlias) -> StoreResult<()>;
    fn commit(&self, conn: &ConnectionAlias) -> StoreResult<()>;
    fn rollback(&self, conn: &ConnectionAlias) -> StoreResult<()>;

    fn savepoint(&self, conn: &ConnectionAlias) -> StoreResult<Savepoint>;
    fn release_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()>;
    /// Undo everything since `sp` and discard it. Outer units of work stay open.
    fn rollback_to_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardkit_core::{ClusterRegistry, EntitySpec};

    #[test]
    fn partition_table_spec() {
        let mut reg = ClusterRegistry::new();
        reg.register("sharded", 2).unwrap();
        let t = ShardTopology::declare(EntitySpec::new("Choice", "sharded", 2, &["poll_id"]).unique_together(&["poll_id", "choice_text"]), &reg);
        // choice_text is not a declared field, but fields are empty so it is accepted
        let t = t.unwrap();
        let spec = TableSpec::for_partition(&t, t.partition(1).unwrap());
        assert_eq!(spec.name, "choice_1");
        let check = spec.check.as_ref().unwrap();
        assert_eq!(check.name, "choice_1_poll_id_check_modulo");
        assert!(check.holds(&json!({"poll_id": 3}).as_object().cloned().unwrap()));
        assert!(!check.holds(&json!({"poll_id": 4}).as_object().cloned().unwrap()));
        assert!(!check.holds(&json!({"other": 1}).as_object().cloned().unwrap()));
        assert_eq!(spec.unique_groups().len(), 2);
    }
}
