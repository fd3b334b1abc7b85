//! In-RAM backend. Replica aliases read their primary's data.
//!
//! Uncommitted rows are visible to other threads (no isolation); units of
//! work only decide what is undone on rollback.

use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use shardkit_core::{ClusterRegistry, ConnectionAlias, Filter, Record};
use tracing::{debug, trace};

use crate::{Savepoint, Storage, StoreError, StoreResult, TableSpec};

struct Table {
    spec: TableSpec,
    rows: Vec<Record>,
}

/// One open unit of work: rows inserted since it started.
struct Frame {
    name: String,
    inserted: Vec<(String, Value)>,
}

#[derive(Default)]
struct ConnState {
    tables: FxHashMap<String, Table>,
    sequences: FxHashMap<String, i64>,
    sessions: FxHashMap<ThreadId, Vec<Frame>>,
    next_savepoint: u64,
}

impl ConnState {
    fn table(&self, name: &str) -> StoreResult<&Table> {
        self.tables.get(name).ok_or_else(|| StoreError::NoSuchTable(name.to_string()))
    }

    fn undo(&mut self, frames: Vec<Frame>) {
        for frame in frames.into_iter().rev() {
            for (table, pk) in frame.inserted.into_iter().rev() {
                if let Some(t) = self.tables.get_mut(&table) {
                    let pk_col = t.spec.primary_key.clone();
                    t.rows.retain(|r| r.get(&pk_col) != Some(&pk));
                }
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    conns: Mutex<FxHashMap<ConnectionAlias, ConnState>>,
    allowed: Option<FxHashSet<ConnectionAlias>>,
}

impl MemoryStore {
    /// Accepts any connection alias.
    pub fn new() -> Self { Self::default() }

    /// Only the primary aliases of `registry` exist; anything else is an unknown connection.
    pub fn for_registry(registry: &ClusterRegistry) -> Self {
        let allowed = registry
            .clusters()
            .into_iter()
            .flat_map(|c| c.slots().iter().map(|s| s.primary.clone()).collect::<Vec<_>>())
            .collect();
        Self { conns: Mutex::new(FxHashMap::default()), allowed: Some(allowed) }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, FxHashMap<ConnectionAlias, ConnState>>> {
        self.conns.lock().map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }

    fn with_conn<T>(&self, conn: &ConnectionAlias, f: impl FnOnce(&mut ConnState) -> StoreResult<T>) -> StoreResult<T> {
        let alias = conn.primary();
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(&alias) {
                return Err(StoreError::UnknownConnection(conn.to_string()));
            }
        }
        let mut conns = self.lock()?;
        f(conns.entry(alias).or_default())
    }

    /// Rows currently stored in `table`, for inspection in tests and tooling.
    pub fn row_count(&self, conn: &ConnectionAlias, table: &str) -> StoreResult<usize> {
        self.with_conn(conn, |st| Ok(st.table(table)?.rows.len()))
    }
}

fn check_row(spec: &TableSpec, rows: &[Record], record: &Record) -> StoreResult<Value> {
    if !spec.columns.is_empty() {
        if let Some(col) = record.keys().find(|k| !spec.columns.iter().any(|c| &c.name == *k)) {
            return Err(StoreError::Backend(format!("table {} has no column named {}", spec.name, col)));
        }
    }
    let pk = match record.get(&spec.primary_key) {
        Some(v) if !v.is_null() => v.clone(),
        _ => return Err(StoreError::NotNull { table: spec.name.clone(), column: spec.primary_key.clone() }),
    };
    if let Some(check) = &spec.check {
        if !check.holds(record) {
            return Err(StoreError::CheckViolation { table: spec.name.clone(), constraint: check.name.clone() });
        }
    }
    for group in spec.unique_groups() {
        let values: Option<Vec<&Value>> = group.iter().map(|c| record.get(c).filter(|v| !v.is_null())).collect();
        // NULLs never collide
        let Some(values) = values else { continue };
        let clash = rows.iter().any(|r| group.iter().zip(&values).all(|(c, v)| r.get(c) == Some(*v)));
        if clash {
            counter!("store_unique_violations_total", 1u64);
            return Err(StoreError::UniqueViolation { table: spec.name.clone(), columns: group });
        }
    }
    Ok(pk)
}

impl Storage for MemoryStore {
    fn ensure_table(&self, conn: &ConnectionAlias, spec: &TableSpec) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            st.tables.entry(spec.name.clone()).or_insert_with(|| {
                debug!(conn = %conn, table = %spec.name, "table created");
                Table { spec: spec.clone(), rows: Vec::new() }
            });
            Ok(())
        })
    }

    fn ensure_sequence(&self, conn: &ConnectionAlias, name: &str) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            st.sequences.entry(name.to_string()).or_insert(0);
            Ok(())
        })
    }

    fn next_value(&self, conn: &ConnectionAlias, sequence: &str) -> StoreResult<i64> {
        self.with_conn(conn, |st| {
            let v = st.sequences.get_mut(sequence).ok_or_else(|| StoreError::NoSuchSequence(sequence.to_string()))?;
            *v += 1;
            Ok(*v)
        })
    }

    fn select(&self, conn: &ConnectionAlias, table: &str, filter: &Filter) -> StoreResult<Vec<Record>> {
        self.with_conn(conn, |st| Ok(st.table(table)?.rows.iter().filter(|r| filter.matches(r)).cloned().collect()))
    }

    fn insert(&self, conn: &ConnectionAlias, table: &str, record: &Record) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            let t = st.tables.get_mut(table).ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
            let pk = check_row(&t.spec, &t.rows, record)?;
            t.rows.push(record.clone());
            if let Some(frame) = st.sessions.get_mut(&thread::current().id()).and_then(|s| s.last_mut()) {
                frame.inserted.push((table.to_string(), pk));
            }
            Ok(())
        })
    }

    fn begin(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            let session = st.sessions.entry(thread::current().id()).or_default();
            if !session.is_empty() {
                return Err(StoreError::Backend(format!("transaction already open on {}", conn)));
            }
            session.push(Frame { name: String::new(), inserted: Vec::new() });
            Ok(())
        })
    }

    fn commit(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.with_conn(conn, |st| match st.sessions.remove(&thread::current().id()) {
            Some(frames) if !frames.is_empty() => Ok(()),
            _ => Err(StoreError::NoTransaction(conn.to_string())),
        })
    }

    fn rollback(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.with_conn(conn, |st| match st.sessions.remove(&thread::current().id()) {
            Some(frames) if !frames.is_empty() => {
                st.undo(frames);
                Ok(())
            }
            _ => Err(StoreError::NoTransaction(conn.to_string())),
        })
    }

    fn savepoint(&self, conn: &ConnectionAlias) -> StoreResult<Savepoint> {
        self.with_conn(conn, |st| {
            st.next_savepoint += 1;
            let name = format!("sk_sp_{}", st.next_savepoint);
            st.sessions
                .entry(thread::current().id())
                .or_default()
                .push(Frame { name: name.clone(), inserted: Vec::new() });
            trace!(conn = %conn, savepoint = %name, "savepoint");
            Ok(Savepoint { name })
        })
    }

    fn release_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            let tid = thread::current().id();
            let session = st.sessions.get_mut(&tid).ok_or_else(|| StoreError::NoTransaction(conn.to_string()))?;
            let pos = session
                .iter()
                .rposition(|f| f.name == sp.name)
                .ok_or_else(|| StoreError::NoTransaction(format!("{} ({})", conn, sp.name)))?;
            let released: Vec<Frame> = session.drain(pos..).collect();
            if let Some(parent) = session.last_mut() {
                for f in released {
                    parent.inserted.extend(f.inserted);
                }
            }
            if session.is_empty() {
                st.sessions.remove(&tid);
            }
            Ok(())
        })
    }

    fn rollback_to_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()> {
        self.with_conn(conn, |st| {
            let tid = thread::current().id();
            let session = st.sessions.get_mut(&tid).ok_or_else(|| StoreError::NoTransaction(conn.to_string()))?;
            let pos = session
                .iter()
                .rposition(|f| f.name == sp.name)
                .ok_or_else(|| StoreError::NoTransaction(format!("{} ({})", conn, sp.name)))?;
            let undone: Vec<Frame> = session.drain(pos..).collect();
            if session.is_empty() {
                st.sessions.remove(&tid);
            }
            st.undo(undone);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shardkit_core::{FieldKind, FieldSpec};

    fn conn() -> ConnectionAlias { ConnectionAlias::from("sharded.shard0") }

    fn spec() -> TableSpec {
        TableSpec {
            name: "t_0".into(),
            columns: vec![
                FieldSpec::new("id", FieldKind::Integer),
                FieldSpec::new("k", FieldKind::Integer),
                FieldSpec::new("v", FieldKind::Text),
            ],
            primary_key: "id".into(),
            unique_together: vec![vec!["k".into(), "v".into()]],
            check: None,
        }
    }

    fn row(id: i64, k: i64, v: &str) -> Record { json!({"id": id, "k": k, "v": v}).as_object().cloned().unwrap() }

    #[test]
    fn unique_groups_enforced() {
        let s = MemoryStore::new();
        s.ensure_table(&conn(), &spec()).unwrap();
        s.insert(&conn(), "t_0", &row(1, 1, "a")).unwrap();
        assert!(s.insert(&conn(), "t_0", &row(1, 2, "b")).unwrap_err().is_unique_violation());
        assert!(s.insert(&conn(), "t_0", &row(2, 1, "a")).unwrap_err().is_unique_violation());
        s.insert(&conn(), "t_0", &row(2, 1, "b")).unwrap();
        let mut null_v = row(3, 1, "x");
        null_v.insert("v".into(), Value::Null);
        s.insert(&conn(), "t_0", &null_v).unwrap();
        assert_eq!(s.row_count(&conn(), "t_0").unwrap(), 3);
    }

    #[test]
    fn replica_reads_primary() {
        let s = MemoryStore::new();
        s.ensure_table(&conn(), &spec()).unwrap();
        s.insert(&conn(), "t_0", &row(1, 1, "a")).unwrap();
        let replica = ConnectionAlias::from("sharded.slave.shard0");
        assert_eq!(s.select(&replica, "t_0", &Filter::new().eq("k", 1)).unwrap().len(), 1);
    }

    #[test]
    fn savepoint_rollback_keeps_outer_transaction() {
        let s = MemoryStore::new();
        let c = conn();
        s.ensure_table(&c, &spec()).unwrap();
        s.begin(&c).unwrap();
        s.insert(&c, "t_0", &row(1, 1, "a")).unwrap();
        let sp = s.savepoint(&c).unwrap();
        s.insert(&c, "t_0", &row(2, 1, "b")).unwrap();
        s.rollback_to_savepoint(&c, &sp).unwrap();
        assert_eq!(s.row_count(&c, "t_0").unwrap(), 1);
        let sp2 = s.savepoint(&c).unwrap();
        s.insert(&c, "t_0", &row(3, 1, "c")).unwrap();
        s.release_savepoint(&c, &sp2).unwrap();
        s.rollback(&c).unwrap();
        assert_eq!(s.row_count(&c, "t_0").unwrap(), 0);
        assert!(matches!(s.commit(&c), Err(StoreError::NoTransaction(_))));
    }

    #[test]
    fn sequences_survive_rollback() {
        let s = MemoryStore::new();
        let c = conn();
        s.ensure_sequence(&c, "t_0_id_seq").unwrap();
        s.begin(&c).unwrap();
        assert_eq!(s.next_value(&c, "t_0_id_seq").unwrap(), 1);
        s.rollback(&c).unwrap();
        s.ensure_sequence(&c, "t_0_id_seq").unwrap();
        assert_eq!(s.next_value(&c, "t_0_id_seq").unwrap(), 2);
        assert!(matches!(s.next_value(&c, "missing"), Err(StoreError::NoSuchSequence(_))));
    }

    #[test]
    fn registry_bound_store_rejects_unknown_aliases() {
        let mut reg = ClusterRegistry::new();
        reg.register("sharded", 1).unwrap();
        let s = MemoryStore::for_registry(&reg);
        s.ensure_sequence(&ConnectionAlias::from("sharded.slave.shard0"), "x").unwrap();
        assert!(matches!(
            s.ensure_sequence(&ConnectionAlias::from("sharded.shard1"), "x"),
            Err(StoreError::UnknownConnection(_))
        ));
    }
}
