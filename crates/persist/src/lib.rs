//! Shardkit persistence: SQLite backend for partition tables and counters.
//!
//! Each primary connection alias maps to `<dir>/<alias>.db`; its counters
//! live in `<dir>/<alias>.seq.db` so that they never ride along with a
//! caller's transaction. Replica aliases open their primary's files.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode, OptionalExtension};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use shardkit_core::{ClusterRegistry, ConnectionAlias, FieldKind, Filter, LookupOp, Record};
use shardkit_store::{Savepoint, Storage, StoreError, StoreResult, TableSpec};
use tracing::{debug, info};

type Shared = Arc<Mutex<Connection>>;
type SessionKey = (ConnectionAlias, ThreadId);
type Sessions = Mutex<FxHashMap<SessionKey, Shared>>;

/// Removes one thread's connection from its store when the thread exits.
struct SessionGuard {
    sessions: Weak<Sessions>,
    key: SessionKey,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(sessions) = self.sessions.upgrade() {
            if let Ok(mut sessions) = sessions.lock() {
                if sessions.remove(&self.key).is_some() {
                    debug!(conn = %self.key.0, "thread exited, sqlite session closed");
                }
            }
        }
    }
}

thread_local! {
    static SESSION_GUARDS: RefCell<Vec<SessionGuard>> = RefCell::new(Vec::new());
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`Storage`]. Units of work are per thread: every thread gets
/// its own connection to each database file.
pub struct SqliteStore {
    dir: PathBuf,
    allowed: Option<FxHashSet<ConnectionAlias>>,
    sessions: Arc<Sessions>,
    counters: Mutex<FxHashMap<ConnectionAlias, Shared>>,
    // Bool columns by (alias, table), read from the declared column types.
    bool_columns: Mutex<FxHashMap<(ConnectionAlias, String), Arc<Vec<String>>>>,
    next_savepoint: AtomicU64,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("dir", &self.dir).finish()
    }
}

fn backend(e: impl std::fmt::Display) -> StoreError { StoreError::Backend(e.to_string()) }

fn lock<T>(m: &Mutex<T>) -> StoreResult<std::sync::MutexGuard<'_, T>> {
    m.lock().map_err(|_| StoreError::Backend("sqlite store lock poisoned".into()))
}

fn quote(ident: &str) -> String { format!("\"{}\"", ident.replace('"', "\"\"")) }

impl SqliteStore {
    /// Store rooted at `dir` (created if missing). Any alias is accepted.
    pub fn open_dir(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| backend(format!("creating {}: {}", dir.display(), e)))?;
        info!(dir = %dir.display(), "sqlite store opened");
        Ok(Self {
            dir,
            allowed: None,
            sessions: Arc::new(Mutex::new(FxHashMap::default())),
            counters: Mutex::new(FxHashMap::default()),
            bool_columns: Mutex::new(FxHashMap::default()),
            next_savepoint: AtomicU64::new(0),
        })
    }

    /// Like [`SqliteStore::open_dir`], restricted to the primaries of `registry`.
    pub fn for_registry(dir: impl AsRef<Path>, registry: &ClusterRegistry) -> StoreResult<Self> {
        let mut me = Self::open_dir(dir)?;
        me.allowed = Some(
            registry
                .clusters()
                .into_iter()
                .flat_map(|c| c.slots().iter().map(|s| s.primary.clone()).collect::<Vec<_>>())
                .collect(),
        );
        Ok(me)
    }

    pub fn dir(&self) -> &Path { &self.dir }

    /// Database file backing `conn`.
    pub fn path_for(&self, conn: &ConnectionAlias) -> PathBuf { self.dir.join(format!("{}.db", conn.primary())) }

    fn primary(&self, conn: &ConnectionAlias) -> StoreResult<ConnectionAlias> {
        let p = conn.primary();
        match &self.allowed {
            Some(allowed) if !allowed.contains(&p) => Err(StoreError::UnknownConnection(conn.to_string())),
            _ => Ok(p),
        }
    }

    fn open(path: &Path) -> StoreResult<Connection> {
        let db = Connection::open(path).map_err(|e| backend(format!("opening sqlite db at {}: {}", path.display(), e)))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(BUSY_TIMEOUT).map_err(backend)?;
        Ok(db)
    }

    /// Connections currently held open by live threads.
    pub fn open_sessions(&self) -> usize { self.sessions.lock().map(|s| s.len()).unwrap_or(0) }

    /// This thread's connection to `conn`'s database. Closed when the thread exits.
    fn session(&self, conn: &ConnectionAlias) -> StoreResult<Shared> {
        let alias = self.primary(conn)?;
        let key = (alias, thread::current().id());
        let mut sessions = lock(&self.sessions)?;
        if let Some(db) = sessions.get(&key) {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(Mutex::new(Self::open(&self.path_for(conn))?));
        sessions.insert(key.clone(), Arc::clone(&db));
        drop(sessions);
        let guard = SessionGuard { sessions: Arc::downgrade(&self.sessions), key };
        // fails only while this thread is already tearing down its locals
        let _ = SESSION_GUARDS.try_with(|guards| {
            let mut guards = guards.borrow_mut();
            guards.retain(|g| g.sessions.strong_count() > 0);
            guards.push(guard);
        });
        Ok(db)
    }

    fn counter_db(&self, conn: &ConnectionAlias) -> StoreResult<Shared> {
        let alias = self.primary(conn)?;
        let mut counters = lock(&self.counters)?;
        if let Some(db) = counters.get(&alias) {
            return Ok(Arc::clone(db));
        }
        let db = Self::open(&self.dir.join(format!("{}.seq.db", alias)))?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS shardkit_sequences (
                name  TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
            [],
        )
        .map_err(backend)?;
        let db = Arc::new(Mutex::new(db));
        counters.insert(alias, Arc::clone(&db));
        Ok(db)
    }

    fn exec<T>(&self, conn: &ConnectionAlias, op: &'static str, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let started = Instant::now();
        let db = self.session(conn)?;
        let db = lock(&db)?;
        let out = f(&db);
        histogram!("persist_exec_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        out
    }

    fn bool_columns(&self, conn: &ConnectionAlias, db: &Connection, table: &str) -> StoreResult<Arc<Vec<String>>> {
        let key = (conn.primary(), table.to_string());
        if let Some(cols) = lock(&self.bool_columns)?.get(&key) {
            return Ok(Arc::clone(cols));
        }
        let mut stmt = db.prepare(&format!("PRAGMA table_info({})", quote(table))).map_err(backend)?;
        let mut rows = stmt.query([]).map_err(backend)?;
        let mut found = false;
        let mut cols = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            found = true;
            let name: String = row.get(1).map_err(backend)?;
            let ty: String = row.get(2).map_err(backend)?;
            if ty.eq_ignore_ascii_case("BOOLEAN") {
                cols.push(name);
            }
        }
        if !found {
            return Err(StoreError::NoSuchTable(table.to_string()));
        }
        let cols = Arc::new(cols);
        lock(&self.bool_columns)?.insert(key, Arc::clone(&cols));
        Ok(cols)
    }
}

fn sql_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Integer => "INTEGER",
        FieldKind::Text => "TEXT",
        FieldKind::Real => "REAL",
        FieldKind::Bool => "BOOLEAN",
    }
}

/// `CREATE TABLE` statement for a partition table.
pub fn create_table_sql(spec: &TableSpec) -> String {
    let mut parts: Vec<String> = spec
        .columns
        .iter()
        .map(|c| {
            if c.name == spec.primary_key {
                format!("{} {} NOT NULL PRIMARY KEY", quote(&c.name), sql_type(c.kind))
            } else {
                format!("{} {}", quote(&c.name), sql_type(c.kind))
            }
        })
        .collect();
    for group in &spec.unique_together {
        parts.push(format!("UNIQUE ({})", group.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")));
    }
    if let Some(check) = &spec.check {
        let present = check.key.iter().map(|k| format!("{} IS NOT NULL", quote(k))).collect::<Vec<_>>().join(" AND ");
        let sum = check.key.iter().map(|k| quote(k)).collect::<Vec<_>>().join(" + ");
        let m = check.modulus;
        parts.push(format!(
            "CONSTRAINT {} CHECK ({} AND (((({}) % {m}) + {m}) % {m}) = {})",
            quote(&check.name),
            present,
            sum,
            check.remainder,
        ));
    }
    format!("CREATE TABLE IF NOT EXISTS {} (\n    {}\n)", quote(&spec.name), parts.join(",\n    "))
}

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(v: ValueRef<'_>, as_bool: bool) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if as_bool => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

/// WHERE clause and its parameters.
fn where_clause(filter: &Filter) -> (String, Vec<SqlValue>) {
    let mut terms = Vec::new();
    let mut params = Vec::new();
    for l in filter.lookups() {
        let col = quote(&l.field);
        let cmp = match l.op {
            LookupOp::Exact => "=",
            LookupOp::Ne => "<>",
            LookupOp::Gt => ">",
            LookupOp::Gte => ">=",
            LookupOp::Lt => "<",
            LookupOp::Lte => "<=",
            LookupOp::In => {
                let options = l.value.as_array().map(Vec::as_slice).unwrap_or_default();
                if options.is_empty() {
                    terms.push("0".to_string());
                } else {
                    terms.push(format!("{} IN ({})", col, vec!["?"; options.len()].join(", ")));
                    params.extend(options.iter().map(to_sql));
                }
                continue;
            }
        };
        terms.push(format!("{} {} ?", col, cmp));
        params.push(to_sql(&l.value));
    }
    if terms.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", terms.join(" AND ")), params)
    }
}

/// `UNIQUE constraint failed: t.a, t.b` style messages name the columns after the colon.
fn failed_columns(msg: &str) -> Vec<String> {
    msg.split_once(": ")
        .map(|(_, cols)| {
            cols.split(", ").map(|c| c.rsplit('.').next().unwrap_or(c).to_string()).collect()
        })
        .unwrap_or_default()
}

fn map_err(table: &str, e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(f, msg) = &e {
        let msg = msg.clone().unwrap_or_default();
        if f.code == ErrorCode::ConstraintViolation {
            match f.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    counter!("persist_unique_violations_total", 1u64);
                    return StoreError::UniqueViolation { table: table.to_string(), columns: failed_columns(&msg) };
                }
                ffi::SQLITE_CONSTRAINT_CHECK => {
                    let constraint = msg.split_once(": ").map(|(_, n)| n.to_string()).unwrap_or_default();
                    return StoreError::CheckViolation { table: table.to_string(), constraint };
                }
                ffi::SQLITE_CONSTRAINT_NOTNULL => {
                    let column = failed_columns(&msg).into_iter().next().unwrap_or_default();
                    return StoreError::NotNull { table: table.to_string(), column };
                }
                _ => {}
            }
        }
        if msg.starts_with("no such table") {
            return StoreError::NoSuchTable(table.to_string());
        }
    }
    backend(e)
}

impl Storage for SqliteStore {
    fn ensure_table(&self, conn: &ConnectionAlias, spec: &TableSpec) -> StoreResult<()> {
        let sql = create_table_sql(spec);
        self.exec(conn, "ensure_table", |db| db.execute_batch(&sql).map_err(|e| map_err(&spec.name, e)))?;
        debug!(conn = %conn, table = %spec.name, "table ensured");
        Ok(())
    }

    fn ensure_sequence(&self, conn: &ConnectionAlias, name: &str) -> StoreResult<()> {
        let db = self.counter_db(conn)?;
        let db = lock(&db)?;
        db.execute("INSERT OR IGNORE INTO shardkit_sequences(name, value) VALUES (?1, 0)", [name])
            .map_err(backend)?;
        Ok(())
    }

    fn next_value(&self, conn: &ConnectionAlias, sequence: &str) -> StoreResult<i64> {
        let started = Instant::now();
        let db = self.counter_db(conn)?;
        let db = lock(&db)?;
        let v = db
            .query_row(
                "UPDATE shardkit_sequences SET value = value + 1 WHERE name = ?1 RETURNING value",
                [sequence],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::NoSuchSequence(sequence.to_string()))?;
        histogram!("persist_exec_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "next_value");
        Ok(v)
    }

    fn select(&self, conn: &ConnectionAlias, table: &str, filter: &Filter) -> StoreResult<Vec<Record>> {
        self.exec(conn, "select", |db| {
            let bools = self.bool_columns(conn, db, table)?;
            let (clause, params) = where_clause(filter);
            let sql = format!("SELECT * FROM {}{}", quote(table), clause);
            let mut stmt = db.prepare(&sql).map_err(|e| map_err(table, e))?;
            let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
            let mut rows = stmt.query(params_from_iter(params)).map_err(|e| map_err(table, e))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(|e| map_err(table, e))? {
                let mut rec = Record::new();
                for (i, name) in names.iter().enumerate() {
                    let v = row.get_ref(i).map_err(backend)?;
                    rec.insert(name.clone(), from_sql(v, bools.contains(name)));
                }
                out.push(rec);
            }
            Ok(out)
        })
    }

    fn insert(&self, conn: &ConnectionAlias, table: &str, record: &Record) -> StoreResult<()> {
        self.exec(conn, "insert", |db| {
            let cols: Vec<String> = record.keys().map(|k| quote(k)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(table),
                cols.join(", "),
                vec!["?"; cols.len()].join(", ")
            );
            db.execute(&sql, params_from_iter(record.values().map(to_sql))).map_err(|e| map_err(table, e))?;
            Ok(())
        })
    }

    fn begin(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.exec(conn, "begin", |db| db.execute_batch("BEGIN IMMEDIATE").map_err(backend))
    }

    fn commit(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.exec(conn, "commit", |db| {
            if db.is_autocommit() {
                return Err(StoreError::NoTransaction(conn.to_string()));
            }
            db.execute_batch("COMMIT").map_err(backend)
        })
    }

    fn rollback(&self, conn: &ConnectionAlias) -> StoreResult<()> {
        self.exec(conn, "rollback", |db| {
            if db.is_autocommit() {
                return Err(StoreError::NoTransaction(conn.to_string()));
            }
            db.execute_batch("ROLLBACK").map_err(backend)
        })
    }

    fn savepoint(&self, conn: &ConnectionAlias) -> StoreResult<Savepoint> {
        let name = format!("sk_sp_{}", self.next_savepoint.fetch_add(1, Ordering::Relaxed) + 1);
        self.exec(conn, "savepoint", |db| db.execute_batch(&format!("SAVEPOINT {}", quote(&name))).map_err(backend))?;
        Ok(Savepoint { name })
    }

    fn release_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()> {
        self.exec(conn, "release", |db| {
            db.execute_batch(&format!("RELEASE {}", quote(&sp.name))).map_err(|e| savepoint_err(conn, sp, e))
        })
    }

    fn rollback_to_savepoint(&self, conn: &ConnectionAlias, sp: &Savepoint) -> StoreResult<()> {
        self.exec(conn, "rollback_to", |db| {
            let name = quote(&sp.name);
            db.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}")).map_err(|e| savepoint_err(conn, sp, e))
        })
    }
}

fn savepoint_err(conn: &ConnectionAlias, sp: &Savepoint, e: rusqlite::Error) -> StoreError {
    if e.to_string().contains("no such savepoint") {
        StoreError::NoTransaction(format!("{} ({})", conn, sp.name))
    } else {
        backend(e)
    }
}
