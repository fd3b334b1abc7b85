use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use shardkit_core::router;
use shardkit_core::{
    Catalog, ConnectionAlias, Filter, IdGenerator, IdStrategy, PartitionDescriptor, Record, ShardEvent, ShardTopology,
};
use shardkit_store::{Storage, TableSpec};
use tracing::{debug, info, warn};

use crate::op::{OpKind, PendingOp, RoutedOp};
use crate::{GatewayError, GatewayResult};

/// Query surface of one partitioned entity.
pub struct PartitionedManager<S: Storage + ?Sized> {
    topology: Arc<ShardTopology>,
    store: Arc<S>,
    ids: Arc<IdGenerator>,
    replica_reads: bool,
}

impl<S: Storage + ?Sized> Clone for PartitionedManager<S> {
    fn clone(&self) -> Self {
        Self {
            topology: Arc::clone(&self.topology),
            store: Arc::clone(&self.store),
            ids: Arc::clone(&self.ids),
            replica_reads: self.replica_reads,
        }
    }
}

impl<S: Storage + ?Sized> std::fmt::Debug for PartitionedManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedManager")
            .field("entity", &self.topology.entity())
            .field("replica_reads", &self.replica_reads)
            .finish()
    }
}

impl<S: Storage + ?Sized> PartitionedManager<S> {
    pub fn new(topology: Arc<ShardTopology>, store: Arc<S>, ids: Arc<IdGenerator>) -> Self {
        Self { topology, store, ids, replica_reads: false }
    }

    pub fn for_entity(catalog: &Catalog, entity: &str, store: Arc<S>, ids: Arc<IdGenerator>) -> GatewayResult<Self> {
        Ok(Self::new(catalog.topology(entity)?, store, ids))
    }

    /// Send `filter`/`get` to replica aliases. Writes always go to primaries.
    pub fn with_replica_reads(mut self, on: bool) -> Self {
        self.replica_reads = on;
        self
    }

    pub fn topology(&self) -> &Arc<ShardTopology> { &self.topology }
    pub fn store(&self) -> &Arc<S> { &self.store }

    pub fn partition_for_key(&self, key: i64) -> GatewayResult<&PartitionDescriptor> {
        Ok(router::partition_for(&self.topology, key)?)
    }

    pub fn database_for_key(&self, key: i64, replica: bool) -> GatewayResult<ConnectionAlias> {
        Ok(self.partition_for_key(key)?.connection(replica).clone())
    }

    /// Connection of partition `index`; `ShardNotFound` past the last partition.
    pub fn connection_for(&self, index: u64, replica: bool) -> GatewayResult<ConnectionAlias> {
        Ok(self.topology.partition(index)?.connection(replica).clone())
    }

    /// Partition-bound handle whose operations need no routing key.
    pub fn shard(&self, index: u64, replica: bool) -> GatewayResult<ShardHandle<'_, S>> {
        let partition = self.topology.partition(index)?;
        Ok(ShardHandle { manager: self, partition, replica })
    }

    /// Ensure every partition's table and counter exist on its primary.
    pub fn provision(&self) -> GatewayResult<()> {
        for p in self.topology.partitions() {
            self.store.ensure_table(&p.primary, &TableSpec::for_partition(&self.topology, p))?;
            self.store.ensure_sequence(&p.primary, &p.sequence)?;
        }
        info!(entity = %self.topology.entity(), partitions = self.topology.num_shards(), "provisioned");
        Ok(())
    }

    pub fn filter(&self, filter: &Filter) -> GatewayResult<Vec<Record>> {
        let op = PendingOp::new(&self.topology, OpKind::Filter).route(filter, self.replica_reads)?;
        self.fetch(op, filter)
    }

    /// Exactly one row or `NotFound` / `MultipleReturned`.
    pub fn get(&self, filter: &Filter) -> GatewayResult<Record> {
        let op = PendingOp::new(&self.topology, OpKind::Get).route(filter, self.replica_reads)?;
        self.fetch_one(op, filter)
    }

    /// Insert a new row. The primary key is assigned per the entity's id strategy
    /// unless `fields` already carries one.
    pub fn create(&self, fields: Record) -> GatewayResult<Record> {
        let op = PendingOp::new(&self.topology, OpKind::Create).route(&fields, false)?;
        self.create_at(op, fields)
    }

    /// Look up by `filter`; create from its equality entries overlaid with
    /// `defaults` when absent. Returns the row and whether it was created.
    ///
    /// The insert runs inside a savepoint. If a concurrent creator wins, the
    /// savepoint is rolled back (any outer unit of work stays intact) and the
    /// lookup is retried once.
    pub fn get_or_create(&self, filter: &Filter, defaults: &Record) -> GatewayResult<(Record, bool)> {
        let op = PendingOp::new(&self.topology, OpKind::GetOrCreate).route(filter, false)?;
        op.execute(|p, conn| {
            let filter = self.topology.normalize_filter(filter)?;
            if let Some(found) = self.single(self.store.select(conn, &p.table, &filter)?)? {
                self.fetched(p, 1);
                return Ok((found, false));
            }
            let mut record = filter.equality_fields();
            for (k, v) in defaults {
                record.insert(k.clone(), v.clone());
            }
            let sp = self.store.savepoint(conn)?;
            match self.insert_new(p, conn, record) {
                Ok(created) => {
                    self.store.release_savepoint(conn, &sp)?;
                    self.saved(p, &created, true);
                    Ok((created, true))
                }
                Err(GatewayError::Store(e)) if e.is_unique_violation() => {
                    self.store.rollback_to_savepoint(conn, &sp)?;
                    counter!("gateway_race_retries_total", 1u64);
                    warn!(entity = %self.topology.entity(), partition = p.index, error = %e, "create lost a race, retrying lookup");
                    match self.single(self.store.select(conn, &p.table, &filter)?)? {
                        Some(found) => {
                            self.fetched(p, 1);
                            Ok((found, false))
                        }
                        None => Err(GatewayError::RaceCondition { entity: self.topology.entity().to_string(), source: e }),
                    }
                }
                Err(e) => {
                    if let Err(rb) = self.store.rollback_to_savepoint(conn, &sp) {
                        warn!(conn = %conn, error = %rb, "savepoint rollback failed");
                    }
                    Err(e)
                }
            }
        })
    }

    fn fetch(&self, op: RoutedOp<'_>, filter: &Filter) -> GatewayResult<Vec<Record>> {
        op.execute(|p, conn| {
            let rows = self.store.select(conn, &p.table, &self.topology.normalize_filter(filter)?)?;
            self.fetched(p, rows.len());
            Ok(rows)
        })
    }

    /// An empty result completes the operation; `NotFound` is raised after.
    fn fetch_one(&self, op: RoutedOp<'_>, filter: &Filter) -> GatewayResult<Record> {
        let found = op.execute(|p, conn| {
            let row = self.single(self.store.select(conn, &p.table, &self.topology.normalize_filter(filter)?)?)?;
            self.fetched(p, usize::from(row.is_some()));
            Ok(row)
        })?;
        found.ok_or_else(|| GatewayError::NotFound { entity: self.topology.entity().to_string() })
    }

    fn create_at(&self, op: RoutedOp<'_>, fields: Record) -> GatewayResult<Record> {
        // writes never go to a replica
        let primary = op.partition().primary.clone();
        op.execute(|p, _| {
            let created = self.insert_new(p, &primary, fields)?;
            self.saved(p, &created, true);
            Ok(created)
        })
    }

    fn single(&self, mut rows: Vec<Record>) -> GatewayResult<Option<Record>> {
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => Err(GatewayError::MultipleReturned { entity: self.topology.entity().to_string(), count }),
        }
    }

    fn insert_new(&self, p: &PartitionDescriptor, conn: &ConnectionAlias, mut record: Record) -> GatewayResult<Record> {
        self.topology.normalize_record(&mut record)?;
        let pk = self.topology.primary_key();
        if record.get(pk).map_or(true, Value::is_null) {
            let id = match self.topology.id_strategy() {
                IdStrategy::Packed => {
                    let seq = self.store.next_value(conn, &p.sequence)?;
                    let id = self.ids.generate(seq, p.index)?;
                    counter!("ids_generated_total", 1u64);
                    Value::from(id.value())
                }
                IdStrategy::Sequence => Value::from(self.store.next_value(conn, &p.sequence)?),
                IdStrategy::Manual => {
                    return Err(GatewayError::MissingPrimaryKey {
                        entity: self.topology.entity().to_string(),
                        field: pk.to_string(),
                    })
                }
            };
            record.insert(pk.to_string(), id);
        }
        self.store.insert(conn, &p.table, &record)?;
        debug!(entity = %self.topology.entity(), partition = p.index, conn = %conn, "row inserted");
        Ok(record)
    }

    fn fetched(&self, p: &PartitionDescriptor, rows: usize) {
        self.topology.notify(&ShardEvent::Fetched { entity: self.topology.entity().to_string(), partition: p.index, rows });
    }

    fn saved(&self, p: &PartitionDescriptor, row: &Record, created: bool) {
        let pk = row.get(self.topology.primary_key()).cloned().unwrap_or(Value::Null);
        self.topology.notify(&ShardEvent::Saved { entity: self.topology.entity().to_string(), partition: p.index, pk, created });
    }
}

/// Direct access to one partition, obtained from [`PartitionedManager::shard`].
pub struct ShardHandle<'m, S: Storage + ?Sized> {
    manager: &'m PartitionedManager<S>,
    partition: &'m PartitionDescriptor,
    replica: bool,
}

impl<'m, S: Storage + ?Sized> ShardHandle<'m, S> {
    pub fn partition(&self) -> &PartitionDescriptor { self.partition }
    pub fn connection(&self) -> &ConnectionAlias { self.partition.connection(self.replica) }

    fn op(&self, kind: OpKind) -> RoutedOp<'m> {
        let manager: &'m PartitionedManager<S> = self.manager;
        PendingOp::new(manager.topology.as_ref(), kind).at(self.partition, self.replica)
    }

    pub fn filter(&self, filter: &Filter) -> GatewayResult<Vec<Record>> { self.manager.fetch(self.op(OpKind::Filter), filter) }

    pub fn get(&self, filter: &Filter) -> GatewayResult<Record> { self.manager.fetch_one(self.op(OpKind::Get), filter) }

    /// Insert into this partition. Rows whose key belongs elsewhere fail the
    /// partition's check constraint.
    pub fn create(&self, fields: Record) -> GatewayResult<Record> { self.manager.create_at(self.op(OpKind::Create), fields) }
}
