//! Shardkit core: how logical entities are split into partitions, how a
//! routing key picks a partition and a connection, and how packed 64-bit IDs
//! are assembled.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod id;
pub mod observer;
pub mod query;
pub mod router;
pub mod topology;

pub use catalog::Catalog;
pub use cluster::{Cluster, ClusterRegistry, ConnectionAlias, ShardSlot};
pub use config::{Deployment, ShardConfig};
pub use error::{ShardError, ShardResult};
pub use id::{Clock, GeneratedId, IdGenerator, ManualClock, SystemClock};
pub use observer::{LifecycleObserver, ShardEvent};
pub use query::{FieldSource, Filter, Lookup, LookupOp, Record};
pub use topology::{EntitySpec, FieldKind, FieldSpec, IdStrategy, PartitionDescriptor, ShardTopology};

pub mod prelude {
    pub use super::{
        Catalog, ClusterRegistry, ConnectionAlias, EntitySpec, Filter, GeneratedId, IdGenerator, IdStrategy,
        PartitionDescriptor, Record, ShardError, ShardResult, ShardTopology,
    };
}
