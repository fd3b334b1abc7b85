//! Deployment configuration: clusters, epoch and entity declarations.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::cluster::ClusterRegistry;
use crate::error::{ShardError, ShardResult};
use crate::id::IdGenerator;
use crate::topology::EntitySpec;

fn default_epoch() -> String { "2012-11-01T00:00:00Z".to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Reference instant for packed IDs. Fixed for the lifetime of a deployment.
    #[serde(default = "default_epoch")]
    pub epoch: String,
    /// Connection aliases to discover clusters from (`<cluster>.shard<N>`).
    #[serde(default)]
    pub connections: Vec<String>,
    /// Explicit cluster sizes; these win over discovery.
    #[serde(default)]
    pub clusters: BTreeMap<String, u32>,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self { epoch: default_epoch(), connections: Vec::new(), clusters: BTreeMap::new(), entities: Vec::new() }
    }
}

/// Everything a process needs after startup.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub catalog: Arc<Catalog>,
    pub ids: Arc<IdGenerator>,
}

impl ShardConfig {
    pub fn epoch_ms(&self) -> ShardResult<i64> {
        DateTime::parse_from_rfc3339(&self.epoch)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| ShardError::Configuration(format!("epoch {:?}: {}", self.epoch, e)))
    }

    pub fn registry(&self) -> ShardResult<ClusterRegistry> {
        let discovered = self.connections.iter().filter(|c| {
            !self.clusters.keys().any(|name| c.strip_prefix(name.as_str()).map_or(false, |rest| rest.starts_with(".shard") || rest.starts_with(".slave.shard")))
        });
        let mut reg = ClusterRegistry::discover(discovered)?;
        for (name, size) in &self.clusters {
            reg.register(name, *size)?;
        }
        Ok(reg)
    }

    pub fn build(&self) -> ShardResult<Deployment> {
        self.build_with_epoch(self.epoch_ms()?)
    }

    /// Like [`ShardConfig::build`] with the epoch supplied by the caller.
    pub fn build_with_epoch(&self, epoch_ms: i64) -> ShardResult<Deployment> {
        let catalog = Catalog::new(self.registry()?);
        for spec in &self.entities {
            catalog.declare(spec.clone())?;
        }
        Ok(Deployment { catalog: Arc::new(catalog), ids: Arc::new(IdGenerator::new(epoch_ms)) })
    }
}
