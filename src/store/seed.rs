//! Topology Seed
//!
//! Loads a topology snapshot (systems, pools, volumes, mirrors, CGs and the
//! replication hierarchy) from YAML into a data store. Used by the binary
//! and by tests that want a realistic starting point.

use crate::domain::model::{
    ConsistencyGroup, Entity, Mirror, ReplicationGroup, ReplicationPair, ReplicationSet,
    StorageSystem, TopologyEntity, VirtualPool, Volume,
};
use crate::domain::ports::DataStore;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// A full topology snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TopologySeed {
    pub storage_systems: Vec<StorageSystem>,
    pub virtual_pools: Vec<VirtualPool>,
    pub consistency_groups: Vec<ConsistencyGroup>,
    pub volumes: Vec<Volume>,
    pub mirrors: Vec<Mirror>,
    pub replication_sets: Vec<ReplicationSet>,
    pub replication_groups: Vec<ReplicationGroup>,
    pub replication_pairs: Vec<ReplicationPair>,
}

impl TopologySeed {
    /// Parse a seed from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a seed from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read topology {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Number of entities in the seed
    pub fn len(&self) -> usize {
        self.storage_systems.len()
            + self.virtual_pools.len()
            + self.consistency_groups.len()
            + self.volumes.len()
            + self.mirrors.len()
            + self.replication_sets.len()
            + self.replication_groups.len()
            + self.replication_pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entities in dependency order, with each volume's mirror set completed
    /// from the mirrors that name it as their source
    pub fn into_entities(self) -> Vec<Entity> {
        let mut volumes = self.volumes;
        for mirror in &self.mirrors {
            if let Some(source) = volumes.iter_mut().find(|v| v.id == mirror.source) {
                source.mirrors.insert(mirror.id.clone());
            }
        }

        let mut entities = Vec::new();
        entities.extend(self.storage_systems.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.virtual_pools.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.consistency_groups.into_iter().map(TopologyEntity::into_entity));
        entities.extend(volumes.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.mirrors.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.replication_sets.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.replication_groups.into_iter().map(TopologyEntity::into_entity));
        entities.extend(self.replication_pairs.into_iter().map(TopologyEntity::into_entity));
        entities
    }

    /// Write every entity of the seed into a store
    pub async fn apply(self, store: &dyn DataStore) -> Result<usize> {
        let entities = self.into_entities();
        let count = entities.len();
        for entity in entities {
            store.create(entity).await?;
        }
        info!("Seeded {} topology entities", count);
        Ok(count)
    }
}
