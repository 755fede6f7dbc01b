//! Domain Ports - Boundaries between the control plane and external systems
//!
//! The orchestrators only ever talk to the outside world through these
//! traits: a [`DataStore`] holding topology and task records, and a
//! [`DeviceGateway`] that dispatches array-specific operations. Both are
//! injected; nothing in the crate holds a process-wide handle.

use crate::domain::model::{
    Entity, EntityId, EntityKind, OperationType, SystemType, Task, TaskKey, TaskState,
    TopologyEntity,
};
use crate::error::{DeviceError, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Data Store Port
// =============================================================================

/// Secondary-index lookups the data store must answer
///
/// Results include inactive entities; callers filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    /// Volumes whose consistency group is the given CG
    VolumesInConsistencyGroup(EntityId),
    /// Mirrors sharing a device-side replication group instance
    MirrorsByReplicationGroupInstance(String),
    /// Mirrors whose source is the given volume
    MirrorsOfSource(EntityId),
    /// Pairs whose parent group is the given group
    PairsInReplicationGroup(EntityId),
    /// Pairs whose source element is the given volume or file share
    PairsBySourceElement(EntityId),
    /// Replication sets for a storage-system type
    SetsBySystemType(SystemType),
    /// Every entity of a kind
    AllOfKind(EntityKind),
}

/// Port for topology and task persistence
///
/// Every call is an independent write or read; there are no multi-entity
/// transactions. `update_batch` applies its entities one after another.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch an entity by kind and id
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>>;

    /// Resolve a constraint to entity ids
    async fn query(&self, constraint: &Constraint) -> Result<Vec<EntityId>>;

    /// Persist a new entity; fails if the id is taken
    async fn create(&self, entity: Entity) -> Result<()>;

    /// Persist changes to an entity, creating it if absent
    async fn update(&self, entity: Entity) -> Result<()>;

    /// Persist several entities in one call
    async fn update_batch(&self, entities: Vec<Entity>) -> Result<()>;

    /// Create a pending task record
    async fn create_task(
        &self,
        kind: EntityKind,
        resource_id: &str,
        op_id: &str,
        operation: OperationType,
        associated: Vec<EntityId>,
    ) -> Result<Task>;

    /// Persist a task record as given
    async fn put_task(&self, task: Task) -> Result<()>;

    /// Fetch a task record
    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>>;

    /// List tasks, optionally restricted to one state
    async fn tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>>;

    /// Check if the store is reachable
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Device Dispatch Gateway Port
// =============================================================================

/// Result of a gateway dispatch
pub type DeviceResult = std::result::Result<(), DeviceError>;

/// The gateway entry points, used for logging, metrics and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    Attach,
    Detach,
    Pause,
    Resume,
    EstablishGroupRelation,
    Deactivate,
    FailbackGroup,
}

impl GatewayOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOperation::Attach => "attach",
            GatewayOperation::Detach => "detach",
            GatewayOperation::Pause => "pause",
            GatewayOperation::Resume => "resume",
            GatewayOperation::EstablishGroupRelation => "establish_group_relation",
            GatewayOperation::Deactivate => "deactivate",
            GatewayOperation::FailbackGroup => "failback_group",
        }
    }
}

impl std::fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Port for array-specific operations
///
/// A normal return means "dispatched", not "completed on the device". Final
/// completion arrives out of band.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Attach prepared mirrors to a source volume
    async fn attach(
        &self,
        system: &str,
        source: &str,
        mirrors: &[EntityId],
        op_id: &str,
    ) -> DeviceResult;

    /// Detach mirrors, promoting each into the matching promoted volume
    async fn detach(
        &self,
        system: &str,
        mirrors: &[EntityId],
        promoted: &[EntityId],
        op_id: &str,
    ) -> DeviceResult;

    /// Fracture mirrors
    async fn pause(&self, system: &str, mirrors: &[EntityId], sync: bool, op_id: &str)
        -> DeviceResult;

    /// Resume fractured mirrors
    async fn resume(&self, system: &str, mirrors: &[EntityId], op_id: &str) -> DeviceResult;

    /// Associate a source volume group with a mirror group
    async fn establish_group_relation(
        &self,
        system: &str,
        source: &str,
        mirror: &str,
        op_id: &str,
    ) -> DeviceResult;

    /// Tear down mirrors
    async fn deactivate(&self, system: &str, mirrors: &[EntityId], op_id: &str) -> DeviceResult;

    /// Fail back a remote replication group
    async fn failback_group(&self, group: &str, op_id: &str) -> DeviceResult;

    /// Check whether the gateway can accept dispatches
    async fn health_check(&self) -> Result<bool>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DataStoreRef = Arc<dyn DataStore>;
pub type DeviceGatewayRef = Arc<dyn DeviceGateway>;

// =============================================================================
// Repository
// =============================================================================

/// Typed access to a [`DataStore`]
#[derive(Clone)]
pub struct Repository {
    store: DataStoreRef,
}

impl Repository {
    pub fn new(store: DataStoreRef) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &DataStoreRef {
        &self.store
    }

    /// Fetch an entity of type `T`
    pub async fn get<T: TopologyEntity>(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(T::KIND, id).await? {
            None => Ok(None),
            Some(entity) => {
                let actual = entity.kind();
                T::from_entity(entity).map(Some).ok_or(Error::KindMismatch {
                    id: id.to_string(),
                    expected: T::KIND,
                    actual,
                })
            }
        }
    }

    /// Fetch an entity of type `T`, failing if it does not exist
    pub async fn require<T: TopologyEntity>(&self, id: &str) -> Result<T> {
        self.get::<T>(id)
            .await?
            .ok_or_else(|| Error::not_found(T::KIND, id))
    }

    /// Fetch several entities, skipping ids that no longer resolve
    pub async fn get_many<T: TopologyEntity>(&self, ids: &[EntityId]) -> Result<Vec<T>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get::<T>(id).await? {
                found.push(entity);
            }
        }
        Ok(found)
    }

    pub async fn query(&self, constraint: &Constraint) -> Result<Vec<EntityId>> {
        self.store.query(constraint).await
    }

    /// Resolve a constraint and load every match
    pub async fn query_entities<T: TopologyEntity>(&self, constraint: &Constraint) -> Result<Vec<T>> {
        let ids = self.store.query(constraint).await?;
        self.get_many(&ids).await
    }

    pub async fn create<T: TopologyEntity>(&self, entity: T) -> Result<()> {
        self.store.create(entity.into_entity()).await
    }

    pub async fn update<T: TopologyEntity>(&self, entity: T) -> Result<()> {
        self.store.update(entity.into_entity()).await
    }

    pub async fn update_batch(&self, entities: Vec<Entity>) -> Result<()> {
        self.store.update_batch(entities).await
    }
}
