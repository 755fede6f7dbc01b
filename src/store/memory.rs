//! In-Memory Data Store
//!
//! Sharded in-memory implementation of the [`DataStore`] port using DashMap
//! for concurrent access. Constraint queries scan the entity map; results
//! are sorted by id so callers see a stable order.

use crate::domain::model::{
    Entity, EntityId, EntityKind, OperationType, Task, TaskKey, TaskState,
};
use crate::domain::ports::{Constraint, DataStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

// =============================================================================
// Memory Store
// =============================================================================

/// In-memory data store backed by DashMap
pub struct InMemoryDataStore {
    /// Topology entities keyed by (kind, id)
    entities: DashMap<(EntityKind, EntityId), Entity>,
    /// Task records keyed by (kind, resource id, op id)
    tasks: DashMap<TaskKey, Task>,
    /// Number of writes accepted
    writes: AtomicU64,
    /// Reject every write with a data store error
    fail_writes: AtomicBool,
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDataStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            tasks: DashMap::new(),
            writes: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of writes accepted so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of entities held
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of task records held
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::DataStore("store is rejecting writes".into()));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn matches(constraint: &Constraint, entity: &Entity) -> bool {
        match (constraint, entity) {
            (Constraint::VolumesInConsistencyGroup(cg), Entity::Volume(v)) => {
                v.consistency_group.as_deref() == Some(cg.as_str())
            }
            (Constraint::MirrorsByReplicationGroupInstance(instance), Entity::Mirror(m)) => {
                m.replication_group_instance.as_deref() == Some(instance.as_str())
            }
            (Constraint::MirrorsOfSource(source), Entity::Mirror(m)) => &m.source == source,
            (Constraint::PairsInReplicationGroup(group), Entity::ReplicationPair(p)) => {
                p.replication_group.as_deref() == Some(group.as_str())
            }
            (Constraint::PairsBySourceElement(element), Entity::ReplicationPair(p)) => {
                &p.source_element == element
            }
            (Constraint::SetsBySystemType(system_type), Entity::ReplicationSet(s)) => {
                s.storage_system_type == *system_type
            }
            (Constraint::AllOfKind(kind), entity) => entity.kind() == *kind,
            _ => false,
        }
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .get(&(kind, id.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn query(&self, constraint: &Constraint) -> Result<Vec<EntityId>> {
        let mut ids: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| Self::matches(constraint, e.value()))
            .map(|e| e.key().1.clone())
            .collect();
        ids.sort();
        trace!("Query {:?} matched {} entities", constraint, ids.len());
        Ok(ids)
    }

    async fn create(&self, entity: Entity) -> Result<()> {
        self.check_writable()?;
        let key = (entity.kind(), entity.id().to_string());
        if self.entities.contains_key(&key) {
            return Err(Error::ResourceExists {
                kind: key.0,
                id: key.1,
            });
        }
        debug!("Created {}/{}", key.0, key.1);
        self.entities.insert(key, entity);
        Ok(())
    }

    async fn update(&self, entity: Entity) -> Result<()> {
        self.check_writable()?;
        let key = (entity.kind(), entity.id().to_string());
        self.entities.insert(key, entity);
        Ok(())
    }

    async fn update_batch(&self, entities: Vec<Entity>) -> Result<()> {
        self.check_writable()?;
        for entity in entities {
            let key = (entity.kind(), entity.id().to_string());
            self.entities.insert(key, entity);
        }
        Ok(())
    }

    async fn create_task(
        &self,
        kind: EntityKind,
        resource_id: &str,
        op_id: &str,
        operation: OperationType,
        associated: Vec<EntityId>,
    ) -> Result<Task> {
        self.check_writable()?;
        let key = TaskKey::new(kind, resource_id, op_id);

        if let Some(existing) = self.tasks.get(&key) {
            if existing.is_terminal() {
                return Err(Error::TaskAlreadyTerminal {
                    kind,
                    id: resource_id.to_string(),
                    op_id: op_id.to_string(),
                    state: existing.state.to_string(),
                });
            }
            // Re-issued with the same op id: the pending record stands
            return Ok(existing.clone());
        }

        let task = Task::pending(key.clone(), operation, associated);
        self.tasks.insert(key, task.clone());
        Ok(task)
    }

    async fn put_task(&self, task: Task) -> Result<()> {
        self.check_writable()?;
        self.tasks.insert(task.key.clone(), task);
        Ok(())
    }

    async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        Ok(self.tasks.get(key).map(|t| t.value().clone()))
    }

    async fn tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| state.map_or(true, |s| t.value().state == s))
            .map(|t| t.value().clone())
            .collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(tasks)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.fail_writes.load(Ordering::SeqCst))
    }
}
