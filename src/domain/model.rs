//! Topology Model
//!
//! Entities the control plane reasons about: volumes, their continuous copies
//! (mirrors), consistency groups, the remote-replication hierarchy
//! (pair → group → set), and the task records that track asynchronous work.
//!
//! Everything here is plain data plus the small predicates the orchestrators
//! validate against. Persistence goes through [`Entity`], the tagged form the
//! data store holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifier of any topology entity
pub type EntityId = String;

// =============================================================================
// Entity Kinds
// =============================================================================

/// Kind of a persisted entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Volume,
    Mirror,
    ConsistencyGroup,
    ReplicationPair,
    ReplicationGroup,
    ReplicationSet,
    VirtualPool,
    StorageSystem,
}

impl EntityKind {
    /// Short prefix used for generated identifiers
    pub fn id_prefix(&self) -> &'static str {
        match self {
            EntityKind::Volume => "vol",
            EntityKind::Mirror => "mirror",
            EntityKind::ConsistencyGroup => "cg",
            EntityKind::ReplicationPair => "rrpair",
            EntityKind::ReplicationGroup => "rrgroup",
            EntityKind::ReplicationSet => "rrset",
            EntityKind::VirtualPool => "vpool",
            EntityKind::StorageSystem => "system",
        }
    }

    /// Generate a fresh identifier for an entity of this kind
    pub fn new_id(&self) -> EntityId {
        format!("{}-{}", self.id_prefix(), uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Volume => write!(f, "Volume"),
            EntityKind::Mirror => write!(f, "BlockMirror"),
            EntityKind::ConsistencyGroup => write!(f, "BlockConsistencyGroup"),
            EntityKind::ReplicationPair => write!(f, "RemoteReplicationPair"),
            EntityKind::ReplicationGroup => write!(f, "RemoteReplicationGroup"),
            EntityKind::ReplicationSet => write!(f, "RemoteReplicationSet"),
            EntityKind::VirtualPool => write!(f, "VirtualPool"),
            EntityKind::StorageSystem => write!(f, "StorageSystem"),
        }
    }
}

// =============================================================================
// Storage Systems
// =============================================================================

/// Array family of a storage system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemType {
    Vmax,
    VnxBlock,
    Xtremio,
    Unity,
    External,
}

impl std::fmt::Display for SystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemType::Vmax => write!(f, "vmax"),
            SystemType::VnxBlock => write!(f, "vnxblock"),
            SystemType::Xtremio => write!(f, "xtremio"),
            SystemType::Unity => write!(f, "unity"),
            SystemType::External => write!(f, "external"),
        }
    }
}

impl std::str::FromStr for SystemType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vmax" => Ok(SystemType::Vmax),
            "vnxblock" | "vnx" => Ok(SystemType::VnxBlock),
            "xtremio" => Ok(SystemType::Xtremio),
            "unity" => Ok(SystemType::Unity),
            "external" => Ok(SystemType::External),
            other => Err(format!("unknown storage system type: {}", other)),
        }
    }
}

/// A discovered storage array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSystem {
    pub id: EntityId,
    pub label: String,
    pub system_type: SystemType,
    /// Managed through an SMI-S 8.0 provider
    #[serde(default)]
    pub using_smis80: bool,
}

/// Virtual pool of a volume; only the mirror-related attribute matters here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPool {
    pub id: EntityId,
    pub label: String,
    /// Pool continuous copies of volumes in this pool are placed into
    #[serde(default)]
    pub mirror_virtual_pool: Option<EntityId>,
}

// =============================================================================
// Volumes & Mirrors
// =============================================================================

/// A logical block volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: EntityId,
    pub label: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub tenant: String,
    pub virtual_pool: EntityId,
    #[serde(default)]
    pub virtual_array: Option<EntityId>,
    pub storage_system: EntityId,
    #[serde(default)]
    pub storage_pool: Option<EntityId>,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub consistency_group: Option<EntityId>,
    #[serde(default)]
    pub mirrors: BTreeSet<EntityId>,
    /// Volume carries an SRDF personality
    #[serde(default)]
    pub srdf: bool,
    #[serde(default)]
    pub inactive: bool,
    /// Mirror this volume was promoted from, for volumes created by a detach
    #[serde(default)]
    pub promoted_from: Option<EntityId>,
}

impl Volume {
    pub fn is_in_cg(&self) -> bool {
        self.consistency_group.is_some()
    }

    pub fn has_mirrors(&self) -> bool {
        !self.mirrors.is_empty()
    }
}

/// Synchronization state of a continuous copy as reported by the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Synchronized,
    Fractured,
    Resynchronizing,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Synchronized => write!(f, "SYNCHRONIZED"),
            SyncState::Fractured => write!(f, "FRACTURED"),
            SyncState::Resynchronizing => write!(f, "RESYNCHRONIZING"),
        }
    }
}

/// Terminal end of a mirror relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorRetirement {
    /// Converted into an independent volume
    Promoted,
    /// Torn down
    Deactivated,
}

/// Full lifecycle state of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorState {
    Synchronized,
    Fractured,
    Resynchronizing,
    Promoted,
    Deactivated,
}

impl MirrorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MirrorState::Promoted | MirrorState::Deactivated)
    }
}

/// Array-side continuous copy of a source volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    pub id: EntityId,
    pub label: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub tenant: String,
    pub source: EntityId,
    pub storage_system: EntityId,
    #[serde(default)]
    pub virtual_pool: Option<EntityId>,
    #[serde(default)]
    pub storage_pool: Option<EntityId>,
    #[serde(default)]
    pub capacity_bytes: u64,
    pub sync_state: SyncState,
    /// Device-side grouping key shared by CG sibling mirrors
    #[serde(default)]
    pub replication_group_instance: Option<String>,
    #[serde(default)]
    pub inactive: bool,
    #[serde(default)]
    pub retired: Option<MirrorRetirement>,
}

impl Mirror {
    /// Active and not already fractured
    pub fn is_pausable(&self) -> bool {
        !self.inactive && self.sync_state != SyncState::Fractured
    }

    /// Active and fractured
    pub fn is_resumable(&self) -> bool {
        !self.inactive && self.sync_state == SyncState::Fractured
    }

    /// Active and resynchronizing
    pub fn is_resynchronizing(&self) -> bool {
        !self.inactive && self.sync_state == SyncState::Resynchronizing
    }

    pub fn state(&self) -> MirrorState {
        match self.retired {
            Some(MirrorRetirement::Promoted) => MirrorState::Promoted,
            Some(MirrorRetirement::Deactivated) => MirrorState::Deactivated,
            None => match self.sync_state {
                SyncState::Synchronized => MirrorState::Synchronized,
                SyncState::Fractured => MirrorState::Fractured,
                SyncState::Resynchronizing => MirrorState::Resynchronizing,
            },
        }
    }
}

/// Volumes whose copies must transition together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyGroup {
    pub id: EntityId,
    pub label: String,
    #[serde(default)]
    pub storage_system: Option<EntityId>,
}

// =============================================================================
// Remote Replication
// =============================================================================

/// Kind of element on either side of a replication pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationElementType {
    Volume,
    FileSystem,
}

/// Which side currently feeds the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationDirection {
    #[default]
    SourceToTarget,
    TargetToSource,
}

impl ReplicationDirection {
    pub fn flipped(self) -> Self {
        match self {
            ReplicationDirection::SourceToTarget => ReplicationDirection::TargetToSource,
            ReplicationDirection::TargetToSource => ReplicationDirection::SourceToTarget,
        }
    }
}

/// Link state of a pair or group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationState {
    Active,
    Suspended,
    Split,
    FailedOver,
    Swapped,
    Stopped,
    #[default]
    Unknown,
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationState::Active => "ACTIVE",
            ReplicationState::Suspended => "SUSPENDED",
            ReplicationState::Split => "SPLIT",
            ReplicationState::FailedOver => "FAILED_OVER",
            ReplicationState::Swapped => "SWAPPED",
            ReplicationState::Stopped => "STOPPED",
            ReplicationState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Granularity at which a replication set accepts link operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkGranularity {
    Pair,
    Group,
    Set,
}

impl std::fmt::Display for LinkGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkGranularity::Pair => write!(f, "pair"),
            LinkGranularity::Group => write!(f, "group"),
            LinkGranularity::Set => write!(f, "set"),
        }
    }
}

/// Link operations on remote replication elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationOperation {
    Establish,
    Split,
    Suspend,
    Resume,
    Failover,
    Failback,
    Swap,
    Stop,
    Restore,
}

impl std::fmt::Display for ReplicationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplicationOperation::Establish => "establish",
            ReplicationOperation::Split => "split",
            ReplicationOperation::Suspend => "suspend",
            ReplicationOperation::Resume => "resume",
            ReplicationOperation::Failover => "failover",
            ReplicationOperation::Failback => "failback",
            ReplicationOperation::Swap => "swap",
            ReplicationOperation::Stop => "stop",
            ReplicationOperation::Restore => "restore",
        };
        write!(f, "{}", s)
    }
}

/// One source/target replication relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationPair {
    pub id: EntityId,
    pub source_element: EntityId,
    pub target_element: EntityId,
    pub element_type: ReplicationElementType,
    #[serde(default)]
    pub direction: ReplicationDirection,
    #[serde(default)]
    pub replication_state: ReplicationState,
    #[serde(default)]
    pub replication_mode: Option<String>,
    #[serde(default)]
    pub replication_group: Option<EntityId>,
    pub replication_set: EntityId,
    #[serde(default)]
    pub inactive: bool,
}

/// Pairs sharing device-level atomicity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationGroup {
    pub id: EntityId,
    pub label: String,
    pub replication_set: EntityId,
    #[serde(default)]
    pub replication_mode: Option<String>,
    #[serde(default)]
    pub replication_state: ReplicationState,
    /// Link operations are only allowed on the group as a whole
    #[serde(default)]
    pub consistency_enforced: bool,
    #[serde(default)]
    pub inactive: bool,
}

/// Policy scope of replication for one storage-system type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSet {
    pub id: EntityId,
    pub label: String,
    pub storage_system_type: SystemType,
    /// Storage systems participating in this set
    #[serde(default)]
    pub storage_systems: BTreeSet<EntityId>,
    #[serde(default)]
    pub link_granularity: BTreeSet<LinkGranularity>,
    /// Operations allowed per granularity; a granularity without an entry
    /// allows every operation
    #[serde(default)]
    pub operation_policy: BTreeMap<LinkGranularity, BTreeSet<ReplicationOperation>>,
    #[serde(default)]
    pub supported_modes: BTreeSet<String>,
    #[serde(default)]
    pub inactive: bool,
}

impl ReplicationSet {
    pub fn supports(&self, granularity: LinkGranularity) -> bool {
        self.link_granularity.contains(&granularity)
    }

    /// Whether `operation` may run at `granularity` in this set
    pub fn permits(&self, granularity: LinkGranularity, operation: ReplicationOperation) -> bool {
        self.supports(granularity)
            && self
                .operation_policy
                .get(&granularity)
                .map_or(true, |allowed| allowed.contains(&operation))
    }

    pub fn supports_mode(&self, mode: &str) -> bool {
        self.supported_modes.contains(mode)
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// State of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Ready,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Error => write!(f, "error"),
        }
    }
}

/// What a task does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    AttachBlockMirror,
    DetachBlockMirror,
    PromoteCopyToVolume,
    FractureVolumeMirror,
    ResumeVolumeMirror,
    EstablishVolumeMirror,
    DeactivateVolumeMirror,
    FailbackReplicationGroup,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationType::AttachBlockMirror => "ATTACH_BLOCK_MIRROR",
            OperationType::DetachBlockMirror => "DETACH_BLOCK_MIRROR",
            OperationType::PromoteCopyToVolume => "PROMOTE_COPY_TO_VOLUME",
            OperationType::FractureVolumeMirror => "FRACTURE_VOLUME_MIRROR",
            OperationType::ResumeVolumeMirror => "RESUME_VOLUME_MIRROR",
            OperationType::EstablishVolumeMirror => "ESTABLISH_VOLUME_MIRROR",
            OperationType::DeactivateVolumeMirror => "DEACTIVATE_VOLUME_MIRROR",
            OperationType::FailbackReplicationGroup => "FAILBACK_REMOTE_REPLICATION_GROUP",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a task: (resource kind, resource id, operation id)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub kind: EntityKind,
    pub resource_id: EntityId,
    pub op_id: String,
}

impl TaskKey {
    pub fn new(kind: EntityKind, resource_id: impl Into<String>, op_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
            op_id: op_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.kind, self.resource_id, self.op_id)
    }
}

/// Durable record of one asynchronous unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub key: TaskKey,
    pub operation: OperationType,
    pub state: TaskState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub associated: Vec<EntityId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A freshly created, pending task
    pub fn pending(key: TaskKey, operation: OperationType, associated: Vec<EntityId>) -> Self {
        Self {
            key,
            operation,
            state: TaskState::Pending,
            message: None,
            associated,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.key.resource_id
    }

    pub fn op_id(&self) -> &str {
        &self.key.op_id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Tasks produced by one orchestrator invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskList(pub Vec<Task>);

impl TaskList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, task: Task) {
        self.0.push(task);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.0.iter()
    }

    pub fn keys(&self) -> Vec<TaskKey> {
        self.0.iter().map(|t| t.key.clone()).collect()
    }

    /// Task for a given resource, if one was produced
    pub fn for_resource(&self, resource_id: &str) -> Option<&Task> {
        self.0.iter().find(|t| t.key.resource_id == resource_id)
    }

    pub fn all_in_state(&self, state: TaskState) -> bool {
        self.0.iter().all(|t| t.state == state)
    }

    pub fn any_failed(&self) -> bool {
        self.0.iter().any(|t| t.state == TaskState::Error)
    }
}

impl IntoIterator for TaskList {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<Task>> for TaskList {
    fn from(tasks: Vec<Task>) -> Self {
        Self(tasks)
    }
}

// =============================================================================
// Stored Entity
// =============================================================================

/// Tagged form of every entity the data store holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entity {
    Volume(Volume),
    Mirror(Mirror),
    ConsistencyGroup(ConsistencyGroup),
    ReplicationPair(ReplicationPair),
    ReplicationGroup(ReplicationGroup),
    ReplicationSet(ReplicationSet),
    VirtualPool(VirtualPool),
    StorageSystem(StorageSystem),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Volume(_) => EntityKind::Volume,
            Entity::Mirror(_) => EntityKind::Mirror,
            Entity::ConsistencyGroup(_) => EntityKind::ConsistencyGroup,
            Entity::ReplicationPair(_) => EntityKind::ReplicationPair,
            Entity::ReplicationGroup(_) => EntityKind::ReplicationGroup,
            Entity::ReplicationSet(_) => EntityKind::ReplicationSet,
            Entity::VirtualPool(_) => EntityKind::VirtualPool,
            Entity::StorageSystem(_) => EntityKind::StorageSystem,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::Volume(e) => &e.id,
            Entity::Mirror(e) => &e.id,
            Entity::ConsistencyGroup(e) => &e.id,
            Entity::ReplicationPair(e) => &e.id,
            Entity::ReplicationGroup(e) => &e.id,
            Entity::ReplicationSet(e) => &e.id,
            Entity::VirtualPool(e) => &e.id,
            Entity::StorageSystem(e) => &e.id,
        }
    }
}

/// Typed view over [`Entity`]
pub trait TopologyEntity: Sized + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn from_entity(entity: Entity) -> Option<Self>;

    fn into_entity(self) -> Entity;
}

macro_rules! topology_entity {
    ($ty:ident) => {
        impl TopologyEntity for $ty {
            const KIND: EntityKind = EntityKind::$ty;

            fn id(&self) -> &str {
                &self.id
            }

            fn from_entity(entity: Entity) -> Option<Self> {
                match entity {
                    Entity::$ty(inner) => Some(inner),
                    _ => None,
                }
            }

            fn into_entity(self) -> Entity {
                Entity::$ty(self)
            }
        }
    };
}

topology_entity!(Volume);
topology_entity!(Mirror);
topology_entity!(ConsistencyGroup);
topology_entity!(ReplicationPair);
topology_entity!(ReplicationGroup);
topology_entity!(ReplicationSet);
topology_entity!(VirtualPool);
topology_entity!(StorageSystem);


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_mirror_predicates() {
        let synced = mirror("m1", "v1", "s1", SyncState::Synchronized);
        assert!(synced.is_pausable());
        assert!(!synced.is_resumable());
        assert!(!synced.is_resynchronizing());

        let fractured = mirror("m2", "v1", "s1", SyncState::Fractured);
        assert!(!fractured.is_pausable());
        assert!(fractured.is_resumable());

        let resync = mirror("m3", "v1", "s1", SyncState::Resynchronizing);
        assert!(resync.is_pausable());
        assert!(resync.is_resynchronizing());

        let mut gone = mirror("m4", "v1", "s1", SyncState::Fractured);
        gone.inactive = true;
        assert!(!gone.is_pausable());
        assert!(!gone.is_resumable());
        assert!(!gone.is_resynchronizing());
    }

    #[test]
    fn test_mirror_state_reflects_retirement() {
        let mut m = mirror("m1", "v1", "s1", SyncState::Fractured);
        assert_eq!(m.state(), MirrorState::Fractured);
        m.retired = Some(MirrorRetirement::Promoted);
        assert_eq!(m.state(), MirrorState::Promoted);
        assert!(m.state().is_terminal());
    }

    #[test]
    fn test_direction_flip() {
        let d = ReplicationDirection::SourceToTarget;
        assert_eq!(d.flipped(), ReplicationDirection::TargetToSource);
        assert_eq!(d.flipped().flipped(), d);
    }

    #[test]
    fn test_entity_round_trip_through_tag() {
        let v = volume("v1", "s1");
        let entity = v.clone().into_entity();
        assert_eq!(entity.kind(), EntityKind::Volume);
        assert_eq!(entity.id(), "v1");
        assert_eq!(Volume::from_entity(entity.clone()), Some(v));
        assert_eq!(Mirror::from_entity(entity), None);
    }

    #[test]
    fn test_system_type_parse() {
        assert_eq!("VMAX".parse::<SystemType>(), Ok(SystemType::Vmax));
        assert_eq!("vnx".parse::<SystemType>(), Ok(SystemType::VnxBlock));
        assert!("netapp".parse::<SystemType>().is_err());
    }

    #[test]
    fn test_new_id_uses_kind_prefix() {
        let id = EntityKind::Volume.new_id();
        assert!(id.starts_with("vol-"));
        assert_ne!(id, EntityKind::Volume.new_id());
    }
}
