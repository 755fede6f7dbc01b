//! Mirror Lifecycle Orchestrator
//!
//! Attach, detach, pause, resume, group relation and deactivate for block
//! continuous copies. Each operation validates against the topology, records
//! its tasks, and issues exactly one gateway call (or none, for no-ops and
//! rejections).
//!
//! Volumes in a consistency group never act alone: their mirrors are resolved
//! to every active sibling sharing the same device-side replication group
//! instance, and the whole set is dispatched under one representative task on
//! the invoking source volume.

use crate::controlplane::tasks::{OperationOutcome, SpeculativeEntity, TaskTracker};
use crate::domain::model::{
    EntityId, EntityKind, Mirror, OperationType, StorageSystem, SyncState, TaskList, TaskState,
    VirtualPool, Volume,
};
use crate::domain::ports::{Constraint, DeviceGatewayRef, DeviceResult, GatewayOperation, Repository};
use crate::error::{Error, Result, ValidationError};
use crate::metrics::ControlPlaneMetrics;
use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use tracing::{debug, error, info, warn};

// =============================================================================
// Capabilities & Requests
// =============================================================================

/// What a storage-system family can do with continuous copies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MirrorCapabilities {
    /// Continuous copies may be attached to consistency-group volumes
    pub supports_cg_mirrors: bool,
}

/// Attach new continuous copies to a volume
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub source: EntityId,
    /// Label of the new copy, suffixed `-1`, `-2`, … when several are prepared
    pub name: String,
    pub count: u32,
    pub op_id: String,
}

/// Detach or resume continuous copies of a volume
///
/// `mirrors: None` targets every active copy of the source.
#[derive(Debug, Clone)]
pub struct MirrorRequest {
    pub source: EntityId,
    pub mirrors: Option<Vec<EntityId>>,
    pub op_id: String,
}

/// Fracture continuous copies of a volume
#[derive(Debug, Clone)]
pub struct PauseRequest {
    pub source: EntityId,
    pub mirrors: Option<Vec<EntityId>>,
    /// Split synchronously on the device
    pub sync: bool,
    pub op_id: String,
}

/// Operation on one named copy of a volume (establish, deactivate)
#[derive(Debug, Clone)]
pub struct SingleMirrorRequest {
    pub source: EntityId,
    pub mirror: EntityId,
    pub op_id: String,
}

// =============================================================================
// Attach Planning
// =============================================================================

/// Placement chosen for one prepared mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRecommendation {
    pub source: EntityId,
    pub storage_system: EntityId,
    pub storage_pool: Option<EntityId>,
    pub virtual_pool: EntityId,
}

/// Recommendations and the mirrors prepared from them, index-aligned
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachPlan {
    pub recommendations: Vec<MirrorRecommendation>,
    pub prepared: Vec<Mirror>,
}

impl AttachPlan {
    pub fn mirror_ids(&self) -> Vec<EntityId> {
        self.prepared.iter().map(|m| m.id.clone()).collect()
    }

    /// Prepared mirror ids belonging to one source
    pub fn mirrors_of(&self, source: &str) -> Vec<EntityId> {
        self.prepared
            .iter()
            .filter(|m| m.source == source)
            .map(|m| m.id.clone())
            .collect()
    }
}

/// Plan `count` new mirrors for each source volume
///
/// Mirrors land in the source's storage pool and in the virtual pool the
/// source's pool designates for copies, falling back to the source's own
/// virtual pool.
pub fn plan_attach(
    sources: &[Volume],
    pools: &HashMap<EntityId, VirtualPool>,
    name: &str,
    count: u32,
) -> AttachPlan {
    let total = sources.len() * count as usize;
    let mut plan = AttachPlan::default();
    let mut ordinal = 0;

    for source in sources {
        let virtual_pool = pools
            .get(&source.virtual_pool)
            .and_then(|pool| pool.mirror_virtual_pool.clone())
            .unwrap_or_else(|| source.virtual_pool.clone());
        let recommendation = MirrorRecommendation {
            source: source.id.clone(),
            storage_system: source.storage_system.clone(),
            storage_pool: source.storage_pool.clone(),
            virtual_pool,
        };

        for _ in 0..count {
            ordinal += 1;
            let label = if total == 1 {
                name.to_string()
            } else {
                format!("{}-{}", name, ordinal)
            };
            plan.prepared.push(Mirror {
                id: EntityKind::Mirror.new_id(),
                label,
                project: source.project.clone(),
                tenant: source.tenant.clone(),
                source: source.id.clone(),
                storage_system: recommendation.storage_system.clone(),
                virtual_pool: Some(recommendation.virtual_pool.clone()),
                storage_pool: recommendation.storage_pool.clone(),
                capacity_bytes: source.capacity_bytes,
                sync_state: SyncState::Synchronized,
                replication_group_instance: None,
                inactive: false,
                retired: None,
            });
            plan.recommendations.push(recommendation.clone());
        }
    }

    plan
}

// =============================================================================
// Group Helpers
// =============================================================================

/// Active siblings keyed by mirror id, valued by their source volume
pub fn group_mirror_source_map(siblings: &[Mirror]) -> IndexMap<EntityId, EntityId> {
    siblings
        .iter()
        .filter(|m| !m.inactive)
        .map(|m| (m.id.clone(), m.source.clone()))
        .collect()
}

/// True when the source is an SRDF consistency-group member and at least one
/// other active mirror of the same replication group remains besides `mirror`
pub fn check_if_not_last_srdf_cg_mirror(mirror: &Mirror, source: &Volume, siblings: &[Mirror]) -> bool {
    if !source.is_in_cg() || !source.srdf {
        return false;
    }
    let Some(instance) = mirror.replication_group_instance.as_deref() else {
        return false;
    };
    siblings.iter().any(|s| {
        s.id != mirror.id && !s.inactive && s.replication_group_instance.as_deref() == Some(instance)
    })
}

fn foreign_mirror(source: &Volume, mirrors: &[Mirror]) -> Option<ValidationError> {
    mirrors
        .iter()
        .find(|m| m.source != source.id)
        .map(|m| ValidationError::MirrorNotOfSource {
            mirror: m.id.clone(),
            source_volume: source.id.clone(),
        })
}

/// Independent volume a detached mirror is promoted into
fn promoted_volume(source: &Volume, mirror: &Mirror) -> Volume {
    Volume {
        id: EntityKind::Volume.new_id(),
        label: mirror.label.clone(),
        project: mirror.project.clone(),
        tenant: mirror.tenant.clone(),
        virtual_pool: mirror
            .virtual_pool
            .clone()
            .unwrap_or_else(|| source.virtual_pool.clone()),
        virtual_array: source.virtual_array.clone(),
        storage_system: mirror.storage_system.clone(),
        storage_pool: mirror.storage_pool.clone(),
        capacity_bytes: mirror.capacity_bytes,
        consistency_group: None,
        mirrors: BTreeSet::new(),
        srdf: false,
        inactive: false,
        promoted_from: None,
    }
}

// =============================================================================
// Mirror Orchestrator Trait
// =============================================================================

/// Continuous-copy lifecycle for one storage-system family
#[async_trait]
pub trait MirrorOrchestrator: Send + Sync {
    /// Orchestrator name
    fn name(&self) -> &str;

    fn capabilities(&self) -> MirrorCapabilities;

    async fn attach(&self, system: &StorageSystem, request: &AttachRequest)
        -> Result<OperationOutcome>;

    async fn detach(&self, system: &StorageSystem, request: &MirrorRequest)
        -> Result<OperationOutcome>;

    async fn pause(&self, system: &StorageSystem, request: &PauseRequest)
        -> Result<OperationOutcome>;

    async fn resume(&self, system: &StorageSystem, request: &MirrorRequest)
        -> Result<OperationOutcome>;

    async fn establish_group_relation(
        &self,
        system: &StorageSystem,
        request: &SingleMirrorRequest,
    ) -> Result<OperationOutcome>;

    async fn deactivate(
        &self,
        system: &StorageSystem,
        request: &SingleMirrorRequest,
    ) -> Result<OperationOutcome>;
}

// =============================================================================
// Block Mirror Orchestrator
// =============================================================================

/// Block continuous-copy orchestrator, parameterized by capabilities
pub struct BlockMirrorOrchestrator {
    name: String,
    capabilities: MirrorCapabilities,
    repo: Repository,
    tracker: TaskTracker,
    gateway: DeviceGatewayRef,
    metrics: ControlPlaneMetrics,
}

impl BlockMirrorOrchestrator {
    pub fn new(
        name: impl Into<String>,
        capabilities: MirrorCapabilities,
        repo: Repository,
        gateway: DeviceGatewayRef,
        metrics: ControlPlaneMetrics,
    ) -> Self {
        let tracker = TaskTracker::new(repo.clone(), metrics.clone());
        Self {
            name: name.into(),
            capabilities,
            repo,
            tracker,
            gateway,
            metrics,
        }
    }

    fn reject(&self, operation: GatewayOperation, error: ValidationError) -> Result<OperationOutcome> {
        warn!("{} rejected: {}", operation, error);
        self.metrics.record_rejection(operation.as_str());
        Ok(OperationOutcome::Rejected(error))
    }

    /// Undo an invocation whose preparation failed before dispatch
    ///
    /// Speculative entities are rolled back and every task already created is
    /// errored, then `cause` is handed back for propagation.
    async fn abandon(
        &self,
        operation: GatewayOperation,
        tasks: &TaskList,
        speculative: &[SpeculativeEntity],
        cause: Error,
    ) -> Error {
        error!("{} abandoned before dispatch: {}", operation, cause);
        if let Err(e) = self.tracker.rollback(speculative).await {
            warn!("Rollback after abandoned {} incomplete: {}", operation, e);
        }
        let message = format!("{} abandoned before dispatch: {}", operation, cause);
        for task in tasks.iter() {
            if let Err(e) = self
                .tracker
                .complete_task(&task.key, TaskState::Error, Some(message.clone()))
                .await
            {
                warn!("Task {} left pending: {}", task.key, e);
            }
        }
        cause
    }

    async fn no_op(
        &self,
        operation: GatewayOperation,
        source: &Volume,
        op_id: &str,
        operation_type: OperationType,
        message: &str,
        associated: Vec<EntityId>,
    ) -> Result<OperationOutcome> {
        let task = self
            .tracker
            .record_no_op(EntityKind::Volume, &source.id, op_id, operation_type, message, associated)
            .await?;
        self.metrics.record_no_op(operation.as_str());
        Ok(OperationOutcome::NoOp(task))
    }

    async fn dispatch<F>(
        &self,
        operation: GatewayOperation,
        failure_context: String,
        tasks: TaskList,
        speculative: &[SpeculativeEntity],
        call: F,
    ) -> Result<OperationOutcome>
    where
        F: Future<Output = DeviceResult> + Send,
    {
        let settled = self
            .tracker
            .dispatch(operation.as_str(), failure_context, tasks, speculative, call)
            .await?;
        Ok(OperationOutcome::Dispatched(settled))
    }

    /// Mirrors named by a request, or every active mirror of the source
    ///
    /// Named ids are de-duplicated, keeping first-seen order.
    async fn candidate_mirrors(
        &self,
        source: &Volume,
        explicit: Option<&[EntityId]>,
    ) -> Result<Vec<Mirror>> {
        match explicit {
            Some(ids) => {
                let unique: IndexSet<&EntityId> = ids.iter().collect();
                let mut mirrors = Vec::with_capacity(unique.len());
                for id in unique {
                    mirrors.push(self.repo.require::<Mirror>(id).await?);
                }
                Ok(mirrors)
            }
            None => {
                let ids: Vec<EntityId> = source.mirrors.iter().cloned().collect();
                Ok(self
                    .repo
                    .get_many::<Mirror>(&ids)
                    .await?
                    .into_iter()
                    .filter(|m| !m.inactive)
                    .collect())
            }
        }
    }

    /// Active mirrors sharing the representative's replication group instance
    async fn siblings(&self, representative: &Mirror) -> Result<Vec<Mirror>> {
        let Some(instance) = representative.replication_group_instance.clone() else {
            return Ok(vec![representative.clone()]);
        };
        let siblings: Vec<Mirror> = self
            .repo
            .query_entities::<Mirror>(&Constraint::MirrorsByReplicationGroupInstance(instance))
            .await?
            .into_iter()
            .filter(|m| !m.inactive)
            .collect();
        debug!(
            "Mirror {} has {} active siblings",
            representative.id,
            siblings.len()
        );
        Ok(siblings)
    }

    /// Volumes of a consistency group that receive new mirrors
    ///
    /// Members without any mirror yet were newly added to the group and are
    /// the only ones protected; if every member already has one, all members
    /// get another.
    async fn consistency_group_targets(&self, source: &Volume, cg: &str) -> Result<Vec<Volume>> {
        let members: Vec<Volume> = self
            .repo
            .query_entities::<Volume>(&Constraint::VolumesInConsistencyGroup(cg.to_string()))
            .await?
            .into_iter()
            .filter(|v| !v.inactive)
            .collect();
        if members.is_empty() {
            return Ok(vec![source.clone()]);
        }

        let newly_added: Vec<Volume> = members.iter().filter(|v| !v.has_mirrors()).cloned().collect();
        if newly_added.is_empty() {
            Ok(members)
        } else {
            info!(
                "Consistency group {}: {} newly added volumes need continuous copies",
                cg,
                newly_added.len()
            );
            Ok(newly_added)
        }
    }

    async fn virtual_pools(&self, volumes: &[Volume]) -> Result<HashMap<EntityId, VirtualPool>> {
        let mut pools = HashMap::new();
        for volume in volumes {
            if pools.contains_key(&volume.virtual_pool) {
                continue;
            }
            if let Some(pool) = self.repo.get::<VirtualPool>(&volume.virtual_pool).await? {
                pools.insert(pool.id.clone(), pool);
            }
        }
        Ok(pools)
    }

    async fn pause_group(
        &self,
        system: &StorageSystem,
        source: &Volume,
        request: &PauseRequest,
        candidates: Vec<Mirror>,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::Pause;
        let had_candidates = !candidates.is_empty();
        let representative = if request.mirrors.is_some() {
            candidates.into_iter().next()
        } else {
            candidates.into_iter().find(|m| m.is_pausable())
        };

        let Some(representative) = representative else {
            let message = if had_candidates {
                "The continuous copies are already paused"
            } else {
                "No continuous copy can be paused"
            };
            return self
                .no_op(op, source, &request.op_id, OperationType::FractureVolumeMirror, message, vec![])
                .await;
        };
        if representative.inactive {
            return self.reject(
                op,
                ValidationError::CannotPause {
                    mirror: representative.id.clone(),
                    state: representative.sync_state,
                    source_volume: source.id.clone(),
                },
            );
        }

        let siblings = self.siblings(&representative).await?;
        if let Some(busy) = siblings.iter().find(|m| m.is_resynchronizing()) {
            return self.reject(
                op,
                ValidationError::CannotPauseWhileResynchronizing {
                    mirror: busy.id.clone(),
                    state: busy.sync_state,
                    source_volume: busy.source.clone(),
                },
            );
        }

        let ids: Vec<EntityId> = group_mirror_source_map(&siblings).into_keys().collect();
        if siblings.iter().all(|m| m.sync_state == SyncState::Fractured) {
            return self
                .no_op(
                    op,
                    source,
                    &request.op_id,
                    OperationType::FractureVolumeMirror,
                    "The continuous copies are already paused",
                    ids,
                )
                .await;
        }

        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::FractureVolumeMirror,
                ids.clone(),
            )
            .await?;
        self.dispatch(
            op,
            format!("Failed to pause continuous copies of consistency group volume {}", source.id),
            TaskList::from(vec![task]),
            &[],
            self.gateway.pause(&system.id, &ids, request.sync, &request.op_id),
        )
        .await
    }

    async fn resume_group(
        &self,
        system: &StorageSystem,
        source: &Volume,
        request: &MirrorRequest,
        candidates: Vec<Mirror>,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::Resume;
        let any_resuming = candidates.iter().any(|m| m.is_resynchronizing());
        let first = candidates.first().cloned();
        let representative = if request.mirrors.is_some() {
            candidates.into_iter().next()
        } else {
            candidates.into_iter().find(|m| m.is_resumable())
        };

        let Some(representative) = representative else {
            if any_resuming {
                return self
                    .no_op(
                        op,
                        source,
                        &request.op_id,
                        OperationType::ResumeVolumeMirror,
                        "The continuous copies are already resuming",
                        vec![],
                    )
                    .await;
            }
            return match first {
                Some(mirror) => self.reject(
                    op,
                    ValidationError::CannotResume {
                        mirror: mirror.id.clone(),
                        state: mirror.sync_state,
                        source_volume: source.id.clone(),
                    },
                ),
                None => {
                    self.no_op(
                        op,
                        source,
                        &request.op_id,
                        OperationType::ResumeVolumeMirror,
                        "No continuous copy can be resumed",
                        vec![],
                    )
                    .await
                }
            };
        };
        if representative.inactive {
            return self.reject(
                op,
                ValidationError::CannotResume {
                    mirror: representative.id.clone(),
                    state: representative.sync_state,
                    source_volume: source.id.clone(),
                },
            );
        }

        let siblings = self.siblings(&representative).await?;
        let ids: Vec<EntityId> = group_mirror_source_map(&siblings).into_keys().collect();
        if !siblings.iter().any(|m| m.is_resumable()) {
            if !siblings.iter().any(|m| m.is_resynchronizing()) {
                return self.reject(
                    op,
                    ValidationError::CannotResume {
                        mirror: representative.id.clone(),
                        state: representative.sync_state,
                        source_volume: source.id.clone(),
                    },
                );
            }
            return self
                .no_op(
                    op,
                    source,
                    &request.op_id,
                    OperationType::ResumeVolumeMirror,
                    "The continuous copies are already resuming",
                    ids,
                )
                .await;
        }

        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::ResumeVolumeMirror,
                ids.clone(),
            )
            .await?;
        self.dispatch(
            op,
            format!("Failed to resume continuous copies of consistency group volume {}", source.id),
            TaskList::from(vec![task]),
            &[],
            self.gateway.resume(&system.id, &ids, &request.op_id),
        )
        .await
    }
}

#[async_trait]
impl MirrorOrchestrator for BlockMirrorOrchestrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> MirrorCapabilities {
        self.capabilities
    }

    async fn attach(
        &self,
        system: &StorageSystem,
        request: &AttachRequest,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::Attach;
        let source = self.repo.require::<Volume>(&request.source).await?;
        info!(
            "Attaching {} continuous copies to volume {} (op {})",
            request.count, source.id, request.op_id
        );

        if request.count == 0 {
            return self.reject(op, ValidationError::InvalidMirrorCount);
        }

        let targets = match source.consistency_group.as_deref() {
            Some(cg) => {
                if request.count > 1 {
                    return self.reject(
                        op,
                        ValidationError::InvalidMirrorCountForConsistencyGroup {
                            requested: request.count,
                        },
                    );
                }
                if !self.capabilities.supports_cg_mirrors {
                    return self.reject(
                        op,
                        ValidationError::ConsistencyGroupMirrorsUnsupported {
                            volume: source.id.clone(),
                            consistency_group: cg.to_string(),
                            system_type: system.system_type.to_string(),
                        },
                    );
                }
                self.consistency_group_targets(&source, cg).await?
            }
            None => vec![source.clone()],
        };

        let pools = self.virtual_pools(&targets).await?;
        let plan = plan_attach(&targets, &pools, &request.name, request.count);
        debug!(
            "Attach plan for volume {}: {} mirrors across {} volumes",
            source.id,
            plan.prepared.len(),
            targets.len()
        );

        let mut speculative = Vec::with_capacity(plan.prepared.len());
        let mut tasks = TaskList::new();
        let prepared = async {
            for mirror in &plan.prepared {
                self.repo.create(mirror.clone()).await?;
                speculative.push(SpeculativeEntity::PreparedMirror {
                    mirror: mirror.id.clone(),
                    source: mirror.source.clone(),
                });
            }
            for target in &targets {
                let added = plan.mirrors_of(&target.id);
                if added.is_empty() {
                    continue;
                }
                let mut volume = self.repo.require::<Volume>(&target.id).await?;
                volume.mirrors.extend(added);
                self.repo.update(volume).await?;
            }
            for mirror in &plan.prepared {
                tasks.push(
                    self.tracker
                        .create_task(
                            EntityKind::Mirror,
                            &mirror.id,
                            &request.op_id,
                            OperationType::AttachBlockMirror,
                            vec![mirror.source.clone()],
                        )
                        .await?,
                );
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(cause) = prepared {
            return Err(self.abandon(op, &tasks, &speculative, cause).await);
        }

        let mirror_ids = plan.mirror_ids();
        self.dispatch(
            op,
            format!("Failed to attach continuous copies to volume {}", source.id),
            tasks,
            &speculative,
            self.gateway.attach(&system.id, &source.id, &mirror_ids, &request.op_id),
        )
        .await
    }

    async fn detach(
        &self,
        system: &StorageSystem,
        request: &MirrorRequest,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::Detach;
        let source = self.repo.require::<Volume>(&request.source).await?;
        info!(
            "Detaching continuous copies of volume {} (op {})",
            source.id, request.op_id
        );

        let candidates = self
            .candidate_mirrors(&source, request.mirrors.as_deref())
            .await?;
        if let Some(error) = foreign_mirror(&source, &candidates) {
            return self.reject(op, error);
        }

        let targets: Vec<Mirror> = if source.is_in_cg() {
            match candidates.into_iter().find(|m| !m.inactive) {
                Some(representative) => self.siblings(&representative).await?,
                None => Vec::new(),
            }
        } else {
            candidates.into_iter().filter(|m| !m.inactive).collect()
        };

        if targets.is_empty() {
            return self
                .no_op(
                    op,
                    &source,
                    &request.op_id,
                    OperationType::DetachBlockMirror,
                    "No continuous copy can be detached",
                    vec![],
                )
                .await;
        }

        let mirror_ids: Vec<EntityId> = targets.iter().map(|m| m.id.clone()).collect();
        let mut tasks = TaskList::new();
        let mut promoted_ids = Vec::with_capacity(targets.len());
        let mut speculative = Vec::with_capacity(targets.len());

        let prepared = async {
            for mirror in &targets {
                let promoted = promoted_volume(&source, mirror);
                let promoted_id = promoted.id.clone();
                self.repo.create(promoted).await?;
                speculative.push(SpeculativeEntity::PromotedVolume(promoted_id.clone()));
                tasks.push(
                    self.tracker
                        .create_task(
                            EntityKind::Volume,
                            &promoted_id,
                            &request.op_id,
                            OperationType::PromoteCopyToVolume,
                            vec![mirror.id.clone()],
                        )
                        .await?,
                );
                promoted_ids.push(promoted_id);
            }
            tasks.push(
                self.tracker
                    .create_task(
                        EntityKind::Volume,
                        &source.id,
                        &request.op_id,
                        OperationType::DetachBlockMirror,
                        mirror_ids.clone(),
                    )
                    .await?,
            );
            Ok::<(), Error>(())
        }
        .await;
        if let Err(cause) = prepared {
            return Err(self.abandon(op, &tasks, &speculative, cause).await);
        }

        self.dispatch(
            op,
            format!("Failed to detach continuous copies of volume {}", source.id),
            tasks,
            &speculative,
            self.gateway
                .detach(&system.id, &mirror_ids, &promoted_ids, &request.op_id),
        )
        .await
    }

    async fn pause(&self, system: &StorageSystem, request: &PauseRequest) -> Result<OperationOutcome> {
        let op = GatewayOperation::Pause;
        let source = self.repo.require::<Volume>(&request.source).await?;
        info!(
            "Pausing continuous copies of volume {} (op {})",
            source.id, request.op_id
        );

        let candidates = self
            .candidate_mirrors(&source, request.mirrors.as_deref())
            .await?;
        if let Some(error) = foreign_mirror(&source, &candidates) {
            return self.reject(op, error);
        }
        if source.is_in_cg() {
            return self.pause_group(system, &source, request, candidates).await;
        }

        let mut already_paused = Vec::new();
        let mut to_pause = Vec::new();
        for mirror in &candidates {
            if mirror.inactive {
                return self.reject(
                    op,
                    ValidationError::CannotPause {
                        mirror: mirror.id.clone(),
                        state: mirror.sync_state,
                        source_volume: source.id.clone(),
                    },
                );
            }
            match mirror.sync_state {
                SyncState::Fractured => already_paused.push(mirror.id.clone()),
                SyncState::Resynchronizing => {
                    return self.reject(
                        op,
                        ValidationError::CannotPauseWhileResynchronizing {
                            mirror: mirror.id.clone(),
                            state: mirror.sync_state,
                            source_volume: source.id.clone(),
                        },
                    );
                }
                SyncState::Synchronized => to_pause.push(mirror.id.clone()),
            }
        }

        if to_pause.is_empty() {
            let message = if already_paused.is_empty() {
                "No continuous copy can be paused"
            } else {
                "The continuous copies are already paused"
            };
            return self
                .no_op(
                    op,
                    &source,
                    &request.op_id,
                    OperationType::FractureVolumeMirror,
                    message,
                    already_paused,
                )
                .await;
        }

        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::FractureVolumeMirror,
                to_pause.clone(),
            )
            .await?;
        self.dispatch(
            op,
            format!("Failed to pause continuous copies of volume {}", source.id),
            TaskList::from(vec![task]),
            &[],
            self.gateway
                .pause(&system.id, &to_pause, request.sync, &request.op_id),
        )
        .await
    }

    async fn resume(&self, system: &StorageSystem, request: &MirrorRequest) -> Result<OperationOutcome> {
        let op = GatewayOperation::Resume;
        let source = self.repo.require::<Volume>(&request.source).await?;
        info!(
            "Resuming continuous copies of volume {} (op {})",
            source.id, request.op_id
        );

        let candidates = self
            .candidate_mirrors(&source, request.mirrors.as_deref())
            .await?;
        if let Some(error) = foreign_mirror(&source, &candidates) {
            return self.reject(op, error);
        }
        if source.is_in_cg() {
            return self.resume_group(system, &source, request, candidates).await;
        }

        let mut already_resuming = Vec::new();
        let mut to_resume: IndexSet<EntityId> = IndexSet::new();
        for mirror in &candidates {
            let eligible = !mirror.inactive
                && matches!(
                    mirror.sync_state,
                    SyncState::Fractured | SyncState::Resynchronizing
                );
            if !eligible {
                return self.reject(
                    op,
                    ValidationError::CannotResume {
                        mirror: mirror.id.clone(),
                        state: mirror.sync_state,
                        source_volume: source.id.clone(),
                    },
                );
            }
            if mirror.is_resynchronizing() {
                already_resuming.push(mirror.id.clone());
            } else {
                to_resume.insert(mirror.id.clone());
            }
        }

        if to_resume.is_empty() {
            let message = if already_resuming.is_empty() {
                "No continuous copy can be resumed"
            } else {
                "The continuous copies are already resuming"
            };
            return self
                .no_op(
                    op,
                    &source,
                    &request.op_id,
                    OperationType::ResumeVolumeMirror,
                    message,
                    already_resuming,
                )
                .await;
        }

        let ids: Vec<EntityId> = to_resume.into_iter().collect();
        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::ResumeVolumeMirror,
                ids.clone(),
            )
            .await?;
        self.dispatch(
            op,
            format!("Failed to resume continuous copies of volume {}", source.id),
            TaskList::from(vec![task]),
            &[],
            self.gateway.resume(&system.id, &ids, &request.op_id),
        )
        .await
    }

    async fn establish_group_relation(
        &self,
        system: &StorageSystem,
        request: &SingleMirrorRequest,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::EstablishGroupRelation;
        let source = self.repo.require::<Volume>(&request.source).await?;
        let mirror = self.repo.require::<Mirror>(&request.mirror).await?;
        info!(
            "Establishing group relation between volume {} and mirror {} (op {})",
            source.id, mirror.id, request.op_id
        );

        if let Some(error) = foreign_mirror(&source, std::slice::from_ref(&mirror)) {
            return self.reject(op, error);
        }
        if mirror.inactive {
            return self.reject(
                op,
                ValidationError::MirrorInactive {
                    mirror: mirror.id.clone(),
                    source_volume: source.id.clone(),
                },
            );
        }

        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::EstablishVolumeMirror,
                vec![mirror.id.clone()],
            )
            .await?;
        self.dispatch(
            op,
            format!(
                "Failed to establish group relation between volume {} and mirror {}",
                source.id, mirror.id
            ),
            TaskList::from(vec![task]),
            &[],
            self.gateway
                .establish_group_relation(&system.id, &source.id, &mirror.id, &request.op_id),
        )
        .await
    }

    async fn deactivate(
        &self,
        system: &StorageSystem,
        request: &SingleMirrorRequest,
    ) -> Result<OperationOutcome> {
        let op = GatewayOperation::Deactivate;
        let source = self.repo.require::<Volume>(&request.source).await?;
        let mirror = self.repo.require::<Mirror>(&request.mirror).await?;
        info!(
            "Deactivating mirror {} of volume {} (op {})",
            mirror.id, source.id, request.op_id
        );

        if let Some(error) = foreign_mirror(&source, std::slice::from_ref(&mirror)) {
            return self.reject(op, error);
        }
        if mirror.inactive {
            return self
                .no_op(
                    op,
                    &source,
                    &request.op_id,
                    OperationType::DeactivateVolumeMirror,
                    "The continuous copy is already inactive",
                    vec![mirror.id.clone()],
                )
                .await;
        }

        let siblings = if source.is_in_cg() {
            self.siblings(&mirror).await?
        } else {
            vec![mirror.clone()]
        };
        let individual = !source.is_in_cg()
            || (source.srdf && !check_if_not_last_srdf_cg_mirror(&mirror, &source, &siblings));

        let group = if individual {
            IndexMap::new()
        } else {
            group_mirror_source_map(&siblings)
        };
        let ids: Vec<EntityId> = if group.is_empty() {
            vec![mirror.id.clone()]
        } else {
            debug!(
                "Deactivating {} group mirrors across {} source volumes",
                group.len(),
                group.values().collect::<BTreeSet<_>>().len()
            );
            group.into_keys().collect()
        };

        let task = self
            .tracker
            .create_task(
                EntityKind::Volume,
                &source.id,
                &request.op_id,
                OperationType::DeactivateVolumeMirror,
                ids.clone(),
            )
            .await?;
        self.dispatch(
            op,
            format!("Failed to deactivate continuous copies of volume {}", source.id),
            TaskList::from(vec![task]),
            &[],
            self.gateway.deactivate(&system.id, &ids, &request.op_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::SimulatedGateway;
    use crate::domain::model::fixtures::{mirror, volume};
    use crate::domain::model::{SystemType, Task, TaskState};
    use crate::domain::ports::DataStore;
    use crate::store::InMemoryDataStore;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    struct Harness {
        store: Arc<InMemoryDataStore>,
        repo: Repository,
        gateway: Arc<SimulatedGateway>,
        orchestrator: BlockMirrorOrchestrator,
        system: StorageSystem,
    }

    impl Harness {
        fn new(supports_cg_mirrors: bool) -> Self {
            let store = Arc::new(InMemoryDataStore::new());
            let repo = Repository::new(store.clone());
            let gateway = Arc::new(SimulatedGateway::default());
            let orchestrator = BlockMirrorOrchestrator::new(
                "vmax",
                MirrorCapabilities { supports_cg_mirrors },
                repo.clone(),
                gateway.clone(),
                ControlPlaneMetrics::new().unwrap(),
            );
            let system = StorageSystem {
                id: "s1".into(),
                label: "vmax-array".into(),
                system_type: SystemType::Vmax,
                using_smis80: supports_cg_mirrors,
            };
            Self {
                store,
                repo,
                gateway,
                orchestrator,
                system,
            }
        }

        /// Store a source volume with its mirrors linked in
        async fn seed(&self, mut source: Volume, mirrors: Vec<Mirror>) {
            for m in &mirrors {
                source.mirrors.insert(m.id.clone());
            }
            self.repo.update(source).await.unwrap();
            for m in mirrors {
                self.repo.update(m).await.unwrap();
            }
        }

        async fn pause(&self, source: &str, mirrors: Option<Vec<&str>>) -> OperationOutcome {
            let request = PauseRequest {
                source: source.into(),
                mirrors: mirrors.map(|ids| ids.into_iter().map(String::from).collect()),
                sync: true,
                op_id: "op-pause".into(),
            };
            self.orchestrator.pause(&self.system, &request).await.unwrap()
        }

        async fn resume(&self, source: &str, mirrors: Option<Vec<&str>>) -> OperationOutcome {
            let request = MirrorRequest {
                source: source.into(),
                mirrors: mirrors.map(|ids| ids.into_iter().map(String::from).collect()),
                op_id: "op-resume".into(),
            };
            self.orchestrator.resume(&self.system, &request).await.unwrap()
        }

        async fn detach(&self, source: &str) -> OperationOutcome {
            let request = MirrorRequest {
                source: source.into(),
                mirrors: None,
                op_id: "op-detach".into(),
            };
            self.orchestrator.detach(&self.system, &request).await.unwrap()
        }

        async fn attach(&self, source: &str, count: u32) -> OperationOutcome {
            let request = AttachRequest {
                source: source.into(),
                name: "copy".into(),
                count,
                op_id: "op-attach".into(),
            };
            self.orchestrator.attach(&self.system, &request).await.unwrap()
        }

        async fn deactivate(&self, source: &str, mirror: &str, op_id: &str) -> OperationOutcome {
            let request = SingleMirrorRequest {
                source: source.into(),
                mirror: mirror.into(),
                op_id: op_id.into(),
            };
            self.orchestrator.deactivate(&self.system, &request).await.unwrap()
        }
    }

    fn in_cg(mut v: Volume, cg: &str) -> Volume {
        v.consistency_group = Some(cg.to_string());
        v
    }

    fn in_group(mut m: Mirror, instance: &str) -> Mirror {
        m.replication_group_instance = Some(instance.to_string());
        m
    }

    fn dispatched(outcome: OperationOutcome) -> TaskList {
        match outcome {
            OperationOutcome::Dispatched(tasks) => tasks,
            other => panic!("expected a dispatch, got {:?}", other),
        }
    }

    fn no_op(outcome: OperationOutcome) -> Task {
        match outcome {
            OperationOutcome::NoOp(task) => task,
            other => panic!("expected a no-op, got {:?}", other),
        }
    }

    /// Seed three CG volumes v1..v3, each with one mirror in group instance rg-1
    async fn seed_cg_siblings(h: &Harness, states: [SyncState; 3]) {
        for (i, state) in states.into_iter().enumerate() {
            let n = i + 1;
            h.seed(
                in_cg(volume(&format!("v{}", n), "s1"), "cg1"),
                vec![in_group(
                    mirror(&format!("m{}", n), &format!("v{}", n), "s1", state),
                    "rg-1",
                )],
            )
            .await;
        }
    }

    // -------------------------------------------------------------------------
    // Pause
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_pause_rejects_mirror_neither_pausable_nor_resumable() {
        let h = Harness::new(false);
        let mut retired = mirror("m1", "v1", "s1", SyncState::Fractured);
        retired.inactive = true;
        assert!(!retired.is_pausable() && !retired.is_resumable());
        h.seed(volume("v1", "s1"), vec![retired]).await;

        let outcome = h.pause("v1", Some(vec!["m1"])).await;
        assert_matches!(
            outcome,
            OperationOutcome::Rejected(ValidationError::CannotPause { ref mirror, .. }) if mirror == "m1"
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_already_fractured_is_ready_no_op() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Fractured)],
        )
        .await;

        let task = no_op(h.pause("v1", None).await);
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.resource_id(), "v1");
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_rejects_resynchronizing() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Resynchronizing)],
        )
        .await;

        assert_matches!(
            h.pause("v1", None).await,
            OperationOutcome::Rejected(ValidationError::CannotPauseWhileResynchronizing { .. })
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_dispatches_only_synchronized() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![
                mirror("m1", "v1", "s1", SyncState::Synchronized),
                mirror("m2", "v1", "s1", SyncState::Fractured),
            ],
        )
        .await;

        let tasks = dispatched(h.pause("v1", None).await);
        assert_eq!(tasks.len(), 1);
        assert!(tasks.all_in_state(TaskState::Ready));
        assert_eq!(tasks.0[0].associated, vec!["m1".to_string()]);

        let calls = h.gateway.calls_for(GatewayOperation::Pause);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mirrors(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_pause_rejects_foreign_mirror() {
        let h = Harness::new(false);
        h.seed(volume("v1", "s1"), vec![]).await;
        h.seed(
            volume("v2", "s1"),
            vec![mirror("m2", "v2", "s1", SyncState::Synchronized)],
        )
        .await;

        assert_matches!(
            h.pause("v1", Some(vec!["m2"])).await,
            OperationOutcome::Rejected(ValidationError::MirrorNotOfSource { .. })
        );
    }

    #[tokio::test]
    async fn test_pause_cg_siblings_one_task_one_call() {
        let h = Harness::new(true);
        seed_cg_siblings(&h, [SyncState::Synchronized; 3]).await;

        let tasks = dispatched(h.pause("v1", None).await);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.0[0].resource_id(), "v1");

        let calls = h.gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].mirrors(),
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_pause_cg_rejects_resynchronizing_sibling() {
        let h = Harness::new(true);
        seed_cg_siblings(
            &h,
            [
                SyncState::Synchronized,
                SyncState::Resynchronizing,
                SyncState::Synchronized,
            ],
        )
        .await;

        assert_matches!(
            h.pause("v1", None).await,
            OperationOutcome::Rejected(ValidationError::CannotPauseWhileResynchronizing { ref mirror, .. }) if mirror == "m2"
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_pause_cg_all_fractured_is_no_op() {
        let h = Harness::new(true);
        seed_cg_siblings(&h, [SyncState::Fractured; 3]).await;

        let task = no_op(h.pause("v2", None).await);
        assert_eq!(task.message.as_deref(), Some("The continuous copies are already paused"));
        assert_eq!(h.gateway.call_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Resume
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_resume_dispatches_fractured_once() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![
                mirror("m1", "v1", "s1", SyncState::Fractured),
                mirror("m2", "v1", "s1", SyncState::Resynchronizing),
            ],
        )
        .await;

        let tasks = dispatched(h.resume("v1", Some(vec!["m1", "m2", "m1"])).await);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.0[0].associated, vec!["m1".to_string()]);
        assert_eq!(h.gateway.calls()[0].mirrors(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_resume_rejects_synchronized() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Synchronized)],
        )
        .await;

        assert_matches!(
            h.resume("v1", None).await,
            OperationOutcome::Rejected(ValidationError::CannotResume { state: SyncState::Synchronized, .. })
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_all_resynchronizing_is_no_op() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Resynchronizing)],
        )
        .await;

        let task = no_op(h.resume("v1", None).await);
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_cg_dispatches_every_sibling() {
        let h = Harness::new(true);
        seed_cg_siblings(&h, [SyncState::Fractured; 3]).await;

        let tasks = dispatched(h.resume("v3", None).await);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.0[0].associated.len(), 3);
        assert_eq!(h.gateway.calls_for(GatewayOperation::Resume).len(), 1);
    }

    #[tokio::test]
    async fn test_resume_cg_rejects_synchronized_siblings() {
        let h = Harness::new(true);
        seed_cg_siblings(&h, [SyncState::Synchronized; 3]).await;

        let outcome = h.resume("v1", Some(vec!["m1"])).await;
        assert_eq!(
            outcome.rejection(),
            Some(&ValidationError::CannotResume {
                mirror: "m1".into(),
                state: SyncState::Synchronized,
                source_volume: "v1".into(),
            })
        );

        let outcome = h.resume("v1", None).await;
        assert_matches!(
            outcome.rejection(),
            Some(ValidationError::CannotResume { .. })
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_cg_resynchronizing_sibling_is_no_op() {
        let h = Harness::new(true);
        seed_cg_siblings(
            &h,
            [
                SyncState::Synchronized,
                SyncState::Resynchronizing,
                SyncState::Synchronized,
            ],
        )
        .await;

        let task = no_op(h.resume("v1", Some(vec!["m1"])).await);
        assert_eq!(
            task.message.as_deref(),
            Some("The continuous copies are already resuming")
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Attach
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_attach_cg_only_newly_added_member() {
        let h = Harness::new(true);
        h.seed(in_cg(volume("v1", "s1"), "cg1"), vec![]).await;
        h.seed(
            in_cg(volume("v2", "s1"), "cg1"),
            vec![mirror("m2", "v2", "s1", SyncState::Synchronized)],
        )
        .await;
        h.seed(
            in_cg(volume("v3", "s1"), "cg1"),
            vec![mirror("m3", "v3", "s1", SyncState::Synchronized)],
        )
        .await;

        let tasks = dispatched(h.attach("v2", 1).await);
        assert_eq!(tasks.len(), 1);
        let task = &tasks.0[0];
        assert_eq!(task.key.kind, EntityKind::Mirror);
        assert_eq!(task.associated, vec!["v1".to_string()]);

        let prepared = h.repo.require::<Mirror>(task.resource_id()).await.unwrap();
        assert_eq!(prepared.source, "v1");
        assert_eq!(prepared.label, "copy");
        assert!(h
            .repo
            .require::<Volume>("v1")
            .await
            .unwrap()
            .mirrors
            .contains(&prepared.id));
        assert_eq!(h.repo.require::<Volume>("v2").await.unwrap().mirrors.len(), 1);

        let calls = h.gateway.calls_for(GatewayOperation::Attach);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mirrors(), vec![prepared.id]);
    }

    #[tokio::test]
    async fn test_attach_cg_fans_out_when_every_member_is_protected() {
        let h = Harness::new(true);
        h.seed(
            in_cg(volume("v1", "s1"), "cg1"),
            vec![mirror("m1", "v1", "s1", SyncState::Synchronized)],
        )
        .await;
        h.seed(
            in_cg(volume("v2", "s1"), "cg1"),
            vec![mirror("m2", "v2", "s1", SyncState::Synchronized)],
        )
        .await;

        let tasks = dispatched(h.attach("v1", 1).await);
        assert_eq!(tasks.len(), 2);
        assert_eq!(h.gateway.calls()[0].mirrors().len(), 2);
    }

    #[tokio::test]
    async fn test_attach_cg_validation() {
        let h = Harness::new(true);
        h.seed(in_cg(volume("v1", "s1"), "cg1"), vec![]).await;
        assert_matches!(
            h.attach("v1", 2).await,
            OperationOutcome::Rejected(ValidationError::InvalidMirrorCountForConsistencyGroup { requested: 2 })
        );

        let unsupported = Harness::new(false);
        unsupported.seed(in_cg(volume("v1", "s1"), "cg1"), vec![]).await;
        assert_matches!(
            unsupported.attach("v1", 1).await,
            OperationOutcome::Rejected(ValidationError::ConsistencyGroupMirrorsUnsupported { .. })
        );
        assert_eq!(h.gateway.call_count() + unsupported.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_attach_rejects_zero_count() {
        let h = Harness::new(false);
        h.seed(volume("v1", "s1"), vec![]).await;
        assert_matches!(
            h.attach("v1", 0).await,
            OperationOutcome::Rejected(ValidationError::InvalidMirrorCount)
        );
    }

    #[tokio::test]
    async fn test_attach_failure_rolls_back_prepared_mirrors() {
        let h = Harness::new(false);
        h.seed(volume("v1", "s1"), vec![]).await;
        h.gateway.fail(GatewayOperation::Attach, "pool exhausted");

        let tasks = dispatched(h.attach("v1", 2).await);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.all_in_state(TaskState::Error));
        for task in tasks.iter() {
            assert!(task.message.as_deref().unwrap().contains("pool exhausted"));
            let prepared = h.repo.require::<Mirror>(task.resource_id()).await.unwrap();
            assert!(prepared.inactive);
        }
        assert!(h.repo.require::<Volume>("v1").await.unwrap().mirrors.is_empty());
    }

    #[test]
    fn test_plan_attach_placement_and_labels() {
        let mut pools = HashMap::new();
        pools.insert(
            "vpool-gold".to_string(),
            VirtualPool {
                id: "vpool-gold".into(),
                label: "gold".into(),
                mirror_virtual_pool: Some("vpool-copies".into()),
            },
        );
        let mut bronze = volume("v2", "s1");
        bronze.virtual_pool = "vpool-bronze".into();

        let plan = plan_attach(&[volume("v1", "s1"), bronze], &pools, "copy", 1);
        assert_eq!(plan.prepared.len(), 2);
        assert_eq!(plan.recommendations.len(), 2);
        assert_eq!(plan.recommendations[0].virtual_pool, "vpool-copies");
        assert_eq!(plan.recommendations[1].virtual_pool, "vpool-bronze");
        assert_eq!(plan.recommendations[0].storage_pool.as_deref(), Some("pool-1"));
        assert_eq!(plan.prepared[0].label, "copy-1");
        assert_eq!(plan.prepared[1].label, "copy-2");
        assert_eq!(plan.mirrors_of("v2"), vec![plan.prepared[1].id.clone()]);

        let single = plan_attach(&[volume("v1", "s1")], &pools, "copy", 1);
        assert_eq!(single.prepared[0].label, "copy");
        assert_eq!(single.prepared[0].sync_state, SyncState::Synchronized);
    }

    // -------------------------------------------------------------------------
    // Detach
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_detach_failure_rolls_back_promoted_volumes() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![
                mirror("m1", "v1", "s1", SyncState::Synchronized),
                mirror("m2", "v1", "s1", SyncState::Fractured),
            ],
        )
        .await;
        h.gateway.fail(GatewayOperation::Detach, "array unreachable");

        let tasks = dispatched(h.detach("v1").await);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.all_in_state(TaskState::Error));

        let mut promoted = 0;
        for task in tasks.iter() {
            assert!(task.message.as_deref().unwrap().contains("array unreachable"));
            if task.operation == OperationType::PromoteCopyToVolume {
                let volume = h.repo.require::<Volume>(task.resource_id()).await.unwrap();
                assert!(volume.inactive);
                promoted += 1;
            }
        }
        assert_eq!(promoted, 2);
        assert!(!h.repo.require::<Mirror>("m1").await.unwrap().inactive);
    }

    #[tokio::test]
    async fn test_detach_abandoned_when_task_write_fails() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Synchronized)],
        )
        .await;
        dispatched(h.detach("v1").await);

        // The source task of op-detach is already settled
        let request = MirrorRequest {
            source: "v1".into(),
            mirrors: None,
            op_id: "op-detach".into(),
        };
        let result = h.orchestrator.detach(&h.system, &request).await;
        assert_matches!(result, Err(Error::TaskAlreadyTerminal { .. }));

        assert!(h.store.tasks(Some(TaskState::Pending)).await.unwrap().is_empty());
        let errored = h.store.tasks(Some(TaskState::Error)).await.unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].operation, OperationType::PromoteCopyToVolume);
        let promoted = h.repo.require::<Volume>(errored[0].resource_id()).await.unwrap();
        assert!(promoted.inactive);
        assert_eq!(h.gateway.calls_for(GatewayOperation::Detach).len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_prevents_dispatch() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Synchronized)],
        )
        .await;
        h.store.set_fail_writes(true);

        let pause = PauseRequest {
            source: "v1".into(),
            mirrors: None,
            sync: false,
            op_id: "op-1".into(),
        };
        assert_matches!(
            h.orchestrator.pause(&h.system, &pause).await,
            Err(Error::DataStore(_))
        );
        let attach = AttachRequest {
            source: "v1".into(),
            name: "copy".into(),
            count: 1,
            op_id: "op-2".into(),
        };
        assert_matches!(
            h.orchestrator.attach(&h.system, &attach).await,
            Err(Error::DataStore(_))
        );
        let detach = MirrorRequest {
            source: "v1".into(),
            mirrors: None,
            op_id: "op-3".into(),
        };
        assert_matches!(
            h.orchestrator.detach(&h.system, &detach).await,
            Err(Error::DataStore(_))
        );
        assert_eq!(h.gateway.call_count(), 0);

        h.store.set_fail_writes(false);
        assert!(h.store.tasks(None).await.unwrap().is_empty());
        let source = h.repo.require::<Volume>("v1").await.unwrap();
        assert_eq!(source.mirrors.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_promotes_every_active_mirror() {
        let h = Harness::new(false);
        let mut retired = mirror("m3", "v1", "s1", SyncState::Synchronized);
        retired.inactive = true;
        h.seed(
            volume("v1", "s1"),
            vec![
                mirror("m1", "v1", "s1", SyncState::Synchronized),
                mirror("m2", "v1", "s1", SyncState::Fractured),
                retired,
            ],
        )
        .await;

        let tasks = dispatched(h.detach("v1").await);
        assert_eq!(tasks.len(), 3);
        assert!(tasks.all_in_state(TaskState::Ready));

        let detach = tasks.for_resource("v1").unwrap();
        assert_eq!(detach.operation, OperationType::DetachBlockMirror);
        assert_eq!(detach.associated, vec!["m1".to_string(), "m2".to_string()]);

        for task in tasks.iter().filter(|t| t.operation == OperationType::PromoteCopyToVolume) {
            let volume = h.repo.require::<Volume>(task.resource_id()).await.unwrap();
            let source_mirror = h.repo.require::<Mirror>(&task.associated[0]).await.unwrap();
            assert_eq!(volume.label, source_mirror.label);
            assert_eq!(volume.project, "project-a");
            assert_eq!(volume.tenant, "tenant-a");
            assert!(!volume.inactive);
        }

        match &h.gateway.calls()[0] {
            crate::controlplane::backends::GatewayCall::Detach { promoted, mirrors, .. } => {
                assert_eq!(mirrors.len(), 2);
                assert_eq!(promoted.len(), 2);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_nothing_active_is_no_op() {
        let h = Harness::new(false);
        let mut retired = mirror("m1", "v1", "s1", SyncState::Synchronized);
        retired.inactive = true;
        h.seed(volume("v1", "s1"), vec![retired]).await;

        let task = no_op(h.detach("v1").await);
        assert_eq!(task.message.as_deref(), Some("No continuous copy can be detached"));
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_cg_resolves_siblings() {
        let h = Harness::new(true);
        seed_cg_siblings(&h, [SyncState::Synchronized; 3]).await;

        let tasks = dispatched(h.detach("v2").await);
        // Three promotions plus the representative task
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks.for_resource("v2").unwrap().associated.len(), 3);
        assert_eq!(h.gateway.calls()[0].mirrors().len(), 3);
    }

    // -------------------------------------------------------------------------
    // Establish & Deactivate
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_establish_failure_marks_task_error_without_rollback() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![mirror("m1", "v1", "s1", SyncState::Synchronized)],
        )
        .await;
        h.gateway
            .fail(GatewayOperation::EstablishGroupRelation, "group not found");

        let request = SingleMirrorRequest {
            source: "v1".into(),
            mirror: "m1".into(),
            op_id: "op-establish".into(),
        };
        let outcome = h
            .orchestrator
            .establish_group_relation(&h.system, &request)
            .await
            .unwrap();
        let tasks = dispatched(outcome);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.0[0].state, TaskState::Error);
        assert!(!h.repo.require::<Mirror>("m1").await.unwrap().inactive);
    }

    #[tokio::test]
    async fn test_deactivate_non_cg_is_individual() {
        let h = Harness::new(false);
        h.seed(
            volume("v1", "s1"),
            vec![
                mirror("m1", "v1", "s1", SyncState::Synchronized),
                mirror("m2", "v1", "s1", SyncState::Synchronized),
            ],
        )
        .await;

        dispatched(h.deactivate("v1", "m1", "op-1").await);
        assert_eq!(h.gateway.calls()[0].mirrors(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_deactivate_srdf_group_routing() {
        let h = Harness::new(true);
        for n in 1..=2 {
            let mut v = in_cg(volume(&format!("v{}", n), "s1"), "cg1");
            v.srdf = true;
            h.seed(
                v,
                vec![in_group(
                    mirror(&format!("m{}", n), &format!("v{}", n), "s1", SyncState::Synchronized),
                    "rg-1",
                )],
            )
            .await;
        }

        // Another active sibling remains: group-level dispatch
        let tasks = dispatched(h.deactivate("v1", "m1", "op-1").await);
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            h.gateway.calls()[0].mirrors(),
            vec!["m1".to_string(), "m2".to_string()]
        );

        // Last active member: individual dispatch
        let mut m2 = h.repo.require::<Mirror>("m2").await.unwrap();
        m2.inactive = true;
        h.repo.update(m2).await.unwrap();
        dispatched(h.deactivate("v1", "m1", "op-2").await);
        assert_eq!(h.gateway.calls()[1].mirrors(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_deactivate_inactive_mirror_is_no_op() {
        let h = Harness::new(false);
        let mut retired = mirror("m1", "v1", "s1", SyncState::Synchronized);
        retired.inactive = true;
        h.seed(volume("v1", "s1"), vec![retired]).await;

        no_op(h.deactivate("v1", "m1", "op-1").await);
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[test]
    fn test_check_if_not_last_srdf_cg_mirror() {
        let mut source = in_cg(volume("v1", "s1"), "cg1");
        source.srdf = true;
        let m1 = in_group(mirror("m1", "v1", "s1", SyncState::Synchronized), "rg-1");
        let m2 = in_group(mirror("m2", "v2", "s1", SyncState::Synchronized), "rg-1");
        let other = in_group(mirror("m9", "v9", "s1", SyncState::Synchronized), "rg-2");

        assert!(check_if_not_last_srdf_cg_mirror(&m1, &source, &[m1.clone(), m2.clone()]));
        assert!(!check_if_not_last_srdf_cg_mirror(&m1, &source, &[m1.clone()]));
        assert!(!check_if_not_last_srdf_cg_mirror(&m1, &source, &[m1.clone(), other]));

        let mut retired = m2.clone();
        retired.inactive = true;
        assert!(!check_if_not_last_srdf_cg_mirror(&m1, &source, &[m1.clone(), retired]));

        let mut plain = source.clone();
        plain.srdf = false;
        assert!(!check_if_not_last_srdf_cg_mirror(&m1, &plain, &[m1.clone(), m2.clone()]));

        let standalone = {
            let mut v = volume("v1", "s1");
            v.srdf = true;
            v
        };
        assert!(!check_if_not_last_srdf_cg_mirror(&m1, &standalone, &[m1.clone(), m2]));
    }

    #[test]
    fn test_group_mirror_source_map_skips_inactive() {
        let m1 = mirror("m1", "v1", "s1", SyncState::Synchronized);
        let mut m2 = mirror("m2", "v2", "s1", SyncState::Synchronized);
        m2.inactive = true;
        let m3 = mirror("m3", "v3", "s1", SyncState::Synchronized);

        let map = group_mirror_source_map(&[m1, m2, m3]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("m3").map(String::as_str), Some("v3"));
        assert_eq!(map.keys().next().map(String::as_str), Some("m1"));
    }
}
