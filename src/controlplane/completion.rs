//! Device Completion
//!
//! Applies the out-of-band acknowledgement of a dispatched mirror operation:
//! sync-state transitions and mirror retirement on success, rollback of
//! speculative entities on failure.
//!
//! Dispatch-time tasks are never reopened. The device result is recorded on a
//! companion task per resource under the `<op_id>:complete` operation id, and
//! a second completion for the same operation is refused.

use crate::controlplane::tasks::{completion_op_id, SpeculativeEntity, TaskTracker};
use crate::domain::model::{
    EntityId, Mirror, MirrorRetirement, OperationType, SyncState, Task, TaskKey, TaskList,
    TaskState, Volume,
};
use crate::domain::ports::{DeviceResult, GatewayOperation, Repository};
use crate::error::{Error, Result};
use crate::metrics::ControlPlaneMetrics;
use indexmap::IndexSet;
use tracing::{debug, info, warn};

/// Task operation types a gateway operation records
fn recorded_operations(operation: GatewayOperation) -> &'static [OperationType] {
    match operation {
        GatewayOperation::Attach => &[OperationType::AttachBlockMirror],
        GatewayOperation::Detach => &[
            OperationType::DetachBlockMirror,
            OperationType::PromoteCopyToVolume,
        ],
        GatewayOperation::Pause => &[OperationType::FractureVolumeMirror],
        GatewayOperation::Resume => &[OperationType::ResumeVolumeMirror],
        GatewayOperation::EstablishGroupRelation => &[OperationType::EstablishVolumeMirror],
        GatewayOperation::Deactivate => &[OperationType::DeactivateVolumeMirror],
        GatewayOperation::FailbackGroup => &[],
    }
}

/// Applies device acknowledgements to the topology
pub struct DeviceCompletion {
    repo: Repository,
    tracker: TaskTracker,
    metrics: ControlPlaneMetrics,
}

impl DeviceCompletion {
    pub fn new(repo: Repository, metrics: ControlPlaneMetrics) -> Self {
        let tracker = TaskTracker::new(repo.clone(), metrics.clone());
        Self {
            repo,
            tracker,
            metrics,
        }
    }

    /// Apply the device's final result for the tasks of `op_id`
    pub async fn apply(
        &self,
        op_id: &str,
        operation: GatewayOperation,
        outcome: DeviceResult,
    ) -> Result<TaskList> {
        let kinds = recorded_operations(operation);
        if kinds.is_empty() {
            return Err(Error::Internal(format!(
                "{} is settled at dispatch and takes no device completion",
                operation
            )));
        }

        let tasks: Vec<Task> = self
            .tracker
            .tasks_for_op(op_id)
            .await?
            .into_iter()
            .filter(|t| kinds.contains(&t.operation))
            .collect();
        if tasks.is_empty() {
            return Err(Error::Internal(format!(
                "no {} tasks recorded for operation {}",
                operation, op_id
            )));
        }

        for task in &tasks {
            let key = TaskKey::new(task.key.kind, task.resource_id(), completion_op_id(op_id));
            if let Some(recorded) = self.repo.store().get_task(&key).await? {
                return Err(Error::TaskAlreadyTerminal {
                    kind: key.kind,
                    id: key.resource_id,
                    op_id: key.op_id,
                    state: recorded.state.to_string(),
                });
            }
        }

        let (state, message) = match outcome {
            Ok(()) => {
                info!("Device completed {} for operation {}", operation, op_id);
                self.apply_success(operation, &tasks).await?;
                (TaskState::Ready, format!("{} completed", operation))
            }
            Err(device_error) => {
                self.metrics.record_device_failure(operation.as_str());
                let message = format!("{} failed on the device: {}", operation, device_error.message);
                warn!("Operation {}: {}", op_id, message);
                self.tracker.rollback(&speculative_entities(&tasks)).await?;
                (TaskState::Error, message)
            }
        };

        let mut recorded = TaskList::new();
        for task in &tasks {
            recorded.push(
                self.tracker
                    .record_completion(task, state, message.clone())
                    .await?,
            );
        }
        Ok(recorded)
    }

    async fn apply_success(&self, operation: GatewayOperation, tasks: &[Task]) -> Result<()> {
        match operation {
            GatewayOperation::Pause => {
                self.set_sync_state(&associated_mirrors(tasks), SyncState::Fractured)
                    .await
            }
            GatewayOperation::Resume => {
                self.set_sync_state(&associated_mirrors(tasks), SyncState::Resynchronizing)
                    .await
            }
            GatewayOperation::Attach => {
                let mirrors: Vec<EntityId> = tasks.iter().map(|t| t.key.resource_id.clone()).collect();
                self.set_sync_state(&mirrors, SyncState::Synchronized).await
            }
            GatewayOperation::Detach => {
                for task in tasks
                    .iter()
                    .filter(|t| t.operation == OperationType::PromoteCopyToVolume)
                {
                    let Some(mirror) = task.associated.first() else {
                        continue;
                    };
                    self.retire(mirror, MirrorRetirement::Promoted).await?;
                    if let Some(mut promoted) = self.repo.get::<Volume>(task.resource_id()).await? {
                        promoted.promoted_from = Some(mirror.clone());
                        self.repo.update(promoted).await?;
                    }
                }
                Ok(())
            }
            GatewayOperation::Deactivate => {
                for mirror in associated_mirrors(tasks) {
                    self.retire(&mirror, MirrorRetirement::Deactivated).await?;
                }
                Ok(())
            }
            GatewayOperation::EstablishGroupRelation | GatewayOperation::FailbackGroup => Ok(()),
        }
    }

    async fn set_sync_state(&self, mirrors: &[EntityId], state: SyncState) -> Result<()> {
        for mut mirror in self.repo.get_many::<Mirror>(mirrors).await? {
            if mirror.inactive {
                continue;
            }
            debug!("Mirror {}: {} -> {}", mirror.id, mirror.sync_state, state);
            mirror.sync_state = state;
            self.repo.update(mirror).await?;
        }
        Ok(())
    }

    /// End a mirror relationship and unlink the mirror from its source
    async fn retire(&self, mirror_id: &str, retirement: MirrorRetirement) -> Result<()> {
        let Some(mut mirror) = self.repo.get::<Mirror>(mirror_id).await? else {
            warn!("Mirror {} vanished before completion", mirror_id);
            return Ok(());
        };
        mirror.retired = Some(retirement);
        mirror.inactive = true;
        let source = mirror.source.clone();
        self.repo.update(mirror).await?;

        if let Some(mut volume) = self.repo.get::<Volume>(&source).await? {
            if volume.mirrors.remove(mirror_id) {
                self.repo.update(volume).await?;
            }
        }
        debug!("Mirror {} retired ({:?})", mirror_id, retirement);
        Ok(())
    }
}

/// Mirror ids named by the tasks, first-seen order
fn associated_mirrors(tasks: &[Task]) -> Vec<EntityId> {
    let ids: IndexSet<&EntityId> = tasks.iter().flat_map(|t| t.associated.iter()).collect();
    ids.into_iter().cloned().collect()
}

/// Entities the dispatch created ahead of the device result
fn speculative_entities(tasks: &[Task]) -> Vec<SpeculativeEntity> {
    tasks
        .iter()
        .filter_map(|t| match t.operation {
            OperationType::PromoteCopyToVolume => {
                Some(SpeculativeEntity::PromotedVolume(t.key.resource_id.clone()))
            }
            OperationType::AttachBlockMirror => t.associated.first().map(|source| {
                SpeculativeEntity::PreparedMirror {
                    mirror: t.key.resource_id.clone(),
                    source: source.clone(),
                }
            }),
            _ => None,
        })
        .collect()
}
