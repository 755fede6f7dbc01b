//! Task Completion Tracker
//!
//! Creates and finalizes task records, and rolls back entities that were
//! created speculatively for a device call that then failed.
//!
//! Ordering contract: every task of an invocation is persisted before the
//! gateway is called, so a crash between recording intent and dispatching
//! always leaves an observable pending task. [`TaskTracker::pending_tasks`]
//! is the scan a recovery pass starts from.

use crate::domain::model::{
    EntityId, EntityKind, Mirror, OperationType, Task, TaskKey, TaskList, TaskState, Volume,
};
use crate::domain::ports::{DeviceResult, Repository};
use crate::error::{Error, Result, ValidationError};
use crate::metrics::ControlPlaneMetrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, error, info, warn};

// =============================================================================
// Speculative Entities
// =============================================================================

/// An entity created ahead of a device call that must be undone if the call
/// fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeculativeEntity {
    /// Volume created to receive a detached mirror
    PromotedVolume(EntityId),
    /// Mirror prepared for attachment and linked into its source
    PreparedMirror { mirror: EntityId, source: EntityId },
}

impl SpeculativeEntity {
    pub fn id(&self) -> &str {
        match self {
            SpeculativeEntity::PromotedVolume(id) => id,
            SpeculativeEntity::PreparedMirror { mirror, .. } => mirror,
        }
    }
}

impl std::fmt::Display for SpeculativeEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeculativeEntity::PromotedVolume(id) => write!(f, "promoted volume {}", id),
            SpeculativeEntity::PreparedMirror { mirror, .. } => {
                write!(f, "prepared mirror {}", mirror)
            }
        }
    }
}

// =============================================================================
// Operation Outcome
// =============================================================================

/// Result of one orchestrator invocation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// The gateway was called; tasks carry the dispatch result
    Dispatched(TaskList),
    /// Nothing needed doing; the task is already ready
    NoOp(Task),
    /// A precondition failed before any device call
    Rejected(ValidationError),
}

impl OperationOutcome {
    /// Tasks produced by the invocation (none when rejected)
    pub fn tasks(&self) -> TaskList {
        match self {
            OperationOutcome::Dispatched(tasks) => tasks.clone(),
            OperationOutcome::NoOp(task) => TaskList::from(vec![task.clone()]),
            OperationOutcome::Rejected(_) => TaskList::new(),
        }
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, OperationOutcome::Dispatched(_))
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, OperationOutcome::NoOp(_))
    }

    pub fn rejection(&self) -> Option<&ValidationError> {
        match self {
            OperationOutcome::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

/// Operation id under which a device completion is recorded
pub fn completion_op_id(op_id: &str) -> String {
    format!("{}:complete", op_id)
}

// =============================================================================
// Task Tracker
// =============================================================================

/// Durable creation and finalization of task records
#[derive(Clone)]
pub struct TaskTracker {
    repo: Repository,
    metrics: ControlPlaneMetrics,
}

impl TaskTracker {
    pub fn new(repo: Repository, metrics: ControlPlaneMetrics) -> Self {
        Self { repo, metrics }
    }

    /// Create a pending task
    pub async fn create_task(
        &self,
        kind: EntityKind,
        resource_id: &str,
        op_id: &str,
        operation: OperationType,
        associated: Vec<EntityId>,
    ) -> Result<Task> {
        let task = self
            .repo
            .store()
            .create_task(kind, resource_id, op_id, operation, associated)
            .await?;
        self.metrics.record_task_created();
        debug!("Created task {} ({})", task.key, operation);
        Ok(task)
    }

    /// Record a request that needed no device work: the task is born ready
    pub async fn record_no_op(
        &self,
        kind: EntityKind,
        resource_id: &str,
        op_id: &str,
        operation: OperationType,
        message: impl Into<String>,
        associated: Vec<EntityId>,
    ) -> Result<Task> {
        let task = self
            .create_task(kind, resource_id, op_id, operation, associated)
            .await?;
        let message = message.into();
        info!("No-op {} on {}: {}", operation, resource_id, message);
        self.complete_task(&task.key, TaskState::Ready, Some(message))
            .await
    }

    /// Move a task to a terminal state
    ///
    /// Completing a task again with the same state is accepted and returns
    /// the stored record unchanged.
    pub async fn complete_task(
        &self,
        key: &TaskKey,
        state: TaskState,
        detail: Option<String>,
    ) -> Result<Task> {
        if !state.is_terminal() {
            return Err(Error::Internal(format!(
                "task {} cannot be completed as {}",
                key, state
            )));
        }

        let mut task = self
            .repo
            .store()
            .get_task(key)
            .await?
            .ok_or_else(|| Error::TaskNotFound {
                kind: key.kind,
                id: key.resource_id.clone(),
                op_id: key.op_id.clone(),
            })?;

        if task.is_terminal() {
            if task.state == state {
                return Ok(task);
            }
            return Err(Error::TaskAlreadyTerminal {
                kind: key.kind,
                id: key.resource_id.clone(),
                op_id: key.op_id.clone(),
                state: task.state.to_string(),
            });
        }

        task.state = state;
        task.message = detail;
        task.completed_at = Some(Utc::now());
        self.repo.store().put_task(task.clone()).await?;
        debug!("Task {} -> {}", key, state);
        Ok(task)
    }

    /// Complete every task of an invocation with the same state and message
    pub async fn complete_all(
        &self,
        tasks: &TaskList,
        state: TaskState,
        detail: &str,
    ) -> Result<TaskList> {
        let mut completed = TaskList::new();
        for task in tasks.iter() {
            completed.push(
                self.complete_task(&task.key, state, Some(detail.to_string()))
                    .await?,
            );
        }
        Ok(completed)
    }

    /// Mark every speculative entity inactive
    ///
    /// Visits the whole set even when a write fails, then reports the first
    /// failure. Returns the number of entities rolled back.
    pub async fn rollback(&self, speculative: &[SpeculativeEntity]) -> Result<usize> {
        let mut rolled_back = 0;
        let mut first_failure: Option<Error> = None;

        for entity in speculative {
            match self.rollback_one(entity).await {
                Ok(true) => rolled_back += 1,
                Ok(false) => warn!("Nothing to roll back for {}", entity),
                Err(e) => {
                    error!("Rollback of {} failed: {}", entity, e);
                    if first_failure.is_none() {
                        first_failure = Some(Error::RollbackFailed {
                            entity: entity.to_string(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        self.metrics.record_rollbacks(rolled_back as u64);
        if rolled_back > 0 {
            info!("Rolled back {} speculative entities", rolled_back);
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(rolled_back),
        }
    }

    async fn rollback_one(&self, entity: &SpeculativeEntity) -> Result<bool> {
        match entity {
            SpeculativeEntity::PromotedVolume(id) => {
                let Some(mut volume) = self.repo.get::<Volume>(id).await? else {
                    return Ok(false);
                };
                volume.inactive = true;
                self.repo.update(volume).await?;
                Ok(true)
            }
            SpeculativeEntity::PreparedMirror { mirror, source } => {
                let Some(mut prepared) = self.repo.get::<Mirror>(mirror).await? else {
                    return Ok(false);
                };
                prepared.inactive = true;
                self.repo.update(prepared).await?;

                if let Some(mut volume) = self.repo.get::<Volume>(source).await? {
                    if volume.mirrors.remove(mirror) {
                        self.repo.update(volume).await?;
                    }
                }
                Ok(true)
            }
        }
    }

    /// Run the single gateway call of an invocation and settle its tasks
    ///
    /// On success every task is finalized ready. On failure every task is
    /// marked error with the gateway's message and the speculative entities
    /// are rolled back. The gateway failure itself is not returned as `Err`;
    /// it is visible through the returned tasks.
    pub async fn dispatch<F>(
        &self,
        operation: &str,
        failure_context: String,
        tasks: TaskList,
        speculative: &[SpeculativeEntity],
        call: F,
    ) -> Result<TaskList>
    where
        F: Future<Output = DeviceResult> + Send,
    {
        match call.await {
            Ok(()) => {
                self.metrics.record_dispatch(operation);
                self.complete_all(&tasks, TaskState::Ready, &format!("{} dispatched", operation))
                    .await
            }
            Err(device_error) => {
                self.metrics.record_device_failure(operation);
                let message = format!("{}: {}", failure_context, device_error.message);
                error!("{}", message);

                let rollback = self.rollback(speculative).await;
                let failed = self.complete_all(&tasks, TaskState::Error, &message).await?;
                rollback?;
                Ok(failed)
            }
        }
    }

    /// Record the device's final result for a dispatched task
    ///
    /// The dispatch-time task keeps its settled state. The result lands on a
    /// companion task for the same resource under [`completion_op_id`].
    pub async fn record_completion(
        &self,
        dispatched: &Task,
        state: TaskState,
        message: String,
    ) -> Result<Task> {
        let op_id = completion_op_id(dispatched.op_id());
        let task = self
            .create_task(
                dispatched.key.kind,
                dispatched.resource_id(),
                &op_id,
                dispatched.operation,
                dispatched.associated.clone(),
            )
            .await?;
        self.complete_task(&task.key, state, Some(message)).await
    }

    /// Fetch a task record
    pub async fn get_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        self.repo.store().get_task(key).await
    }

    /// Every task recorded under one operation id
    pub async fn tasks_for_op(&self, op_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .repo
            .store()
            .tasks(None)
            .await?
            .into_iter()
            .filter(|t| t.op_id() == op_id)
            .collect())
    }

    /// Tasks still pending: intent recorded, no resolution observed
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        self.repo.store().tasks(Some(TaskState::Pending)).await
    }
}
