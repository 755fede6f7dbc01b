//! Control Plane - The "Brain"
//!
//! Entry point for every continuous-copy and replication request:
//! - Resolves the source volume's storage system
//! - Selects the mirror orchestrator registered for its array family
//! - Routes replication group requests to the coordinator
//! - Applies out-of-band device completions

use crate::config::ControlPlaneConfig;
use crate::controlplane::backends::BackendFactory;
use crate::controlplane::completion::DeviceCompletion;
use crate::controlplane::mirror::{AttachRequest, MirrorRequest, PauseRequest, SingleMirrorRequest};
use crate::controlplane::registry::{MirrorOrchestratorRef, OrchestratorRegistry};
use crate::controlplane::replication::ReplicationCoordinator;
use crate::controlplane::tasks::{OperationOutcome, TaskTracker};
use crate::domain::model::{StorageSystem, Task, TaskList, Volume};
use crate::domain::ports::{DataStoreRef, DeviceGatewayRef, DeviceResult, GatewayOperation, Repository};
use crate::error::Result;
use crate::metrics::ControlPlaneMetrics;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// Control Plane
// =============================================================================

/// Coordinates all continuous-copy and replication operations
pub struct ControlPlane {
    config: ControlPlaneConfig,
    repo: Repository,
    gateway: DeviceGatewayRef,
    registry: OrchestratorRegistry,
    replication: ReplicationCoordinator,
    completion: DeviceCompletion,
    tracker: TaskTracker,
    metrics: ControlPlaneMetrics,
}

impl ControlPlane {
    /// Create a control plane with the configured gateway backend
    pub fn new(config: ControlPlaneConfig, store: DataStoreRef) -> Result<Self> {
        let gateway = BackendFactory::create(&config.backends.name, &config.backends)?;
        let metrics = ControlPlaneMetrics::new()?;
        Ok(Self::with_gateway(config, store, gateway, metrics))
    }

    /// Create a control plane around an existing gateway
    pub fn with_gateway(
        config: ControlPlaneConfig,
        store: DataStoreRef,
        gateway: DeviceGatewayRef,
        metrics: ControlPlaneMetrics,
    ) -> Self {
        info!(
            "Initializing control plane (gateway: {})",
            gateway.backend_name()
        );
        let repo = Repository::new(store);
        let registry =
            OrchestratorRegistry::with_defaults(&repo, &gateway, &metrics, &config.capabilities);
        debug!("Registered {} mirror orchestrators", registry.len());

        Self {
            replication: ReplicationCoordinator::new(repo.clone(), gateway.clone(), metrics.clone()),
            completion: DeviceCompletion::new(repo.clone(), metrics.clone()),
            tracker: TaskTracker::new(repo.clone(), metrics.clone()),
            config,
            repo,
            gateway,
            registry,
            metrics,
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn registry(&self) -> &OrchestratorRegistry {
        &self.registry
    }

    pub fn replication(&self) -> &ReplicationCoordinator {
        &self.replication
    }

    pub fn metrics(&self) -> &ControlPlaneMetrics {
        &self.metrics
    }

    /// Storage system and orchestrator serving a source volume
    ///
    /// `Ok(Err(outcome))` carries the rejection for an unsupported array
    /// family; missing volumes or systems are fatal.
    async fn resolve(
        &self,
        operation: GatewayOperation,
        source: &str,
    ) -> Result<std::result::Result<(StorageSystem, MirrorOrchestratorRef), OperationOutcome>> {
        let volume = self.repo.require::<Volume>(source).await?;
        let system = self
            .repo
            .require::<StorageSystem>(&volume.storage_system)
            .await?;

        match self.registry.resolve(&system) {
            Ok(orchestrator) => {
                debug!(
                    "{} on volume {} routed to orchestrator {}",
                    operation,
                    source,
                    orchestrator.name()
                );
                Ok(Ok((system, orchestrator)))
            }
            Err(error) => {
                warn!("{} rejected for volume {}: {}", operation, source, error);
                self.metrics.record_rejection(operation.as_str());
                Ok(Err(OperationOutcome::Rejected(error)))
            }
        }
    }

    /// Attach new continuous copies
    pub async fn attach(&self, request: &AttachRequest) -> Result<OperationOutcome> {
        match self.resolve(GatewayOperation::Attach, &request.source).await? {
            Ok((system, orchestrator)) => orchestrator.attach(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Detach continuous copies, promoting each to an independent volume
    pub async fn detach(&self, request: &MirrorRequest) -> Result<OperationOutcome> {
        match self.resolve(GatewayOperation::Detach, &request.source).await? {
            Ok((system, orchestrator)) => orchestrator.detach(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Pause (fracture) continuous copies
    pub async fn pause(&self, request: &PauseRequest) -> Result<OperationOutcome> {
        match self.resolve(GatewayOperation::Pause, &request.source).await? {
            Ok((system, orchestrator)) => orchestrator.pause(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Resume paused continuous copies
    pub async fn resume(&self, request: &MirrorRequest) -> Result<OperationOutcome> {
        match self.resolve(GatewayOperation::Resume, &request.source).await? {
            Ok((system, orchestrator)) => orchestrator.resume(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Establish the group relation between a CG volume and its mirror
    pub async fn establish_group_relation(
        &self,
        request: &SingleMirrorRequest,
    ) -> Result<OperationOutcome> {
        match self
            .resolve(GatewayOperation::EstablishGroupRelation, &request.source)
            .await?
        {
            Ok((system, orchestrator)) => orchestrator.establish_group_relation(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Tear down a continuous copy
    pub async fn deactivate(&self, request: &SingleMirrorRequest) -> Result<OperationOutcome> {
        match self.resolve(GatewayOperation::Deactivate, &request.source).await? {
            Ok((system, orchestrator)) => orchestrator.deactivate(&system, request).await,
            Err(rejected) => Ok(rejected),
        }
    }

    /// Fail back a remote replication group
    pub async fn failback(&self, group: &str, op_id: &str) -> Result<OperationOutcome> {
        self.replication.failback(group, op_id).await
    }

    /// Apply a device's final result for a dispatched operation
    ///
    /// Returns the completion records; the dispatch-time tasks are left as
    /// they settled.
    pub async fn complete(
        &self,
        op_id: &str,
        operation: GatewayOperation,
        outcome: DeviceResult,
    ) -> Result<TaskList> {
        self.completion.apply(op_id, operation, outcome).await
    }

    /// Tasks still waiting on the device
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        self.tracker.pending_tasks().await
    }

    /// Get gateway health status
    pub async fn backends_health(&self) -> BTreeMap<String, bool> {
        let mut health = BTreeMap::new();
        let is_healthy = self.gateway.health_check().await.unwrap_or(false);
        health.insert(self.gateway.backend_name().to_string(), is_healthy);
        health
    }

    /// Get overall control plane status
    pub async fn status(&self) -> Result<ControlPlaneStatus> {
        let backends_health = self.backends_health().await;
        let pending_tasks = self.pending_tasks().await?.len();

        Ok(ControlPlaneStatus {
            healthy: backends_health.values().all(|&h| h),
            orchestrators: self.registry.keys().iter().map(|k| k.to_string()).collect(),
            pending_tasks: pending_tasks as u64,
            rollbacks: self.metrics.rollback_count(),
            backends_health,
        })
    }
}

/// Control plane status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    pub healthy: bool,
    pub orchestrators: Vec<String>,
    pub pending_tasks: u64,
    pub rollbacks: u64,
    pub backends_health: BTreeMap<String, bool>,
}
