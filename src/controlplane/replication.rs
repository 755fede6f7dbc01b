//! Remote Replication Coordinator
//!
//! Navigates the pair → group → set hierarchy, decides which link operations
//! an element may take, and runs group failback.
//!
//! Policy is decided by the element's enclosing set and, for pairs, by the
//! consistency enforcement of the pair's group:
//!
//! | Element           | Allowed when                                                |
//! |-------------------|-------------------------------------------------------------|
//! | Pair              | set supports PAIR, and the pair's group does not enforce consistency |
//! | Consistency group | every pair sourced from the CG's volumes passes the Pair rule |
//! | Group             | set supports GROUP                                          |
//! | Set               | set supports SET                                            |
//!
//! A set may further narrow the operations allowed at each granularity
//! through its operation policy.

use crate::controlplane::tasks::{OperationOutcome, TaskTracker};
use crate::domain::model::{
    EntityId, EntityKind, LinkGranularity, OperationType, ReplicationElementType,
    ReplicationGroup, ReplicationOperation, ReplicationPair, ReplicationSet, ReplicationState,
    StorageSystem, TaskList,
    TaskState, TopologyEntity, Volume,
};
use crate::domain::ports::{Constraint, DeviceGatewayRef, GatewayOperation, Repository};
use crate::error::{Error, Result, ValidationError};
use crate::metrics::ControlPlaneMetrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

// =============================================================================
// Elements & Operations
// =============================================================================

/// Anything a remote replication operation can target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ReplicationElement {
    Pair(EntityId),
    ConsistencyGroup(EntityId),
    Group(EntityId),
    Set(EntityId),
}

impl ReplicationElement {
    pub fn element_type(&self) -> &'static str {
        match self {
            ReplicationElement::Pair(_) => "replication pair",
            ReplicationElement::ConsistencyGroup(_) => "consistency group",
            ReplicationElement::Group(_) => "replication group",
            ReplicationElement::Set(_) => "replication set",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ReplicationElement::Pair(id)
            | ReplicationElement::ConsistencyGroup(id)
            | ReplicationElement::Group(id)
            | ReplicationElement::Set(id) => id,
        }
    }
}

/// Side of a replication pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairSide {
    Source,
    Target,
}

/// Source or target elements of the given pairs, in pair order
pub fn elements(pairs: &[ReplicationPair], side: PairSide) -> Vec<EntityId> {
    pairs
        .iter()
        .map(|p| match side {
            PairSide::Source => p.source_element.clone(),
            PairSide::Target => p.target_element.clone(),
        })
        .collect()
}

fn not_allowed(element: &ReplicationElement, operation: ReplicationOperation, reason: String) -> Error {
    Error::Validation(ValidationError::ReplicationOperationNotAllowed {
        element_type: element.element_type().to_string(),
        element: element.id().to_string(),
        operation: operation.to_string(),
        reason,
    })
}

fn mode_not_allowed(element: &ReplicationElement, mode: &str, reason: String) -> Error {
    Error::Validation(ValidationError::ReplicationModeChangeNotAllowed {
        element_type: element.element_type().to_string(),
        element: element.id().to_string(),
        mode: mode.to_string(),
        reason,
    })
}

// =============================================================================
// Replication Coordinator
// =============================================================================

/// Remote replication lookups, policy and failback
pub struct ReplicationCoordinator {
    repo: Repository,
    tracker: TaskTracker,
    gateway: DeviceGatewayRef,
    metrics: ControlPlaneMetrics,
}

impl ReplicationCoordinator {
    pub fn new(repo: Repository, gateway: DeviceGatewayRef, metrics: ControlPlaneMetrics) -> Self {
        let tracker = TaskTracker::new(repo.clone(), metrics.clone());
        Self {
            repo,
            tracker,
            gateway,
            metrics,
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Parent group of a pair, if it has one
    pub async fn group_of_pair(&self, pair: &ReplicationPair) -> Result<Option<ReplicationGroup>> {
        match &pair.replication_group {
            Some(group) => self.repo.get::<ReplicationGroup>(group).await,
            None => Ok(None),
        }
    }

    /// Set enclosing a pair
    pub async fn set_of_pair(&self, pair: &ReplicationPair) -> Result<ReplicationSet> {
        self.repo.require::<ReplicationSet>(&pair.replication_set).await
    }

    /// Consistency group of the pair's source volume
    pub async fn consistency_group_of_pair(&self, pair: &ReplicationPair) -> Result<Option<EntityId>> {
        if pair.element_type != ReplicationElementType::Volume {
            return Ok(None);
        }
        Ok(self
            .repo
            .get::<Volume>(&pair.source_element)
            .await?
            .and_then(|v| v.consistency_group))
    }

    /// Active pairs of a group
    pub async fn pairs_of_group(&self, group: &str) -> Result<Vec<ReplicationPair>> {
        self.active_pairs(&Constraint::PairsInReplicationGroup(group.to_string()))
            .await
    }

    /// Active pairs whose source is the given element
    pub async fn pairs_for_source(&self, element: &str) -> Result<Vec<ReplicationPair>> {
        self.active_pairs(&Constraint::PairsBySourceElement(element.to_string()))
            .await
    }

    /// Active pairs sourced from any volume of a consistency group
    pub async fn pairs_for_consistency_group(&self, cg: &str) -> Result<Vec<ReplicationPair>> {
        let volumes = self
            .repo
            .query(&Constraint::VolumesInConsistencyGroup(cg.to_string()))
            .await?;
        let mut pairs = Vec::new();
        for volume in &volumes {
            pairs.extend(self.pairs_for_source(volume).await?);
        }
        Ok(pairs)
    }

    /// Active replication sets a storage system participates in
    pub async fn sets_for_storage_system(&self, system: &StorageSystem) -> Result<Vec<ReplicationSet>> {
        Ok(self
            .repo
            .query_entities::<ReplicationSet>(&Constraint::SetsBySystemType(system.system_type))
            .await?
            .into_iter()
            .filter(|s| !s.inactive && s.storage_systems.contains(&system.id))
            .collect())
    }

    async fn active_pairs(&self, constraint: &Constraint) -> Result<Vec<ReplicationPair>> {
        Ok(self
            .repo
            .query_entities::<ReplicationPair>(constraint)
            .await?
            .into_iter()
            .filter(|p| !p.inactive)
            .collect())
    }

    async fn set_of_group(&self, group: &ReplicationGroup) -> Result<ReplicationSet> {
        self.repo.require::<ReplicationSet>(&group.replication_set).await
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Check that `operation` may run on `element`
    ///
    /// Policy violations come back as `Error::Validation`.
    pub async fn validate_operation_allowed(
        &self,
        element: &ReplicationElement,
        operation: ReplicationOperation,
    ) -> Result<()> {
        debug!("Validating {} on {} {}", operation, element.element_type(), element.id());
        match element {
            ReplicationElement::Pair(id) => {
                let pair = self.repo.require::<ReplicationPair>(id).await?;
                self.check_pair(&pair, element, operation).await
            }
            ReplicationElement::ConsistencyGroup(id) => {
                for pair in self.pairs_for_consistency_group(id).await? {
                    self.check_pair(&pair, element, operation).await?;
                }
                Ok(())
            }
            ReplicationElement::Group(id) => {
                let group = self.repo.require::<ReplicationGroup>(id).await?;
                let set = self.set_of_group(&group).await?;
                Self::check_set(&set, LinkGranularity::Group, element, operation)
            }
            ReplicationElement::Set(id) => {
                let set = self.repo.require::<ReplicationSet>(id).await?;
                Self::check_set(&set, LinkGranularity::Set, element, operation)
            }
        }
    }

    async fn check_pair(
        &self,
        pair: &ReplicationPair,
        element: &ReplicationElement,
        operation: ReplicationOperation,
    ) -> Result<()> {
        let set = self.set_of_pair(pair).await?;
        Self::check_set(&set, LinkGranularity::Pair, element, operation)?;
        if let Some(group) = self.group_of_pair(pair).await? {
            if group.consistency_enforced {
                return Err(not_allowed(
                    element,
                    operation,
                    format!(
                        "pair {} belongs to replication group {} with enforced consistency",
                        pair.id, group.id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Set-level policy: the granularity is supported and permits `operation`
    fn check_set(
        set: &ReplicationSet,
        granularity: LinkGranularity,
        element: &ReplicationElement,
        operation: ReplicationOperation,
    ) -> Result<()> {
        if !set.supports(granularity) {
            return Err(not_allowed(
                element,
                operation,
                format!("replication set {} does not support {} operations", set.id, granularity),
            ));
        }
        if !set.permits(granularity, operation) {
            return Err(not_allowed(
                element,
                operation,
                format!("replication set {} does not permit {} at {} level", set.id, operation, granularity),
            ));
        }
        Ok(())
    }

    /// Check that `element` may switch to replication mode `mode`
    pub async fn validate_mode_change(&self, element: &ReplicationElement, mode: &str) -> Result<()> {
        match element {
            ReplicationElement::Pair(id) => {
                let pair = self.repo.require::<ReplicationPair>(id).await?;
                self.check_pair_mode(&pair, element, mode).await
            }
            ReplicationElement::ConsistencyGroup(id) => {
                for pair in self.pairs_for_consistency_group(id).await? {
                    self.check_pair_mode(&pair, element, mode).await?;
                }
                Ok(())
            }
            ReplicationElement::Group(id) => {
                let group = self.repo.require::<ReplicationGroup>(id).await?;
                let set = self.set_of_group(&group).await?;
                Self::check_set_mode(&set, LinkGranularity::Group, element, mode)
            }
            ReplicationElement::Set(id) => {
                let set = self.repo.require::<ReplicationSet>(id).await?;
                Self::check_set_mode(&set, LinkGranularity::Set, element, mode)
            }
        }
    }

    async fn check_pair_mode(
        &self,
        pair: &ReplicationPair,
        element: &ReplicationElement,
        mode: &str,
    ) -> Result<()> {
        let set = self.set_of_pair(pair).await?;
        if let Some(group) = &pair.replication_group {
            return Err(mode_not_allowed(
                element,
                mode,
                format!("pair {} is managed through replication group {}", pair.id, group),
            ));
        }
        Self::check_set_mode(&set, LinkGranularity::Pair, element, mode)
    }

    fn check_set_mode(
        set: &ReplicationSet,
        granularity: LinkGranularity,
        element: &ReplicationElement,
        mode: &str,
    ) -> Result<()> {
        if !set.supports(granularity) {
            return Err(mode_not_allowed(
                element,
                mode,
                format!("replication set {} does not support {} operations", set.id, granularity),
            ));
        }
        if !set.supports_mode(mode) {
            return Err(mode_not_allowed(
                element,
                mode,
                format!("replication set {} does not support mode {}", set.id, mode),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Failback
    // =========================================================================

    /// Fail back a replication group
    ///
    /// After the gateway accepts, every active pair of the group flips
    /// direction and becomes ACTIVE, and the group becomes ACTIVE, in one
    /// batch write. A gateway failure errors the task and changes nothing.
    pub async fn failback(&self, group_id: &str, op_id: &str) -> Result<OperationOutcome> {
        let op = GatewayOperation::FailbackGroup;
        let mut group = self.repo.require::<ReplicationGroup>(group_id).await?;
        info!("Failing back replication group {} (op {})", group.id, op_id);

        let element = ReplicationElement::Group(group.id.clone());
        if group.inactive {
            let error = ValidationError::ReplicationOperationNotAllowed {
                element_type: element.element_type().to_string(),
                element: group.id.clone(),
                operation: ReplicationOperation::Failback.to_string(),
                reason: "replication group is inactive".to_string(),
            };
            return Ok(self.reject(op, error));
        }
        match self
            .validate_operation_allowed(&element, ReplicationOperation::Failback)
            .await
        {
            Ok(()) => {}
            Err(Error::Validation(error)) => return Ok(self.reject(op, error)),
            Err(e) => return Err(e),
        }

        let pairs = self.pairs_of_group(&group.id).await?;
        let task = self
            .tracker
            .create_task(
                EntityKind::ReplicationGroup,
                &group.id,
                op_id,
                OperationType::FailbackReplicationGroup,
                pairs.iter().map(|p| p.id.clone()).collect(),
            )
            .await?;

        if let Err(device_error) = self.gateway.failback_group(&group.id, op_id).await {
            self.metrics.record_device_failure(op.as_str());
            let message = format!(
                "Failed to fail back replication group {}: {}",
                group.id, device_error.message
            );
            error!("{}", message);
            let task = self
                .tracker
                .complete_task(&task.key, TaskState::Error, Some(message))
                .await?;
            return Ok(OperationOutcome::Dispatched(TaskList::from(vec![task])));
        }
        self.metrics.record_dispatch(op.as_str());

        let pair_count = pairs.len();
        let mut batch = Vec::with_capacity(pair_count + 1);
        for mut pair in pairs {
            pair.direction = pair.direction.flipped();
            pair.replication_state = ReplicationState::Active;
            batch.push(pair.into_entity());
        }
        group.replication_state = ReplicationState::Active;
        batch.push(group.clone().into_entity());
        self.repo.update_batch(batch).await?;
        info!(
            "Replication group {} failed back, {} pairs now active",
            group.id, pair_count
        );

        let task = self
            .tracker
            .complete_task(
                &task.key,
                TaskState::Ready,
                Some(format!("{} dispatched", op)),
            )
            .await?;
        Ok(OperationOutcome::Dispatched(TaskList::from(vec![task])))
    }

    fn reject(&self, operation: GatewayOperation, error: ValidationError) -> OperationOutcome {
        warn!("{} rejected: {}", operation, error);
        self.metrics.record_rejection(operation.as_str());
        OperationOutcome::Rejected(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::SimulatedGateway;
    use crate::domain::model::fixtures::volume;
    use crate::domain::model::{ReplicationDirection, SystemType};
    use crate::store::InMemoryDataStore;
    use assert_matches::assert_matches;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    struct Harness {
        repo: Repository,
        gateway: Arc<SimulatedGateway>,
        coordinator: ReplicationCoordinator,
    }

    fn harness() -> Harness {
        let repo = Repository::new(Arc::new(InMemoryDataStore::new()));
        let gateway = Arc::new(SimulatedGateway::default());
        let coordinator =
            ReplicationCoordinator::new(repo.clone(), gateway.clone(), ControlPlaneMetrics::new().unwrap());
        Harness {
            repo,
            gateway,
            coordinator,
        }
    }

    fn set(id: &str, granularity: &[LinkGranularity], modes: &[&str]) -> ReplicationSet {
        ReplicationSet {
            id: id.into(),
            label: id.into(),
            storage_system_type: SystemType::Vmax,
            storage_systems: ["s1".to_string()].into_iter().collect(),
            link_granularity: granularity.iter().copied().collect(),
            operation_policy: BTreeMap::new(),
            supported_modes: modes.iter().map(|m| m.to_string()).collect(),
            inactive: false,
        }
    }

    fn group(id: &str, set: &str, enforced: bool) -> ReplicationGroup {
        ReplicationGroup {
            id: id.into(),
            label: id.into(),
            replication_set: set.into(),
            replication_mode: Some("SYNC".into()),
            replication_state: ReplicationState::FailedOver,
            consistency_enforced: enforced,
            inactive: false,
        }
    }

    fn pair(id: &str, source: &str, set: &str, group: Option<&str>) -> ReplicationPair {
        ReplicationPair {
            id: id.into(),
            source_element: source.into(),
            target_element: format!("{}-target", source),
            element_type: ReplicationElementType::Volume,
            direction: ReplicationDirection::SourceToTarget,
            replication_state: ReplicationState::FailedOver,
            replication_mode: Some("SYNC".into()),
            replication_group: group.map(String::from),
            replication_set: set.into(),
            inactive: false,
        }
    }

    async fn seed_group(h: &Harness, enforced: bool) {
        h.repo
            .update(set(
                "set-1",
                &[LinkGranularity::Pair, LinkGranularity::Group],
                &["SYNC", "ASYNC"],
            ))
            .await
            .unwrap();
        h.repo.update(group("g1", "set-1", enforced)).await.unwrap();
        h.repo.update(pair("p1", "v1", "set-1", Some("g1"))).await.unwrap();
        h.repo.update(pair("p2", "v2", "set-1", Some("g1"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_failback_twice_keeps_active_and_restores_direction() {
        let h = harness();
        seed_group(&h, false).await;

        let expected = [
            ("op-1", ReplicationDirection::TargetToSource),
            ("op-2", ReplicationDirection::SourceToTarget),
        ];
        for (op_id, direction) in expected {
            let outcome = h.coordinator.failback("g1", op_id).await.unwrap();
            assert_matches!(outcome, OperationOutcome::Dispatched(ref tasks) if tasks.all_in_state(TaskState::Ready));

            for id in ["p1", "p2"] {
                let p = h.repo.require::<ReplicationPair>(id).await.unwrap();
                assert_eq!(p.replication_state, ReplicationState::Active);
                assert_eq!(p.direction, direction);
            }
            let g = h.repo.require::<ReplicationGroup>("g1").await.unwrap();
            assert_eq!(g.replication_state, ReplicationState::Active);
        }

        let p1 = h.repo.require::<ReplicationPair>("p1").await.unwrap();
        assert_eq!(p1.direction, ReplicationDirection::SourceToTarget);
        assert_eq!(h.gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failback_gateway_failure_leaves_pairs_unchanged() {
        let h = harness();
        seed_group(&h, false).await;
        h.gateway.fail(GatewayOperation::FailbackGroup, "link down");

        let outcome = h.coordinator.failback("g1", "op-1").await.unwrap();
        let tasks = outcome.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.0[0].state, TaskState::Error);
        assert!(tasks.0[0].message.as_deref().unwrap().contains("link down"));

        let p1 = h.repo.require::<ReplicationPair>("p1").await.unwrap();
        assert_eq!(p1.direction, ReplicationDirection::SourceToTarget);
        assert_eq!(p1.replication_state, ReplicationState::FailedOver);
        let g = h.repo.require::<ReplicationGroup>("g1").await.unwrap();
        assert_eq!(g.replication_state, ReplicationState::FailedOver);
    }

    #[tokio::test]
    async fn test_failback_rejected_without_group_granularity() {
        let h = harness();
        h.repo
            .update(set("set-1", &[LinkGranularity::Pair], &["SYNC"]))
            .await
            .unwrap();
        h.repo.update(group("g1", "set-1", false)).await.unwrap();

        assert_matches!(
            h.coordinator.failback("g1", "op-1").await.unwrap(),
            OperationOutcome::Rejected(ValidationError::ReplicationOperationNotAllowed { .. })
        );
        assert_eq!(h.gateway.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failback_rejected_when_policy_forbids_it() {
        let h = harness();
        seed_group(&h, false).await;
        let mut narrowed = h.repo.require::<ReplicationSet>("set-1").await.unwrap();
        narrowed
            .operation_policy
            .insert(LinkGranularity::Group, BTreeSet::from([ReplicationOperation::Split]));
        h.repo.update(narrowed).await.unwrap();

        assert_matches!(
            h.coordinator.failback("g1", "op-1").await.unwrap(),
            OperationOutcome::Rejected(ValidationError::ReplicationOperationNotAllowed { .. })
        );
        assert_eq!(h.gateway.call_count(), 0);
        let g = h.repo.require::<ReplicationGroup>("g1").await.unwrap();
        assert_eq!(g.replication_state, ReplicationState::FailedOver);
    }

    #[tokio::test]
    async fn test_pair_policy_respects_enforced_consistency() {
        let h = harness();
        seed_group(&h, true).await;
        h.repo.update(pair("p3", "v3", "set-1", None)).await.unwrap();

        let err = h
            .coordinator
            .validate_operation_allowed(&ReplicationElement::Pair("p1".into()), ReplicationOperation::Split)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Validation(ValidationError::ReplicationOperationNotAllowed { ref element, .. }) if element == "p1"
        );

        // Ungrouped pair in a set with pair granularity
        h.coordinator
            .validate_operation_allowed(&ReplicationElement::Pair("p3".into()), ReplicationOperation::Split)
            .await
            .unwrap();

        // The group itself may still be operated on
        h.coordinator
            .validate_operation_allowed(&ReplicationElement::Group("g1".into()), ReplicationOperation::Split)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_operation_policy_narrows_allowed_granularity() {
        let h = harness();
        seed_group(&h, false).await;
        h.repo.update(pair("p3", "v3", "set-1", None)).await.unwrap();
        let mut narrowed = h.repo.require::<ReplicationSet>("set-1").await.unwrap();
        narrowed.operation_policy.insert(
            LinkGranularity::Pair,
            [ReplicationOperation::Split, ReplicationOperation::Establish]
                .into_iter()
                .collect(),
        );
        narrowed
            .operation_policy
            .insert(LinkGranularity::Group, BTreeSet::from([ReplicationOperation::Suspend]));
        h.repo.update(narrowed).await.unwrap();

        let p3 = ReplicationElement::Pair("p3".into());
        h.coordinator
            .validate_operation_allowed(&p3, ReplicationOperation::Split)
            .await
            .unwrap();
        let err = h
            .coordinator
            .validate_operation_allowed(&p3, ReplicationOperation::Failover)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Validation(ValidationError::ReplicationOperationNotAllowed { ref operation, .. }) if operation == "failover"
        );

        let g1 = ReplicationElement::Group("g1".into());
        h.coordinator
            .validate_operation_allowed(&g1, ReplicationOperation::Suspend)
            .await
            .unwrap();
        assert!(h
            .coordinator
            .validate_operation_allowed(&g1, ReplicationOperation::Swap)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_set_policy_requires_set_granularity() {
        let h = harness();
        seed_group(&h, false).await;
        assert!(h
            .coordinator
            .validate_operation_allowed(&ReplicationElement::Set("set-1".into()), ReplicationOperation::Suspend)
            .await
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_consistency_group_policy_checks_every_pair() {
        let h = harness();
        seed_group(&h, false).await;
        let mut v1 = volume("v1", "s1");
        v1.consistency_group = Some("cg1".into());
        let mut v2 = volume("v2", "s1");
        v2.consistency_group = Some("cg1".into());
        h.repo.update(v1).await.unwrap();
        h.repo.update(v2).await.unwrap();

        let cg = ReplicationElement::ConsistencyGroup("cg1".into());
        h.coordinator
            .validate_operation_allowed(&cg, ReplicationOperation::Failover)
            .await
            .unwrap();

        let mut enforced = h.repo.require::<ReplicationGroup>("g1").await.unwrap();
        enforced.consistency_enforced = true;
        h.repo.update(enforced).await.unwrap();
        assert!(h
            .coordinator
            .validate_operation_allowed(&cg, ReplicationOperation::Failover)
            .await
            .is_err());

        let pairs = h.coordinator.pairs_for_consistency_group("cg1").await.unwrap();
        assert_eq!(elements(&pairs, PairSide::Source), vec!["v1".to_string(), "v2".to_string()]);
        assert_eq!(
            elements(&pairs, PairSide::Target),
            vec!["v1-target".to_string(), "v2-target".to_string()]
        );
        let p1 = h.repo.require::<ReplicationPair>("p1").await.unwrap();
        assert_eq!(
            h.coordinator.consistency_group_of_pair(&p1).await.unwrap().as_deref(),
            Some("cg1")
        );
    }

    #[tokio::test]
    async fn test_mode_change_validation() {
        let h = harness();
        seed_group(&h, false).await;
        h.repo.update(pair("p3", "v3", "set-1", None)).await.unwrap();

        let p3 = ReplicationElement::Pair("p3".into());
        h.coordinator.validate_mode_change(&p3, "ASYNC").await.unwrap();
        assert_matches!(
            h.coordinator.validate_mode_change(&p3, "METRO").await,
            Err(Error::Validation(ValidationError::ReplicationModeChangeNotAllowed { .. }))
        );

        // Grouped pairs change mode through their group
        assert!(h
            .coordinator
            .validate_mode_change(&ReplicationElement::Pair("p1".into()), "ASYNC")
            .await
            .is_err());
        h.coordinator
            .validate_mode_change(&ReplicationElement::Group("g1".into()), "ASYNC")
            .await
            .unwrap();
        assert!(h
            .coordinator
            .validate_mode_change(&ReplicationElement::Set("set-1".into()), "ASYNC")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_lookups() {
        let h = harness();
        seed_group(&h, false).await;
        let mut other = set("set-2", &[LinkGranularity::Set], &[]);
        other.storage_systems = BTreeSet::new();
        h.repo.update(other).await.unwrap();

        let p1 = h.repo.require::<ReplicationPair>("p1").await.unwrap();
        assert_eq!(h.coordinator.group_of_pair(&p1).await.unwrap().unwrap().id, "g1");
        assert_eq!(h.coordinator.set_of_pair(&p1).await.unwrap().id, "set-1");
        assert_eq!(h.coordinator.pairs_of_group("g1").await.unwrap().len(), 2);
        assert_eq!(h.coordinator.pairs_for_source("v2").await.unwrap()[0].id, "p2");

        let system = StorageSystem {
            id: "s1".into(),
            label: "vmax".into(),
            system_type: SystemType::Vmax,
            using_smis80: true,
        };
        let sets = h.coordinator.sets_for_storage_system(&system).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].id, "set-1");
    }
}
