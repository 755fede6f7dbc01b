//! Simulated Device Gateway
//!
//! An in-process gateway that accepts every dispatch, records it, and can be
//! told to fail chosen operations. Stands in for array bindings in the
//! binary and in tests.

use crate::domain::model::EntityId;
use crate::domain::ports::{DeviceGateway, DeviceResult, GatewayOperation};
use crate::error::{DeviceError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the simulated gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatedGatewayConfig {
    /// Name reported as the backend name and in device errors
    pub name: String,
    /// Operations that fail when dispatched
    pub failing_operations: Vec<GatewayOperation>,
    /// Message carried by injected failures
    pub failure_message: String,
}

impl Default for SimulatedGatewayConfig {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            failing_operations: Vec::new(),
            failure_message: "simulated device failure".to_string(),
        }
    }
}

// =============================================================================
// Recorded Calls
// =============================================================================

/// A dispatch as the gateway received it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayCall {
    Attach {
        system: String,
        source: String,
        mirrors: Vec<EntityId>,
        op_id: String,
    },
    Detach {
        system: String,
        mirrors: Vec<EntityId>,
        promoted: Vec<EntityId>,
        op_id: String,
    },
    Pause {
        system: String,
        mirrors: Vec<EntityId>,
        sync: bool,
        op_id: String,
    },
    Resume {
        system: String,
        mirrors: Vec<EntityId>,
        op_id: String,
    },
    EstablishGroupRelation {
        system: String,
        source: String,
        mirror: String,
        op_id: String,
    },
    Deactivate {
        system: String,
        mirrors: Vec<EntityId>,
        op_id: String,
    },
    FailbackGroup {
        group: String,
        op_id: String,
    },
}

impl GatewayCall {
    pub fn operation(&self) -> GatewayOperation {
        match self {
            GatewayCall::Attach { .. } => GatewayOperation::Attach,
            GatewayCall::Detach { .. } => GatewayOperation::Detach,
            GatewayCall::Pause { .. } => GatewayOperation::Pause,
            GatewayCall::Resume { .. } => GatewayOperation::Resume,
            GatewayCall::EstablishGroupRelation { .. } => GatewayOperation::EstablishGroupRelation,
            GatewayCall::Deactivate { .. } => GatewayOperation::Deactivate,
            GatewayCall::FailbackGroup { .. } => GatewayOperation::FailbackGroup,
        }
    }

    /// Mirror ids named by the call
    pub fn mirrors(&self) -> Vec<EntityId> {
        match self {
            GatewayCall::Attach { mirrors, .. }
            | GatewayCall::Detach { mirrors, .. }
            | GatewayCall::Pause { mirrors, .. }
            | GatewayCall::Resume { mirrors, .. }
            | GatewayCall::Deactivate { mirrors, .. } => mirrors.clone(),
            GatewayCall::EstablishGroupRelation { mirror, .. } => vec![mirror.clone()],
            GatewayCall::FailbackGroup { .. } => Vec::new(),
        }
    }
}

// =============================================================================
// Simulated Gateway
// =============================================================================

/// Gateway that records dispatches instead of talking to an array
pub struct SimulatedGateway {
    name: String,
    failing: Mutex<HashSet<GatewayOperation>>,
    failure_message: Mutex<String>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new(SimulatedGatewayConfig::default())
    }
}

impl SimulatedGateway {
    /// Create a new simulated gateway
    pub fn new(config: SimulatedGatewayConfig) -> Self {
        Self {
            name: config.name,
            failing: Mutex::new(config.failing_operations.into_iter().collect()),
            failure_message: Mutex::new(config.failure_message),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Make an operation fail from now on
    pub fn fail(&self, operation: GatewayOperation, message: impl Into<String>) {
        self.failing.lock().insert(operation);
        *self.failure_message.lock() = message.into();
    }

    /// Let an operation succeed again
    pub fn heal(&self, operation: GatewayOperation) {
        self.failing.lock().remove(&operation);
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls received for one operation
    pub fn calls_for(&self, operation: GatewayOperation) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation() == operation)
            .cloned()
            .collect()
    }

    fn record(&self, system: &str, call: GatewayCall) -> DeviceResult {
        let operation = call.operation();
        debug!("{} received {:?}", self.name, call);
        self.calls.lock().push(call);

        if self.failing.lock().contains(&operation) {
            let message = self.failure_message.lock().clone();
            warn!("{}: injected failure for {} on {}", self.name, operation, system);
            return Err(DeviceError::new(system, operation.as_str(), message));
        }

        info!("{}: dispatched {} on {}", self.name, operation, system);
        Ok(())
    }
}

#[async_trait]
impl DeviceGateway for SimulatedGateway {
    async fn attach(
        &self,
        system: &str,
        source: &str,
        mirrors: &[EntityId],
        op_id: &str,
    ) -> DeviceResult {
        self.record(
            system,
            GatewayCall::Attach {
                system: system.to_string(),
                source: source.to_string(),
                mirrors: mirrors.to_vec(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn detach(
        &self,
        system: &str,
        mirrors: &[EntityId],
        promoted: &[EntityId],
        op_id: &str,
    ) -> DeviceResult {
        self.record(
            system,
            GatewayCall::Detach {
                system: system.to_string(),
                mirrors: mirrors.to_vec(),
                promoted: promoted.to_vec(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn pause(
        &self,
        system: &str,
        mirrors: &[EntityId],
        sync: bool,
        op_id: &str,
    ) -> DeviceResult {
        self.record(
            system,
            GatewayCall::Pause {
                system: system.to_string(),
                mirrors: mirrors.to_vec(),
                sync,
                op_id: op_id.to_string(),
            },
        )
    }

    async fn resume(&self, system: &str, mirrors: &[EntityId], op_id: &str) -> DeviceResult {
        self.record(
            system,
            GatewayCall::Resume {
                system: system.to_string(),
                mirrors: mirrors.to_vec(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn establish_group_relation(
        &self,
        system: &str,
        source: &str,
        mirror: &str,
        op_id: &str,
    ) -> DeviceResult {
        self.record(
            system,
            GatewayCall::EstablishGroupRelation {
                system: system.to_string(),
                source: source.to_string(),
                mirror: mirror.to_string(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn deactivate(&self, system: &str, mirrors: &[EntityId], op_id: &str) -> DeviceResult {
        self.record(
            system,
            GatewayCall::Deactivate {
                system: system.to_string(),
                mirrors: mirrors.to_vec(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn failback_group(&self, group: &str, op_id: &str) -> DeviceResult {
        self.record(
            group,
            GatewayCall::FailbackGroup {
                group: group.to_string(),
                op_id: op_id.to_string(),
            },
        )
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.failing.lock().is_empty())
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let gateway = SimulatedGateway::default();
        gateway
            .pause("vmax-1", &["m1".into(), "m2".into()], true, "op-1")
            .await
            .unwrap();

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation(), GatewayOperation::Pause);
        assert_eq!(calls[0].mirrors(), vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let gateway = SimulatedGateway::default();
        gateway.fail(GatewayOperation::Detach, "array busy");

        let err = gateway
            .detach("vmax-1", &["m1".into()], &["p1".into()], "op-1")
            .await
            .unwrap_err();
        assert_eq!(err.message, "array busy");
        assert_eq!(err.operation, "detach");
        // Failed calls are still recorded
        assert_eq!(gateway.calls_for(GatewayOperation::Detach).len(), 1);

        gateway.heal(GatewayOperation::Detach);
        assert!(gateway.detach("vmax-1", &[], &[], "op-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_configured_failures() {
        let gateway = SimulatedGateway::new(SimulatedGatewayConfig {
            failing_operations: vec![GatewayOperation::FailbackGroup],
            ..Default::default()
        });
        assert!(gateway.failback_group("rrgroup-1", "op-1").await.is_err());
        assert!(gateway.resume("vmax-1", &[], "op-1").await.is_ok());
    }
}
