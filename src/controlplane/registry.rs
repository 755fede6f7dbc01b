//! Orchestrator Registry
//!
//! Maps an array family to the mirror orchestrator that serves it. VMAX
//! arrays behind an SMI-S 8.0 provider get their own entry since they gain
//! consistency-group mirrors.

use crate::controlplane::mirror::{BlockMirrorOrchestrator, MirrorCapabilities, MirrorOrchestrator};
use crate::domain::model::{StorageSystem, SystemType};
use crate::domain::ports::{DeviceGatewayRef, Repository};
use crate::error::ValidationError;
use crate::metrics::ControlPlaneMetrics;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Array families with a block mirror orchestrator
pub const SUPPORTED_SYSTEM_TYPES: [SystemType; 4] = [
    SystemType::Vmax,
    SystemType::VnxBlock,
    SystemType::Xtremio,
    SystemType::Unity,
];

/// Registry lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrchestratorKey {
    pub system_type: SystemType,
    pub using_smis80: bool,
}

impl OrchestratorKey {
    pub fn new(system_type: SystemType, using_smis80: bool) -> Self {
        Self {
            system_type,
            using_smis80,
        }
    }

    pub fn of(system: &StorageSystem) -> Self {
        Self::new(system.system_type, system.using_smis80)
    }
}

impl std::fmt::Display for OrchestratorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.using_smis80 {
            write!(f, "{}-smis80", self.system_type)
        } else {
            write!(f, "{}", self.system_type)
        }
    }
}

/// Built-in capabilities of an array family
pub fn default_capabilities(key: OrchestratorKey) -> MirrorCapabilities {
    let supports_cg_mirrors = match key.system_type {
        SystemType::Vmax => key.using_smis80,
        SystemType::VnxBlock => true,
        _ => false,
    };
    MirrorCapabilities {
        supports_cg_mirrors,
    }
}

pub type MirrorOrchestratorRef = Arc<dyn MirrorOrchestrator>;

/// Array family to orchestrator mapping
#[derive(Default)]
pub struct OrchestratorRegistry {
    orchestrators: RwLock<BTreeMap<OrchestratorKey, MirrorOrchestratorRef>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a block orchestrator for every supported family
    ///
    /// `overrides` replaces the built-in capabilities of a family for both
    /// of its provider variants.
    pub fn with_defaults(
        repo: &Repository,
        gateway: &DeviceGatewayRef,
        metrics: &ControlPlaneMetrics,
        overrides: &BTreeMap<SystemType, MirrorCapabilities>,
    ) -> Self {
        let registry = Self::new();
        for system_type in SUPPORTED_SYSTEM_TYPES {
            for using_smis80 in [false, true] {
                let key = OrchestratorKey::new(system_type, using_smis80);
                let capabilities = overrides
                    .get(&system_type)
                    .copied()
                    .unwrap_or_else(|| default_capabilities(key));
                registry.register(
                    key,
                    Arc::new(BlockMirrorOrchestrator::new(
                        key.to_string(),
                        capabilities,
                        repo.clone(),
                        gateway.clone(),
                        metrics.clone(),
                    )),
                );
            }
        }
        registry
    }

    pub fn register(&self, key: OrchestratorKey, orchestrator: MirrorOrchestratorRef) {
        debug!(
            "Registering orchestrator {} for {} (cg mirrors: {})",
            orchestrator.name(),
            key,
            orchestrator.capabilities().supports_cg_mirrors
        );
        if self.orchestrators.write().insert(key, orchestrator).is_some() {
            info!("Replaced orchestrator for {}", key);
        }
    }

    /// Orchestrator serving a storage system
    pub fn resolve(
        &self,
        system: &StorageSystem,
    ) -> std::result::Result<MirrorOrchestratorRef, ValidationError> {
        let key = OrchestratorKey::of(system);
        let orchestrators = self.orchestrators.read();
        orchestrators
            .get(&key)
            .or_else(|| orchestrators.get(&OrchestratorKey::new(key.system_type, false)))
            .cloned()
            .ok_or_else(|| ValidationError::UnsupportedSystemType {
                system_type: system.system_type.to_string(),
            })
    }

    pub fn keys(&self) -> Vec<OrchestratorKey> {
        self.orchestrators.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.orchestrators.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.orchestrators.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::SimulatedGateway;
    use crate::store::InMemoryDataStore;

    fn system(system_type: SystemType, using_smis80: bool) -> StorageSystem {
        StorageSystem {
            id: "s1".into(),
            label: "array".into(),
            system_type,
            using_smis80,
        }
    }

    fn registry(overrides: BTreeMap<SystemType, MirrorCapabilities>) -> OrchestratorRegistry {
        let repo = Repository::new(Arc::new(InMemoryDataStore::new()));
        let gateway: DeviceGatewayRef = Arc::new(SimulatedGateway::default());
        OrchestratorRegistry::with_defaults(
            &repo,
            &gateway,
            &ControlPlaneMetrics::new().unwrap(),
            &overrides,
        )
    }

    #[test]
    fn test_default_capabilities() {
        let cg = |t, smis| default_capabilities(OrchestratorKey::new(t, smis)).supports_cg_mirrors;
        assert!(!cg(SystemType::Vmax, false));
        assert!(cg(SystemType::Vmax, true));
        assert!(cg(SystemType::VnxBlock, false));
        assert!(!cg(SystemType::Xtremio, false));
        assert!(!cg(SystemType::Unity, true));
    }

    #[test]
    fn test_resolve_by_system() {
        let registry = registry(BTreeMap::new());
        assert_eq!(registry.len(), 8);

        let plain = registry.resolve(&system(SystemType::Vmax, false)).unwrap();
        assert_eq!(plain.name(), "vmax");
        assert!(!plain.capabilities().supports_cg_mirrors);

        let smis = registry.resolve(&system(SystemType::Vmax, true)).unwrap();
        assert_eq!(smis.name(), "vmax-smis80");
        assert!(smis.capabilities().supports_cg_mirrors);
    }

    #[test]
    fn test_unsupported_system_type() {
        let registry = registry(BTreeMap::new());
        let err = registry
            .resolve(&system(SystemType::External, false))
            .err()
            .unwrap();
        assert_eq!(
            err,
            ValidationError::UnsupportedSystemType {
                system_type: "external".into()
            }
        );
    }

    #[test]
    fn test_capability_override() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            SystemType::Unity,
            MirrorCapabilities {
                supports_cg_mirrors: true,
            },
        );
        let registry = registry(overrides);
        let unity = registry.resolve(&system(SystemType::Unity, false)).unwrap();
        assert!(unity.capabilities().supports_cg_mirrors);
    }
}
