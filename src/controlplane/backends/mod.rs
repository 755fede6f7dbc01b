//! Device Gateway Backends
//!
//! Implementations of the [`DeviceGateway`] port:
//! - Simulated: records dispatches in process, with failure injection

pub mod simulated;

pub use simulated::*;

use crate::domain::ports::DeviceGatewayRef;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Factory for creating device gateways
pub struct BackendFactory;

impl BackendFactory {
    /// Create a gateway by backend name
    pub fn create(name: &str, config: &BackendConfig) -> Result<DeviceGatewayRef> {
        match name.to_lowercase().as_str() {
            "simulated" | "loopback" => Ok(Arc::new(SimulatedGateway::new(config.simulated.clone()))),
            other => Err(Error::Configuration(format!(
                "unsupported device gateway backend: {}",
                other
            ))),
        }
    }
}

/// Combined backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Backend used for every storage system
    pub name: String,
    pub simulated: SimulatedGatewayConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: "simulated".to_string(),
            simulated: SimulatedGatewayConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_selects_backend_by_name() {
        let config = BackendConfig::default();
        let gateway = BackendFactory::create("Simulated", &config).unwrap();
        assert_eq!(gateway.backend_name(), "simulated");

        assert!(matches!(
            BackendFactory::create("smis", &config),
            Err(Error::Configuration(_))
        ));
    }
}
