//! Control Plane Configuration
//!
//! YAML document selecting the device gateway backend and overriding the
//! built-in mirror capabilities per array family.
//!
//! ```yaml
//! backends:
//!   name: simulated
//!   simulated:
//!     failingOperations: [pause]
//! capabilities:
//!   unity:
//!     supportsCgMirrors: true
//! ```

use crate::controlplane::backends::BackendConfig;
use crate::controlplane::mirror::MirrorCapabilities;
use crate::domain::model::SystemType;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Configuration for the control plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneConfig {
    /// Device gateway backend
    pub backends: BackendConfig,
    /// Capability overrides by array family
    pub capabilities: BTreeMap<SystemType, MirrorCapabilities>,
}

impl ControlPlaneConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load configuration from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }
}
