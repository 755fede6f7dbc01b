//! Error types for the replica orchestrator
//!
//! Three families of failure flow through the control plane:
//!
//! - [`ValidationError`]: a precondition was violated before any device call.
//! - [`DeviceError`]: the device dispatch gateway rejected a call. These never
//!   escape an orchestrator operation as `Err`; they are recorded on the
//!   invocation's tasks instead.
//! - [`Error`]: everything fatal (data store failures, missing entities).

use thiserror::Error;

use crate::domain::model::{EntityKind, SyncState};

/// Precondition failures detected before dispatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Continuous copy {mirror} with sync state {state} cannot be paused (source volume {source_volume})")]
    CannotPause {
        mirror: String,
        state: SyncState,
        source_volume: String,
    },

    #[error("Continuous copy {mirror} is {state} and cannot be paused while resynchronizing (source volume {source_volume})")]
    CannotPauseWhileResynchronizing {
        mirror: String,
        state: SyncState,
        source_volume: String,
    },

    #[error("Continuous copy {mirror} with sync state {state} cannot be resumed (source volume {source_volume})")]
    CannotResume {
        mirror: String,
        state: SyncState,
        source_volume: String,
    },

    #[error("Continuous copy {mirror} is inactive (source volume {source_volume})")]
    MirrorInactive {
        mirror: String,
        source_volume: String,
    },

    #[error("Continuous copy {mirror} does not belong to source volume {source_volume}")]
    MirrorNotOfSource {
        mirror: String,
        source_volume: String,
    },

    #[error("Volumes in a consistency group support exactly one continuous copy per request, {requested} requested")]
    InvalidMirrorCountForConsistencyGroup { requested: u32 },

    #[error("Continuous copy count must be at least one")]
    InvalidMirrorCount,

    #[error("Volume {volume} is in consistency group {consistency_group}; {system_type} does not support continuous copies for consistency group volumes")]
    ConsistencyGroupMirrorsUnsupported {
        volume: String,
        consistency_group: String,
        system_type: String,
    },

    #[error("Remote replication operation {operation} is not allowed on {element_type} {element}: {reason}")]
    ReplicationOperationNotAllowed {
        element_type: String,
        element: String,
        operation: String,
        reason: String,
    },

    #[error("Replication mode change to {mode} is not allowed on {element_type} {element}: {reason}")]
    ReplicationModeChangeNotAllowed {
        element_type: String,
        element: String,
        mode: String,
        reason: String,
    },

    #[error("No orchestrator is registered for storage system type {system_type}")]
    UnsupportedSystemType { system_type: String },
}

impl ValidationError {
    /// Identifier of the resource the error names, if any
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            ValidationError::CannotPause { mirror, .. }
            | ValidationError::CannotPauseWhileResynchronizing { mirror, .. }
            | ValidationError::CannotResume { mirror, .. }
            | ValidationError::MirrorInactive { mirror, .. }
            | ValidationError::MirrorNotOfSource { mirror, .. } => Some(mirror),
            ValidationError::ConsistencyGroupMirrorsUnsupported { volume, .. } => Some(volume),
            ValidationError::ReplicationOperationNotAllowed { element, .. }
            | ValidationError::ReplicationModeChangeNotAllowed { element, .. } => Some(element),
            ValidationError::InvalidMirrorCountForConsistencyGroup { .. }
            | ValidationError::InvalidMirrorCount
            | ValidationError::UnsupportedSystemType { .. } => None,
        }
    }
}

/// Failure reported by a device dispatch gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{system}: {operation} failed: {message}")]
pub struct DeviceError {
    pub system: String,
    pub operation: String,
    pub message: String,
}

impl DeviceError {
    pub fn new(
        system: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Data Store Errors
    // =========================================================================
    #[error("Data store error: {0}")]
    DataStore(String),

    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: EntityKind, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    ResourceExists { kind: EntityKind, id: String },

    #[error("Task not found: {kind}/{id} operation {op_id}")]
    TaskNotFound {
        kind: EntityKind,
        id: String,
        op_id: String,
    },

    #[error("Task {op_id} on {kind}/{id} is already {state}")]
    TaskAlreadyTerminal {
        kind: EntityKind,
        id: String,
        op_id: String,
        state: String,
    },

    #[error("Entity {id} has kind {actual}, expected {expected}")]
    KindMismatch {
        id: String,
        expected: EntityKind,
        actual: EntityKind,
    },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Rollback of {entity} failed: {reason}")]
    RollbackFailed { entity: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a caller (workflow engine) should do with an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Resubmitting the same request may succeed
    Retry,
    /// The request itself is wrong; resubmitting will fail the same way
    NoRetry,
    /// The control plane state is suspect; stop and investigate
    Fatal,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Device failures are a workflow-level retry concern
            Error::Device(_) => ErrorAction::Retry,

            Error::Validation(_)
            | Error::Configuration(_)
            | Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::TaskAlreadyTerminal { .. }
            | Error::KindMismatch { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRetry,

            Error::DataStore(_)
            | Error::TaskNotFound { .. }
            | Error::RollbackFailed { .. }
            | Error::Internal(_)
            | Error::Metrics(_)
            | Error::Io(_) => ErrorAction::Fatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.action(), ErrorAction::Retry)
    }

    /// Check if this error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Validation(ValidationError::InvalidMirrorCountForConsistencyGroup {
            requested: 2,
        });
        assert_eq!(err.action(), ErrorAction::NoRetry);
        assert!(err.is_validation());

        let err = Error::DataStore("write timed out".into());
        assert_eq!(err.action(), ErrorAction::Fatal);

        let err = Error::Device(DeviceError::new("vmax-1", "pause", "link down"));
        assert_eq!(err.action(), ErrorAction::Retry);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_error_names_resource() {
        let err = ValidationError::CannotPause {
            mirror: "mirror-1".into(),
            state: SyncState::Fractured,
            source_volume: "vol-1".into(),
        };
        assert_eq!(err.resource_id(), Some("mirror-1"));
        let text = err.to_string();
        assert!(text.contains("mirror-1"));
        assert!(text.contains("FRACTURED"));
        assert!(text.contains("vol-1"));
    }

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::new("vnx-2", "detach", "array busy");
        assert_eq!(err.to_string(), "vnx-2: detach failed: array busy");
    }
}
