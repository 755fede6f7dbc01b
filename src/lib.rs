//! Replica Orchestrator - Continuous-Copy & Remote-Replication Control Plane
//!
//! Plans, validates and dispatches array-side mirror operations (attach,
//! detach, pause, resume, establish, deactivate) and remote replication
//! group failback, tracking every asynchronous device operation as a task.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Control Plane                                   │
//! │         resolve volume → storage system → registered orchestrator           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐  ┌─────────────────────┐  ┌─────────────────────┐  │
//! │  │  Mirror Orchestrator │  │ Replication         │  │  Device Completion  │  │
//! │  │  (per array family)  │  │ Coordinator         │  │  (out of band)      │  │
//! │  └──────────┬───────────┘  └──────────┬──────────┘  └──────────┬──────────┘  │
//! │             └─────────────────────────┼────────────────────────┘             │
//! │                          ┌────────────┴────────────┐                         │
//! │                          │      Task Tracker       │                         │
//! │                          └────────────┬────────────┘                         │
//! ├───────────────────────────────────────┼─────────────────────────────────────┤
//! │  ┌─────────────────────────────┐      │     ┌─────────────────────────────┐  │
//! │  │     Data Store (port)       │◄─────┴────►│    Device Gateway (port)    │  │
//! │  └─────────────────────────────┘            └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrators, task tracking, gateway backends
//! - [`domain`]: Topology model and port traits
//! - [`store`]: In-memory data store and topology seeding
//! - [`config`]: YAML configuration
//! - [`metrics`]: Prometheus counters
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use config::ControlPlaneConfig;

pub use controlplane::{
    AttachRequest, BackendConfig, BackendFactory, BlockMirrorOrchestrator, ControlPlane,
    ControlPlaneStatus, DeviceCompletion, MirrorCapabilities, MirrorOrchestrator, MirrorRequest,
    OperationOutcome, OrchestratorRegistry, PauseRequest, ReplicationCoordinator,
    ReplicationElement, SimulatedGateway, SingleMirrorRequest, TaskTracker,
};

pub use domain::model::{
    ConsistencyGroup, EntityId, EntityKind, Mirror, MirrorState, ReplicationGroup,
    ReplicationOperation, ReplicationPair, ReplicationSet, StorageSystem, SyncState, SystemType,
    Task, TaskKey, TaskList, TaskState, Volume,
};

pub use domain::ports::{DataStore, DeviceGateway, GatewayOperation, Repository};

pub use error::{DeviceError, Error, ErrorAction, Result, ValidationError};

pub use metrics::ControlPlaneMetrics;

pub use store::{InMemoryDataStore, TopologySeed};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
