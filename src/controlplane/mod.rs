//! Control Plane Module
//!
//! The "brain" that coordinates continuous-copy lifecycles and remote
//! replication across storage-system families.

pub mod backends;
pub mod completion;
pub mod mirror;
pub mod orchestrator;
pub mod registry;
pub mod replication;
pub mod tasks;

pub use backends::*;
pub use completion::*;
pub use mirror::*;
pub use orchestrator::*;
pub use registry::*;
pub use replication::*;
pub use tasks::*;
