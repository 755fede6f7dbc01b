//! Domain layer - Topology model and port definitions
//!
//! This module defines the entities the control plane reasons about and the
//! traits (ports) that storage and device adapters implement, following
//! hexagonal architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
