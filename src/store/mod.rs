//! Data Store Implementations
//!
//! The in-memory store backs the binary and the test suite; the persistence
//! engine behind a production deployment implements the same
//! [`DataStore`](crate::domain::ports::DataStore) port.

mod memory;
pub mod seed;

pub use memory::InMemoryDataStore;
pub use seed::TopologySeed;
