//! Snapshot lifecycle for the twin VM on top of a narrow control-plane
//! contract.

pub mod contract;
pub mod manager;
pub mod testing;
pub mod types;

pub use contract::*;
pub use manager::*;
pub use types::*;
