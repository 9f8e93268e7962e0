//! Hand a generated service configuration to an external apply tool.

pub mod ansible;
pub mod inventory;
pub mod probe;
pub mod testing;
pub mod tool;

pub use ansible::*;
pub use inventory::*;
pub use probe::*;
pub use tool::*;
