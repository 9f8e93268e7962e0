pub mod config;
pub mod context;
pub mod reconciler;

pub use config::*;
pub use context::*;
pub use reconciler::*;
