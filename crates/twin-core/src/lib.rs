//! Shared model for the digital-twin engine: the observed-state tree, its
//! fingerprint and diff, ingress validation, and the service projection.

pub mod diff;
pub mod hashing;
pub mod ids;
pub mod model;
pub mod projector;
pub mod time;
pub mod tree;
pub mod validate;

pub use diff::*;
pub use hashing::*;
pub use ids::*;
pub use model::*;
pub use projector::*;
pub use time::*;
pub use tree::*;
pub use validate::*;
