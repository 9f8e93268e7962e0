pub mod fs;
pub mod memory;
pub mod store;
pub mod traits;

pub use fs::*;
pub use memory::*;
pub use store::*;
pub use traits::*;
