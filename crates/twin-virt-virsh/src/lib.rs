mod parse;
mod virsh;

pub use virsh::VirshControlPlane;
