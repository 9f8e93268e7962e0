use anyhow::Result;
use serde::{Deserialize, Serialize};
use twin_core::{EpochMs, VmId};

/// Snapshot as reported by the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    /// Absent when the control plane keeps no creation metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_ms: Option<EpochMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotListing {
    pub current: Option<String>,
    pub history: Vec<SnapshotMeta>,
}

impl SnapshotListing {
    pub fn contains(&self, name: &str) -> bool {
        self.history.iter().any(|s| s.name == name)
    }
}

/// A snapshot this engine created, as tracked locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub vm_id: VmId,
    pub created_ms: EpochMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Operations the engine needs from the virtualization control plane.
pub trait ControlPlane: Send + Sync {
    /// `Ok(None)` when no VM with that name exists.
    fn resolve_vm(&self, name: &str) -> Result<Option<VmId>>;

    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> Result<()>;

    fn list_snapshots(&self, vm: &VmId) -> Result<SnapshotListing>;

    fn revert_snapshot(&self, vm: &VmId, name: &str) -> Result<()>;

    fn delete_snapshot(&self, vm: &VmId, name: &str) -> Result<()>;

    /// First address the guest reports, if any.
    fn resolve_guest_address(&self, vm: &VmId) -> Result<Option<String>>;
}

impl<T: ControlPlane + ?Sized> ControlPlane for std::sync::Arc<T> {
    fn resolve_vm(&self, name: &str) -> Result<Option<VmId>> {
        (**self).resolve_vm(name)
    }
    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> Result<()> {
        (**self).create_snapshot(vm, name, description)
    }
    fn list_snapshots(&self, vm: &VmId) -> Result<SnapshotListing> {
        (**self).list_snapshots(vm)
    }
    fn revert_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        (**self).revert_snapshot(vm, name)
    }
    fn delete_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        (**self).delete_snapshot(vm, name)
    }
    fn resolve_guest_address(&self, vm: &VmId) -> Result<Option<String>> {
        (**self).resolve_guest_address(vm)
    }
}
