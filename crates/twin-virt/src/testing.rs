//! Deterministic in-memory control plane for tests and local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use twin_core::{now_ms, EpochMs, VmId};

use crate::types::{ControlPlane, SnapshotListing, SnapshotMeta};

#[derive(Clone, Debug)]
struct MemSnapshot {
    name: String,
    created_ms: EpochMs,
    description: Option<String>,
}

#[derive(Default)]
struct Vm {
    snapshots: Vec<MemSnapshot>,
    current: Option<String>,
    address: Option<String>,
}

#[derive(Default)]
struct PlaneInner {
    names: BTreeMap<String, VmId>,
    vms: BTreeMap<VmId, Vm>,
    clock_ms: EpochMs,
    omit_metadata: bool,
    failing: BTreeSet<String>,
    creates: usize,
}

/// Snapshot timestamps come from a settable clock that advances one second
/// per create.
#[derive(Default)]
pub struct MemoryControlPlane {
    inner: Mutex<PlaneInner>,
}

impl MemoryControlPlane {
    /// Clock starts at the current wall time.
    pub fn new() -> Self {
        let plane = Self::default();
        plane.set_clock(now_ms());
        plane
    }

    pub fn with_vm(self, name: &str, id: &str) -> Self {
        {
            let mut inner = self.lock();
            let id = VmId::from_str(id);
            inner.names.insert(name.to_string(), id.clone());
            inner.vms.entry(id).or_default();
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, PlaneInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_clock(&self, ms: EpochMs) {
        self.lock().clock_ms = ms;
    }

    /// Stop reporting creation times, like a control plane without metadata.
    pub fn omit_metadata(&self, omit: bool) {
        self.lock().omit_metadata = omit;
    }

    /// Make the named operation (`create`, `list`, `revert`, `delete`,
    /// `resolve`, `address`) fail.
    pub fn fail(&self, op: &str, failing: bool) {
        let mut inner = self.lock();
        if failing {
            inner.failing.insert(op.to_string());
        } else {
            inner.failing.remove(op);
        }
    }

    pub fn set_address(&self, vm: &str, address: &str) {
        let mut inner = self.lock();
        if let Some(id) = inner.names.get(vm).cloned() {
            inner.vms.entry(id).or_default().address = Some(address.to_string());
        }
    }

    /// Add a snapshot behind the manager's back.
    pub fn insert_snapshot(&self, vm: &str, name: &str, created_ms: EpochMs) {
        let mut inner = self.lock();
        if let Some(id) = inner.names.get(vm).cloned() {
            inner.vms.entry(id).or_default().snapshots.push(MemSnapshot {
                name: name.to_string(),
                created_ms,
                description: None,
            });
        }
    }

    /// Remove a snapshot behind the manager's back.
    pub fn forget_snapshot(&self, vm: &str, name: &str) {
        let mut inner = self.lock();
        if let Some(id) = inner.names.get(vm).cloned() {
            if let Some(state) = inner.vms.get_mut(&id) {
                state.snapshots.retain(|s| s.name != name);
                if state.current.as_deref() == Some(name) {
                    state.current = None;
                }
            }
        }
    }

    pub fn snapshot_names(&self, vm: &str) -> Vec<String> {
        let inner = self.lock();
        inner
            .names
            .get(vm)
            .and_then(|id| inner.vms.get(id))
            .map(|state| state.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn current(&self, vm: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .names
            .get(vm)
            .and_then(|id| inner.vms.get(id))
            .and_then(|state| state.current.clone())
    }

    /// Number of successful creates so far.
    pub fn creates(&self) -> usize {
        self.lock().creates
    }
}

fn check(inner: &PlaneInner, op: &str) -> Result<()> {
    if inner.failing.contains(op) {
        bail!("injected {op} failure");
    }
    Ok(())
}

fn vm_mut<'a>(inner: &'a mut PlaneInner, vm: &VmId) -> Result<&'a mut Vm> {
    inner.vms.get_mut(vm).ok_or_else(|| anyhow!("unknown vm {vm}"))
}

impl ControlPlane for MemoryControlPlane {
    fn resolve_vm(&self, name: &str) -> Result<Option<VmId>> {
        let inner = self.lock();
        check(&inner, "resolve")?;
        Ok(inner.names.get(name).cloned())
    }

    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> Result<()> {
        let mut inner = self.lock();
        check(&inner, "create")?;
        let created_ms = inner.clock_ms;
        let state = vm_mut(&mut inner, vm)?;
        if state.snapshots.iter().any(|s| s.name == name) {
            bail!("snapshot {name} already exists");
        }
        state.snapshots.push(MemSnapshot {
            name: name.to_string(),
            created_ms,
            description: Some(description.to_string()),
        });
        state.current = Some(name.to_string());
        inner.clock_ms += 1_000;
        inner.creates += 1;
        Ok(())
    }

    fn list_snapshots(&self, vm: &VmId) -> Result<SnapshotListing> {
        let mut inner = self.lock();
        check(&inner, "list")?;
        let omit = inner.omit_metadata;
        let state = vm_mut(&mut inner, vm)?;
        Ok(SnapshotListing {
            current: state.current.clone(),
            history: state
                .snapshots
                .iter()
                .map(|s| SnapshotMeta {
                    name: s.name.clone(),
                    created_ms: (!omit).then_some(s.created_ms),
                    description: s.description.clone(),
                })
                .collect(),
        })
    }

    fn revert_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        let mut inner = self.lock();
        check(&inner, "revert")?;
        let state = vm_mut(&mut inner, vm)?;
        if !state.snapshots.iter().any(|s| s.name == name) {
            bail!("no snapshot {name}");
        }
        state.current = Some(name.to_string());
        Ok(())
    }

    fn delete_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        let mut inner = self.lock();
        check(&inner, "delete")?;
        let state = vm_mut(&mut inner, vm)?;
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.name != name);
        if state.snapshots.len() == before {
            bail!("no snapshot {name}");
        }
        if state.current.as_deref() == Some(name) {
            state.current = None;
        }
        Ok(())
    }

    fn resolve_guest_address(&self, vm: &VmId) -> Result<Option<String>> {
        let mut inner = self.lock();
        check(&inner, "address")?;
        Ok(vm_mut(&mut inner, vm)?.address.clone())
    }
}
