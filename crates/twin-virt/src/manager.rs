use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use twin_core::{now_ms, snapshot_label, to_rfc3339, EpochMs, VmId};

use crate::types::{ControlPlane, SnapshotListing, SnapshotRecord};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("virtual machine `{0}` could not be resolved")]
    VmUnresolved(String),
    #[error("control plane failure: {0:#}")]
    ControlPlane(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    pub max_count: usize,
    pub max_age_ms: i64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            max_count: 10,
            max_age_ms: 3_600_000,
        }
    }
}

#[derive(Default)]
struct Inner {
    tracked: Vec<SnapshotRecord>,
}

/// Creates, reverts, deletes and rotates snapshots of one VM.
///
/// Local history covers only snapshots created here and is advisory: the
/// control plane is the source of truth and vanished entries are dropped.
pub struct SnapshotManager {
    plane: Box<dyn ControlPlane>,
    vm_name: String,
    policy: SnapshotPolicy,
    history_path: Option<PathBuf>,
    vm: OnceLock<VmId>,
    inner: Mutex<Inner>,
}

impl SnapshotManager {
    pub fn new(plane: Box<dyn ControlPlane>, vm_name: impl Into<String>, policy: SnapshotPolicy) -> Self {
        let manager = Self {
            plane,
            vm_name: vm_name.into(),
            policy,
            history_path: None,
            vm: OnceLock::new(),
            inner: Mutex::new(Inner::default()),
        };
        if let Err(e) = manager.resolve() {
            warn!(vm = %manager.vm_name, error = %e, "vm not resolved yet; will retry on use");
        }
        manager
    }

    /// Persist local history to `path`, loading any history already there.
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let loaded = load_history(&path)?;
        debug!(path = %path.display(), count = loaded.len(), "loaded snapshot history");
        self.inner
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .tracked = loaded;
        self.history_path = Some(path);
        Ok(self)
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached after the first success; never takes the history lock, so
    /// listings do not queue behind a create or retention pass.
    fn resolve(&self) -> Result<VmId, SnapshotError> {
        if let Some(vm) = self.vm.get() {
            return Ok(vm.clone());
        }
        match self.plane.resolve_vm(&self.vm_name) {
            Ok(Some(vm)) => {
                info!(vm = %self.vm_name, id = %vm, "resolved vm");
                Ok(self.vm.get_or_init(|| vm).clone())
            }
            Ok(None) => Err(SnapshotError::VmUnresolved(self.vm_name.clone())),
            Err(e) => Err(SnapshotError::ControlPlane(e)),
        }
    }

    pub fn vm_id(&self) -> Option<VmId> {
        self.vm.get().cloned()
    }

    pub fn create(&self, label: Option<&str>) -> Result<SnapshotRecord, SnapshotError> {
        self.create_at(label, now_ms())
    }

    /// Take a snapshot, then rotate old ones. The new snapshot is never
    /// rotated away by its own retention pass.
    pub fn create_at(&self, label: Option<&str>, now: EpochMs) -> Result<SnapshotRecord, SnapshotError> {
        let vm = self.resolve()?;
        let mut inner = self.lock();

        let base = label
            .map(str::to_string)
            .unwrap_or_else(|| snapshot_label(now));
        let mut taken: HashSet<String> = inner.tracked.iter().map(|r| r.name.clone()).collect();
        match self.plane.list_snapshots(&vm) {
            Ok(listing) => taken.extend(listing.history.into_iter().map(|s| s.name)),
            Err(e) => debug!(error = %e, "could not list snapshots before create"),
        }
        let name = unique_name(&base, &taken);

        let description = format!("Digital twin snapshot taken {}", to_rfc3339(now));
        self.plane
            .create_snapshot(&vm, &name, &description)
            .map_err(SnapshotError::ControlPlane)?;

        let record = SnapshotRecord {
            name: name.clone(),
            vm_id: vm,
            created_ms: now,
            description: Some(description),
        };
        inner.tracked.push(record.clone());
        info!(snapshot = %name, vm = %self.vm_name, "created snapshot");

        if let Err(e) = self.retain(&mut inner, Some(name.as_str()), now) {
            warn!(error = %e, "snapshot retention failed");
        }
        self.persist(&inner);
        Ok(record)
    }

    pub fn enforce_retention(&self, protect: Option<&str>) -> Result<Vec<String>, SnapshotError> {
        self.enforce_retention_at(protect, now_ms())
    }

    /// Returns the names of evicted snapshots.
    pub fn enforce_retention_at(&self, protect: Option<&str>, now: EpochMs) -> Result<Vec<String>, SnapshotError> {
        let mut inner = self.lock();
        let evicted = self.retain(&mut inner, protect, now)?;
        self.persist(&inner);
        Ok(evicted)
    }

    fn retain(&self, inner: &mut Inner, protect: Option<&str>, now: EpochMs) -> Result<Vec<String>, SnapshotError> {
        let vm = self.resolve()?;
        let listing = self
            .plane
            .list_snapshots(&vm)
            .map_err(SnapshotError::ControlPlane)?;
        let live: HashMap<&str, Option<EpochMs>> = listing
            .history
            .iter()
            .map(|s| (s.name.as_str(), s.created_ms))
            .collect();

        let before = inner.tracked.len();
        inner.tracked.retain(|r| live.contains_key(r.name.as_str()));
        if inner.tracked.len() != before {
            debug!(dropped = before - inner.tracked.len(), "forgot snapshots gone from control plane");
        }

        // Control-plane metadata wins over the locally recorded time.
        let mut candidates: Vec<(EpochMs, String)> = inner
            .tracked
            .iter()
            .map(|r| {
                let created = live.get(r.name.as_str()).copied().flatten();
                (created.unwrap_or(r.created_ms), r.name.clone())
            })
            .collect();
        candidates.sort_by(|a, b| b.cmp(a));

        let mut kept = 0usize;
        let mut evict = Vec::new();
        for (created, name) in candidates {
            if protect == Some(name.as_str()) {
                kept += 1;
                continue;
            }
            let too_old = now - created > self.policy.max_age_ms;
            if too_old || kept >= self.policy.max_count {
                evict.push(name);
            } else {
                kept += 1;
            }
        }

        let mut evicted = Vec::new();
        for name in evict {
            match self.plane.delete_snapshot(&vm, &name) {
                Ok(()) => {
                    info!(snapshot = %name, "rotated out old snapshot");
                    inner.tracked.retain(|r| r.name != name);
                    evicted.push(name);
                }
                Err(e) => warn!(snapshot = %name, error = %e, "failed to delete old snapshot"),
            }
        }
        Ok(evicted)
    }

    /// Revert the VM to `name`. False when the VM has no current snapshot,
    /// the name is unknown, or the control plane fails.
    pub fn revert(&self, name: &str) -> bool {
        let _inner = self.lock();
        let vm = match self.resolve() {
            Ok(vm) => vm,
            Err(e) => {
                warn!(snapshot = name, error = %e, "cannot revert");
                return false;
            }
        };
        let listing = match self.plane.list_snapshots(&vm) {
            Ok(l) => l,
            Err(e) => {
                error!(snapshot = name, error = %e, "listing snapshots failed");
                return false;
            }
        };
        if listing.current.is_none() {
            warn!(snapshot = name, "vm has no current snapshot; refusing to revert");
            return false;
        }
        if !listing.contains(name) {
            warn!(snapshot = name, "no such snapshot");
            return false;
        }
        match self.plane.revert_snapshot(&vm, name) {
            Ok(()) => {
                info!(snapshot = name, "reverted vm");
                true
            }
            Err(e) => {
                error!(snapshot = name, error = %e, "revert failed");
                false
            }
        }
    }

    /// Delete `name`. Unknown names return false and leave history as is.
    pub fn delete(&self, name: &str) -> bool {
        let mut inner = self.lock();
        let vm = match self.resolve() {
            Ok(vm) => vm,
            Err(e) => {
                warn!(snapshot = name, error = %e, "cannot delete");
                return false;
            }
        };
        match self.plane.list_snapshots(&vm) {
            Ok(listing) if listing.contains(name) => {}
            Ok(_) => {
                warn!(snapshot = name, "no such snapshot");
                return false;
            }
            Err(e) => {
                error!(snapshot = name, error = %e, "listing snapshots failed");
                return false;
            }
        }
        match self.plane.delete_snapshot(&vm, name) {
            Ok(()) => {
                inner.tracked.retain(|r| r.name != name);
                self.persist(&inner);
                info!(snapshot = name, "deleted snapshot");
                true
            }
            Err(e) => {
                error!(snapshot = name, error = %e, "delete failed");
                false
            }
        }
    }

    /// Live listing. An unresolved VM yields an empty listing. Does not
    /// wait for a create or retention pass in progress.
    pub fn list_snapshots(&self) -> Result<SnapshotListing, SnapshotError> {
        let vm = match self.resolve() {
            Ok(vm) => vm,
            Err(SnapshotError::VmUnresolved(_)) => return Ok(SnapshotListing::default()),
            Err(e) => return Err(e),
        };
        self.plane
            .list_snapshots(&vm)
            .map_err(SnapshotError::ControlPlane)
    }

    pub fn guest_address(&self) -> Result<Option<String>, SnapshotError> {
        let vm = self.resolve()?;
        self.plane
            .resolve_guest_address(&vm)
            .map_err(SnapshotError::ControlPlane)
    }

    /// Snapshots created by this manager that are believed to still exist.
    pub fn tracked(&self) -> Vec<SnapshotRecord> {
        self.lock().tracked.clone()
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.history_path else { return };
        if let Err(e) = save_history(path, &inner.tracked) {
            warn!(path = %path.display(), error = %e, "could not persist snapshot history");
        }
    }
}

fn unique_name(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn load_history(path: &Path) -> anyhow::Result<Vec<SnapshotRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("decode snapshot history {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("read snapshot history {}", path.display())),
    }
}

fn save_history(path: &Path, records: &[SnapshotRecord]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename onto {}", path.display()))?;
    Ok(())
}
