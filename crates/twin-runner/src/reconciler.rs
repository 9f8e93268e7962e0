//! The reconciliation controller: save, diff, snapshot, project, apply.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use twin_apply::{ApplyError, ApplyOutput, ApplyTool, Inventory, ReachabilityProbe};
use twin_core::{generate, DiffResult, StateId, Tree, ValidationError};
use twin_storage::{HistoryEntry, StateStore, StoreError};
use twin_virt::{SnapshotError, SnapshotListing, SnapshotManager};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("projection failed: {0}")]
    Projection(#[from] ValidationError),
    #[error("rendering service config failed: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("saved state {0} is no longer the latest")]
    StateVanished(StateId),
    #[error("vm has no reachable guest address")]
    NoGuestAddress,
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Saving,
    Diffing,
    Snapshotting,
    Projecting,
    Applying,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub current_id: Option<StateId>,
    pub previous_id: Option<StateId>,
    /// Snapshot the twin was last successfully configured from.
    pub current_snapshot: Option<String>,
    pub in_progress: bool,
    pub phase: Phase,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    NoChanges {
        id: StateId,
    },
    Updated {
        id: StateId,
        snapshot: String,
        diff: DiffResult,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<StateId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
        reason: String,
    },
}

impl ReconcileOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ReconcileOutcome::Error { .. })
    }

    pub fn id(&self) -> Option<&StateId> {
        match self {
            ReconcileOutcome::NoChanges { id } | ReconcileOutcome::Updated { id, .. } => Some(id),
            ReconcileOutcome::Error { id, .. } => id.as_ref(),
        }
    }
}

/// How to reach the guest when applying.
#[derive(Clone, Debug)]
pub struct ApplySettings {
    pub user: String,
    pub ssh_key: PathBuf,
    pub timeout: Duration,
}

pub struct Reconciler {
    store: StateStore,
    snapshots: SnapshotManager,
    apply: Box<dyn ApplyTool>,
    probe: Option<Box<dyn ReachabilityProbe>>,
    settings: ApplySettings,
    /// Held for the whole of a reconciliation, revert or delete.
    run_lock: Mutex<()>,
    state: Mutex<ReconciliationState>,
}

/// Marks the reconciliation as running; resets to idle however it ends.
struct InProgress<'a> {
    state: &'a Mutex<ReconciliationState>,
}

impl<'a> InProgress<'a> {
    fn begin(state: &'a Mutex<ReconciliationState>) -> Self {
        let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
        s.in_progress = true;
        s.phase = Phase::Saving;
        drop(s);
        Self { state }
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.in_progress = false;
        s.phase = Phase::Idle;
    }
}

impl Reconciler {
    pub fn new(
        store: StateStore,
        snapshots: SnapshotManager,
        apply: Box<dyn ApplyTool>,
        probe: Option<Box<dyn ReachabilityProbe>>,
        settings: ApplySettings,
    ) -> Self {
        let initial = ReconciliationState {
            current_id: store.current_id(),
            ..ReconciliationState::default()
        };
        Self {
            store,
            snapshots,
            apply,
            probe,
            settings,
            run_lock: Mutex::new(()),
            state: Mutex::new(initial),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReconciliationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.run_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Handle one observed state. Blocks until any reconciliation already
    /// running has finished. Never panics on collaborator failure; every
    /// failure is reported as [`ReconcileOutcome::Error`].
    pub fn on_observed_state(&self, payload: Tree, source_id: &str) -> ReconcileOutcome {
        let _exclusive = self.exclusive();
        let _running = InProgress::begin(&self.state);

        let id = match self.store.save(payload, source_id) {
            Ok(id) => id,
            Err(e) => return self.failed(None, None, e.into()),
        };
        {
            let mut s = self.state();
            s.current_id = Some(id.clone());
            s.previous_id = self.store.previous_id();
            s.phase = Phase::Diffing;
        }

        let (changed, diff) = match self.store.compare(&id) {
            Ok(r) => r,
            Err(e) => return self.failed(Some(id), None, e.into()),
        };
        if !changed {
            info!(id = %id.short(), "state unchanged");
            return ReconcileOutcome::NoChanges { id };
        }
        info!(id = %id.short(), changes = diff.len(), initial = diff.initial, "state changed");

        self.set_phase(Phase::Snapshotting);
        let snapshot = match self.snapshots.create(None) {
            Ok(record) => record.name,
            Err(e) => return self.failed(Some(id), None, e.into()),
        };

        match self.project_and_apply(&id) {
            Ok(_) => {
                self.state().current_snapshot = Some(snapshot.clone());
                info!(id = %id.short(), snapshot = %snapshot, "twin updated");
                ReconcileOutcome::Updated { id, snapshot, diff }
            }
            Err(e) => self.failed(Some(id), Some(snapshot), e),
        }
    }

    fn project_and_apply(&self, id: &StateId) -> Result<ApplyOutput, ReconcileError> {
        self.set_phase(Phase::Projecting);
        let state = self
            .store
            .latest()
            .filter(|s| &s.id == id)
            .ok_or_else(|| ReconcileError::StateVanished(id.clone()))?;
        let artifact = generate(&state)?.to_yaml()?;

        self.set_phase(Phase::Applying);
        let address = self
            .snapshots
            .guest_address()?
            .ok_or(ReconcileError::NoGuestAddress)?;
        if let Some(probe) = &self.probe {
            if !probe.is_reachable(&address) {
                return Err(ApplyError::Unreachable(address).into());
            }
        }
        let inventory = Inventory::new(address, &self.settings.user, &self.settings.ssh_key);
        Ok(self.apply.apply(&artifact, &inventory, self.settings.timeout)?)
    }

    fn failed(&self, id: Option<StateId>, snapshot: Option<String>, err: ReconcileError) -> ReconcileOutcome {
        let reason = err.to_string();
        match &id {
            Some(id) => error!(id = %id.short(), snapshot = ?snapshot, %reason, "reconciliation failed"),
            None => warn!(%reason, "observed state rejected"),
        }
        ReconcileOutcome::Error { id, snapshot, reason }
    }

    /// Does not wait for a running reconciliation.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, ReconcileError> {
        Ok(self.store.history(limit)?)
    }

    pub fn list_snapshots(&self) -> Result<SnapshotListing, ReconcileError> {
        Ok(self.snapshots.list_snapshots()?)
    }

    pub fn revert(&self, name: &str) -> bool {
        let _exclusive = self.exclusive();
        let ok = self.snapshots.revert(name);
        if ok {
            self.state().current_snapshot = Some(name.to_string());
        }
        ok
    }

    pub fn delete(&self, name: &str) -> bool {
        let _exclusive = self.exclusive();
        let ok = self.snapshots.delete(name);
        if ok {
            let mut s = self.state();
            if s.current_snapshot.as_deref() == Some(name) {
                s.current_snapshot = None;
            }
        }
        ok
    }

    pub fn status(&self) -> ReconciliationState {
        self.state().clone()
    }
}
