//! The state store: validated, fingerprinted, time-ordered copies of every
//! observed state plus a `latest` alias, with bounded retention.

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use twin_core::{
    fingerprint, now_ms, to_rfc3339, validate_state, DiffResult, EpochMs, StateId,
    StateSnapshot, Tree, ValidationError,
};

use crate::traits::{entry_key, EntryMeta, StateStorage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("state storage failure: {0:#}")]
    Storage(anyhow::Error),
    #[error("unknown state id {0}")]
    UnknownState(StateId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_ms: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 10,
            max_age_ms: 3_600_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: StateId,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub created_ms: EpochMs,
    #[serde(rename = "current")]
    pub is_current: bool,
}

#[derive(Default)]
struct Inner {
    current: Option<StateSnapshot>,
    previous: Option<StateSnapshot>,
}

pub struct StateStore {
    backend: Box<dyn StateStorage>,
    policy: RetentionPolicy,
    inner: Mutex<Inner>,
}

impl StateStore {
    /// Open over `backend`, resuming from its `latest` alias if present.
    /// An unreadable alias is logged and the store starts without a baseline.
    pub fn open(backend: Box<dyn StateStorage>, policy: RetentionPolicy) -> Self {
        let current = match backend.load_latest() {
            Ok(current) => current,
            Err(e) => {
                error!(error = %format!("{e:#}"), "could not load latest state; starting without a baseline");
                None
            }
        };
        if let Some(c) = &current {
            info!(id = %c.id.short(), "resuming from latest stored state");
        }
        Self {
            backend,
            policy,
            inner: Mutex::new(Inner {
                current,
                previous: None,
            }),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn save(&self, payload: Tree, source_id: &str) -> Result<StateId, StoreError> {
        self.save_at(payload, source_id, now_ms())
    }

    /// Validate and persist `payload`, making it the latest state.
    ///
    /// Either both the timestamped entry and the alias are written, or
    /// neither is. Retention runs afterwards and never fails the save.
    pub fn save_at(&self, payload: Tree, source_id: &str, now: EpochMs) -> Result<StateId, StoreError> {
        validate_state(&payload)?;
        let snapshot = StateSnapshot {
            id: fingerprint(&payload),
            payload,
            created_ms: now,
            source_id: source_id.to_string(),
        };

        let mut inner = self.lock();
        // Same payload in the same millisecond maps to an entry already committed.
        let existed = self
            .backend
            .has_entry(&entry_key(&snapshot))
            .map_err(StoreError::Storage)?;
        let key = self.backend.put_entry(&snapshot).map_err(StoreError::Storage)?;
        if let Err(e) = self.backend.put_latest(&snapshot) {
            if existed {
                return Err(StoreError::Storage(e));
            }
            if let Err(undo) = self.backend.remove_entry(&key) {
                warn!(key = %key, error = %undo, "could not remove entry after alias failure");
            }
            return Err(StoreError::Storage(e));
        }

        let id = snapshot.id.clone();
        inner.previous = inner.current.replace(snapshot);
        if let Err(e) = self.sweep(now, &key) {
            warn!(error = %e, "state retention sweep failed");
        }
        info!(id = %id.short(), source = source_id, "stored observed state");
        Ok(id)
    }

    fn sorted_entries(&self) -> anyhow::Result<Vec<EntryMeta>> {
        let mut entries = self.backend.list_entries()?;
        entries.sort_by(|a, b| {
            b.created_ms
                .cmp(&a.created_ms)
                .then_with(|| b.key.cmp(&a.key))
        });
        Ok(entries)
    }

    /// Drop entries beyond `max_count` or older than `max_age_ms`. The entry
    /// just written is always kept and counted first.
    fn sweep(&self, now: EpochMs, fresh_key: &str) -> anyhow::Result<()> {
        let mut entries = self.sorted_entries()?;
        if let Some(pos) = entries.iter().position(|e| e.key == fresh_key) {
            let fresh = entries.remove(pos);
            entries.insert(0, fresh);
        }
        for (rank, e) in entries.iter().enumerate().skip(1) {
            let too_many = rank >= self.policy.max_count;
            let too_old = now - e.created_ms > self.policy.max_age_ms;
            if too_many || too_old {
                self.backend.remove_entry(&e.key)?;
                debug!(key = %e.key, too_many, too_old, "evicted stored state");
            }
        }
        Ok(())
    }

    /// Diff the current state against its predecessor.
    ///
    /// Returns `(changed, diff)`. With no predecessor the state counts as
    /// changed and the diff carries the initial marker.
    pub fn compare(&self, id: &StateId) -> Result<(bool, DiffResult), StoreError> {
        let inner = self.lock();
        let current = inner
            .current
            .as_ref()
            .filter(|c| &c.id == id)
            .ok_or_else(|| StoreError::UnknownState(id.clone()))?;
        let Some(previous) = inner.previous.as_ref() else {
            return Ok((true, DiffResult::initial_state()));
        };
        if previous.id == current.id {
            return Ok((false, DiffResult::default()));
        }
        let diff = DiffResult::compute(&previous.payload, &current.payload);
        Ok((!diff.is_empty(), diff))
    }

    /// Newest first, at most `limit` entries.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        let current = self.current_id();
        let entries = self.sorted_entries().map_err(StoreError::Storage)?;
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| HistoryEntry {
                is_current: current.as_ref() == Some(&e.id),
                timestamp: to_rfc3339(e.created_ms),
                created_ms: e.created_ms,
                id: e.id,
            })
            .collect())
    }

    pub fn latest(&self) -> Option<StateSnapshot> {
        self.lock().current.clone()
    }

    pub fn current_id(&self) -> Option<StateId> {
        self.lock().current.as_ref().map(|c| c.id.clone())
    }

    pub fn previous_id(&self) -> Option<StateId> {
        self.lock().previous.as_ref().map(|p| p.id.clone())
    }

    /// Look up a retained state by id.
    pub fn get(&self, id: &StateId) -> Result<Option<StateSnapshot>, StoreError> {
        {
            let inner = self.lock();
            for s in [&inner.current, &inner.previous].into_iter().flatten() {
                if &s.id == id {
                    return Ok(Some(s.clone()));
                }
            }
        }
        let entries = self.sorted_entries().map_err(StoreError::Storage)?;
        match entries.into_iter().find(|e| &e.id == id) {
            Some(e) => self.backend.load_entry(&e.key).map_err(StoreError::Storage),
            None => Ok(None),
        }
    }
}
