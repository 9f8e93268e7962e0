use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use twin_core::StateSnapshot;

use crate::traits::{entry_key, EntryMeta, StateStorage};

/// In-memory storage for tests. Not durable, but supports failure injection
/// on the `latest` alias.
#[derive(Default)]
pub struct MemoryStateStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, StateSnapshot>,
    latest: Option<StateSnapshot>,
    fail_latest: bool,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make subsequent `put_latest` calls fail.
    pub fn fail_latest_writes(&self, fail: bool) {
        self.lock().fail_latest = fail;
    }

    /// Backdate an entry; returns false if the key is unknown.
    pub fn set_created_ms(&self, key: &str, created_ms: i64) -> bool {
        match self.lock().entries.get_mut(key) {
            Some(e) => {
                e.created_ms = created_ms;
                true
            }
            None => false,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }
}

impl StateStorage for MemoryStateStorage {
    fn put_entry(&self, state: &StateSnapshot) -> anyhow::Result<String> {
        let key = entry_key(state);
        self.lock().entries.insert(key.clone(), state.clone());
        Ok(key)
    }

    fn put_latest(&self, state: &StateSnapshot) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if inner.fail_latest {
            return Err(anyhow!("injected failure writing latest alias"));
        }
        inner.latest = Some(state.clone());
        Ok(())
    }

    fn load_latest(&self) -> anyhow::Result<Option<StateSnapshot>> {
        Ok(self.lock().latest.clone())
    }

    fn load_entry(&self, key: &str) -> anyhow::Result<Option<StateSnapshot>> {
        Ok(self.lock().entries.get(key).cloned())
    }

    fn has_entry(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.lock().entries.contains_key(key))
    }

    fn list_entries(&self) -> anyhow::Result<Vec<EntryMeta>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .map(|(k, s)| EntryMeta {
                key: k.clone(),
                id: s.id.clone(),
                created_ms: s.created_ms,
            })
            .collect())
    }

    fn remove_entry(&self, key: &str) -> anyhow::Result<()> {
        self.lock().entries.remove(key);
        Ok(())
    }
}
