use twin_core::{EpochMs, StateId, StateSnapshot};

/// A persisted, timestamped copy of one observed state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub key: String,
    pub id: StateId,
    pub created_ms: EpochMs,
}

pub fn entry_key(state: &StateSnapshot) -> String {
    format!("state_{}_{}", state.created_ms, state.id)
}

/// Durable backend for the state store.
///
/// Timestamped entries and the `latest` alias are written separately so the
/// store can undo the entry when the alias write fails.
pub trait StateStorage: Send + Sync {
    /// Persist a timestamped copy; returns its key.
    fn put_entry(&self, state: &StateSnapshot) -> anyhow::Result<String>;
    fn put_latest(&self, state: &StateSnapshot) -> anyhow::Result<()>;
    fn load_latest(&self) -> anyhow::Result<Option<StateSnapshot>>;
    fn load_entry(&self, key: &str) -> anyhow::Result<Option<StateSnapshot>>;
    fn has_entry(&self, key: &str) -> anyhow::Result<bool>;
    fn list_entries(&self) -> anyhow::Result<Vec<EntryMeta>>;
    /// Removing a missing key is not an error.
    fn remove_entry(&self, key: &str) -> anyhow::Result<()>;
}

impl<T: StateStorage + ?Sized> StateStorage for std::sync::Arc<T> {
    fn put_entry(&self, state: &StateSnapshot) -> anyhow::Result<String> {
        (**self).put_entry(state)
    }
    fn put_latest(&self, state: &StateSnapshot) -> anyhow::Result<()> {
        (**self).put_latest(state)
    }
    fn load_latest(&self) -> anyhow::Result<Option<StateSnapshot>> {
        (**self).load_latest()
    }
    fn load_entry(&self, key: &str) -> anyhow::Result<Option<StateSnapshot>> {
        (**self).load_entry(key)
    }
    fn has_entry(&self, key: &str) -> anyhow::Result<bool> {
        (**self).has_entry(key)
    }
    fn list_entries(&self) -> anyhow::Result<Vec<EntryMeta>> {
        (**self).list_entries()
    }
    fn remove_entry(&self, key: &str) -> anyhow::Result<()> {
        (**self).remove_entry(key)
    }
}
