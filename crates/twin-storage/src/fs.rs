use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use twin_core::{StateId, StateSnapshot};

use crate::traits::{entry_key, EntryMeta, StateStorage};

pub const LATEST_FILE: &str = "state_latest.json";
const ENTRY_PREFIX: &str = "state_";
const ENTRY_SUFFIX: &str = ".json";

/// One JSON file per state: `state_<created_ms>_<id>.json`, plus the
/// `state_latest.json` alias.
#[derive(Clone)]
pub struct FsStateStorage {
    pub root: PathBuf,
}

impl FsStateStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create state dir {}", root.display()))?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{ENTRY_SUFFIX}"))
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }

    fn read(path: &Path) -> Result<Option<StateSnapshot>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let state = serde_json::from_slice(&bytes)
            .with_context(|| format!("decode {}", path.display()))?;
        Ok(Some(state))
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename onto {}", path.display()))?;
    Ok(())
}

fn parse_key(key: &str) -> Option<EntryMeta> {
    let rest = key.strip_prefix(ENTRY_PREFIX)?;
    let (ms, id) = rest.split_once('_')?;
    if id.is_empty() {
        return None;
    }
    Some(EntryMeta {
        key: key.to_string(),
        id: StateId::from_str(id),
        created_ms: ms.parse().ok()?,
    })
}

impl StateStorage for FsStateStorage {
    fn put_entry(&self, state: &StateSnapshot) -> Result<String> {
        let key = entry_key(state);
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.entry_path(&key), &bytes)?;
        Ok(key)
    }

    fn put_latest(&self, state: &StateSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.latest_path(), &bytes)
    }

    fn load_latest(&self) -> Result<Option<StateSnapshot>> {
        Self::read(&self.latest_path())
    }

    fn load_entry(&self, key: &str) -> Result<Option<StateSnapshot>> {
        Self::read(&self.entry_path(key))
    }

    fn has_entry(&self, key: &str) -> Result<bool> {
        let path = self.entry_path(key);
        path.try_exists()
            .with_context(|| format!("stat {}", path.display()))
    }

    fn list_entries(&self) -> Result<Vec<EntryMeta>> {
        let mut out = Vec::new();
        let dir = std::fs::read_dir(&self.root)
            .with_context(|| format!("list {}", self.root.display()))?;
        for entry in dir {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == LATEST_FILE {
                continue;
            }
            let Some(key) = name.strip_suffix(ENTRY_SUFFIX) else { continue };
            match parse_key(key) {
                Some(meta) => out.push(meta),
                None => debug!(file = name, "ignoring unrecognised file in state dir"),
            }
        }
        Ok(out)
    }

    fn remove_entry(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}
