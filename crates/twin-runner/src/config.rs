use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use twin_core::MS_PER_SECOND;
use twin_storage::RetentionPolicy;
use twin_virt::SnapshotPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/twin/twin.toml";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vm: VmConfig,
    pub store: StoreConfig,
    pub snapshots: SnapshotsConfig,
    pub apply: ApplyConfig,
    pub daemon: DaemonConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub name: String,
    pub libvirt_uri: String,
    pub user: String,
    pub ssh_key: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: "digital-twin-vm".to_string(),
            libvirt_uri: "qemu:///system".to_string(),
            user: "root".to_string(),
            ssh_key: "~/.ssh/id_rsa".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub state_dir: String,
    pub max_count: usize,
    pub max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: "/var/lib/twin/states".to_string(),
            max_count: 10,
            max_age_secs: 3600,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub max_count: usize,
    pub max_age_secs: u64,
    /// Where to keep local snapshot history across restarts.
    pub history_file: Option<String>,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            max_age_secs: 3600,
            history_file: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    pub program: String,
    pub playbook: String,
    pub work_dir: String,
    pub timeout_secs: u64,
    pub extra_args: Vec<String>,
    pub probe_enabled: bool,
    pub probe_port: u16,
    pub probe_timeout_secs: u64,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            program: "ansible-playbook".to_string(),
            playbook: "/etc/twin/apply_services.yml".to_string(),
            work_dir: "/var/lib/twin/apply".to_string(),
            timeout_secs: 120,
            extra_args: Vec::new(),
            probe_enabled: false,
            probe_port: 22,
            probe_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:5678".to_string(),
        }
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs)
        .unwrap_or(i64::MAX / MS_PER_SECOND)
        .saturating_mul(MS_PER_SECOND)
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    /// Like [`Config::load_from`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from(path);
        }
        info!(path = %path.display(), "no config file; using defaults");
        Ok(Self::default())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        expand_path(&self.store.state_dir)
    }

    pub fn ssh_key(&self) -> PathBuf {
        expand_path(&self.vm.ssh_key)
    }

    pub fn apply_work_dir(&self) -> PathBuf {
        expand_path(&self.apply.work_dir)
    }

    pub fn playbook(&self) -> PathBuf {
        expand_path(&self.apply.playbook)
    }

    pub fn snapshot_history_file(&self) -> Option<PathBuf> {
        self.snapshots.history_file.as_deref().map(expand_path)
    }

    pub fn store_retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.store.max_count,
            max_age_ms: secs_to_ms(self.store.max_age_secs),
        }
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            max_count: self.snapshots.max_count,
            max_age_ms: secs_to_ms(self.snapshots.max_age_secs),
        }
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.apply.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.vm.name, "digital-twin-vm");
        assert_eq!(cfg.vm.libvirt_uri, "qemu:///system");
        assert_eq!(cfg.daemon.listen, "127.0.0.1:5678");
        assert_eq!(cfg.apply_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.store_retention(), RetentionPolicy { max_count: 10, max_age_ms: 3_600_000 });
        assert!(!cfg.apply.probe_enabled);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("twin.toml");
        std::fs::write(&path, "[vm]\nname = \"edge-twin\"\n\n[snapshots]\nmax_count = 3\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.vm.name, "edge-twin");
        assert_eq!(cfg.vm.user, "root");
        assert_eq!(cfg.snapshots.max_count, 3);
        assert_eq!(cfg.snapshots.max_age_secs, 3600);
        assert_eq!(cfg.apply.program, "ansible-playbook");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc").join("twin.toml");
        let mut cfg = Config::default();
        cfg.apply.timeout_secs = 30;
        cfg.snapshots.history_file = Some("/tmp/snapshots.json".into());
        cfg.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let cfg = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn tilde_paths_are_expanded() {
        if std::env::var_os("HOME").is_none() {
            return;
        }
        let cfg = Config::default();
        assert!(!cfg.ssh_key().display().to_string().starts_with('~'));
        assert!(cfg.ssh_key().ends_with(".ssh/id_rsa"));
    }
}
