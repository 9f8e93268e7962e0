use anyhow::Result;
use tracing::info;
use twin_apply::{AnsibleApplyTool, ApplyTool, ReachabilityProbe, TcpProbe};
use twin_storage::{FsStateStorage, StateStorage, StateStore};
use twin_virt::{ControlPlane, SnapshotManager};
use twin_virt_virsh::VirshControlPlane;

use crate::config::Config;
use crate::reconciler::{ApplySettings, Reconciler};

/// Everything a running twin needs, built once at startup and shared.
pub struct TwinContext {
    pub config: Config,
    pub reconciler: Reconciler,
}

impl TwinContext {
    /// Production wiring: state directory on disk, `virsh`, `ansible-playbook`.
    pub fn open(config: Config) -> Result<Self> {
        let storage = FsStateStorage::open(config.state_dir())?;
        let plane = VirshControlPlane::new(&config.vm.libvirt_uri);
        let mut tool = AnsibleApplyTool::new(config.playbook(), config.apply_work_dir())
            .with_program(&config.apply.program);
        tool.extra_args = config.apply.extra_args.clone();
        let probe: Option<Box<dyn ReachabilityProbe>> = config.apply.probe_enabled.then(|| {
            Box::new(TcpProbe {
                port: config.apply.probe_port,
                timeout: config.probe_timeout(),
            }) as Box<dyn ReachabilityProbe>
        });
        Self::with_collaborators(config, Box::new(storage), Box::new(plane), Box::new(tool), probe)
    }

    /// Wire the engine over explicit collaborators.
    pub fn with_collaborators(
        config: Config,
        storage: Box<dyn StateStorage>,
        plane: Box<dyn ControlPlane>,
        tool: Box<dyn ApplyTool>,
        probe: Option<Box<dyn ReachabilityProbe>>,
    ) -> Result<Self> {
        let store = StateStore::open(storage, config.store_retention());
        let mut snapshots = SnapshotManager::new(plane, &config.vm.name, config.snapshot_policy());
        if let Some(path) = config.snapshot_history_file() {
            snapshots = snapshots.with_history_file(path)?;
        }
        let settings = ApplySettings {
            user: config.vm.user.clone(),
            ssh_key: config.ssh_key(),
            timeout: config.apply_timeout(),
        };
        let reconciler = Reconciler::new(store, snapshots, tool, probe, settings);
        info!(vm = %config.vm.name, "twin context ready");
        Ok(Self { config, reconciler })
    }
}
