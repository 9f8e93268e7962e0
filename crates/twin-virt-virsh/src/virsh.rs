use std::process::{Command, Output};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use twin_core::VmId;
use twin_virt::{ControlPlane, SnapshotListing, SnapshotMeta};

use crate::parse;

/// [`ControlPlane`] backed by the libvirt `virsh` CLI.
#[derive(Clone, Debug)]
pub struct VirshControlPlane {
    pub program: String,
    pub uri: String,
}

impl VirshControlPlane {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            program: "virsh".to_string(),
            uri: uri.into(),
        }
    }

    /// Use a different `virsh` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c").arg(&self.uri).args(args);
        debug!(program = %self.program, ?args, "running virsh");
        cmd.output()
            .with_context(|| format!("run {} {:?}", self.program, args))
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let out = self.output(args)?;
        if !out.status.success() {
            return Err(anyhow!(
                "command failed: {} {:?}\nstdout:{}\nstderr:{}",
                self.program,
                args,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn current_snapshot(&self, vm: &VmId) -> Result<Option<String>> {
        let out = self.output(&["snapshot-current", "--domain", vm.as_str(), "--name"])?;
        if out.status.success() {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            return Ok((!name.is_empty()).then_some(name));
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if parse::is_no_current(&stderr) {
            return Ok(None);
        }
        Err(anyhow!("snapshot-current failed for {vm}: {}", stderr.trim()))
    }

    fn snapshot_meta(&self, vm: &VmId, name: &str) -> SnapshotMeta {
        let xml = self.run(&["snapshot-dumpxml", "--domain", vm.as_str(), "--snapshotname", name]);
        match xml {
            Ok(xml) => SnapshotMeta {
                name: name.to_string(),
                created_ms: parse::creation_time_ms(&xml),
                description: parse::description(&xml),
            },
            Err(e) => {
                warn!(snapshot = name, error = %e, "no snapshot metadata");
                SnapshotMeta {
                    name: name.to_string(),
                    created_ms: None,
                    description: None,
                }
            }
        }
    }
}

impl ControlPlane for VirshControlPlane {
    fn resolve_vm(&self, name: &str) -> Result<Option<VmId>> {
        let out = self.output(&["domuuid", name])?;
        if out.status.success() {
            let uuid = String::from_utf8_lossy(&out.stdout).trim().to_string();
            return Ok((!uuid.is_empty()).then(|| VmId::from_str(uuid)));
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if parse::is_missing_domain(&stderr) {
            return Ok(None);
        }
        Err(anyhow!("domuuid failed for {name}: {}", stderr.trim()))
    }

    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> Result<()> {
        self.run(&[
            "snapshot-create-as",
            "--domain",
            vm.as_str(),
            "--name",
            name,
            "--description",
            description,
        ])?;
        Ok(())
    }

    fn list_snapshots(&self, vm: &VmId) -> Result<SnapshotListing> {
        let stdout = self.run(&["snapshot-list", "--domain", vm.as_str(), "--name"])?;
        let history = parse::names(&stdout)
            .iter()
            .map(|name| self.snapshot_meta(vm, name))
            .collect();
        Ok(SnapshotListing {
            current: self.current_snapshot(vm)?,
            history,
        })
    }

    fn revert_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        self.run(&["snapshot-revert", "--domain", vm.as_str(), "--snapshotname", name])?;
        Ok(())
    }

    fn delete_snapshot(&self, vm: &VmId, name: &str) -> Result<()> {
        self.run(&["snapshot-delete", "--domain", vm.as_str(), "--snapshotname", name])?;
        Ok(())
    }

    fn resolve_guest_address(&self, vm: &VmId) -> Result<Option<String>> {
        let stdout = self.run(&["domifaddr", "--domain", vm.as_str()])?;
        Ok(parse::guest_address(&stdout))
    }
}
