use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout as deadline;
use tracing::{debug, info, warn};

use crate::inventory::Inventory;
use crate::tool::{ApplyError, ApplyOutput, ApplyTool};

pub const CONFIG_FILE: &str = "service_config.yaml";
pub const INVENTORY_FILE: &str = "inventory.yaml";
const STDOUT_LOG: &str = "apply.stdout.log";
const STDERR_LOG: &str = "apply.stderr.log";

/// Runs `ansible-playbook -i <inventory> <playbook> -e config_file=<artifact>`
/// with every input and log kept under `work_dir`.
#[derive(Clone, Debug)]
pub struct AnsibleApplyTool {
    pub program: String,
    pub playbook: PathBuf,
    pub work_dir: PathBuf,
    pub extra_args: Vec<String>,
}

impl AnsibleApplyTool {
    pub fn new(playbook: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: "ansible-playbook".to_string(),
            playbook: playbook.into(),
            work_dir: work_dir.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn write_inputs(&self, artifact: &str, inventory: &Inventory) -> Result<(PathBuf, PathBuf), ApplyError> {
        std::fs::create_dir_all(&self.work_dir)?;
        let config_path = self.work_dir.join(CONFIG_FILE);
        std::fs::write(&config_path, artifact)?;
        let inventory_path = self.work_dir.join(INVENTORY_FILE);
        let rendered = inventory.to_yaml().map_err(std::io::Error::other)?;
        std::fs::write(&inventory_path, rendered)?;
        Ok((config_path, inventory_path))
    }
}

fn read_log(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read apply log");
            String::new()
        }
    }
}

impl AnsibleApplyTool {
    async fn run(
        &self,
        config_path: &Path,
        inventory_path: &Path,
        inventory: &Inventory,
        timeout: Duration,
    ) -> Result<ApplyOutput, ApplyError> {
        let stdout_path = self.work_dir.join(STDOUT_LOG);
        let stderr_path = self.work_dir.join(STDERR_LOG);
        let stdout = File::create(&stdout_path)?;
        let stderr = File::create(&stderr_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("-i")
            .arg(inventory_path)
            .arg(&self.playbook)
            .arg("-e")
            .arg(format!("config_file={}", config_path.display()))
            .args(&self.extra_args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        debug!(?cmd, "starting apply");

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ApplyError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let status = match deadline(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "could not kill timed out apply");
                }
                warn!(host = %inventory.address, ?timeout, "apply timed out; killed");
                return Err(ApplyError::Timeout(timeout));
            }
        };

        let output = ApplyOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: read_log(&stdout_path),
            stderr: read_log(&stderr_path),
        };
        if !status.success() {
            return Err(ApplyError::NonZeroExit(output));
        }
        info!(host = %inventory.address, elapsed_ms = started.elapsed().as_millis() as u64, "apply finished");
        Ok(output)
    }
}

impl ApplyTool for AnsibleApplyTool {
    /// Drives the child on a private current-thread runtime. Call from a
    /// plain thread or `spawn_blocking`, never from async code.
    fn apply(&self, artifact: &str, inventory: &Inventory, timeout: Duration) -> Result<ApplyOutput, ApplyError> {
        let (config_path, inventory_path) = self.write_inputs(artifact, inventory)?;
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(self.run(&config_path, &inventory_path, inventory, timeout))
    }
}
