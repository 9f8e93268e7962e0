use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::Inventory;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("apply exited with code {}: {}", .0.exit_code, last_line(&.0.stderr))]
    NonZeroExit(ApplyOutput),
    #[error("apply timed out after {0:?}")]
    Timeout(Duration),
    #[error("guest {0} is not reachable")]
    Unreachable(String),
    #[error("apply i/o: {0}")]
    Io(#[from] std::io::Error),
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Applies a service configuration artifact to the hosts in an inventory.
/// `Ok` means the tool ran to completion and reported success.
pub trait ApplyTool: Send + Sync {
    fn apply(&self, artifact: &str, inventory: &Inventory, timeout: Duration) -> Result<ApplyOutput, ApplyError>;
}

impl<T: ApplyTool + ?Sized> ApplyTool for std::sync::Arc<T> {
    fn apply(&self, artifact: &str, inventory: &Inventory, timeout: Duration) -> Result<ApplyOutput, ApplyError> {
        (**self).apply(artifact, inventory, timeout)
    }
}
