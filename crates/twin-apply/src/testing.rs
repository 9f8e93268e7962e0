//! Scripted collaborators for exercising the apply path without a guest.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::inventory::Inventory;
use crate::probe::ReachabilityProbe;
use crate::tool::{ApplyError, ApplyOutput, ApplyTool};

/// Scripted response for one apply call.
#[derive(Clone, Debug)]
pub enum Scripted {
    Succeed,
    Fail(i32),
    /// Sleep for the given time; report a timeout if it exceeds the limit.
    Hang(Duration),
}

#[derive(Clone, Debug)]
pub struct ApplyCall {
    pub artifact: String,
    pub inventory: Inventory,
    pub timeout: Duration,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Scripted>,
    calls: Vec<ApplyCall>,
}

/// Answers from a queue of [`Scripted`] responses, then succeeds. Every
/// call is recorded.
#[derive(Default)]
pub struct ScriptedApplyTool {
    inner: Mutex<Inner>,
}

impl ScriptedApplyTool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, step: Scripted) {
        self.lock().script.push_back(step);
    }

    pub fn calls(&self) -> Vec<ApplyCall> {
        self.lock().calls.clone()
    }
}

impl ApplyTool for ScriptedApplyTool {
    fn apply(&self, artifact: &str, inventory: &Inventory, timeout: Duration) -> Result<ApplyOutput, ApplyError> {
        let step = {
            let mut inner = self.lock();
            inner.calls.push(ApplyCall {
                artifact: artifact.to_string(),
                inventory: inventory.clone(),
                timeout,
            });
            inner.script.pop_front().unwrap_or(Scripted::Succeed)
        };
        match step {
            Scripted::Succeed => Ok(ApplyOutput {
                exit_code: 0,
                stdout: "ok".into(),
                stderr: String::new(),
            }),
            Scripted::Fail(code) => Err(ApplyError::NonZeroExit(ApplyOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: "scripted failure".into(),
            })),
            Scripted::Hang(d) => {
                std::thread::sleep(d.min(timeout));
                if d > timeout {
                    Err(ApplyError::Timeout(timeout))
                } else {
                    Ok(ApplyOutput::default())
                }
            }
        }
    }
}

/// Probe with a fixed answer.
#[derive(Clone, Copy, Debug)]
pub struct FixedProbe(pub bool);

impl ReachabilityProbe for FixedProbe {
    fn is_reachable(&self, _address: &str) -> bool {
        self.0
    }
}
