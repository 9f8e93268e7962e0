use serde::{Deserialize, Serialize};

use crate::{ids::StateId, time::EpochMs, tree::Tree};

/// One observed state as reported by an agent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub id: StateId,
    pub payload: Tree,
    pub created_ms: EpochMs,
    pub source_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemProfile {
    pub hostname: String,
    pub cpu_count: i64,
    pub cpu_model: String,
    pub memory_total_gb: f64,
    pub kernel: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitProcess {
    pub cmdline: Vec<String>,
    pub environment: Vec<String>,
    pub cwd: String,
}

/// A service manager unit (systemd) to recreate on the twin.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemUnit {
    pub name: String,
    pub enabled: bool,
    pub state: String,
    pub restart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<UnitProcess>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortMapping {
    pub container_port: String,
    pub host_port: String,
    pub host_ip: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct VolumeMapping {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerUnit {
    pub name: String,
    pub image: String,
    pub state: String,
    pub restart: String,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMapping>,
    pub environment: Vec<String>,
}

/// A busy process not owned by any unit or container.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StandaloneProcess {
    pub name: String,
    pub pid: i64,
    pub user: String,
    pub cmdline: Vec<String>,
    pub cwd: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub environment: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

/// Declarative service configuration for the twin, derived from one state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub system: SystemProfile,
    pub system_units: Vec<SystemUnit>,
    pub container_units: Vec<ContainerUnit>,
    pub standalone_processes: Vec<StandaloneProcess>,
}

impl ServiceConfig {
    /// Artifact handed to the apply tool.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
