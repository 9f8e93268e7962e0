//! Projection of an observed state into a [`ServiceConfig`].
//!
//! Pure and deterministic: no I/O, no clock, and every output list is sorted
//! so reordered input collections produce byte-identical artifacts.

use std::collections::HashSet;

use crate::model::{
    ContainerUnit, PortMapping, ServiceConfig, StandaloneProcess, StateSnapshot, SystemProfile,
    SystemUnit, UnitProcess, VolumeMapping,
};
use crate::tree::Tree;
use crate::validate::{validate_state, ValidationError};

/// Processes at or below this CPU share are not worth recreating.
pub const CPU_THRESHOLD_PERCENT: f64 = 1.0;
/// Safety margin applied to observed resident memory.
pub const MEMORY_MARGIN: f64 = 1.2;

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_CWD: &str = "/";
pub const DEFAULT_HOST_IP: &str = "0.0.0.0";
pub const DEFAULT_SERVICE_STATE: &str = "stopped";
pub const DEFAULT_RESTART: &str = "no";
pub const DEFAULT_HOSTNAME: &str = "digitaltwin";
pub const DEFAULT_CPU_COUNT: i64 = 2;
pub const DEFAULT_MEMORY_GB: f64 = 4.0;
pub const UNKNOWN: &str = "unknown";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServiceKind {
    Unit,
    Container,
    Other,
}

impl ServiceKind {
    fn of(svc: &Tree) -> Self {
        match svc.get("type").and_then(Tree::as_str) {
            Some("systemd") | Some("unit") => ServiceKind::Unit,
            Some("docker") | Some("container") => ServiceKind::Container,
            _ => ServiceKind::Other,
        }
    }
}

pub fn generate(state: &StateSnapshot) -> Result<ServiceConfig, ValidationError> {
    project(&state.payload)
}

pub fn project(payload: &Tree) -> Result<ServiceConfig, ValidationError> {
    validate_state(payload)?;

    let services = list(payload, "services");
    let processes = list(payload, "processes");

    let mut system_units = Vec::new();
    let mut container_units = Vec::new();
    for svc in services.iter().filter(|s| s.as_map().is_some()) {
        match ServiceKind::of(svc) {
            ServiceKind::Unit => system_units.push(system_unit(svc, processes)),
            ServiceKind::Container => container_units.push(container_unit(svc)),
            ServiceKind::Other => {}
        }
    }

    let managed: HashSet<i64> = services
        .iter()
        .filter_map(|s| s.get("pid").and_then(Tree::as_i64))
        .collect();

    let mut standalone_processes: Vec<StandaloneProcess> = processes
        .iter()
        .filter(|p| !p.get("pid").and_then(Tree::as_i64).is_some_and(|pid| managed.contains(&pid)))
        .filter(|p| number(p, "cpu_percent") > CPU_THRESHOLD_PERCENT)
        .map(standalone_process)
        .collect();

    system_units.sort_by_cached_key(|u| (u.name.clone(), sort_key(u)));
    container_units.sort_by_cached_key(|c| (c.name.clone(), sort_key(c)));
    standalone_processes.sort_by_cached_key(|p| (p.pid, p.name.clone(), sort_key(p)));

    Ok(ServiceConfig {
        system: system_profile(payload.get("hardware")),
        system_units,
        container_units,
        standalone_processes,
    })
}

/// Memory ceiling for a process: resident bytes plus margin, whole megabytes.
pub fn memory_limit_mb(rss_bytes: f64) -> u64 {
    (rss_bytes.max(0.0) * MEMORY_MARGIN / BYTES_PER_MB).floor() as u64
}

fn sort_key<T: serde::Serialize>(item: &T) -> String {
    serde_json::to_string(item).unwrap_or_default()
}

fn list<'a>(t: &'a Tree, key: &str) -> &'a [Tree] {
    t.get(key).and_then(Tree::as_list).unwrap_or(&[])
}

fn text(t: &Tree, key: &str, default: &str) -> String {
    t.get(key)
        .and_then(Tree::scalar_text)
        .unwrap_or_else(|| default.to_string())
}

fn number(t: &Tree, key: &str) -> f64 {
    t.get(key).and_then(Tree::as_f64).unwrap_or(0.0)
}

fn strings(t: &Tree, key: &str) -> Vec<String> {
    list(t, key).iter().filter_map(Tree::scalar_text).collect()
}

fn sorted_strings(t: &Tree, key: &str) -> Vec<String> {
    let mut v = strings(t, key);
    v.sort();
    v
}

fn system_profile(hw: Option<&Tree>) -> SystemProfile {
    let empty = Tree::Null;
    let hw = hw.unwrap_or(&empty);
    let cpu = hw.get("cpu").unwrap_or(&empty);
    let memory = hw.get("memory").unwrap_or(&empty);
    SystemProfile {
        hostname: text(hw, "hostname", DEFAULT_HOSTNAME),
        cpu_count: cpu
            .get("count_logical")
            .or_else(|| cpu.get("logical_cores"))
            .and_then(Tree::as_i64)
            .unwrap_or(DEFAULT_CPU_COUNT),
        cpu_model: text(cpu, "model", UNKNOWN),
        memory_total_gb: memory
            .get("total_gb")
            .and_then(Tree::as_f64)
            .unwrap_or(DEFAULT_MEMORY_GB),
        kernel: text(hw, "kernel_version", UNKNOWN),
    }
}

fn system_unit(svc: &Tree, processes: &[Tree]) -> SystemUnit {
    let status = svc.get("status").and_then(Tree::as_str);
    let process = svc.get("pid").and_then(Tree::as_i64).and_then(|pid| {
        processes
            .iter()
            .find(|p| p.get("pid").and_then(Tree::as_i64) == Some(pid))
            .map(|p| UnitProcess {
                cmdline: strings(p, "cmdline"),
                environment: sorted_strings(p, "environment"),
                cwd: text(p, "cwd", DEFAULT_CWD),
            })
    });
    SystemUnit {
        name: text(svc, "name", UNKNOWN),
        enabled: status == Some("active"),
        state: status.unwrap_or(DEFAULT_SERVICE_STATE).to_string(),
        restart: DEFAULT_RESTART.to_string(),
        process,
    }
}

fn container_unit(svc: &Tree) -> ContainerUnit {
    let mut ports: Vec<PortMapping> = list(svc, "ports")
        .iter()
        .map(|p| PortMapping {
            container_port: text(p, "container_port", ""),
            host_port: text(p, "host_port", ""),
            host_ip: text(p, "host_ip", DEFAULT_HOST_IP),
        })
        .collect();
    ports.sort();

    let mut volumes: Vec<VolumeMapping> = list(svc, "volumes")
        .iter()
        .map(|v| VolumeMapping {
            source: text(v, "source", ""),
            destination: text(v, "destination", ""),
            read_only: v.get("read_only").and_then(Tree::as_bool).unwrap_or(false),
        })
        .collect();
    volumes.sort();

    ContainerUnit {
        name: text(svc, "name", UNKNOWN),
        image: text(svc, "image", ""),
        state: text(svc, "status", DEFAULT_SERVICE_STATE),
        restart: text(svc, "restart_policy", DEFAULT_RESTART),
        ports,
        volumes,
        environment: sorted_strings(svc, "environment"),
    }
}

fn standalone_process(p: &Tree) -> StandaloneProcess {
    StandaloneProcess {
        name: text(p, "name", UNKNOWN),
        pid: p.get("pid").and_then(Tree::as_i64).unwrap_or(0),
        user: text(p, "username", DEFAULT_USER),
        cmdline: strings(p, "cmdline"),
        cwd: text(p, "cwd", DEFAULT_CWD),
        cpu_percent: number(p, "cpu_percent"),
        memory_percent: number(p, "memory_percent"),
        environment: sorted_strings(p, "environment"),
        memory_limit_mb: p
            .get("memory_info")
            .and_then(|m| m.get("rss"))
            .and_then(Tree::as_f64)
            .map(memory_limit_mb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Tree {
        Tree::parse(s).unwrap()
    }

    #[test]
    fn empty_state_uses_defaults() {
        let cfg = project(&t("{}")).unwrap();
        assert_eq!(cfg.system.hostname, "digitaltwin");
        assert_eq!(cfg.system.cpu_count, 2);
        assert!(cfg.system_units.is_empty());
        assert!(cfg.container_units.is_empty());
        assert!(cfg.standalone_processes.is_empty());
    }

    #[test]
    fn memory_limit_rounds_down() {
        assert_eq!(memory_limit_mb(100.0 * BYTES_PER_MB), 120);
        assert_eq!(memory_limit_mb(1_000_000.0), 1);
        assert_eq!(memory_limit_mb(0.0), 0);
    }

    #[test]
    fn bare_string_services_are_ignored() {
        let cfg = project(&t(r#"{"services": ["nginx", "redis"]}"#)).unwrap();
        assert!(cfg.system_units.is_empty());
    }

    #[test]
    fn rejects_invalid_payload() {
        assert!(project(&t(r#"{"services": 3}"#)).is_err());
    }
}
