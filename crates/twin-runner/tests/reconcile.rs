use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use twin_apply::testing::{FixedProbe, Scripted, ScriptedApplyTool};
use twin_apply::{ApplyError, ApplyOutput, ApplyTool, Inventory, ReachabilityProbe};
use twin_core::{Tree, VmId};
use twin_runner::{Config, Phase, ReconcileOutcome, TwinContext};
use twin_storage::MemoryStateStorage;
use twin_virt::testing::MemoryControlPlane;
use twin_virt::{ControlPlane, SnapshotListing};

const VM: &str = "digital-twin-vm";

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.vm.ssh_key = "/keys/twin".into();
    cfg
}

fn context(
    cfg: Config,
    tool: Box<dyn ApplyTool>,
    probe: Option<Box<dyn ReachabilityProbe>>,
) -> (Arc<TwinContext>, Arc<MemoryControlPlane>) {
    let plane = Arc::new(MemoryControlPlane::new().with_vm(VM, "uuid-1"));
    plane.set_address(VM, "192.168.122.10");
    let ctx = TwinContext::with_collaborators(
        cfg,
        Box::new(MemoryStateStorage::new()),
        Box::new(plane.clone()),
        tool,
        probe,
    )
    .unwrap();
    (Arc::new(ctx), plane)
}

struct Harness {
    ctx: Arc<TwinContext>,
    plane: Arc<MemoryControlPlane>,
    tool: Arc<ScriptedApplyTool>,
}

fn harness_with_config(cfg: Config) -> Harness {
    let tool = Arc::new(ScriptedApplyTool::new());
    let (ctx, plane) = context(cfg, Box::new(tool.clone()), None);
    Harness { ctx, plane, tool }
}

fn harness() -> Harness {
    harness_with_config(config())
}

fn tree(s: &str) -> Tree {
    Tree::parse(s).unwrap()
}

#[test]
fn added_service_triggers_snapshot_and_apply() {
    let h = harness();
    let r = &h.ctx.reconciler;

    let first = r.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    let ReconcileOutcome::Updated { snapshot: baseline, diff, .. } = first else {
        panic!("expected update, got {first:?}");
    };
    assert!(diff.initial);

    let second = r.on_observed_state(tree(r#"{"services": ["nginx", "redis"]}"#), "agent");
    let ReconcileOutcome::Updated { snapshot, diff, id } = second else {
        panic!("expected update, got {second:?}");
    };
    assert_ne!(snapshot, baseline);
    assert_eq!(diff.added_values().collect::<Vec<_>>(), vec![&Tree::from("redis")]);
    assert_eq!(r.store().current_id(), Some(id));

    let calls = h.tool.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].inventory.address, "192.168.122.10");
    assert_eq!(calls[1].inventory.user, "root");
    assert_eq!(calls[1].inventory.ssh_key, std::path::PathBuf::from("/keys/twin"));
    assert_eq!(calls[1].timeout, Duration::from_secs(120));
    assert!(calls[1].artifact.contains("hostname: digitaltwin"));

    let status = r.status();
    assert_eq!(status.current_snapshot, Some(snapshot));
    assert!(!status.in_progress);
    assert_eq!(status.phase, Phase::Idle);
}

#[test]
fn unchanged_state_creates_no_snapshot() {
    let h = harness();
    let r = &h.ctx.reconciler;
    r.on_observed_state(tree(r#"{"services": ["nginx", "redis"]}"#), "agent");
    let again = r.on_observed_state(tree(r#"{"services": ["redis", "nginx"]}"#), "agent");

    assert!(matches!(again, ReconcileOutcome::NoChanges { .. }));
    assert_eq!(h.plane.creates(), 1);
    assert_eq!(h.tool.calls().len(), 1);
}

#[test]
fn apply_timeout_keeps_snapshot_and_new_baseline() {
    let mut cfg = config();
    cfg.apply.timeout_secs = 1;
    let h = harness_with_config(cfg);
    let r = &h.ctx.reconciler;
    r.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    let applied_snapshot = r.status().current_snapshot;

    h.tool.push(Scripted::Hang(Duration::from_secs(600)));
    let outcome = r.on_observed_state(tree(r#"{"services": ["nginx", "redis"]}"#), "agent");
    let ReconcileOutcome::Error { id, snapshot, reason } = outcome else {
        panic!("expected error, got {outcome:?}");
    };
    assert!(reason.contains("timed out"), "{reason}");

    let snapshot = snapshot.expect("snapshot taken before apply");
    assert!(r.list_snapshots().unwrap().contains(&snapshot));
    assert_eq!(r.store().current_id(), id);
    // The twin is still configured from the earlier snapshot.
    assert_eq!(r.status().current_snapshot, applied_snapshot);

    // Resubmitting the same state is now a no-op.
    let again = r.on_observed_state(tree(r#"{"services": ["nginx", "redis"]}"#), "agent");
    assert!(matches!(again, ReconcileOutcome::NoChanges { .. }));
}

#[test]
fn non_zero_apply_is_reported() {
    let h = harness();
    h.tool.push(Scripted::Fail(2));
    let outcome = h.ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    match outcome {
        ReconcileOutcome::Error { id, snapshot, reason } => {
            assert!(id.is_some());
            assert!(snapshot.is_some());
            assert!(reason.contains("code 2"), "{reason}");
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn invalid_state_is_rejected_before_persistence() {
    let h = harness();
    let outcome = h.ctx.reconciler.on_observed_state(tree(r#"{"processes": "many"}"#), "agent");
    match outcome {
        ReconcileOutcome::Error { id, snapshot, .. } => {
            assert!(id.is_none());
            assert!(snapshot.is_none());
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(h.ctx.reconciler.history(10).unwrap().is_empty());
    assert_eq!(h.plane.creates(), 0);
}

#[test]
fn snapshot_failure_is_reported_and_skips_apply() {
    let h = harness();
    h.plane.fail("create", true);
    let outcome = h.ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    assert!(outcome.is_error());
    assert!(outcome.id().is_some());
    assert!(h.tool.calls().is_empty());
}

#[test]
fn unreachable_guest_is_not_applied() {
    let tool = Arc::new(ScriptedApplyTool::new());
    let (ctx, _plane) = context(config(), Box::new(tool.clone()), Some(Box::new(FixedProbe(false))));
    let outcome = ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    match outcome {
        ReconcileOutcome::Error { reason, .. } => assert!(reason.contains("not reachable"), "{reason}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(tool.calls().is_empty());
}

#[test]
fn missing_guest_address_is_an_error() {
    let tool = Arc::new(ScriptedApplyTool::new());
    let plane = Arc::new(MemoryControlPlane::new().with_vm(VM, "uuid-1"));
    let ctx = TwinContext::with_collaborators(
        config(),
        Box::new(MemoryStateStorage::new()),
        Box::new(plane),
        Box::new(tool.clone()),
        None,
    )
    .unwrap();
    let outcome = ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    assert!(outcome.is_error());
    assert!(tool.calls().is_empty());
}

type Events = Arc<Mutex<Vec<&'static str>>>;

/// Records when apply starts and finishes, sleeping in between.
struct SlowTool {
    events: Events,
}

impl ApplyTool for SlowTool {
    fn apply(&self, _artifact: &str, _inventory: &Inventory, _timeout: Duration) -> Result<ApplyOutput, ApplyError> {
        self.events.lock().unwrap().push("start");
        thread::sleep(Duration::from_millis(150));
        self.events.lock().unwrap().push("end");
        Ok(ApplyOutput::default())
    }
}

/// Records every snapshot creation into the same log as [`SlowTool`].
struct RecordingPlane {
    inner: Arc<MemoryControlPlane>,
    events: Events,
}

impl ControlPlane for RecordingPlane {
    fn resolve_vm(&self, name: &str) -> anyhow::Result<Option<VmId>> {
        self.inner.resolve_vm(name)
    }
    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("snap");
        self.inner.create_snapshot(vm, name, description)
    }
    fn list_snapshots(&self, vm: &VmId) -> anyhow::Result<SnapshotListing> {
        self.inner.list_snapshots(vm)
    }
    fn revert_snapshot(&self, vm: &VmId, name: &str) -> anyhow::Result<()> {
        self.inner.revert_snapshot(vm, name)
    }
    fn delete_snapshot(&self, vm: &VmId, name: &str) -> anyhow::Result<()> {
        self.inner.delete_snapshot(vm, name)
    }
    fn resolve_guest_address(&self, vm: &VmId) -> anyhow::Result<Option<String>> {
        self.inner.resolve_guest_address(vm)
    }
}

#[test]
fn concurrent_reconciliations_are_serialized() {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let plane = Arc::new(MemoryControlPlane::new().with_vm(VM, "uuid-1"));
    plane.set_address(VM, "192.168.122.10");
    let ctx = Arc::new(
        TwinContext::with_collaborators(
            config(),
            Box::new(MemoryStateStorage::new()),
            Box::new(RecordingPlane { inner: plane.clone(), events: events.clone() }),
            Box::new(SlowTool { events: events.clone() }),
            None,
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let payload = Tree::parse(&format!(r#"{{"services": ["svc{i}"]}}"#)).unwrap();
                ctx.reconciler.on_observed_state(payload, "agent")
            })
        })
        .collect();
    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(outcomes.iter().all(|o| matches!(o, ReconcileOutcome::Updated { .. })));
    let events = events.lock().unwrap().clone();
    assert_eq!(events, ["snap", "start", "end"].repeat(3));
    assert_eq!(plane.creates(), 3);
    assert!(!ctx.reconciler.status().in_progress);
}

#[test]
fn revert_and_delete_go_through_the_snapshot_manager() {
    let h = harness();
    let r = &h.ctx.reconciler;
    let ReconcileOutcome::Updated { snapshot: first, .. } =
        r.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent")
    else {
        panic!("expected update");
    };
    r.on_observed_state(tree(r#"{"services": ["nginx", "redis"]}"#), "agent");

    assert!(r.revert(&first));
    assert_eq!(r.status().current_snapshot.as_deref(), Some(first.as_str()));
    assert_eq!(h.plane.current(VM).as_deref(), Some(first.as_str()));
    assert!(!r.revert("missing"));

    assert!(r.delete(&first));
    assert!(r.status().current_snapshot.is_none());
    assert!(!r.delete(&first));
}

#[test]
fn history_lists_newest_first() {
    let h = harness();
    let r = &h.ctx.reconciler;
    for i in 0..3 {
        r.on_observed_state(tree(&format!(r#"{{"services": ["svc{i}"]}}"#)), "agent");
        thread::sleep(Duration::from_millis(2));
    }
    let history = r.history(2).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_current);
    assert_eq!(Some(&history[0].id), r.store().current_id().as_ref());
}

#[test]
fn outcome_serializes_with_status_tag() {
    let h = harness();
    let outcome = h.ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["status"], "updated");
    assert!(json["snapshot"].is_string());
    assert_eq!(json["diff"]["initial"], true);

    let unchanged = h.ctx.reconciler.on_observed_state(tree(r#"{"services": ["nginx"]}"#), "agent");
    let json = serde_json::to_value(&unchanged).unwrap();
    assert_eq!(json["status"], "no_changes");
    assert!(json.get("reason").is_none());
}
