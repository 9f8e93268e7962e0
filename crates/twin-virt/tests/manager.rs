use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use twin_core::VmId;
use twin_virt::testing::MemoryControlPlane;
use twin_virt::{
    run_control_plane_contract, ControlPlane, SnapshotError, SnapshotListing, SnapshotManager,
    SnapshotPolicy,
};

const VM: &str = "digital-twin-vm";
const T0: i64 = 1_714_557_600_000;
const MINUTE: i64 = 60_000;

fn plane() -> Arc<MemoryControlPlane> {
    let plane = Arc::new(MemoryControlPlane::new().with_vm(VM, "uuid-1"));
    plane.set_clock(T0);
    plane
}

fn manager(plane: &Arc<MemoryControlPlane>, policy: SnapshotPolicy) -> SnapshotManager {
    SnapshotManager::new(Box::new(plane.clone()), VM, policy)
}

#[test]
fn memory_plane_satisfies_contract() {
    let plane = plane();
    run_control_plane_contract(plane.as_ref(), VM).unwrap();
}

#[test]
fn create_uses_timestamp_label_and_becomes_current() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    let rec = mgr.create_at(None, T0 + 17).unwrap();
    assert_eq!(rec.name, "state_20240501_100000_017");
    assert_eq!(rec.vm_id.as_str(), "uuid-1");
    assert_eq!(plane.current(VM).as_deref(), Some(rec.name.as_str()));
    assert_eq!(mgr.tracked(), vec![rec]);
}

#[test]
fn duplicate_label_gets_suffix() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    let a = mgr.create_at(Some("baseline"), T0).unwrap();
    let b = mgr.create_at(Some("baseline"), T0 + 1).unwrap();
    assert_eq!(a.name, "baseline");
    assert_eq!(b.name, "baseline_1");
}

#[test]
fn unresolved_vm_yields_error_and_empty_listing() {
    let plane = Arc::new(MemoryControlPlane::new());
    let mgr = manager(&plane, SnapshotPolicy::default());
    assert!(matches!(mgr.create(None), Err(SnapshotError::VmUnresolved(_))));
    assert_eq!(mgr.list_snapshots().unwrap(), SnapshotListing::default());
    assert!(!mgr.revert("anything"));
    assert!(mgr.vm_id().is_none());
}

#[test]
fn vm_is_resolved_lazily_after_startup_failure() {
    let plane = plane();
    plane.fail("resolve", true);
    let mgr = manager(&plane, SnapshotPolicy::default());
    assert!(mgr.vm_id().is_none());

    plane.fail("resolve", false);
    mgr.create_at(None, T0).unwrap();
    assert_eq!(mgr.vm_id().map(|v| v.as_str().to_string()).as_deref(), Some("uuid-1"));
}

#[test]
fn create_failure_is_reported_not_fatal() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    plane.fail("create", true);
    assert!(matches!(mgr.create_at(None, T0), Err(SnapshotError::ControlPlane(_))));
    assert!(mgr.tracked().is_empty());
    plane.fail("create", false);
    assert!(mgr.create_at(None, T0).is_ok());
}

#[test]
fn retention_keeps_newest_max_count() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy { max_count: 3, max_age_ms: 60 * MINUTE });
    let mut names = Vec::new();
    for i in 0..5 {
        names.push(mgr.create_at(Some(&format!("snap{i}")), T0 + i).unwrap().name);
    }
    assert_eq!(plane.snapshot_names(VM), vec!["snap2", "snap3", "snap4"]);
    let tracked: Vec<_> = mgr.tracked().into_iter().map(|r| r.name).collect();
    assert_eq!(tracked, vec!["snap2", "snap3", "snap4"]);
}

#[test]
fn retention_uses_metadata_time_over_local_time() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy { max_count: 10, max_age_ms: 60 * MINUTE });
    // Control plane says this one is old even though we recorded it as new.
    plane.set_clock(T0 - 2 * 60 * MINUTE);
    mgr.create_at(Some("stale"), T0).unwrap();
    plane.set_clock(T0);
    mgr.create_at(Some("fresh"), T0).unwrap();
    assert_eq!(plane.snapshot_names(VM), vec!["fresh"]);
}

#[test]
fn retention_falls_back_to_local_time_without_metadata() {
    let plane = plane();
    plane.omit_metadata(true);
    let mgr = manager(&plane, SnapshotPolicy { max_count: 10, max_age_ms: 60 * MINUTE });
    mgr.create_at(Some("early"), T0).unwrap();
    mgr.create_at(Some("mid"), T0 + 30 * MINUTE).unwrap();
    assert_eq!(plane.snapshot_names(VM), vec!["early", "mid"]);

    mgr.create_at(Some("late"), T0 + 61 * MINUTE).unwrap();
    assert_eq!(plane.snapshot_names(VM), vec!["mid", "late"]);
}

#[test]
fn equal_creation_times_keep_the_greater_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.json");
    let plane = plane();
    plane.omit_metadata(true);
    {
        let mgr = manager(&plane, SnapshotPolicy::default())
            .with_history_file(&path)
            .unwrap();
        mgr.create_at(Some("beta"), T0).unwrap();
        mgr.create_at(Some("alpha"), T0).unwrap();
    }

    let mgr = manager(&plane, SnapshotPolicy { max_count: 1, max_age_ms: 60 * MINUTE })
        .with_history_file(&path)
        .unwrap();
    let evicted = mgr.enforce_retention_at(None, T0 + 1).unwrap();
    assert_eq!(evicted, vec!["alpha".to_string()]);
    assert_eq!(plane.snapshot_names(VM), vec!["beta"]);
}

#[test]
fn in_flight_snapshot_is_never_evicted() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy { max_count: 0, max_age_ms: 0 });
    let rec = mgr.create_at(Some("only"), T0 + 10 * MINUTE).unwrap();
    assert_eq!(plane.snapshot_names(VM), vec![rec.name.clone()]);

    let evicted = mgr.enforce_retention_at(Some(rec.name.as_str()), T0 + 20 * MINUTE).unwrap();
    assert!(evicted.is_empty());
    let evicted = mgr.enforce_retention_at(None, T0 + 20 * MINUTE).unwrap();
    assert_eq!(evicted, vec![rec.name]);
}

#[test]
fn retention_ignores_snapshots_created_elsewhere() {
    let plane = plane();
    plane.insert_snapshot(VM, "manual", T0 - 10 * 60 * MINUTE);
    let mgr = manager(&plane, SnapshotPolicy { max_count: 1, max_age_ms: 60 * MINUTE });
    mgr.create_at(Some("a"), T0).unwrap();
    mgr.create_at(Some("b"), T0 + 1).unwrap();
    assert_eq!(plane.snapshot_names(VM), vec!["manual", "b"]);
}

#[test]
fn vanished_snapshots_leave_local_history() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    mgr.create_at(Some("a"), T0).unwrap();
    mgr.create_at(Some("b"), T0 + 1).unwrap();
    plane.forget_snapshot(VM, "a");
    mgr.enforce_retention_at(None, T0 + 2).unwrap();
    let tracked: Vec<_> = mgr.tracked().into_iter().map(|r| r.name).collect();
    assert_eq!(tracked, vec!["b"]);
}

#[test]
fn revert_requires_current_pointer_and_known_name() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    plane.insert_snapshot(VM, "manual", T0);
    // Snapshot exists but nothing is current yet.
    assert!(!mgr.revert("manual"));

    mgr.create_at(Some("a"), T0).unwrap();
    mgr.create_at(Some("b"), T0 + 1).unwrap();
    assert!(!mgr.revert("nope"));
    assert!(mgr.revert("a"));
    assert_eq!(plane.current(VM).as_deref(), Some("a"));

    plane.fail("revert", true);
    assert!(!mgr.revert("b"));
}

#[test]
fn delete_unknown_is_false_and_keeps_history() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    mgr.create_at(Some("a"), T0).unwrap();
    assert!(!mgr.delete("missing"));
    assert_eq!(mgr.tracked().len(), 1);

    assert!(mgr.delete("a"));
    assert!(mgr.tracked().is_empty());
    assert!(plane.snapshot_names(VM).is_empty());
}

#[test]
fn listing_is_live() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    mgr.create_at(Some("a"), T0).unwrap();
    plane.insert_snapshot(VM, "manual", T0);
    let listing = mgr.list_snapshots().unwrap();
    assert_eq!(listing.current.as_deref(), Some("a"));
    assert!(listing.contains("manual"));
}

#[test]
fn guest_address_comes_from_control_plane() {
    let plane = plane();
    let mgr = manager(&plane, SnapshotPolicy::default());
    assert_eq!(mgr.guest_address().unwrap(), None);
    plane.set_address(VM, "192.168.122.10");
    assert_eq!(mgr.guest_address().unwrap().as_deref(), Some("192.168.122.10"));
}

#[test]
fn history_file_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshots.json");
    let plane = plane();
    {
        let mgr = manager(&plane, SnapshotPolicy::default())
            .with_history_file(&path)
            .unwrap();
        mgr.create_at(Some("a"), T0).unwrap();
    }
    assert!(path.exists());
    let mgr = manager(&plane, SnapshotPolicy::default())
        .with_history_file(&path)
        .unwrap();
    let tracked: Vec<_> = mgr.tracked().into_iter().map(|r| r.name).collect();
    assert_eq!(tracked, vec!["a"]);
}

/// Parks inside `create_snapshot` until released.
struct GatedPlane {
    inner: Arc<MemoryControlPlane>,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl ControlPlane for GatedPlane {
    fn resolve_vm(&self, name: &str) -> anyhow::Result<Option<VmId>> {
        self.inner.resolve_vm(name)
    }
    fn create_snapshot(&self, vm: &VmId, name: &str, description: &str) -> anyhow::Result<()> {
        self.entered.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
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
fn listing_does_not_wait_for_a_create_in_progress() {
    let plane = plane();
    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    let gated = GatedPlane {
        inner: plane.clone(),
        entered: Mutex::new(entered_tx),
        release: Mutex::new(release_rx),
    };
    let mgr = Arc::new(SnapshotManager::new(Box::new(gated), VM, SnapshotPolicy::default()));

    let creator = {
        let mgr = mgr.clone();
        thread::spawn(move || mgr.create_at(Some("slow"), T0))
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let (listed_tx, listed_rx) = channel();
    {
        let mgr = mgr.clone();
        thread::spawn(move || listed_tx.send(mgr.list_snapshots()).unwrap());
    }
    let listing = listed_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("listing blocked behind create")
        .unwrap();
    assert!(!listing.contains("slow"));
    assert!(mgr.guest_address().is_ok());

    release_tx.send(()).unwrap();
    creator.join().unwrap().unwrap();
    assert!(mgr.list_snapshots().unwrap().contains("slow"));
}
