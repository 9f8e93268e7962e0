use anyhow::{anyhow, ensure, Result};

use crate::types::ControlPlane;

/// Shared control-plane contract suite, run against the in-memory plane and,
/// when a disposable VM is available, against real adapters.
///
/// Leaves the VM without the two snapshots it creates.
pub fn run_control_plane_contract(plane: &dyn ControlPlane, vm_name: &str) -> Result<()> {
    let vm = plane
        .resolve_vm(vm_name)?
        .ok_or_else(|| anyhow!("vm {vm_name} must exist for contract tests"))?;
    ensure!(
        plane.resolve_vm("twin-contract-no-such-vm")?.is_none(),
        "unknown vm must resolve to None"
    );

    let first = "twin_contract_a";
    let second = "twin_contract_b";
    plane.create_snapshot(&vm, first, "contract snapshot a")?;
    plane.create_snapshot(&vm, second, "contract snapshot b")?;

    let listing = plane.list_snapshots(&vm)?;
    ensure!(listing.contains(first) && listing.contains(second), "created snapshots must be listed");
    ensure!(
        listing.current.as_deref() == Some(second),
        "latest snapshot must be current, got {:?}",
        listing.current
    );

    plane.revert_snapshot(&vm, first)?;
    let listing = plane.list_snapshots(&vm)?;
    ensure!(listing.current.as_deref() == Some(first), "revert must move the current pointer");

    ensure!(
        plane.revert_snapshot(&vm, "twin_contract_missing").is_err(),
        "reverting to an unknown snapshot must fail"
    );

    plane.delete_snapshot(&vm, second)?;
    ensure!(!plane.list_snapshots(&vm)?.contains(second), "deleted snapshot must disappear");
    plane.delete_snapshot(&vm, first)?;
    ensure!(!plane.list_snapshots(&vm)?.contains(first), "deleted snapshot must disappear");
    Ok(())
}
