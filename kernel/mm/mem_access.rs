//! Permission table access.
//!
//! Single-page queries, view default updates and the emulated-access
//! re-check. Bulk updates live in [`crate::batch`].

use crate::access::{is_violation, ExternalAccess};
use crate::domain::{Domain, Vcpu};
use crate::event::MemAccessResponse;
use crate::lock_order::CpuLockState;
use crate::view::{Query, View};
use crate::{Gfn, MemAccessError, MemAccessResult};

/// Permission of `gfn` in `view`, or the view default for [`Gfn::INVALID`].
pub(crate) fn view_get_access(
    view: &View,
    cpu: &CpuLockState,
    gfn: Gfn,
) -> MemAccessResult<ExternalAccess> {
    if gfn.is_invalid() {
        return Ok(view.default_access().to_external());
    }

    let entry = view.read(cpu).get_entry(gfn, Query::Plain);
    if !entry.is_present() {
        return Err(MemAccessError::NotFound);
    }
    match entry.permission() {
        Ok(perm) => Ok(perm.to_external()),
        Err(e) => {
            klog!(
                Warn,
                "d{}: gfn {} stored access tag {} out of range",
                view.domain(),
                gfn,
                entry.access
            );
            Err(e)
        }
    }
}

/// Query the permission of `gfn` in view `idx` (0 for the host view).
///
/// [`Gfn::INVALID`] returns the view default.
pub fn get_access(
    domain: &Domain,
    cpu: &CpuLockState,
    gfn: Gfn,
    idx: u16,
) -> MemAccessResult<ExternalAccess> {
    let view = domain.select_view(idx)?;
    view_get_access(&view, cpu, gfn)
}

/// Set the default permission of view `idx`.
///
/// `DEFAULT` resolves to the current default and so leaves it unchanged.
pub fn set_default_access(domain: &Domain, idx: u16, access: ExternalAccess) -> MemAccessResult<()> {
    let view = domain.select_view(idx)?;
    let perm = view.translate(access)?;
    view.set_default_access(perm);
    Ok(())
}

/// Re-check an access the consumer asked to emulate.
///
/// Looks the page up in the vCPU's current view; a page that cannot be
/// looked up counts as a violation.
pub fn emulate_check(
    domain: &Domain,
    vcpu: &Vcpu,
    cpu: &CpuLockState,
    rsp: &MemAccessResponse,
) -> bool {
    let view = domain.vcpu_view(vcpu);
    match view_get_access(&view, cpu, rsp.gfn) {
        Ok(access) => is_violation(access, rsp.flags),
        Err(_) => true,
    }
}
