//! Fault-time access check.
//!
//! Runs once for every nested page fault caused by an access restriction.
//! The order of effects is fixed:
//!
//! 1. Transitioning permissions are upgraded under the view lock.
//! 2. With no listener attached the fault is either fatal for the guest
//!    (enforcement required) or the restriction is dropped.
//! 3. Page-walk faults may be emulated instead of reported.
//! 4. Otherwise a violation record is built for the caller to deliver.
//!
//! An upgrade therefore always happens before the consumer hears about the
//! fault, and the consumer is never asked about a page that was silently
//! promoted.

use x86_64::PhysAddr;

use crate::access::{MemAccessFlags, Permission};
use crate::domain::{Domain, Vcpu};
use crate::event::MemAccessRequest;
use crate::lock_order::CpuLockState;
use crate::view::{Query, ViewGuard};
use crate::{Gfn, PAGE_SIZE};

/// Where in the translation the fault arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultKind {
    #[default]
    Unknown,
    /// On the final translation of a guest linear address.
    WithGla,
    /// While the hardware walked the guest's page tables.
    InGpt,
}

/// Decoded nested page fault qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NestedFault {
    pub read: bool,
    pub write: bool,
    pub fetch: bool,
    pub gla_valid: bool,
    pub kind: FaultKind,
}

impl NestedFault {
    fn access_flags(&self) -> MemAccessFlags {
        let mut flags = MemAccessFlags::empty();
        flags.set(MemAccessFlags::R, self.read);
        flags.set(MemAccessFlags::W, self.write);
        flags.set(MemAccessFlags::X, self.fetch);
        flags
    }
}

/// Result of [`mem_access_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    /// The faulting vCPU must wait for the consumer's response.
    pub pause: bool,
    /// Record to hand to the monitor transport.
    pub request: Option<MemAccessRequest>,
}

impl CheckOutcome {
    const RESOLVED: CheckOutcome = CheckOutcome {
        pause: false,
        request: None,
    };
}

#[track_caller]
fn must_set(guard: &ViewGuard<'_>, gfn: Gfn, access: Permission) {
    // The entry was read under the same hold, so the rewrite cannot fail.
    let entry = guard.get_entry(gfn, Query::Plain);
    let rc = guard.set_access(gfn, &entry, access);
    assert!(rc.is_ok(), "gfn {} rewrite to {:?} failed: {:?}", gfn, access, rc);
}

/// Handle an access-restriction fault at `gpa` taken by `vcpu`.
pub fn mem_access_check(
    domain: &Domain,
    vcpu: &Vcpu,
    cpu: &CpuLockState,
    gpa: PhysAddr,
    gla: u64,
    fault: NestedFault,
) -> CheckOutcome {
    let view = domain.vcpu_view(vcpu);
    let gfn = Gfn::from_gpa(gpa.as_u64());

    let access = {
        let guard = view.lock(cpu);
        let access = guard.get_entry(gfn, Query::Plain).permission().ok();
        match access {
            Some(Permission::Rx2rw) if fault.write => {
                must_set(&guard, gfn, Permission::Rw);
                return CheckOutcome::RESOLVED;
            }
            Some(Permission::N2rwx) => {
                assert!(fault.read || fault.write || fault.fetch);
                must_set(&guard, gfn, Permission::Rwx);
            }
            _ => {}
        }
        access
    };

    if !domain.monitor().has_listener() {
        if view.access_required() {
            klog_domain!(
                Warn,
                domain.id(),
                vcpu.id(),
                "memory access permissions failure, no listener"
            );
            domain.crash();
            return CheckOutcome::RESOLVED;
        }

        let guard = view.lock(cpu);
        let current = guard.get_entry(gfn, Query::Plain).permission().ok();
        if current != Some(Permission::N2rwx) {
            must_set(&guard, gfn, Permission::Rwx);
        }
        return CheckOutcome::RESOLVED;
    }

    if domain.inguest_pagefault_disabled() && fault.kind == FaultKind::InGpt {
        klog_domain!(Debug, domain.id(), vcpu.id(), "emulating page-walk fault at gfn {}", gfn);
        vcpu.set_send_event(true);
        domain.emulator().emulate_one(vcpu);
        vcpu.set_send_event(false);
        return CheckOutcome::RESOLVED;
    }

    let mut flags = fault.access_flags();
    match fault.kind {
        FaultKind::WithGla => flags |= MemAccessFlags::FAULT_WITH_GLA,
        FaultKind::InGpt => flags |= MemAccessFlags::FAULT_IN_GPT,
        FaultKind::Unknown => {}
    }
    let gla = if fault.gla_valid {
        flags |= MemAccessFlags::GLA_VALID;
        Some(gla)
    } else {
        None
    };

    CheckOutcome {
        pause: access != Some(Permission::N2rwx),
        request: Some(MemAccessRequest {
            vcpu_id: vcpu.id(),
            gfn,
            offset: gpa.as_u64() & (PAGE_SIZE - 1),
            gla,
            flags,
        }),
    }
}
