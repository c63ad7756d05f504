//! Batch permission updates.
//!
//! Range and list updates hold the host view lock, plus the target
//! alternate view lock when one is named, for the whole call. Long batches
//! yield by returning [`BatchStatus::Preempted`] with the offset to resume
//! from; nothing else is kept across the restart.
//!
//! # Continuation
//!
//! After each entry, if more entries remain, the processed count is on a
//! `mask + 1` boundary and the caller's [`PreemptCheck`] fires, the batch
//! stops. Re-issuing the call with `start` set to the returned offset
//! continues where it left off.

use alloc::sync::Arc;

use crate::access::{ExternalAccess, Permission};
use crate::alt_view::set_alt_view_access;
use crate::domain::Domain;
use crate::lock_order::CpuLockState;
use crate::view::{Query, View, ViewGuard};
use crate::{Gfn, MemAccessError, MemAccessResult};

/// Entries copied from a caller list per step.
///
/// An eighth of a page of frame numbers; the two copy buffers on the stack
/// come to 576 bytes. A page of the caller's list splits into whole steps.
pub const LIST_CHUNK: usize = 64;

/// Outcome of a batch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Complete,
    /// Stopped for preemption; resume at this offset.
    Preempted(u32),
}

impl BatchStatus {
    /// Hypercall return value: 0, or the positive continuation offset.
    pub fn into_rc(self) -> i64 {
        match self {
            BatchStatus::Complete => 0,
            BatchStatus::Preempted(start) => i64::from(start),
        }
    }
}

/// Preemption predicate polled at continuation points.
pub trait PreemptCheck {
    fn preempt_requested(&self) -> bool;
}

impl<F: Fn() -> bool> PreemptCheck for F {
    fn preempt_requested(&self) -> bool {
        self()
    }
}

/// Copy from a caller-supplied array failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyFault;

impl From<CopyFault> for MemAccessError {
    fn from(_: CopyFault) -> Self {
        MemAccessError::CopyFault
    }
}

/// Array living in caller memory.
pub trait GuestArray<T: Copy> {
    /// Copy `dst.len()` elements starting at element `offset`.
    fn copy_out(&self, offset: usize, dst: &mut [T]) -> Result<(), CopyFault>;
}

impl<T: Copy> GuestArray<T> for [T] {
    fn copy_out(&self, offset: usize, dst: &mut [T]) -> Result<(), CopyFault> {
        let end = offset.checked_add(dst.len()).ok_or(CopyFault)?;
        let src = self.get(offset..end).ok_or(CopyFault)?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

fn select_alt(domain: &Domain, idx: u16) -> MemAccessResult<Option<Arc<View>>> {
    if idx == 0 {
        return Ok(None);
    }
    domain.select_view(idx).map(Some)
}

fn set_one(
    host: &ViewGuard<'_>,
    alt: Option<&ViewGuard<'_>>,
    gfn: Gfn,
    access: Permission,
) -> MemAccessResult<()> {
    match alt {
        // No host translation either: nothing to restrict.
        Some(alt) => match set_alt_view_access(alt, host, gfn, access) {
            Err(MemAccessError::NotFound) => Ok(()),
            rc => rc,
        },
        None => {
            let entry = host.get_entry(gfn, Query::Alloc);
            host.set_entry(gfn, entry.mfn, 0, entry.page_type, access, None)
        }
    }
}

#[inline]
fn should_yield<P: PreemptCheck + ?Sized>(nr: u32, start: u32, mask: u32, preempt: &P) -> bool {
    nr > start && start & mask == 0 && preempt.preempt_requested()
}

/// Set `access` on `nr` frames from `gfn`, beginning at offset `start`.
///
/// [`Gfn::INVALID`] sets the default permission of the view instead.
#[allow(clippy::too_many_arguments)]
pub fn set_access_range<P: PreemptCheck + ?Sized>(
    domain: &Domain,
    cpu: &CpuLockState,
    gfn: Gfn,
    nr: u32,
    start: u32,
    mask: u32,
    access: ExternalAccess,
    idx: u16,
    preempt: &P,
) -> MemAccessResult<BatchStatus> {
    let ap2m = select_alt(domain, idx)?;
    let target: &View = match &ap2m {
        Some(view) => view,
        None => domain.host(),
    };
    let perm = target.translate(access)?;

    if gfn.is_invalid() {
        target.set_default_access(perm);
        return Ok(BatchStatus::Complete);
    }

    let host = domain.host().lock(cpu);
    let alt = ap2m.as_ref().map(|view| view.lock(cpu));

    let mut start = start;
    while nr > start {
        set_one(&host, alt.as_ref(), gfn.add(u64::from(start)), perm)?;
        start += 1;
        if should_yield(nr, start, mask, preempt) {
            klog!(Debug, "d{}: access range preempted at {}", domain.id(), start);
            return Ok(BatchStatus::Preempted(start));
        }
    }
    Ok(BatchStatus::Complete)
}

/// Set per-frame permissions from parallel caller lists, beginning at
/// offset `start`.
///
/// Lists are copied a page at a time. A copy failure or an unknown access
/// value stops the batch; entries already processed stay applied.
#[allow(clippy::too_many_arguments)]
pub fn set_access_list<G, A, P>(
    domain: &Domain,
    cpu: &CpuLockState,
    gfns: &G,
    accesses: &A,
    nr: u32,
    start: u32,
    mask: u32,
    idx: u16,
    preempt: &P,
) -> MemAccessResult<BatchStatus>
where
    G: GuestArray<u64> + ?Sized,
    A: GuestArray<u8> + ?Sized,
    P: PreemptCheck + ?Sized,
{
    let ap2m = select_alt(domain, idx)?;
    let target: &View = match &ap2m {
        Some(view) => view,
        None => domain.host(),
    };

    let host = domain.host().lock(cpu);
    let alt = ap2m.as_ref().map(|view| view.lock(cpu));

    let mut gfn_buf = [0u64; LIST_CHUNK];
    let mut access_buf = [0u8; LIST_CHUNK];
    let mut start = start;
    while start < nr {
        let pos = start as usize;
        let n = (LIST_CHUNK - pos % LIST_CHUNK).min((nr - start) as usize);
        gfns.copy_out(pos, &mut gfn_buf[..n])?;
        accesses.copy_out(pos, &mut access_buf[..n])?;

        for (&gfn, &raw) in gfn_buf[..n].iter().zip(&access_buf[..n]) {
            let perm = target.translate(ExternalAccess(raw))?;
            set_one(&host, alt.as_ref(), Gfn(gfn), perm)?;
            start += 1;
            if should_yield(nr, start, mask, preempt) {
                klog!(Debug, "d{}: access list preempted at {}", domain.id(), start);
                return Ok(BatchStatus::Preempted(start));
            }
        }
    }
    Ok(BatchStatus::Complete)
}
