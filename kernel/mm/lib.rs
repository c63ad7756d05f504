//! Guest memory access control.
//!
//! Per-page read/write/execute restrictions on guest physical memory, with
//! synchronous violation reports to a monitoring consumer and support for
//! several alternate physical-memory views of one guest.
//!
//! # Architecture
//!
//! ```text
//!  hypercall entry                      fault path
//!        |                                  |
//!        v                                  v
//! +---------------+  +------------+  +---------------+
//! | mem_access    |  | batch      |  | check         |---> emulate / request
//! | get / default |  | range/list |  | fault-time    |
//! +-------+-------+  +-----+------+  +-------+-------+
//!         |                |                 |
//!         v                v                 v
//! +-----------------------------------------------------+
//! | view (host + alternate), alt_view resolver          |
//! +---------------------------+-------------------------+
//!                             |
//!            locks (MmRwLock / MmLock), lock_order
//!                             |
//!                             v
//!               TranslationBackend (external)
//! ```
//!
//! Every lock acquisition goes through a [`CpuLockState`] owned by the
//! calling core; see [`lock_order`] for the fixed order.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod access;
pub mod alt_view;
pub mod batch;
pub mod check;
pub mod domain;
pub mod event;
pub mod lock_order;
pub mod locks;
pub mod mem_access;
pub mod view;

#[cfg(test)]
mod test_support;

use core::fmt;
use x86_64::structures::paging::{PageSize, Size4KiB};

pub use access::{ExternalAccess, MemAccessFlags, Permission};
pub use batch::{set_access_list, set_access_range, BatchStatus, CopyFault, GuestArray, PreemptCheck};
pub use check::{mem_access_check, CheckOutcome, FaultKind, NestedFault};
pub use domain::{Domain, DomainConfig, DomainId, Vcpu};
pub use event::{Emulator, MemAccessRequest, MemAccessResponse, MonitorRing};
pub use lock_order::{CpuLockState, LockOrder, OrderConstraint, OrderViolation, MM_LOCK_ORDER_MAX};
pub use locks::{MmLock, MmLockGuard, MmReadGuard, MmRwLock, MmWriteGuard};
pub use mem_access::{emulate_check, get_access, set_default_access};
pub use view::{Mfn, PageType, Query, TranslationBackend, View, ViewEntry, ViewKind};

// ============================================================================
// Constants
// ============================================================================

/// Guest page size.
pub const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Guest page shift.
pub const PAGE_SHIFT: u32 = PAGE_SIZE.trailing_zeros();

/// Maximum number of alternate views per guest.
pub const MAX_ALTP2M: usize = 10;

// ============================================================================
// Types
// ============================================================================

/// Guest frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gfn(pub u64);

impl Gfn {
    /// "No address": selects the view default in get/set requests.
    pub const INVALID: Gfn = Gfn(u64::MAX);

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Frame containing a guest physical address.
    #[inline]
    pub const fn from_gpa(gpa: u64) -> Self {
        Gfn(gpa >> PAGE_SHIFT)
    }

    #[inline]
    pub const fn add(self, n: u64) -> Self {
        Gfn(self.0.wrapping_add(n))
    }
}

impl fmt::Display for Gfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Memory access operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessError {
    /// Bad alternate view index or unrecognised access value.
    InvalidArgument,
    /// No translation present for the page.
    NotFound,
    /// Stored access tag outside the known set.
    OutOfRange,
    /// Copying a caller-supplied list failed.
    CopyFault,
    /// Alternate view still in use, or guest not paused.
    Busy,
    /// Translation backend refused the update (negative errno).
    BackendFailure(i32),
}

/// Result type for memory access operations.
pub type MemAccessResult<T> = Result<T, MemAccessError>;

const EINVAL: i32 = 22;
const ESRCH: i32 = 3;
const ERANGE: i32 = 34;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;

impl MemAccessError {
    /// Negative errno returned across the hypercall boundary.
    pub fn errno(self) -> i32 {
        match self {
            MemAccessError::InvalidArgument => -EINVAL,
            MemAccessError::NotFound => -ESRCH,
            MemAccessError::OutOfRange => -ERANGE,
            MemAccessError::CopyFault => -EFAULT,
            MemAccessError::Busy => -EBUSY,
            MemAccessError::BackendFailure(rc) => {
                if rc < 0 {
                    rc
                } else {
                    -EINVAL
                }
            }
        }
    }
}

impl fmt::Display for MemAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemAccessError::InvalidArgument => f.write_str("invalid argument"),
            MemAccessError::NotFound => f.write_str("no translation for page"),
            MemAccessError::OutOfRange => f.write_str("stored access out of range"),
            MemAccessError::CopyFault => f.write_str("fault copying caller list"),
            MemAccessError::Busy => f.write_str("view busy"),
            MemAccessError::BackendFailure(rc) => write!(f, "translation backend error {}", rc),
        }
    }
}
