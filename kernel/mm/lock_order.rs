//! Lock ordering for the guest memory-access subsystem.
//!
//! Every mm lock belongs to one of eight classes with a fixed numeric order.
//! Locks must be acquired in ascending order and released in reverse; the
//! verifier below rejects any acquisition whose level is lower than the
//! highest level currently held on the same core.
//!
//! # Lock Ordering (acquire top to bottom)
//!
//! ```text
//! 8   NestedView      per-guest, nested view table array
//! 16  HostView        per-guest host view (rwlock, recursive writer)
//! 24  PerPageSharing  external, per shared page
//! 32  AltViewList     per-guest list of alternate views
//! 40  AltView         per alternate view (rwlock, recursive writer)
//! 48  Pod             per view, populate-on-demand cache
//! 56  PageAlloc       external, per-guest page allocator
//! 64  Paging          per-guest paging structures
//! ```
//!
//! Host-side changes that must be mirrored into alternate views therefore
//! take `HostView -> AltViewList -> AltView`, never the reverse.
//!
//! # Privileged Bias
//!
//! Locks owned by a control guest are shifted up by [`MM_LOCK_ORDER_MAX`].
//! A hypercall from the control guest may hold the subject guest's locks and
//! then need its own (for example while copying a list out of its memory).
//!
//! # Per-Core State
//!
//! The current level is not ambient global state: each execution core owns a
//! [`CpuLockState`] and passes it by reference into every acquire and
//! release. Tests simulate N cores with N independent states.
//!
//! # Known Gap
//!
//! Read acquisitions are checked against the current level but do not raise
//! it (there is nowhere to keep a per-reader restore level), so an ordering
//! violation made while only a read lock is held goes unnoticed.

use core::cell::Cell;

/// Bias applied to every lock level of a control guest.
pub const MM_LOCK_ORDER_MAX: i32 = 64;

/// Sentinel owner value for "not held by any core".
pub const NO_CPU: usize = usize::MAX;

/// Lock class, ordered from outermost to innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockOrder {
    /// Nested view table array (per guest).
    NestedView = 8,
    /// Host view table.
    HostView = 16,
    /// Per-page sharing lock (external).
    PerPageSharing = 24,
    /// Alternate view list (per guest).
    AltViewList = 32,
    /// Alternate view table.
    AltView = 40,
    /// Populate-on-demand cache (per view).
    Pod = 48,
    /// Guest page allocator (external).
    PageAlloc = 56,
    /// Paging structures (per guest).
    Paging = 64,
}

impl LockOrder {
    /// All classes in acquisition order.
    pub const ALL: [LockOrder; 8] = [
        LockOrder::NestedView,
        LockOrder::HostView,
        LockOrder::PerPageSharing,
        LockOrder::AltViewList,
        LockOrder::AltView,
        LockOrder::Pod,
        LockOrder::PageAlloc,
        LockOrder::Paging,
    ];

    /// Unbiased numeric level.
    #[inline]
    pub const fn value(self) -> i32 {
        self as i32
    }

    /// Level of a lock of this class owned by a guest, with the control
    /// guest bias applied.
    #[inline]
    pub const fn level_for(self, control: bool) -> i32 {
        self.value() + if control { MM_LOCK_ORDER_MAX } else { 0 }
    }

    pub const fn name(self) -> &'static str {
        match self {
            LockOrder::NestedView => "nested_view",
            LockOrder::HostView => "host_view",
            LockOrder::PerPageSharing => "per_page_sharing",
            LockOrder::AltViewList => "alt_view_list",
            LockOrder::AltView => "alt_view",
            LockOrder::Pod => "pod",
            LockOrder::PageAlloc => "page_alloc",
            LockOrder::Paging => "paging",
        }
    }
}

/// An acquisition that would lower the per-core level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderViolation {
    /// Level currently held on this core.
    pub held: i32,
    /// Level of the lock being requested.
    pub requested: i32,
}

/// Per-core lock level tracking.
///
/// One instance per execution core, reset at core bring-up and touched only
/// by lock acquire/release on that core. It is deliberately `!Sync`.
#[derive(Debug)]
pub struct CpuLockState {
    cpu: usize,
    level: Cell<i32>,
}

impl CpuLockState {
    pub const fn new(cpu: usize) -> Self {
        assert!(cpu != NO_CPU, "reserved cpu id");
        Self {
            cpu,
            level: Cell::new(0),
        }
    }

    /// Identity of the owning core, recorded as lock owner.
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Highest level currently held on this core.
    #[inline]
    pub fn level(&self) -> i32 {
        self.level.get()
    }

    /// Core init: no mm lock is held.
    pub fn reset(&self) {
        self.level.set(0);
    }

    /// Check whether a lock at `level` may be taken now.
    #[inline]
    pub fn check(&self, level: i32) -> Result<(), OrderViolation> {
        let held = self.level.get();
        if held > level {
            return Err(OrderViolation {
                held,
                requested: level,
            });
        }
        Ok(())
    }

    /// Like [`check`](Self::check), but an ordering violation is fatal.
    ///
    /// The numbers printed are the levels from [`LockOrder`], biased by
    /// [`MM_LOCK_ORDER_MAX`] for control guest locks.
    #[track_caller]
    pub fn enforce(&self, level: i32, name: &str) {
        if let Err(v) = self.check(level) {
            klog_force!(
                "mm locking order violation on cpu {}: {} > {} ({})",
                self.cpu,
                v.held,
                v.requested,
                name
            );
            panic!(
                "mm locking order violation: {} > {} ({})",
                v.held, v.requested, name
            );
        }
    }

    /// Drop the innermost lock at `held` and go back to `restore`.
    ///
    /// Locks come off a core in the reverse order they went on, so the lock
    /// being released must be the one that set the current level. Anything
    /// else is fatal.
    #[track_caller]
    pub(crate) fn release(&self, held: i32, restore: i32, name: &str) {
        let level = self.level.get();
        if level != held {
            klog_force!(
                "mm lock release order mismatch on cpu {}: {} at {}, core at {}",
                self.cpu,
                name,
                held,
                level
            );
            panic!(
                "mm lock release order mismatch: {} at {}, core at {}",
                name, held, level
            );
        }
        self.level.set(restore);
    }

    #[inline]
    pub(crate) fn set_level(&self, level: i32) {
        self.level.set(level);
    }
}

/// Ordering hooks for locks that live outside this crate.
///
/// The per-page sharing lock and the page allocator lock are not
/// [`MmLock`](crate::locks::MmLock)s, but they still sit at fixed points in
/// the order. Their owners call [`pre_lock`](Self::pre_lock) before spinning,
/// [`post_lock`](Self::post_lock) once the lock is held and
/// [`unlock`](Self::unlock) on release, keeping the restore level and an
/// optional recursion count in their own storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderConstraint {
    order: LockOrder,
}

/// Per-page sharing lock. Not tied to a guest, so never biased.
pub const PER_PAGE_SHARING: OrderConstraint = OrderConstraint::new(LockOrder::PerPageSharing);

/// Per-guest page allocator lock. Not recursive.
pub const PAGE_ALLOC: OrderConstraint = OrderConstraint::new(LockOrder::PageAlloc);

impl OrderConstraint {
    pub const fn new(order: LockOrder) -> Self {
        Self { order }
    }

    #[inline]
    pub fn order(&self) -> LockOrder {
        self.order
    }

    #[track_caller]
    pub fn pre_lock(&self, cpu: &CpuLockState, control: bool) {
        cpu.enforce(self.order.level_for(control), self.order.name());
    }

    /// Record the restore level (on first entry when recursive) and raise
    /// the core level.
    pub fn post_lock(
        &self,
        cpu: &CpuLockState,
        control: bool,
        unlock_level: &mut i32,
        recurse_count: Option<&mut u16>,
    ) {
        match recurse_count {
            Some(count) => {
                if *count == 0 {
                    *unlock_level = cpu.level();
                }
                *count += 1;
            }
            None => *unlock_level = cpu.level(),
        }
        cpu.set_level(self.order.level_for(control));
    }

    /// Drop one hold; the saved level comes back on the outermost release.
    pub fn unlock(&self, cpu: &CpuLockState, unlock_level: i32, recurse_count: Option<&mut u16>) {
        match recurse_count {
            Some(count) => {
                assert!(*count != 0, "{} released more often than taken", self.order.name());
                *count -= 1;
                if *count == 0 {
                    cpu.set_level(unlock_level);
                }
            }
            None => cpu.set_level(unlock_level),
        }
    }
}
