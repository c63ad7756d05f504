//! Ordered mm lock primitives.
//!
//! Two flavours, both bound to a [`LockOrder`] class at construction:
//!
//! - [`MmLock`]: exclusive spin lock that may be re-entered by the owning
//!   core when the caller asks for recursion.
//! - [`MmRwLock`]: writer-preferring reader/writer spin lock whose write
//!   side is recursive and level-tracked. The read side is checked but not
//!   tracked, and new readers wait while a writer is queued.
//!
//! Neither lock owns data. They serialise access to structures whose storage
//! is elsewhere (view entries live in the translation backend), and release
//! happens when the returned guard is dropped.
//!
//! ```rust,ignore
//! let cpu = CpuLockState::new(0);
//! let list = MmLock::new(LockOrder::AltViewList, false);
//! let view = MmRwLock::new(LockOrder::AltView, false);
//!
//! let _l = list.lock(&cpu);      // level 32
//! let _v = view.write(&cpu);     // level 40
//! // dropping in reverse restores 32, then 0
//! ```

use core::mem;
use core::panic::Location;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use spin::{Mutex as SpinMutex, RwLock as SpinRwLock, RwLockReadGuard as SpinReadGuard};

use crate::lock_order::{CpuLockState, LockOrder, NO_CPU};

type Site = Option<&'static Location<'static>>;

struct Holder<'a>(Site, &'a str);

impl core::fmt::Display for Holder<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.0 {
            Some(site) => write!(f, "{} ({})", self.1, site),
            None => f.write_str("nobody"),
        }
    }
}

// ============================================================================
// Exclusive recursive lock
// ============================================================================

/// Exclusive mm lock with optional same-core recursion.
pub struct MmLock {
    raw: SpinMutex<()>,
    order: LockOrder,
    /// Biased level, fixed at construction.
    level: i32,
    owner: AtomicUsize,
    recurse: AtomicU32,
    unlock_level: AtomicI32,
    locker: SpinMutex<Site>,
}

impl MmLock {
    /// `control` applies the control guest bias to this lock's level.
    pub const fn new(order: LockOrder, control: bool) -> Self {
        Self {
            raw: SpinMutex::new(()),
            order,
            level: order.level_for(control),
            owner: AtomicUsize::new(NO_CPU),
            recurse: AtomicU32::new(0),
            unlock_level: AtomicI32::new(0),
            locker: SpinMutex::new(None),
        }
    }

    #[inline]
    pub fn order(&self) -> LockOrder {
        self.order
    }

    #[inline]
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Take the lock. Re-entry from the owning core is a fatal bug.
    #[track_caller]
    pub fn lock<'a>(&'a self, cpu: &'a CpuLockState) -> MmLockGuard<'a> {
        self.acquire(cpu, false, Location::caller());
        MmLockGuard { lock: self, cpu }
    }

    /// Take the lock, allowing re-entry from the owning core.
    #[track_caller]
    pub fn lock_recursive<'a>(&'a self, cpu: &'a CpuLockState) -> MmLockGuard<'a> {
        self.acquire(cpu, true, Location::caller());
        MmLockGuard { lock: self, cpu }
    }

    /// Whether `cpu` currently owns the lock.
    #[inline]
    pub fn locked_by(&self, cpu: &CpuLockState) -> bool {
        self.owner.load(Ordering::Relaxed) == cpu.cpu()
    }

    /// Whether any core holds the lock.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Call site of the outermost holder, for diagnostics.
    pub fn locker(&self) -> Option<&'static Location<'static>> {
        *self.locker.lock()
    }

    fn acquire(&self, cpu: &CpuLockState, recursive: bool, site: &'static Location<'static>) {
        let reentry = self.locked_by(cpu);
        // Re-entry cannot close a cycle, so only fresh acquisitions are checked.
        if !(reentry && recursive) {
            cpu.enforce(self.level, self.order.name());
        }

        if reentry {
            if !recursive {
                panic!(
                    "mm lock already held by {}",
                    Holder(self.locker(), self.order.name())
                );
            }
            self.recurse.fetch_add(1, Ordering::Relaxed);
            return;
        }

        mem::forget(self.raw.lock());
        self.owner.store(cpu.cpu(), Ordering::Relaxed);
        self.recurse.store(1, Ordering::Relaxed);
        *self.locker.lock() = Some(site);
        self.unlock_level.store(cpu.level(), Ordering::Relaxed);
        cpu.set_level(self.level);
    }

    fn release(&self, cpu: &CpuLockState) {
        debug_assert!(self.locked_by(cpu), "{} released by non-owner", self.order.name());
        let count = self.recurse.load(Ordering::Relaxed);
        if count > 1 {
            self.recurse.store(count - 1, Ordering::Relaxed);
            return;
        }

        cpu.release(
            self.level,
            self.unlock_level.load(Ordering::Relaxed),
            self.order.name(),
        );
        *self.locker.lock() = None;
        self.recurse.store(0, Ordering::Relaxed);
        self.owner.store(NO_CPU, Ordering::Relaxed);
        // Safety: this core took `raw` in `acquire` and forgot the guard;
        // ownership was checked above.
        unsafe { self.raw.force_unlock() };
    }
}

/// Held [`MmLock`]; one per (possibly recursive) acquisition.
pub struct MmLockGuard<'a> {
    lock: &'a MmLock,
    cpu: &'a CpuLockState,
}

impl Drop for MmLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.cpu);
    }
}

// ============================================================================
// Reader/writer lock with recursive writer
// ============================================================================

/// Reader/writer mm lock.
///
/// The write side is recursive and level-tracked like [`MmLock`]. Readers
/// are checked against the current level but never raise it, and a read
/// taken by the core that already holds the write side does not touch the
/// raw lock.
///
/// Writers are preferred: once a writer is spinning, readers from other
/// cores hold off until it has been through. Read holds therefore do not
/// nest on one core.
pub struct MmRwLock {
    raw: SpinRwLock<()>,
    order: LockOrder,
    level: i32,
    /// Writers spinning for the raw lock.
    writers: AtomicU32,
    owner: AtomicUsize,
    recurse: AtomicU32,
    unlock_level: AtomicI32,
    locker: SpinMutex<Site>,
}

impl MmRwLock {
    pub const fn new(order: LockOrder, control: bool) -> Self {
        Self {
            raw: SpinRwLock::new(()),
            order,
            level: order.level_for(control),
            writers: AtomicU32::new(0),
            owner: AtomicUsize::new(NO_CPU),
            recurse: AtomicU32::new(0),
            unlock_level: AtomicI32::new(0),
            locker: SpinMutex::new(None),
        }
    }

    #[inline]
    pub fn order(&self) -> LockOrder {
        self.order
    }

    #[inline]
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Whether some core is queued for the write side.
    #[inline]
    pub fn writer_waiting(&self) -> bool {
        self.writers.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn write_locked_by(&self, cpu: &CpuLockState) -> bool {
        self.owner.load(Ordering::Relaxed) == cpu.cpu()
    }

    /// Number of nested write holds on the owning core.
    pub fn write_depth(&self) -> u32 {
        self.recurse.load(Ordering::Relaxed)
    }

    pub fn locker(&self) -> Option<&'static Location<'static>> {
        *self.locker.lock()
    }

    /// Take the write side; re-entry from the owning core nests.
    #[track_caller]
    pub fn write<'a>(&'a self, cpu: &'a CpuLockState) -> MmWriteGuard<'a> {
        if !self.write_locked_by(cpu) {
            cpu.enforce(self.level, self.order.name());
            self.writers.fetch_add(1, Ordering::AcqRel);
            mem::forget(self.raw.write());
            self.writers.fetch_sub(1, Ordering::AcqRel);
            self.owner.store(cpu.cpu(), Ordering::Relaxed);
            *self.locker.lock() = Some(Location::caller());
            self.unlock_level.store(cpu.level(), Ordering::Relaxed);
            cpu.set_level(self.level);
        }
        self.recurse.fetch_add(1, Ordering::Relaxed);
        MmWriteGuard { lock: self, cpu }
    }

    /// Take the read side, waiting out any queued writer first.
    #[track_caller]
    pub fn read<'a>(&'a self, cpu: &'a CpuLockState) -> MmReadGuard<'a> {
        if self.write_locked_by(cpu) {
            return MmReadGuard { _raw: None };
        }
        cpu.enforce(self.level, self.order.name());
        loop {
            while self.writer_waiting() {
                core::hint::spin_loop();
            }
            let raw = self.raw.read();
            // A writer that queued while we were getting in goes first.
            if !self.writer_waiting() {
                return MmReadGuard { _raw: Some(raw) };
            }
            drop(raw);
        }
    }

    fn write_release(&self, cpu: &CpuLockState) {
        debug_assert!(self.write_locked_by(cpu), "{} released by non-owner", self.order.name());
        let count = self.recurse.load(Ordering::Relaxed);
        if count > 1 {
            self.recurse.store(count - 1, Ordering::Relaxed);
            return;
        }
        cpu.release(
            self.level,
            self.unlock_level.load(Ordering::Relaxed),
            self.order.name(),
        );
        self.recurse.store(0, Ordering::Relaxed);
        self.owner.store(NO_CPU, Ordering::Relaxed);
        *self.locker.lock() = None;
        // Safety: the write side was taken in `write` by this core and its
        // guard forgotten; this was the last nested hold.
        unsafe { self.raw.force_write_unlock() };
    }
}

/// Held write side of an [`MmRwLock`].
pub struct MmWriteGuard<'a> {
    lock: &'a MmRwLock,
    cpu: &'a CpuLockState,
}

impl Drop for MmWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_release(self.cpu);
    }
}

/// Held read side of an [`MmRwLock`].
pub struct MmReadGuard<'a> {
    _raw: Option<SpinReadGuard<'a, ()>>,
}
