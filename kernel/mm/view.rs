//! Guest physical memory views.
//!
//! A view is one guest-physical to machine-frame mapping table. Every guest
//! has a host view and, while alternate views are active, up to
//! [`MAX_ALTP2M`](crate::MAX_ALTP2M) alternate ones. The mappings themselves
//! live in a [`TranslationBackend`]; a [`View`] adds the lock, the default
//! permission, deferred flush bookkeeping and the access-required flag.
//!
//! Backend entries are only reachable through a held view lock:
//! [`View::lock`] for updates, [`View::read`] for lookups.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crate::access::{translate_external, ExternalAccess, Permission};
use crate::domain::DomainId;
use crate::lock_order::{CpuLockState, LockOrder};
use crate::locks::{MmReadGuard, MmRwLock, MmWriteGuard};
use crate::{Gfn, MemAccessError, MemAccessResult};

// ============================================================================
// Entries
// ============================================================================

/// Machine frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mfn(pub u64);

impl Mfn {
    pub const INVALID: Mfn = Mfn(u64::MAX);

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

/// Type of a mapping, as kept by the translation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageType(pub u8);

impl PageType {
    /// Ordinary read/write guest RAM.
    pub const RAM_RW: PageType = PageType(0);
    pub const RAM_RO: PageType = PageType(1);
    pub const RAM_LOGDIRTY: PageType = PageType(2);
    pub const MMIO_DIRECT: PageType = PageType(5);
    pub const INVALID: PageType = PageType(0xff);
}

/// Lookup mode for [`TranslationBackend::get_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Report the entry as is.
    Plain,
    /// Populate a demand-allocated entry before reporting it.
    Alloc,
}

/// One entry as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewEntry {
    pub mfn: Mfn,
    pub page_type: PageType,
    /// Raw permission tag; validated by [`ViewEntry::permission`].
    pub access: u8,
    /// Order of the mapping that covers the frame (0 for 4 KiB).
    pub order: u32,
    pub suppress_ve: bool,
}

impl ViewEntry {
    /// Entry for a frame with no translation.
    pub const NOT_PRESENT: ViewEntry = ViewEntry {
        mfn: Mfn::INVALID,
        page_type: PageType::INVALID,
        access: Permission::N as u8,
        order: 0,
        suppress_ve: true,
    };

    #[inline]
    pub fn is_present(&self) -> bool {
        self.mfn.is_valid()
    }

    pub fn permission(&self) -> MemAccessResult<Permission> {
        Permission::from_tag(self.access).ok_or(MemAccessError::OutOfRange)
    }
}

/// The translation engine behind a view.
///
/// Implementations do their own internal synchronisation; callers serialise
/// updates to one view through the view lock.
pub trait TranslationBackend: Send + Sync {
    /// Look up `gfn`. Frames without a translation report
    /// [`ViewEntry::NOT_PRESENT`].
    fn get_entry(&self, gfn: Gfn, query: Query) -> ViewEntry;

    /// Map the naturally aligned `1 << order` frames at `gfn` to `mfn`.
    ///
    /// `suppress_ve` of `None` keeps the existing bit, or sets it on a new
    /// entry.
    fn set_entry(
        &self,
        gfn: Gfn,
        mfn: Mfn,
        order: u32,
        page_type: PageType,
        access: Permission,
        suppress_ve: Option<bool>,
    ) -> MemAccessResult<()>;

    /// Flush cached translations of this view.
    fn flush(&self) {}
}

// ============================================================================
// View
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Host,
    Alternate(u16),
}

/// A guest physical memory view.
pub struct View {
    domain: DomainId,
    kind: ViewKind,
    lock: MmRwLock,
    default_access: AtomicU8,
    /// Outstanding write holds; the last one out flushes.
    defer_flush: AtomicU32,
    need_flush: AtomicBool,
    access_required: AtomicBool,
    backend: Arc<dyn TranslationBackend>,
}

impl View {
    /// `control` selects the biased lock level of a control guest.
    pub fn new(
        domain: DomainId,
        kind: ViewKind,
        control: bool,
        default_access: Permission,
        backend: Arc<dyn TranslationBackend>,
    ) -> Self {
        let order = match kind {
            ViewKind::Host => LockOrder::HostView,
            ViewKind::Alternate(_) => LockOrder::AltView,
        };
        Self {
            domain,
            kind,
            lock: MmRwLock::new(order, control),
            default_access: AtomicU8::new(default_access.tag()),
            defer_flush: AtomicU32::new(0),
            need_flush: AtomicBool::new(false),
            access_required: AtomicBool::new(false),
            backend,
        }
    }

    #[inline]
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    #[inline]
    pub fn is_alternate(&self) -> bool {
        matches!(self.kind, ViewKind::Alternate(_))
    }

    pub fn default_access(&self) -> Permission {
        // Only ever stored from a `Permission`.
        Permission::from_tag(self.default_access.load(Ordering::Acquire))
            .unwrap_or(Permission::Rwx)
    }

    pub fn set_default_access(&self, access: Permission) {
        self.default_access.store(access.tag(), Ordering::Release);
    }

    /// Translate an external value, resolving `DEFAULT` against this view.
    pub fn translate(&self, access: ExternalAccess) -> MemAccessResult<Permission> {
        translate_external(access, self.default_access())
    }

    pub fn access_required(&self) -> bool {
        self.access_required.load(Ordering::Acquire)
    }

    pub fn set_access_required(&self, required: bool) {
        self.access_required.store(required, Ordering::Release);
    }

    /// The underlying lock, for ownership queries.
    pub fn raw_lock(&self) -> &MmRwLock {
        &self.lock
    }

    /// Take the view for update.
    #[track_caller]
    pub fn lock<'a>(&'a self, cpu: &'a CpuLockState) -> ViewGuard<'a> {
        let write = self.lock.write(cpu);
        self.defer_flush.fetch_add(1, Ordering::Relaxed);
        ViewGuard {
            view: self,
            _write: write,
        }
    }

    /// Take the view for lookup.
    #[track_caller]
    pub fn read<'a>(&'a self, cpu: &'a CpuLockState) -> ViewReadGuard<'a> {
        ViewReadGuard {
            view: self,
            _read: self.lock.read(cpu),
        }
    }
}

/// Write hold on a [`View`].
///
/// Dropping the outermost guard runs the pending flush before the lock is
/// released.
pub struct ViewGuard<'a> {
    view: &'a View,
    _write: MmWriteGuard<'a>,
}

impl ViewGuard<'_> {
    #[inline]
    pub fn view(&self) -> &View {
        self.view
    }

    pub fn get_entry(&self, gfn: Gfn, query: Query) -> ViewEntry {
        self.view.backend.get_entry(gfn, query)
    }

    pub fn set_entry(
        &self,
        gfn: Gfn,
        mfn: Mfn,
        order: u32,
        page_type: PageType,
        access: Permission,
        suppress_ve: Option<bool>,
    ) -> MemAccessResult<()> {
        self.view
            .backend
            .set_entry(gfn, mfn, order, page_type, access, suppress_ve)?;
        self.view.need_flush.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Rewrite only the permission of a present 4 KiB entry.
    pub fn set_access(&self, gfn: Gfn, entry: &ViewEntry, access: Permission) -> MemAccessResult<()> {
        self.set_entry(gfn, entry.mfn, 0, entry.page_type, access, None)
    }
}

impl Drop for ViewGuard<'_> {
    fn drop(&mut self) {
        let view = self.view;
        if view.defer_flush.fetch_sub(1, Ordering::Relaxed) == 1
            && view.need_flush.swap(false, Ordering::Relaxed)
        {
            view.backend.flush();
        }
        // `_write` drops after this, releasing the lock.
    }
}

/// Read hold on a [`View`].
pub struct ViewReadGuard<'a> {
    view: &'a View,
    _read: MmReadGuard<'a>,
}

impl ViewReadGuard<'_> {
    pub fn get_entry(&self, gfn: Gfn, query: Query) -> ViewEntry {
        self.view.backend.get_entry(gfn, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemBackend;

    fn host_view(backend: Arc<MemBackend>) -> View {
        View::new(1, ViewKind::Host, false, Permission::Rwx, backend)
    }

    #[test]
    fn test_lock_class_follows_kind() {
        let backend = Arc::new(MemBackend::new());
        let host = host_view(backend.clone());
        let alt = View::new(1, ViewKind::Alternate(3), false, Permission::Rwx, backend.clone());
        let ctrl = View::new(0, ViewKind::Host, true, Permission::Rwx, backend);
        assert_eq!(host.raw_lock().order(), LockOrder::HostView);
        assert_eq!(alt.raw_lock().order(), LockOrder::AltView);
        assert_eq!(ctrl.raw_lock().level(), LockOrder::HostView.level_for(true));
    }

    #[test]
    fn test_nested_holds_flush_once_on_outermost_release() {
        let backend = Arc::new(MemBackend::new());
        backend.map(Gfn(5), Mfn(50), PageType::RAM_RW, Permission::Rwx);
        let view = host_view(backend.clone());
        let cpu = CpuLockState::new(0);
        {
            let outer = view.lock(&cpu);
            let entry = outer.get_entry(Gfn(5), Query::Plain);
            outer.set_access(Gfn(5), &entry, Permission::R).unwrap();
            {
                let inner = view.lock(&cpu);
                inner.set_access(Gfn(5), &entry, Permission::Rw).unwrap();
            }
            assert_eq!(backend.flushes(), 0);
        }
        assert_eq!(backend.flushes(), 1);
        assert_eq!(cpu.level(), 0);
        assert!(!view.raw_lock().write_locked_by(&cpu));
    }

    #[test]
    fn test_no_flush_without_update() {
        let backend = Arc::new(MemBackend::new());
        let view = host_view(backend.clone());
        let cpu = CpuLockState::new(0);
        drop(view.lock(&cpu));
        assert_eq!(backend.flushes(), 0);
    }

    #[test]
    fn test_read_under_write_sees_update() {
        let backend = Arc::new(MemBackend::new());
        backend.map(Gfn(9), Mfn(90), PageType::RAM_RW, Permission::Rwx);
        let view = host_view(backend);
        let cpu = CpuLockState::new(0);
        let w = view.lock(&cpu);
        let entry = w.get_entry(Gfn(9), Query::Plain);
        w.set_access(Gfn(9), &entry, Permission::X).unwrap();
        let r = view.read(&cpu);
        assert_eq!(r.get_entry(Gfn(9), Query::Plain).permission(), Ok(Permission::X));
    }

    #[test]
    fn test_bad_stored_tag_is_out_of_range() {
        let entry = ViewEntry {
            access: 200,
            ..ViewEntry::NOT_PRESENT
        };
        assert_eq!(entry.permission(), Err(MemAccessError::OutOfRange));
        assert!(!entry.is_present());
    }

    #[test]
    fn test_default_access_and_translate() {
        let view = host_view(Arc::new(MemBackend::new()));
        view.set_default_access(Permission::Rx2rw);
        assert_eq!(view.default_access(), Permission::Rx2rw);
        assert_eq!(view.translate(ExternalAccess::DEFAULT), Ok(Permission::Rx2rw));
        assert_eq!(view.translate(ExternalAccess::W), Ok(Permission::W));
    }
}
