//! Alternate view entry resolution.
//!
//! An alternate view starts empty and is filled lazily from the host view.
//! Before an alternate entry's permission is changed the entry has to exist,
//! so the resolver copies the host translation in first. Only the
//! permission is ever rewritten; translation, type and the suppress-#VE bit
//! are kept.

use crate::access::Permission;
use crate::view::{Mfn, PageType, Query, ViewEntry, ViewGuard};
use crate::{Gfn, MemAccessError, MemAccessResult};

/// Entry of `gfn` as the alternate view would see it.
///
/// Falls back to the host entry when the alternate view has none. Only
/// present host pages of type RAM read/write qualify; anything else is
/// `NotFound`. With `prepopulate`, a host superpage is first copied whole
/// into the alternate view with suppress-#VE set.
pub fn effective_entry(
    alt: &ViewGuard<'_>,
    host: &ViewGuard<'_>,
    gfn: Gfn,
    prepopulate: bool,
) -> MemAccessResult<ViewEntry> {
    let entry = alt.get_entry(gfn, Query::Plain);
    if entry.is_present() {
        return Ok(entry);
    }

    let entry = host.get_entry(gfn, Query::Alloc);
    if !entry.is_present() || entry.page_type != PageType::RAM_RW {
        return Err(MemAccessError::NotFound);
    }

    if prepopulate && entry.order != 0 {
        let mask = !((1u64 << entry.order) - 1);
        let access = entry.permission()?;
        alt.set_entry(
            Gfn(gfn.0 & mask),
            Mfn(entry.mfn.0 & mask),
            entry.order,
            entry.page_type,
            access,
            Some(true),
        )?;
    }
    Ok(entry)
}

/// Set the permission of `gfn` in an alternate view.
pub fn set_alt_view_access(
    alt: &ViewGuard<'_>,
    host: &ViewGuard<'_>,
    gfn: Gfn,
    access: Permission,
) -> MemAccessResult<()> {
    let entry = effective_entry(alt, host, gfn, true)?;
    alt.set_entry(gfn, entry.mfn, 0, entry.page_type, access, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_order::CpuLockState;
    use crate::test_support::MemBackend;
    use crate::view::{View, ViewKind};
    use alloc::sync::Arc;

    struct Pair {
        host_backend: Arc<MemBackend>,
        alt_backend: Arc<MemBackend>,
        host: View,
        alt: View,
    }

    fn pair() -> Pair {
        let host_backend = Arc::new(MemBackend::new());
        let alt_backend = Arc::new(MemBackend::new());
        Pair {
            host: View::new(1, ViewKind::Host, false, Permission::Rwx, host_backend.clone()),
            alt: View::new(1, ViewKind::Alternate(1), false, Permission::Rwx, alt_backend.clone()),
            host_backend,
            alt_backend,
        }
    }

    #[test]
    fn test_present_alternate_entry_is_used() {
        let p = pair();
        p.alt_backend.map(Gfn(2), Mfn(99), PageType::RAM_RO, Permission::R);
        let cpu = CpuLockState::new(0);
        let h = p.host.lock(&cpu);
        let a = p.alt.lock(&cpu);
        let entry = effective_entry(&a, &h, Gfn(2), true).unwrap();
        assert_eq!(entry.mfn, Mfn(99));
        assert_eq!(entry.page_type, PageType::RAM_RO);
    }

    #[test]
    fn test_missing_everywhere_is_not_found() {
        let p = pair();
        let cpu = CpuLockState::new(0);
        let h = p.host.lock(&cpu);
        let a = p.alt.lock(&cpu);
        assert_eq!(
            effective_entry(&a, &h, Gfn(7), true),
            Err(MemAccessError::NotFound)
        );
    }

    #[test]
    fn test_non_ram_host_page_is_not_found() {
        let p = pair();
        p.host_backend.map(Gfn(7), Mfn(70), PageType::MMIO_DIRECT, Permission::Rw);
        let cpu = CpuLockState::new(0);
        let h = p.host.lock(&cpu);
        let a = p.alt.lock(&cpu);
        assert_eq!(
            set_alt_view_access(&a, &h, Gfn(7), Permission::R),
            Err(MemAccessError::NotFound)
        );
        assert!(!p.alt_backend.entry(Gfn(7)).is_present());
    }

    #[test]
    fn test_small_page_copied_with_new_permission() {
        let p = pair();
        p.host_backend.map(Gfn(0x10), Mfn(0x500), PageType::RAM_RW, Permission::Rwx);
        let cpu = CpuLockState::new(0);
        {
            let h = p.host.lock(&cpu);
            let a = p.alt.lock(&cpu);
            set_alt_view_access(&a, &h, Gfn(0x10), Permission::Rx).unwrap();
        }
        let alt = p.alt_backend.entry(Gfn(0x10));
        assert_eq!(alt.mfn, Mfn(0x500));
        assert_eq!(alt.page_type, PageType::RAM_RW);
        assert_eq!(alt.permission(), Ok(Permission::Rx));
        assert!(alt.suppress_ve);
        // Host untouched.
        assert_eq!(p.host_backend.entry(Gfn(0x10)).permission(), Ok(Permission::Rwx));
        assert_eq!(p.alt_backend.flushes(), 1);
    }

    #[test]
    fn test_superpage_prepopulated_before_update() {
        let p = pair();
        // 2 MiB host mapping covering gfn 0x200..0x400.
        p.host_backend
            .map_order(Gfn(0x200), Mfn(0x8000), 9, PageType::RAM_RW, Permission::Rw);
        let cpu = CpuLockState::new(0);
        {
            let h = p.host.lock(&cpu);
            let a = p.alt.lock(&cpu);
            set_alt_view_access(&a, &h, Gfn(0x234), Permission::R).unwrap();
        }

        let target = p.alt_backend.entry(Gfn(0x234));
        assert_eq!(target.mfn, Mfn(0x8034));
        assert_eq!(target.permission(), Ok(Permission::R));
        assert!(target.suppress_ve);

        for gfn in [0x200, 0x233, 0x235, 0x3ff] {
            let e = p.alt_backend.entry(Gfn(gfn));
            assert_eq!(e.mfn, Mfn(0x8000 + gfn - 0x200));
            assert_eq!(e.permission(), Ok(Permission::Rw));
            assert!(e.suppress_ve);
        }
        assert!(!p.alt_backend.entry(Gfn(0x400)).is_present());
    }

    #[test]
    fn test_sticky_suppress_bit_preserved() {
        let p = pair();
        p.alt_backend.map(Gfn(1), Mfn(11), PageType::RAM_RW, Permission::Rwx);
        p.alt_backend.set_suppress_ve(Gfn(1), false);
        let cpu = CpuLockState::new(0);
        {
            let h = p.host.lock(&cpu);
            let a = p.alt.lock(&cpu);
            set_alt_view_access(&a, &h, Gfn(1), Permission::N).unwrap();
        }
        let e = p.alt_backend.entry(Gfn(1));
        assert!(!e.suppress_ve);
        assert_eq!(e.permission(), Ok(Permission::N));
    }
}
