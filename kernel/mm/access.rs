//! Page access permissions.
//!
//! Two enumerations meet here. [`Permission`] is what a view entry stores;
//! [`ExternalAccess`] is the raw value exchanged with the monitoring
//! consumer, which adds a "use the view default" request on top of the ten
//! concrete permissions. Both share numbering for the concrete values.
//!
//! # Transitioning Permissions
//!
//! - `Rx2rw`: read/execute until the first write fault, then read/write.
//! - `N2rwx`: no access until the first fault of any kind, then full access.
//!
//! The fault-time check performs the upgrade; see [`crate::check`].

use crate::{MemAccessError, MemAccessResult};

/// Concrete permission stored in a view entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Permission {
    /// No access.
    N = 0,
    R = 1,
    W = 2,
    Rw = 3,
    X = 4,
    Rx = 5,
    Wx = 6,
    Rwx = 7,
    /// Read/execute, upgraded to read/write on the first write fault.
    Rx2rw = 8,
    /// No access, upgraded to read/write/execute on the first fault.
    N2rwx = 9,
}

impl Permission {
    pub const ALL: [Permission; 10] = [
        Permission::N,
        Permission::R,
        Permission::W,
        Permission::Rw,
        Permission::X,
        Permission::Rx,
        Permission::Wx,
        Permission::Rwx,
        Permission::Rx2rw,
        Permission::N2rwx,
    ];

    /// Decode a stored tag. `None` for anything outside the known set.
    pub const fn from_tag(tag: u8) -> Option<Permission> {
        Some(match tag {
            0 => Permission::N,
            1 => Permission::R,
            2 => Permission::W,
            3 => Permission::Rw,
            4 => Permission::X,
            5 => Permission::Rx,
            6 => Permission::Wx,
            7 => Permission::Rwx,
            8 => Permission::Rx2rw,
            9 => Permission::N2rwx,
            _ => return None,
        })
    }

    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Value reported to the monitoring consumer.
    #[inline]
    pub const fn to_external(self) -> ExternalAccess {
        ExternalAccess(self as u8)
    }

    /// Access bits that violate this permission.
    pub const fn disallowed(self) -> MemAccessFlags {
        match self {
            Permission::N | Permission::N2rwx => MemAccessFlags::RWX,
            Permission::R => MemAccessFlags::WX,
            Permission::W => MemAccessFlags::RX,
            Permission::X => MemAccessFlags::RW,
            Permission::Rx | Permission::Rx2rw => MemAccessFlags::W,
            Permission::Wx => MemAccessFlags::R,
            Permission::Rw => MemAccessFlags::X,
            Permission::Rwx => MemAccessFlags::empty(),
        }
    }
}

/// Access value as exchanged with the monitoring consumer.
///
/// Kept as a raw byte: values arrive from untrusted callers and anything
/// outside `0..=10` must be rejected rather than assumed away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalAccess(pub u8);

impl ExternalAccess {
    pub const N: ExternalAccess = ExternalAccess(0);
    pub const R: ExternalAccess = ExternalAccess(1);
    pub const W: ExternalAccess = ExternalAccess(2);
    pub const RW: ExternalAccess = ExternalAccess(3);
    pub const X: ExternalAccess = ExternalAccess(4);
    pub const RX: ExternalAccess = ExternalAccess(5);
    pub const WX: ExternalAccess = ExternalAccess(6);
    pub const RWX: ExternalAccess = ExternalAccess(7);
    pub const RX2RW: ExternalAccess = ExternalAccess(8);
    pub const N2RWX: ExternalAccess = ExternalAccess(9);
    /// Use the target view's default permission.
    pub const DEFAULT: ExternalAccess = ExternalAccess(10);
}

/// Map an external access value to the permission to store.
///
/// `DEFAULT` resolves to `view_default`; unknown values are rejected.
pub fn translate_external(
    access: ExternalAccess,
    view_default: Permission,
) -> MemAccessResult<Permission> {
    if access == ExternalAccess::DEFAULT {
        return Ok(view_default);
    }
    Permission::from_tag(access.0).ok_or(MemAccessError::InvalidArgument)
}

bitflags::bitflags! {
    /// Fault reason bits carried in a violation record and its response.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemAccessFlags: u32 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
        /// The record carries a guest linear address.
        const GLA_VALID = 1 << 3;
        /// Fault on the final translation of a linear address.
        const FAULT_WITH_GLA = 1 << 4;
        /// Fault while walking the guest's own page tables.
        const FAULT_IN_GPT = 1 << 5;

        const RW = Self::R.bits() | Self::W.bits();
        const RX = Self::R.bits() | Self::X.bits();
        const WX = Self::W.bits() | Self::X.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

/// Whether an access described by `flags` still violates `access`.
///
/// Unknown values (including `DEFAULT`) deny any read, write or execute.
pub fn is_violation(access: ExternalAccess, flags: MemAccessFlags) -> bool {
    let disallowed = match Permission::from_tag(access.0) {
        Some(perm) => perm.disallowed(),
        None => MemAccessFlags::RWX,
    };
    flags.intersects(disallowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_round_trip() {
        for perm in Permission::ALL {
            let ext = perm.to_external();
            assert_eq!(translate_external(ext, Permission::Rwx), Ok(perm));
            assert_eq!(Permission::from_tag(perm.tag()), Some(perm));
        }
    }

    #[test]
    fn test_default_resolves_against_view() {
        assert_eq!(
            translate_external(ExternalAccess::DEFAULT, Permission::Rx),
            Ok(Permission::Rx)
        );
        assert_eq!(
            translate_external(ExternalAccess::DEFAULT, Permission::N2rwx),
            Ok(Permission::N2rwx)
        );
    }

    #[test]
    fn test_unknown_external_value_rejected() {
        for raw in [11u8, 12, 0x80, u8::MAX] {
            assert_eq!(
                translate_external(ExternalAccess(raw), Permission::Rwx),
                Err(MemAccessError::InvalidArgument)
            );
        }
        assert_eq!(Permission::from_tag(10), None);
    }

    #[test]
    fn test_violation_table() {
        use MemAccessFlags as F;
        let cases: [(ExternalAccess, F, bool); 16] = [
            (ExternalAccess::N, F::R, true),
            (ExternalAccess::N2RWX, F::X, true),
            (ExternalAccess::R, F::R, false),
            (ExternalAccess::R, F::W, true),
            (ExternalAccess::R, F::X, true),
            (ExternalAccess::W, F::W, false),
            (ExternalAccess::W, F::R, true),
            (ExternalAccess::X, F::X, false),
            (ExternalAccess::X, F::W, true),
            (ExternalAccess::RX, F::RX, false),
            (ExternalAccess::RX2RW, F::W, true),
            (ExternalAccess::WX, F::R, true),
            (ExternalAccess::RW, F::X, true),
            (ExternalAccess::RW, F::RW, false),
            (ExternalAccess::RWX, F::RWX, false),
            (ExternalAccess(42), F::R, true),
        ];
        for (access, flags, expected) in cases {
            assert_eq!(is_violation(access, flags), expected, "{:?} {:?}", access, flags);
        }
    }

    #[test]
    fn test_non_access_bits_never_violate() {
        let flags = MemAccessFlags::GLA_VALID | MemAccessFlags::FAULT_IN_GPT;
        assert!(!is_violation(ExternalAccess::N, flags));
        assert!(!is_violation(ExternalAccess::DEFAULT, flags));
    }
}
