//! Boundary with the monitoring consumer and the instruction emulator.
//!
//! The transport that carries records to the consumer is not part of this
//! crate: the fault-time check hands a [`MemAccessRequest`] back to its
//! caller, which owns delivery and the pause/resume handshake.

use crate::access::MemAccessFlags;
use crate::domain::Vcpu;
use crate::Gfn;

/// Violation record for one permission-checked fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessRequest {
    pub vcpu_id: u32,
    pub gfn: Gfn,
    /// Offset of the faulting access within the page.
    pub offset: u64,
    /// Guest linear address, when the fault carried one.
    pub gla: Option<u64>,
    pub flags: MemAccessFlags,
}

/// Consumer reply, as used to re-check an emulated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemAccessResponse {
    pub gfn: Gfn,
    pub flags: MemAccessFlags,
}

impl From<&MemAccessRequest> for MemAccessResponse {
    fn from(req: &MemAccessRequest) -> Self {
        Self {
            gfn: req.gfn,
            flags: req.flags,
        }
    }
}

/// Monitor ring of a guest.
pub trait MonitorRing: Send + Sync {
    /// Whether a consumer is attached.
    fn has_listener(&self) -> bool;
}

/// Instruction emulator.
pub trait Emulator: Send + Sync {
    /// Execute one instruction on behalf of `vcpu`.
    fn emulate_one(&self, vcpu: &Vcpu);
}
