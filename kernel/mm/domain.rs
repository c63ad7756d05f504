//! Guest model.
//!
//! Just enough of a guest for memory access control: its host view, the
//! alternate view slots and their list lock, vCPUs with their active view,
//! a pause count, the crash flag, and handles to the monitor ring and the
//! emulator.
//!
//! # Alternate View Slots
//!
//! Slot 0 is never populated: index 0 names the host view in every request.
//! Structural changes to the slots and vCPU view switches take the list
//! lock ([`LockOrder::AltViewList`]), so a host-side change that has to reach
//! every alternate view nests `host -> list -> alternate`.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use spin::RwLock;

use crate::access::Permission;
use crate::event::{Emulator, MonitorRing};
use crate::lock_order::{CpuLockState, LockOrder};
use crate::locks::MmLock;
use crate::view::{TranslationBackend, View, ViewKind};
use crate::{MemAccessError, MemAccessResult, MAX_ALTP2M};

/// Domain identifier type.
pub type DomainId = u16;

/// Per-guest configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainConfig {
    pub id: DomainId,
    /// Control (privileged) guest; its mm locks are biased.
    pub control: bool,
    pub hvm: bool,
    /// Hardware virtualisation extensions present.
    pub hardware_virt: bool,
    /// Hardware-assisted paging enabled.
    pub hap: bool,
    /// Initial default permission of the host view.
    pub default_access: Permission,
    /// Emulate, rather than report, faults raised by guest page-table walks.
    pub inguest_pagefault_disabled: bool,
    pub nr_vcpus: u32,
}

impl DomainConfig {
    /// An HVM guest with full hardware support and one vCPU.
    pub const fn hvm(id: DomainId) -> Self {
        Self {
            id,
            control: false,
            hvm: true,
            hardware_virt: true,
            hap: true,
            default_access: Permission::Rwx,
            inguest_pagefault_disabled: false,
            nr_vcpus: 1,
        }
    }
}

/// Virtual CPU state used by memory access control.
#[derive(Debug)]
pub struct Vcpu {
    id: u32,
    /// Active alternate view; 0 means the host view.
    altp2m_idx: AtomicU16,
    /// Set while emulating a fault whose event was suppressed.
    send_event: AtomicBool,
}

impl Vcpu {
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            altp2m_idx: AtomicU16::new(0),
            send_event: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn altp2m_idx(&self) -> u16 {
        self.altp2m_idx.load(Ordering::Acquire)
    }

    #[inline]
    pub fn send_event(&self) -> bool {
        self.send_event.load(Ordering::Acquire)
    }

    pub(crate) fn set_send_event(&self, on: bool) {
        self.send_event.store(on, Ordering::Release);
    }
}

/// A guest, as seen by memory access control.
pub struct Domain {
    config: DomainConfig,
    host: Arc<View>,
    altp2m_active: AtomicBool,
    altp2m_list_lock: MmLock,
    altp2m: RwLock<[Option<Arc<View>>; MAX_ALTP2M]>,
    vcpus: Vec<Vcpu>,
    pause_count: AtomicU32,
    crashed: AtomicBool,
    monitor: Arc<dyn MonitorRing>,
    emulator: Arc<dyn Emulator>,
}

impl Domain {
    pub fn new(
        config: DomainConfig,
        host_backend: Arc<dyn TranslationBackend>,
        monitor: Arc<dyn MonitorRing>,
        emulator: Arc<dyn Emulator>,
    ) -> Self {
        let host = View::new(
            config.id,
            ViewKind::Host,
            config.control,
            config.default_access,
            host_backend,
        );
        Self {
            config,
            host: Arc::new(host),
            altp2m_active: AtomicBool::new(false),
            altp2m_list_lock: MmLock::new(LockOrder::AltViewList, config.control),
            altp2m: RwLock::new(Default::default()),
            vcpus: (0..config.nr_vcpus).map(Vcpu::new).collect(),
            pause_count: AtomicU32::new(0),
            crashed: AtomicBool::new(false),
            monitor,
            emulator,
        }
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.config.id
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.config.control
    }

    #[inline]
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    #[inline]
    pub fn host(&self) -> &Arc<View> {
        &self.host
    }

    pub fn vcpu(&self, id: u32) -> Option<&Vcpu> {
        self.vcpus.get(id as usize)
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn monitor(&self) -> &dyn MonitorRing {
        &*self.monitor
    }

    pub fn emulator(&self) -> &dyn Emulator {
        &*self.emulator
    }

    #[inline]
    pub fn inguest_pagefault_disabled(&self) -> bool {
        self.config.inguest_pagefault_disabled
    }

    /// Memory access control needs an HVM guest with hardware
    /// virtualisation and HAP.
    pub fn mem_access_sanity_check(&self) -> bool {
        self.config.hvm && self.config.hardware_virt && self.config.hap
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn pause(&self) {
        self.pause_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpause(&self) {
        let prev = self.pause_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "d{}: unpause without pause", self.config.id);
    }

    pub fn is_paused(&self) -> bool {
        self.pause_count.load(Ordering::Acquire) != 0
    }

    /// Fatal guest fault. The guest is torn down by its owner.
    pub fn crash(&self) {
        if !self.crashed.swap(true, Ordering::AcqRel) {
            klog!(Error, "domain {} crashed", self.config.id);
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Set "access enforcement required" on the host view and every live
    /// alternate view. The guest must be paused.
    pub fn set_access_required(&self, required: bool) {
        assert!(self.is_paused(), "d{}: access_required changed while running", self.config.id);
        self.host.set_access_required(required);
        if self.altp2m_active() {
            for view in self.altp2m.read().iter().flatten() {
                view.set_access_required(required);
            }
        }
    }

    // ------------------------------------------------------------------
    // View selection
    // ------------------------------------------------------------------

    #[inline]
    pub fn altp2m_active(&self) -> bool {
        self.altp2m_active.load(Ordering::Acquire)
    }

    /// Turn alternate view support on or off. Turning it off moves every
    /// vCPU back to the host view.
    pub fn set_altp2m_active(&self, active: bool) {
        self.altp2m_active.store(active, Ordering::Release);
        if !active {
            for vcpu in &self.vcpus {
                vcpu.altp2m_idx.store(0, Ordering::Release);
            }
        }
    }

    /// Live alternate view in slot `idx`, if any.
    pub fn alt_view(&self, idx: u16) -> Option<Arc<View>> {
        self.altp2m.read().get(idx as usize)?.clone()
    }

    /// Resolve a request's view index: 0 is the host view, anything else
    /// must name a live alternate view while support is active.
    pub fn select_view(&self, idx: u16) -> MemAccessResult<Arc<View>> {
        if idx == 0 {
            return Ok(self.host.clone());
        }
        if !self.altp2m_active() {
            return Err(MemAccessError::InvalidArgument);
        }
        self.alt_view(idx).ok_or(MemAccessError::InvalidArgument)
    }

    /// View the vCPU currently runs on.
    pub fn vcpu_view(&self, vcpu: &Vcpu) -> Arc<View> {
        let idx = vcpu.altp2m_idx();
        if idx != 0 && self.altp2m_active() {
            if let Some(view) = self.alt_view(idx) {
                return view;
            }
        }
        self.host.clone()
    }

    /// Point a vCPU at view `idx` (0 for the host view).
    ///
    /// Runs under the list lock so it cannot interleave with
    /// [`destroy_alt_view`](Self::destroy_alt_view) between its in-use check
    /// and the slot being emptied.
    pub fn vcpu_switch_view(&self, cpu: &CpuLockState, vcpu: &Vcpu, idx: u16) -> MemAccessResult<()> {
        let _list = self.altp2m_list_lock.lock(cpu);
        self.select_view(idx)?;
        vcpu.altp2m_idx.store(idx, Ordering::Release);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Alternate view list
    // ------------------------------------------------------------------

    /// Create alternate view `idx` over `backend`.
    ///
    /// The new view starts with the host view's default permission and
    /// access-required flag.
    pub fn create_alt_view(
        &self,
        cpu: &CpuLockState,
        idx: u16,
        backend: Arc<dyn TranslationBackend>,
    ) -> MemAccessResult<Arc<View>> {
        if idx == 0 || idx as usize >= MAX_ALTP2M {
            return Err(MemAccessError::InvalidArgument);
        }

        let _list = self.altp2m_list_lock.lock(cpu);
        let mut slots = self.altp2m.write();
        let slot = &mut slots[idx as usize];
        if slot.is_some() {
            return Err(MemAccessError::InvalidArgument);
        }

        let view = Arc::new(View::new(
            self.config.id,
            ViewKind::Alternate(idx),
            self.config.control,
            self.host.default_access(),
            backend,
        ));
        view.set_access_required(self.host.access_required());
        *slot = Some(view.clone());
        klog!(Info, "d{}: alternate view {} created", self.config.id, idx);
        Ok(view)
    }

    /// Destroy alternate view `idx`. The guest must be paused and no vCPU
    /// may be using the view.
    pub fn destroy_alt_view(&self, cpu: &CpuLockState, idx: u16) -> MemAccessResult<()> {
        if idx == 0 || idx as usize >= MAX_ALTP2M {
            return Err(MemAccessError::InvalidArgument);
        }

        let _list = self.altp2m_list_lock.lock(cpu);
        if !self.is_paused() {
            return Err(MemAccessError::Busy);
        }
        if self.vcpus.iter().any(|v| v.altp2m_idx() == idx) {
            return Err(MemAccessError::Busy);
        }

        let view = self.altp2m.write()[idx as usize]
            .take()
            .ok_or(MemAccessError::InvalidArgument)?;
        // Wait out any holder still working on the view.
        drop(view.lock(cpu));
        klog!(Info, "d{}: alternate view {} destroyed", self.config.id, idx);
        Ok(())
    }

    /// Visit every live alternate view under the list lock.
    ///
    /// `f` may lock the view it is handed but must not take the host view
    /// lock, which orders before the list lock.
    pub fn for_each_alt_view<F>(&self, cpu: &CpuLockState, mut f: F)
    where
        F: FnMut(u16, &View),
    {
        let _list = self.altp2m_list_lock.lock(cpu);
        let live: Vec<(u16, Arc<View>)> = self
            .altp2m
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.clone().map(|v| (i as u16, v)))
            .collect();
        for (idx, view) in live {
            f(idx, &view);
        }
    }
}
