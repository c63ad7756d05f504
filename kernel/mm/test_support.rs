//! Host-side doubles for unit tests.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::access::Permission;
use crate::domain::{Domain, DomainConfig, Vcpu};
use crate::event::{Emulator, MonitorRing};
use crate::view::{Mfn, PageType, Query, TranslationBackend, ViewEntry};
use crate::{Gfn, MemAccessError, MemAccessResult};

/// Translation backend over a map of 4 KiB entries.
pub struct MemBackend {
    entries: Mutex<BTreeMap<u64, ViewEntry>>,
    flushes: AtomicUsize,
    fail_gfn: Mutex<Option<Gfn>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            flushes: AtomicUsize::new(0),
            fail_gfn: Mutex::new(None),
        }
    }

    pub fn map(&self, gfn: Gfn, mfn: Mfn, page_type: PageType, access: Permission) {
        self.map_order(gfn, mfn, 0, page_type, access);
    }

    /// Map an aligned `1 << order` block, as a superpage would be.
    pub fn map_order(&self, gfn: Gfn, mfn: Mfn, order: u32, page_type: PageType, access: Permission) {
        let mut entries = self.entries.lock();
        for i in 0..(1u64 << order) {
            entries.insert(
                gfn.0 + i,
                ViewEntry {
                    mfn: Mfn(mfn.0 + i),
                    page_type,
                    access: access.tag(),
                    order,
                    suppress_ve: true,
                },
            );
        }
    }

    pub fn entry(&self, gfn: Gfn) -> ViewEntry {
        self.get_entry(gfn, Query::Plain)
    }

    /// Overwrite the raw permission tag, bypassing validation.
    pub fn corrupt_access(&self, gfn: Gfn, tag: u8) {
        if let Some(e) = self.entries.lock().get_mut(&gfn.0) {
            e.access = tag;
        }
    }

    pub fn set_suppress_ve(&self, gfn: Gfn, on: bool) {
        if let Some(e) = self.entries.lock().get_mut(&gfn.0) {
            e.suppress_ve = on;
        }
    }

    /// Make every update of `gfn` fail with `-ENOMEM`.
    pub fn fail_on(&self, gfn: Gfn) {
        *self.fail_gfn.lock() = Some(gfn);
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl TranslationBackend for MemBackend {
    fn get_entry(&self, gfn: Gfn, _query: Query) -> ViewEntry {
        self.entries
            .lock()
            .get(&gfn.0)
            .copied()
            .unwrap_or(ViewEntry::NOT_PRESENT)
    }

    fn set_entry(
        &self,
        gfn: Gfn,
        mfn: Mfn,
        order: u32,
        page_type: PageType,
        access: Permission,
        suppress_ve: Option<bool>,
    ) -> MemAccessResult<()> {
        if *self.fail_gfn.lock() == Some(gfn) {
            return Err(MemAccessError::BackendFailure(-12));
        }

        let mut entries = self.entries.lock();
        for i in 0..(1u64 << order) {
            let key = gfn.0 + i;
            if !mfn.is_valid() {
                entries.remove(&key);
                continue;
            }
            let sve = suppress_ve
                .or_else(|| entries.get(&key).map(|e| e.suppress_ve))
                .unwrap_or(true);
            entries.insert(
                key,
                ViewEntry {
                    mfn: Mfn(mfn.0 + i),
                    page_type,
                    access: access.tag(),
                    order,
                    suppress_ve: sve,
                },
            );
        }
        Ok(())
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Monitor ring with a switchable listener.
#[derive(Default)]
pub struct TestMonitor {
    listener: AtomicBool,
}

impl TestMonitor {
    pub fn attach(&self) {
        self.listener.store(true, Ordering::SeqCst);
    }

    pub fn detach(&self) {
        self.listener.store(false, Ordering::SeqCst);
    }
}

impl MonitorRing for TestMonitor {
    fn has_listener(&self) -> bool {
        self.listener.load(Ordering::SeqCst)
    }
}

/// Emulator that only counts calls.
#[derive(Default)]
pub struct CountingEmulator {
    count: AtomicUsize,
    with_send_event: AtomicUsize,
}

impl CountingEmulator {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Calls made while the vCPU had `send_event` set.
    pub fn with_send_event(&self) -> usize {
        self.with_send_event.load(Ordering::SeqCst)
    }
}

impl Emulator for CountingEmulator {
    fn emulate_one(&self, vcpu: &Vcpu) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if vcpu.send_event() {
            self.with_send_event.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct TestDomain {
    pub domain: Domain,
    pub host: Arc<MemBackend>,
    pub monitor: Arc<TestMonitor>,
    pub emulator: Arc<CountingEmulator>,
}

pub struct DomainBuilder {
    config: DomainConfig,
}

impl DomainBuilder {
    pub fn new(id: u16) -> Self {
        Self::from_config(DomainConfig::hvm(id))
    }

    pub fn from_config(config: DomainConfig) -> Self {
        Self { config }
    }

    pub fn default_access(mut self, access: Permission) -> Self {
        self.config.default_access = access;
        self
    }

    pub fn vcpus(mut self, n: u32) -> Self {
        self.config.nr_vcpus = n;
        self
    }

    pub fn inguest_pagefault_disabled(mut self) -> Self {
        self.config.inguest_pagefault_disabled = true;
        self
    }

    pub fn build(self) -> TestDomain {
        let host = Arc::new(MemBackend::new());
        let monitor = Arc::new(TestMonitor::default());
        let emulator = Arc::new(CountingEmulator::default());
        TestDomain {
            domain: Domain::new(self.config, host.clone(), monitor.clone(), emulator.clone()),
            host,
            monitor,
            emulator,
        }
    }
}
