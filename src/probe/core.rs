//! Per-site probe state.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use spin::{Once, RwLock};

use super::retprobe::InstancePool;
use super::{DiversionMode, Handler, ProbeState};
use crate::error::{ProbeError, ProbeResult};
use crate::insn::{Insn, Isa};
use crate::insn_slot::Slot;
use crate::platform::ContextId;
use crate::trampoline::Trampoline;

/// Handler registrations one probed site can carry.
pub const MAX_HANDLERS: usize = 4;

/// A probed site: address space plus instruction address (Thumb bit clear).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeKey {
    pub space: ContextId,
    pub addr: u32,
}

impl ProbeKey {
    pub const fn new(space: ContextId, addr: u32) -> Self {
        Self { space, addr }
    }
}

/// One caller's attachment to a probed site.
#[derive(Clone)]
pub struct Registration {
    pub id: u64,
    pub entry: Option<Handler>,
    pub exit: Option<Handler>,
    /// Interrupt number passed to the notify hook when the site fires in a
    /// non-kernel context.
    pub notify: Option<u32>,
}

/// Handlers of one kind, without allocation.
pub(crate) type HandlerSet = [Option<Handler>; MAX_HANDLERS];

/// Up to 4 bytes of code, with their length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeBytes {
    bytes: [u8; 4],
    len: usize,
}

impl CodeBytes {
    pub fn new(bytes: [u8; 4], len: usize) -> Self {
        Self { bytes, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Installed state of one probed instruction.
///
/// Owns the displaced bytes, the trampoline slot and the handler set. The
/// slot belongs to this core alone and is released only after the core is
/// out of every lookup table and no delivery is still using it.
pub struct ProbeCore {
    key: ProbeKey,
    isa: Isa,
    insn: Insn,
    category: &'static str,
    saved: CodeBytes,
    patch: CodeBytes,
    diversion: DiversionMode,
    slot: Slot,
    trampoline: Trampoline,
    state: AtomicU8,
    inflight: AtomicUsize,
    hits: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
    retprobe: Once<InstancePool>,
}

impl ProbeCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ProbeKey,
        isa: Isa,
        insn: Insn,
        category: &'static str,
        patch: CodeBytes,
        diversion: DiversionMode,
        slot: Slot,
        trampoline: Trampoline,
    ) -> Self {
        let (bytes, len) = insn.to_bytes();
        Self {
            key,
            isa,
            insn,
            category,
            saved: CodeBytes::new(bytes, len),
            patch,
            diversion,
            slot,
            trampoline,
            state: AtomicU8::new(ProbeState::Unarmed as u8),
            inflight: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            handlers: RwLock::new(Vec::with_capacity(MAX_HANDLERS)),
            retprobe: Once::new(),
        }
    }

    pub fn key(&self) -> ProbeKey {
        self.key
    }

    pub fn addr(&self) -> u32 {
        self.key.addr
    }

    pub fn isa(&self) -> Isa {
        self.isa
    }

    pub fn insn(&self) -> &Insn {
        &self.insn
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    /// Interworking address of the probed instruction.
    pub fn interworking_addr(&self) -> u32 {
        match self.isa {
            Isa::Arm => self.key.addr,
            Isa::Thumb => self.key.addr | 1,
        }
    }

    /// Interworking address of the instruction after the probed one.
    pub fn next_addr(&self) -> u32 {
        self.key.addr.wrapping_add(self.insn.len as u32) | (self.isa == Isa::Thumb) as u32
    }

    /// Bytes the diversion displaced.
    pub fn saved(&self) -> &CodeBytes {
        &self.saved
    }

    /// Bytes written over the site to divert it.
    pub fn patch(&self) -> &CodeBytes {
        &self.patch
    }

    pub fn diversion(&self) -> DiversionMode {
        self.diversion
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn trampoline(&self) -> &Trampoline {
        &self.trampoline
    }

    /// Interworking address where a delivery resumes to run the displaced instruction.
    pub fn entry_addr(&self) -> u32 {
        self.trampoline.entry_addr(self.slot.addr)
    }

    /// Hijack entry of a call-site trampoline.
    pub fn hijack_addr(&self) -> Option<u32> {
        self.trampoline.hijack_addr(self.slot.addr)
    }

    pub fn state(&self) -> ProbeState {
        ProbeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProbeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a delivery as running until the guard is dropped.
    pub(crate) fn enter(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard(&self.inflight)
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Spin until no delivery is using this core.
    pub(crate) fn drain(&self) {
        while self.inflight.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    pub(crate) fn add_registration(&self, reg: Registration) -> ProbeResult<()> {
        let mut handlers = self.handlers.write();
        if handlers.len() >= MAX_HANDLERS {
            return Err(ProbeError::CapacityExceeded("handlers per probe"));
        }
        handlers.push(reg);
        Ok(())
    }

    /// Detach registration `id`; returns it and how many remain.
    pub(crate) fn remove_registration(&self, id: u64) -> ProbeResult<(Registration, usize)> {
        let mut handlers = self.handlers.write();
        let pos = handlers
            .iter()
            .position(|r| r.id == id)
            .ok_or(ProbeError::NotFound)?;
        let reg = handlers.remove(pos);
        Ok((reg, handlers.len()))
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Entry handlers in registration order, copied out so none runs under the lock.
    pub(crate) fn entry_handlers(&self) -> HandlerSet {
        self.snapshot(|r| r.entry.clone())
    }

    pub(crate) fn exit_handlers(&self) -> HandlerSet {
        self.snapshot(|r| r.exit.clone())
    }

    /// First notify interrupt among the registrations.
    pub(crate) fn notify_irq(&self) -> Option<u32> {
        self.handlers.read().iter().find_map(|r| r.notify)
    }

    fn snapshot(&self, pick: impl Fn(&Registration) -> Option<Handler>) -> HandlerSet {
        let mut set: HandlerSet = Default::default();
        for (out, reg) in set.iter_mut().zip(self.handlers.read().iter()) {
            *out = pick(reg);
        }
        set
    }

    pub fn has_exit_handler(&self) -> bool {
        self.handlers.read().iter().any(|r| r.exit.is_some())
    }

    // =========================================================================
    // Return instances
    // =========================================================================

    /// Instance pool, created on first use with `maxactive` entries.
    pub(crate) fn init_retprobe(&self, maxactive: usize) -> &InstancePool {
        self.retprobe.call_once(|| InstancePool::new(maxactive))
    }

    pub fn retprobe(&self) -> Option<&InstancePool> {
        self.retprobe.get()
    }

    pub fn nmissed(&self) -> u64 {
        self.retprobe().map_or(0, |p| p.nmissed())
    }
}

/// Keeps a core's in-flight counter raised while a delivery runs.
pub struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
