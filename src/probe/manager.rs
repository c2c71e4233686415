//! Probe registry.
//!
//! Owns the attached address spaces, the probed sites and the index from
//! trampoline breakpoint slots back to their sites. Registration and removal
//! are serialized by one writer lock; trap delivery only takes read locks.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use super::core::{CodeBytes, ProbeCore, ProbeKey, Registration};
use super::retprobe::{InstancePool, OrphanList, patch_stack};
use super::{DiversionMode, KprobeConfig, ProbeBuilder, ProbeHandle, ProbeInfo, ProbeState};
use crate::access::{self, AddressSpace};
use crate::error::{ProbeError, ProbeResult};
use crate::insn::{self, Cond, Insn, Isa, branch, thumb};
use crate::insn_slot::{Slot, SlotAllocator};
use crate::platform::{self, ContextId};
use crate::regs::PtRegs;
use crate::symbols;
use crate::trampoline::template::{
    ARM_RETURN_BKPT, ARM_SITE_BKPT, THUMB_SITE_BKPT, THUMB2_SITE_BKPT,
};
use crate::trampoline::{self, SynthOptions};

/// Called with the owning context and interrupt number when a probe fires
/// in a non-kernel address space.
pub type NotifyHook = fn(ContextId, u32);

/// An attached address space with its trampoline memory.
pub(crate) struct SpaceEntry {
    slots: SlotAllocator,
    return_slot: Slot,
}

impl SpaceEntry {
    pub(crate) fn space(&self) -> &dyn AddressSpace {
        self.slots.space().as_ref()
    }

    pub(crate) fn id(&self) -> ContextId {
        self.slots.space().id()
    }

    /// Address of the shared return trampoline (A32).
    pub(crate) fn return_trampoline(&self) -> u32 {
        self.return_slot.addr
    }
}

/// Probe registry and trap dispatcher.
pub struct KprobeManager {
    config: KprobeConfig,
    pub(crate) spaces: RwLock<HashMap<ContextId, Arc<SpaceEntry>>>,
    pub(crate) cores: RwLock<HashMap<ProbeKey, Arc<ProbeCore>>>,
    /// Trampoline breakpoint slot -> probed site.
    pub(crate) slot_sites: RwLock<HashMap<ProbeKey, ProbeKey>>,
    pub(crate) orphans: OrphanList,
    pub(crate) notify: RwLock<Option<NotifyHook>>,
    writer: Mutex<()>,
    next_id: AtomicU64,
}

impl Default for KprobeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KprobeManager {
    pub fn new() -> Self {
        Self::with_config(KprobeConfig::default())
    }

    pub fn with_config(config: KprobeConfig) -> Self {
        Self {
            config,
            spaces: RwLock::new(HashMap::new()),
            cores: RwLock::new(HashMap::new()),
            slot_sites: RwLock::new(HashMap::new()),
            orphans: OrphanList::default(),
            notify: RwLock::new(None),
            writer: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &KprobeConfig {
        &self.config
    }

    pub fn set_notify_hook(&self, hook: Option<NotifyHook>) {
        *self.notify.write() = hook;
    }

    // =========================================================================
    // Address spaces
    // =========================================================================

    /// Make `space` probeable and place its shared return trampoline.
    pub fn attach_space(&self, space: Arc<dyn AddressSpace>) -> ProbeResult<()> {
        let _w = self.writer.lock();
        let id = space.id();
        if self.spaces.read().contains_key(&id) {
            return Err(ProbeError::AlreadyExists);
        }

        let slots = SlotAllocator::new(space);
        let return_slot = slots.alloc(4)?;
        if let Err(e) = access::write_u32(slots.space().as_ref(), return_slot.addr, ARM_RETURN_BKPT)
        {
            let _ = slots.free(return_slot);
            return Err(e);
        }

        info!(
            "kprobe: attached context {} (return trampoline at {:#x})",
            id.0, return_slot.addr
        );
        self.spaces.write().insert(
            id,
            Arc::new(SpaceEntry {
                slots,
                return_slot,
            }),
        );
        Ok(())
    }

    /// Remove every probe in `ctx`, drop its return instances and release its
    /// trampoline memory. Returns the hijacked returns that could not be put
    /// back, as [`unregister`](Self::unregister) does.
    pub fn detach_space(&self, ctx: ContextId) -> ProbeResult<Vec<ProbeError>> {
        let _w = self.writer.lock();
        let entry = self.space_entry(ctx).ok_or(ProbeError::NotFound)?;

        let keys: Vec<ProbeKey> = self
            .cores
            .read()
            .keys()
            .filter(|k| k.space == ctx)
            .copied()
            .collect();
        let mut misses = Vec::new();
        for key in keys {
            let core = self.cores.read().get(&key).cloned();
            if let Some(core) = core {
                misses.extend(self.remove_core(&entry, &core)?);
            }
        }

        let dropped = self.orphans.discard(|i| i.space == ctx);
        if dropped > 0 {
            debug!("kretprobe: dropped {} orphans of context {}", dropped, ctx.0);
        }
        if let Err(e) = entry.slots.free(entry.return_slot) {
            warn!("kprobe: return trampoline of context {}: {}", ctx.0, e);
        }
        self.spaces.write().remove(&ctx);
        info!("kprobe: detached context {}", ctx.0);
        Ok(misses)
    }

    pub fn is_attached(&self, ctx: ContextId) -> bool {
        self.spaces.read().contains_key(&ctx)
    }

    /// Shared return trampoline of `ctx`.
    pub fn return_trampoline(&self, ctx: ContextId) -> Option<u32> {
        self.space_entry(ctx).map(|e| e.return_trampoline())
    }

    pub(crate) fn space_entry(&self, ctx: ContextId) -> Option<Arc<SpaceEntry>> {
        self.spaces.read().get(&ctx).cloned()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register(&self, builder: ProbeBuilder) -> ProbeResult<ProbeHandle> {
        if builder.entry.is_none() && builder.exit.is_none() {
            return Err(ProbeError::InvalidArgument("probe has no handler"));
        }
        let target = builder.resolve()?;
        let isa = Isa::from_interworking(target);
        let key = ProbeKey::new(builder.space, target & !1);
        let maxactive = builder.maxactive.unwrap_or(self.config.maxactive);
        let mode = builder.diversion.unwrap_or(self.config.diversion);
        let is_return = builder.is_return_probe();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reg = Registration {
            id,
            entry: builder.entry,
            exit: builder.exit,
            notify: builder.notify,
        };

        let _w = self.writer.lock();
        let existing = self.cores.read().get(&key).cloned();
        let core = match existing {
            Some(core) => {
                if core.isa() != isa {
                    return Err(ProbeError::InvalidAddress { addr: target });
                }
                core.add_registration(reg)?;
                debug!(
                    "kprobe: attached handler {} to probe at {:#x} ({} handlers)",
                    id,
                    target,
                    core.handler_count()
                );
                core
            }
            None => self.install(key, isa, mode, reg)?,
        };

        if is_return {
            let pool = core.init_retprobe(maxactive);
            debug!(
                "kretprobe: probe at {:#x} keeps up to {} instances",
                target,
                pool.capacity()
            );
        }
        Ok(ProbeHandle { key, isa, id })
    }

    /// Build, commit and arm a new probed site. Nothing is left behind on failure.
    fn install(
        &self,
        key: ProbeKey,
        isa: Isa,
        mode: DiversionMode,
        reg: Registration,
    ) -> ProbeResult<Arc<ProbeCore>> {
        let entry = self.space_entry(key.space).ok_or(ProbeError::NotFound)?;
        let space = entry.space();

        let insn = access::fetch_insn(space, key.addr, isa)?;
        // The trampoline cannot carry ITSTATE across its continuation jump.
        if isa == Isa::Thumb && thumb::in_it_block(key.addr, |a| access::read_u16(space, a).ok()) {
            return Err(ProbeError::DecodeUnsupported {
                addr: key.addr,
                reason: "inside an IT block",
            });
        }
        let decoded = insn::classify(&insn);
        let options = SynthOptions {
            return_trampoline: Some(entry.return_trampoline()),
        };
        let trampoline = trampoline::synthesize(key.addr, &insn, &decoded, &options)?;

        let slot = entry.slots.alloc(trampoline.len())?;
        if let Err(e) = access::write(space, slot.addr, trampoline.as_bytes()) {
            let _ = entry.slots.free(slot);
            return Err(e);
        }

        let (patch, diversion) = diversion_patch(key.addr, &insn, slot.addr, mode);
        let core = Arc::new(ProbeCore::new(
            key,
            isa,
            insn,
            decoded.category(),
            patch,
            diversion,
            slot,
            trampoline,
        ));
        core.add_registration(reg)?;

        let slot_key = ProbeKey::new(key.space, slot.addr);
        self.cores.write().insert(key, core.clone());
        self.slot_sites.write().insert(slot_key, key);

        if let Err(e) = write_site(space, &core, core.patch()) {
            self.cores.write().remove(&key);
            self.slot_sites.write().remove(&slot_key);
            let _ = entry.slots.free(slot);
            return Err(e);
        }
        core.set_state(ProbeState::Armed);

        info!(
            "kprobe: registered {:?} {} probe at {:#x} in context {} (slot {:#x}, {:?})",
            isa,
            decoded.category(),
            key.addr,
            key.space.0,
            slot.addr,
            diversion
        );
        Ok(core)
    }

    /// Detach one registration; the site is torn down with its last one.
    ///
    /// The probe is gone once this returns `Ok`. The list holds a
    /// [`ProbeError::StackScanNotFound`] for every outstanding call whose
    /// hijacked return could not be put back; those still return through the
    /// shared trampoline.
    pub fn unregister(&self, handle: ProbeHandle) -> ProbeResult<Vec<ProbeError>> {
        let _w = self.writer.lock();
        let core = self
            .cores
            .read()
            .get(&handle.key)
            .cloned()
            .ok_or(ProbeError::NotFound)?;
        let (reg, remaining) = core.remove_registration(handle.id)?;
        if remaining > 0 {
            debug!(
                "kprobe: detached handler {} from {:#x}, {} left",
                handle.id, handle.key.addr, remaining
            );
            return Ok(Vec::new());
        }

        let entry = self
            .space_entry(handle.key.space)
            .ok_or(ProbeError::NotFound)?;
        self.remove_core(&entry, &core).inspect_err(|_| {
            // Site still installed: keep the caller's registration on it.
            let _ = core.add_registration(reg);
        })
    }

    /// Restore the site, wait for deliveries to finish, then free the slot.
    fn remove_core(
        &self,
        entry: &SpaceEntry,
        core: &Arc<ProbeCore>,
    ) -> ProbeResult<Vec<ProbeError>> {
        let space = entry.space();
        let was_armed = core.state() == ProbeState::Armed;
        core.set_state(ProbeState::Disarming);
        if was_armed {
            if let Err(e) = write_site(space, core, core.saved()) {
                core.set_state(ProbeState::Armed);
                return Err(e);
            }
        }

        // Deliveries still running first, then contexts that already left the
        // handler but may still be inside the trampoline.
        core.drain();
        platform::synchronize();

        let key = core.key();
        self.cores.write().remove(&key);
        self.slot_sites
            .write()
            .remove(&ProbeKey::new(key.space, core.slot().addr));

        let misses = core
            .retprobe()
            .map_or_else(Vec::new, |pool| self.retire_instances(entry, pool));
        if let Err(e) = entry.slots.free(core.slot()) {
            warn!("kprobe: slot of {:#x}: {}", key.addr, e);
        }
        core.set_state(ProbeState::Removed);
        info!(
            "kprobe: unregistered probe at {:#x} in context {} ({} hits)",
            key.addr,
            key.space.0,
            core.hits()
        );
        Ok(misses)
    }

    /// Put the real return address back for every outstanding call of a
    /// return probe that is going away. Misses become orphans and are returned.
    fn retire_instances(&self, entry: &SpaceEntry, pool: &InstancePool) -> Vec<ProbeError> {
        let mut misses = Vec::new();
        for (index, inst) in pool.live(|_| true) {
            if let Err(e) = self.fix_return(entry, &inst, None) {
                warn!("kretprobe: {}; leaving it to the trampoline", e);
                self.orphans.adopt(inst);
                misses.push(e);
            }
            if pool.release(index).is_err() {
                // Returned through the trampoline while being retired.
                let _ = self.orphans.take(inst.seq);
            }
        }
        misses
    }

    /// Point a hijacked return back at its real address, through LR when the
    /// snapshot still holds the trampoline, otherwise through the stack.
    pub(crate) fn fix_return(
        &self,
        entry: &SpaceEntry,
        inst: &super::Instance,
        regs: Option<&mut PtRegs>,
    ) -> ProbeResult<()> {
        let tramp = entry.return_trampoline();
        if let Some(regs) = regs {
            if regs.lr() & !1 == tramp {
                regs.set_lr(inst.ret);
                return Ok(());
            }
        }
        patch_stack(entry.space(), inst, tramp, self.config.stack_scan_depth).map(|_| ())
    }

    // =========================================================================
    // Arm / disarm
    // =========================================================================

    /// Reinstall the diversion of a disarmed probe.
    pub fn arm(&self, space: ContextId, addr: u32) -> ProbeResult<()> {
        let _w = self.writer.lock();
        let (entry, core) = self.lookup_site(space, addr)?;
        match core.state() {
            ProbeState::Armed => Ok(()),
            ProbeState::Unarmed => {
                write_site(entry.space(), &core, core.patch())?;
                core.set_state(ProbeState::Armed);
                info!("kprobe: armed {:#x} in context {}", core.addr(), space.0);
                Ok(())
            }
            _ => Err(ProbeError::NotFound),
        }
    }

    /// Put the original instruction back, keeping the trampoline and handlers.
    pub fn disarm(&self, space: ContextId, addr: u32) -> ProbeResult<()> {
        let _w = self.writer.lock();
        let (entry, core) = self.lookup_site(space, addr)?;
        match core.state() {
            ProbeState::Unarmed => Ok(()),
            ProbeState::Armed => {
                write_site(entry.space(), &core, core.saved())?;
                core.set_state(ProbeState::Unarmed);
                info!("kprobe: disarmed {:#x} in context {}", core.addr(), space.0);
                Ok(())
            }
            _ => Err(ProbeError::NotFound),
        }
    }

    fn lookup_site(
        &self,
        space: ContextId,
        addr: u32,
    ) -> ProbeResult<(Arc<SpaceEntry>, Arc<ProbeCore>)> {
        let entry = self.space_entry(space).ok_or(ProbeError::NotFound)?;
        let core = self
            .cores
            .read()
            .get(&ProbeKey::new(space, addr & !1))
            .cloned()
            .ok_or(ProbeError::NotFound)?;
        Ok((entry, core))
    }

    // =========================================================================
    // Contexts
    // =========================================================================

    /// Fix up every outstanding return of `ctx` (the context is about to stop
    /// being probed, or to run without the trampolines). `regs`, when given,
    /// is the context's current register state; its LR is checked before the
    /// stack. Returns the instances that could not be found; they stay live.
    pub fn release_context(
        &self,
        ctx: ContextId,
        mut regs: Option<&mut PtRegs>,
    ) -> Vec<ProbeError> {
        let mut pending: Vec<(u64, Option<(Arc<ProbeCore>, usize)>, super::Instance)> = Vec::new();
        for core in self.cores.read().values() {
            if let Some(pool) = core.retprobe() {
                for (index, inst) in pool.live(|i| i.ctx == ctx) {
                    pending.push((inst.seq, Some((core.clone(), index)), inst));
                }
            }
        }
        for inst in self.orphans.live(|i| i.ctx == ctx) {
            pending.push((inst.seq, None, inst));
        }
        // Innermost call first: only it can still have the trampoline in LR.
        pending.sort_by(|a, b| b.0.cmp(&a.0));

        let mut misses = Vec::new();
        for (_, holder, inst) in pending {
            let Some(entry) = self.space_entry(inst.space) else {
                continue;
            };
            match self.fix_return(&entry, &inst, regs.as_deref_mut()) {
                Ok(()) => {
                    match holder {
                        Some((core, index)) => {
                            let _ = core.retprobe().map(|p| p.release(index));
                        }
                        None => {
                            let _ = self.orphans.take(inst.seq);
                        }
                    }
                }
                Err(e) => {
                    warn!("kretprobe: {}", e);
                    misses.push(e);
                }
            }
            // LR belongs to the innermost frame only.
            regs = None;
        }
        misses
    }

    /// Forget every return instance of a context that no longer exists.
    pub fn context_exit(&self, ctx: ContextId) -> usize {
        let mut dropped = 0;
        for core in self.cores.read().values() {
            if let Some(pool) = core.retprobe() {
                dropped += pool.discard(|i| i.ctx == ctx);
            }
        }
        dropped += self.orphans.discard(|i| i.ctx == ctx);
        if dropped > 0 {
            debug!("kretprobe: context {} exited with {} instances", ctx.0, dropped);
        }
        dropped
    }

    /// Return instances left behind by removed probes.
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    // =========================================================================
    // Listing
    // =========================================================================

    pub fn list(&self) -> Vec<ProbeInfo> {
        let mut out: Vec<ProbeInfo> = self
            .cores
            .read()
            .values()
            .map(|core| ProbeInfo {
                space: core.key().space,
                addr: core.interworking_addr(),
                symbol: if core.key().space == ContextId::KERNEL {
                    symbols::describe(core.addr())
                } else {
                    None
                },
                isa: core.isa(),
                category: core.category(),
                state: core.state(),
                diversion: core.diversion(),
                handlers: core.handler_count(),
                hits: core.hits(),
                nmissed: core.nmissed(),
                live_instances: core.retprobe().map_or(0, |p| p.live_count()),
            })
            .collect();
        out.sort_by_key(|p| (p.space, p.addr));
        out
    }

    /// Probed site at `addr` in `space`.
    pub fn probe(&self, space: ContextId, addr: u32) -> Option<Arc<ProbeCore>> {
        self.cores
            .read()
            .get(&ProbeKey::new(space, addr & !1))
            .cloned()
    }

    pub fn probe_count(&self) -> usize {
        self.cores.read().len()
    }
}

// =============================================================================
// Site patching
// =============================================================================

fn write_site(space: &dyn AddressSpace, core: &ProbeCore, bytes: &CodeBytes) -> ProbeResult<()> {
    let result = access::write(space, core.addr(), bytes.as_slice());
    if result.is_err() {
        // A short write can leave half a breakpoint; put the original back.
        let _ = access::write(space, core.addr(), core.saved().as_slice());
    }
    result
}

/// Bytes that divert the instruction at `addr` into the trampoline at `slot`.
fn diversion_patch(addr: u32, insn: &Insn, slot: u32, mode: DiversionMode) -> (CodeBytes, DiversionMode) {
    if mode == DiversionMode::Branch {
        if let Some(bytes) = branch_patch(addr, insn, slot) {
            return (bytes, DiversionMode::Branch);
        }
        warn!(
            "kprobe: trampoline {:#x} out of branch range from {:#x}, using a trap",
            slot, addr
        );
    }
    (trap_patch(insn), DiversionMode::Trap)
}

fn trap_patch(insn: &Insn) -> CodeBytes {
    match insn.isa {
        Isa::Arm => CodeBytes::new(ARM_SITE_BKPT.to_le_bytes(), 4),
        Isa::Thumb if insn.is_thumb32() => {
            let (hw1, hw2) = THUMB2_SITE_BKPT;
            CodeBytes::new(halfword_pair(hw1, hw2), 4)
        }
        Isa::Thumb => {
            let [b0, b1] = THUMB_SITE_BKPT.to_le_bytes();
            CodeBytes::new([b0, b1, 0, 0], 2)
        }
    }
}

fn branch_patch(addr: u32, insn: &Insn, slot: u32) -> Option<CodeBytes> {
    let disp = slot.wrapping_sub(branch::pc_value(addr, insn.isa)) as i32;
    match insn.isa {
        Isa::Arm => branch::encode_arm_branch(Cond::AL.0, false, disp)
            .map(|word| CodeBytes::new(word.to_le_bytes(), 4)),
        // A 16-bit site has no room for a branch with useful reach.
        Isa::Thumb if insn.is_thumb32() => branch::encode_thumb_b_t4(disp)
            .map(|(hw1, hw2)| CodeBytes::new(halfword_pair(hw1, hw2), 4)),
        Isa::Thumb => None,
    }
}

fn halfword_pair(hw1: u16, hw2: u16) -> [u8; 4] {
    let [a, b] = hw1.to_le_bytes();
    let [c, d] = hw2.to_le_bytes();
    [a, b, c, d]
}
