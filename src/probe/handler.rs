//! Trap delivery.
//!
//! Three kinds of trap reach the engine:
//! 1. a site breakpoint, at the probed address itself
//! 2. a trampoline breakpoint slot, reached by a branch-diverted site
//! 3. the shared return trampoline, reached by a hijacked return
//!
//! Anything else is handed back to the caller.

use alloc::sync::Arc;

use super::core::ProbeCore;
use super::manager::{KprobeManager, SpaceEntry};
use super::retprobe::Instance;
use super::{ProbeAction, ProbeKey, ProbeState};
use crate::access;
use crate::error::{ProbeError, fatal};
use crate::insn::{Cond, Isa};
use crate::platform::{self, ContextId};
use crate::regs::{PtRegs, it_advance};
use crate::trampoline::template::{is_arm_breakpoint, is_thumb_breakpoint};

/// A live return instance and where it is kept.
struct Found {
    inst: Instance,
    holder: Option<(Arc<ProbeCore>, usize)>,
}

impl KprobeManager {
    /// Handle an undefined-instruction trap raised in address space `space`.
    ///
    /// `regs.pc()` is the trapping instruction. Returns `true` when the trap
    /// was the engine's; `regs` then holds the state to resume with.
    pub fn handle_trap(&self, space: ContextId, regs: &mut PtRegs) -> bool {
        let pc = regs.pc();
        if let Some(core) = self.lookup_trap(ProbeKey::new(space, pc)) {
            self.deliver(space, &core, regs);
            return true;
        }

        let Some(entry) = self.space_entry(space) else {
            return false;
        };
        if pc == entry.return_trampoline() && !regs.is_thumb() {
            self.deliver_return(&entry, regs);
            return true;
        }
        if is_engine_breakpoint(&entry, pc, regs.is_thumb()) {
            fatal(ProbeError::LookupMiss { addr: pc });
        }
        false
    }

    /// Core owning a site or trampoline breakpoint slot at `key`.
    fn lookup_trap(&self, key: ProbeKey) -> Option<Arc<ProbeCore>> {
        if let Some(core) = self.cores.read().get(&key) {
            return Some(core.clone());
        }
        let site = *self.slot_sites.read().get(&key)?;
        self.cores.read().get(&site).cloned()
    }

    fn deliver(&self, space: ContextId, core: &ProbeCore, regs: &mut PtRegs) {
        let _guard = core.enter();
        if core.state() != ProbeState::Armed {
            // The original instruction is back in place: run it there.
            regs.branch_exchange(core.interworking_addr());
            return;
        }
        if core.isa() == Isa::Thumb && !settle_it_state(core, regs) {
            return;
        }

        core.record_hit();
        trace!(
            "kprobe: hit at {:#x} in context {} on cpu {}",
            core.addr(),
            space.0,
            platform::cpu_id()
        );
        if space != ContextId::KERNEL {
            // Copied out so the hook may replace itself.
            let hook = *self.notify.read();
            if let (Some(irq), Some(hook)) = (core.notify_irq(), hook) {
                hook(space, irq);
            }
        }

        regs.branch_exchange(core.interworking_addr());
        for handler in core.entry_handlers().iter().flatten() {
            if handler(&mut *regs) == ProbeAction::Skip {
                if regs.pc() == core.addr() {
                    regs.branch_exchange(core.next_addr());
                }
                debug!(
                    "kprobe: handler skipped {:#x}, resuming at {:#x}",
                    core.addr(),
                    regs.pc_interworking()
                );
                return;
            }
        }

        let resume = self
            .capture_return(space, core, regs)
            .unwrap_or_else(|| core.entry_addr());
        regs.branch_exchange(resume);
    }

    /// Record a return instance when the site belongs to a return probe.
    /// Returns the hijack entry when the call itself is the probed instruction.
    fn capture_return(&self, space: ContextId, core: &ProbeCore, regs: &mut PtRegs) -> Option<u32> {
        let pool = core.retprobe()?;
        if !core.has_exit_handler() {
            return None;
        }
        let entry = self.space_entry(space)?;
        let ctx = platform::context_id();

        match core.trampoline().link {
            // Call site: the trampoline makes the call, LR gets the trampoline.
            Some(link) => {
                if !link.cond.passed(regs.cpsr) {
                    return None;
                }
                let hijack = core.hijack_addr()?;
                let inst = Instance::new(link.return_addr, regs.sp(), ctx, space);
                match pool.acquire(inst) {
                    Ok(_) => Some(hijack),
                    Err(e) => {
                        warn!("kretprobe: missed call at {:#x}: {}", core.addr(), e);
                        None
                    }
                }
            }
            // Function entry: swap LR now.
            None => {
                let inst = Instance::new(regs.lr(), regs.sp(), ctx, space);
                match pool.acquire(inst) {
                    Ok(_) => regs.set_lr(entry.return_trampoline()),
                    Err(e) => warn!("kretprobe: missed entry at {:#x}: {}", core.addr(), e),
                }
                None
            }
        }
    }

    /// A hijacked return hit the shared trampoline.
    fn deliver_return(&self, entry: &SpaceEntry, regs: &mut PtRegs) {
        let space = entry.id();
        let tramp = entry.return_trampoline();
        let ctx = platform::context_id();
        let sp = regs.sp();

        let stale = self.discard_stale(ctx, space, sp);
        if stale > 0 {
            warn!(
                "kretprobe: dropped {} stale instances of context {} below sp {:#x}",
                stale, ctx.0, sp
            );
        }

        let Some(target) = self.resolve_return(ctx, space, tramp) else {
            fatal(ProbeError::LookupMiss { addr: tramp });
        };

        loop {
            let Some(found) = self.newest_instance(ctx, space, u64::MAX) else {
                break;
            };
            let inst = found.inst;
            let released = match &found.holder {
                Some((core, index)) => core.retprobe().map(|p| p.release(*index)),
                None => Some(
                    self.orphans
                        .take(inst.seq)
                        .ok_or(ProbeError::InvalidInstance { index: 0 }),
                ),
            };
            if let Some(Err(e)) = released {
                fatal(e);
            }

            regs.branch_exchange(target);
            if let Some((core, _)) = &found.holder {
                for handler in core.exit_handlers().iter().flatten() {
                    handler(&mut *regs);
                }
            }
            trace!(
                "kretprobe: context {} returns to {:#x} (sp {:#x})",
                ctx.0,
                target,
                inst.sp
            );
            if inst.ret & !1 != tramp {
                break;
            }
        }
        regs.branch_exchange(target);
    }

    /// Real return address of the innermost call, skipping chained instances
    /// whose captured address is the trampoline itself.
    fn resolve_return(&self, ctx: ContextId, space: ContextId, tramp: u32) -> Option<u32> {
        let mut before = u64::MAX;
        while let Some(found) = self.newest_instance(ctx, space, before) {
            if found.inst.ret & !1 != tramp {
                return Some(found.inst.ret);
            }
            before = found.inst.seq;
        }
        None
    }

    fn newest_instance(&self, ctx: ContextId, space: ContextId, before: u64) -> Option<Found> {
        let mut best: Option<Found> = None;
        for core in self.cores.read().values() {
            let Some(pool) = core.retprobe() else {
                continue;
            };
            if let Some((index, inst)) = pool.newest(ctx, space, before) {
                if best.as_ref().is_none_or(|b| inst.seq > b.inst.seq) {
                    best = Some(Found {
                        inst,
                        holder: Some((core.clone(), index)),
                    });
                }
            }
        }
        if let Some(inst) = self.orphans.newest(ctx, space, before) {
            if best.as_ref().is_none_or(|b| inst.seq > b.inst.seq) {
                best = Some(Found { inst, holder: None });
            }
        }
        best
    }

    /// Instances captured deeper than the current stack pointer belong to
    /// frames that are already gone.
    fn discard_stale(&self, ctx: ContextId, space: ContextId, sp: u32) -> usize {
        let stale = |i: &Instance| i.ctx == ctx && i.space == space && i.sp < sp;
        let mut dropped = 0;
        for core in self.cores.read().values() {
            if let Some(pool) = core.retprobe() {
                dropped += pool.discard(stale);
            }
        }
        dropped + self.orphans.discard(stale)
    }
}

/// Whether the instruction at `pc` is one of the engine's breakpoints.
fn is_engine_breakpoint(entry: &SpaceEntry, pc: u32, thumb: bool) -> bool {
    let space = entry.space();
    if thumb {
        let Ok(hw1) = access::read_u16(space, pc) else {
            return false;
        };
        let hw2 = access::read_u16(space, pc.wrapping_add(2)).unwrap_or(0);
        is_thumb_breakpoint(hw1, hw2)
    } else {
        access::read_u32(space, pc).is_ok_and(is_arm_breakpoint)
    }
}

/// Account for a Thumb site trapped with ITSTATE set.
///
/// Only the last instruction of an IT block can trap here, since sites inside
/// a block are refused at registration. A failed condition means the
/// instruction is not executed: no handlers run and execution moves past it.
/// Returns whether delivery should go on.
fn settle_it_state(core: &ProbeCore, regs: &mut PtRegs) -> bool {
    let it = regs.itstate();
    if it & 0xf == 0 {
        return true;
    }
    if !Cond(it >> 4).passed(regs.cpsr) {
        regs.set_itstate(it_advance(it));
        regs.branch_exchange(core.next_addr());
        trace!("kprobe: {:#x} not executed, IT condition failed", core.addr());
        return false;
    }
    if it_advance(it) != 0 {
        fatal(ProbeError::DecodeUnsupported {
            addr: core.addr(),
            reason: "trapped inside an IT block",
        });
    }
    regs.set_itstate(0);
    true
}
