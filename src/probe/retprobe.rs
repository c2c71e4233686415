//! Return-probe instances.
//!
//! A return probe hijacks the return address of a call: the real address is
//! saved in an [`Instance`] and the shared return trampoline of the address
//! space takes its place. Instances live in a fixed-size pool per probed
//! site, allocated at registration, so the trap path never allocates.
//!
//! When a probe goes away while calls it hijacked are still running, each
//! outstanding instance is fixed up by scanning that call's stack for the
//! trampoline address and writing the real one back. Instances the scan
//! cannot find stay behind as orphans and are resolved by the trampoline.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::access::{self, AddressSpace};
use crate::error::{ProbeError, ProbeResult};
use crate::platform::ContextId;

/// Default number of concurrently outstanding instances per return probe.
pub const DEFAULT_MAXACTIVE: usize = 16;

/// Default number of stack words searched when fixing up a return address.
pub const DEFAULT_STACK_SCAN_DEPTH: usize = 64;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// One hijacked return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance {
    /// Interworking address the call really returns to.
    pub ret: u32,
    /// Stack pointer when the return address was captured.
    pub sp: u32,
    /// Execution context that made the call.
    pub ctx: ContextId,
    /// Address space the call runs in.
    pub space: ContextId,
    /// Creation order, global across pools.
    pub seq: u64,
}

impl Instance {
    pub fn new(ret: u32, sp: u32, ctx: ContextId, space: ContextId) -> Self {
        Self {
            ret,
            sp,
            ctx,
            space,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn belongs_to(&self, ctx: ContextId, space: ContextId) -> bool {
        self.ctx == ctx && self.space == space
    }
}

/// Fixed-capacity instance pool of one return probe.
pub struct InstancePool {
    slots: Mutex<Vec<Option<Instance>>>,
    nmissed: AtomicU64,
}

impl InstancePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            nmissed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Store `inst`; returns its index. A full pool counts a miss.
    pub fn acquire(&self, inst: Instance) -> ProbeResult<usize> {
        let mut slots = self.slots.lock();
        match slots.iter().position(Option::is_none) {
            Some(index) => {
                slots[index] = Some(inst);
                Ok(index)
            }
            None => {
                self.nmissed.fetch_add(1, Ordering::Relaxed);
                Err(ProbeError::CapacityExceeded("return instances"))
            }
        }
    }

    /// Take the instance at `index` out of the pool.
    pub fn release(&self, index: usize) -> ProbeResult<Instance> {
        self.slots
            .lock()
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(ProbeError::InvalidInstance { index })
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn nmissed(&self) -> u64 {
        self.nmissed.load(Ordering::Relaxed)
    }

    /// Most recent instance of `ctx` in `space` created before `before`.
    pub fn newest(&self, ctx: ContextId, space: ContextId, before: u64) -> Option<(usize, Instance)> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|inst| (i, inst)))
            .filter(|(_, inst)| inst.belongs_to(ctx, space) && inst.seq < before)
            .max_by_key(|(_, inst)| inst.seq)
    }

    /// Live instances matching `pred`, with their indices.
    pub fn live(&self, pred: impl Fn(&Instance) -> bool) -> Vec<(usize, Instance)> {
        self.slots
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.filter(|inst| pred(inst)).map(|inst| (i, inst)))
            .collect()
    }

    /// Drop every instance matching `pred`; returns how many were dropped.
    pub fn discard(&self, pred: impl Fn(&Instance) -> bool) -> usize {
        let mut dropped = 0;
        for slot in self.slots.lock().iter_mut() {
            if slot.as_ref().is_some_and(&pred) {
                *slot = None;
                dropped += 1;
            }
        }
        dropped
    }
}

/// Instances whose probe is gone but whose return still goes through the
/// trampoline.
#[derive(Default)]
pub struct OrphanList {
    list: Mutex<Vec<Instance>>,
}

impl OrphanList {
    pub fn adopt(&self, inst: Instance) {
        self.list.lock().push(inst);
    }

    pub fn newest(&self, ctx: ContextId, space: ContextId, before: u64) -> Option<Instance> {
        self.list
            .lock()
            .iter()
            .filter(|i| i.belongs_to(ctx, space) && i.seq < before)
            .max_by_key(|i| i.seq)
            .copied()
    }

    /// Remove the orphan created with sequence number `seq`.
    pub fn take(&self, seq: u64) -> Option<Instance> {
        let mut list = self.list.lock();
        let pos = list.iter().position(|i| i.seq == seq)?;
        Some(list.swap_remove(pos))
    }

    pub fn live(&self, pred: impl Fn(&Instance) -> bool) -> Vec<Instance> {
        self.list.lock().iter().filter(|i| pred(i)).copied().collect()
    }

    pub fn discard(&self, pred: impl Fn(&Instance) -> bool) -> usize {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|i| !pred(i));
        before - list.len()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Search the `depth` words below `inst.sp` for the trampoline address and
/// write the real return address over the first hit. Returns the patched
/// stack address.
pub fn patch_stack(
    space: &dyn AddressSpace,
    inst: &Instance,
    trampoline: u32,
    depth: usize,
) -> ProbeResult<u32> {
    let not_found = ProbeError::StackScanNotFound {
        context: inst.ctx,
        sp: inst.sp,
        depth,
    };
    for i in 1..=depth as u32 {
        let Some(addr) = inst.sp.checked_sub(i * 4) else {
            break;
        };
        let Ok(word) = access::read_u32(space, addr) else {
            break;
        };
        if word & !1 == trampoline {
            access::write_u32(space, addr, inst.ret)?;
            debug!(
                "kretprobe: restored return address {:#x} at {:#x} for context {}",
                inst.ret, addr, inst.ctx.0
            );
            return Ok(addr);
        }
    }
    Err(not_found)
}
