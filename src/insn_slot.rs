//! Trampoline slot allocator.
//!
//! Each probed instruction gets its own trampoline, placed in a fixed-size
//! slot. Slots are carved from executable pages ("chunks") obtained from the
//! owning address space; chunks are created on demand and handed back once
//! their last slot is freed.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::access::AddressSpace;
use crate::error::{ProbeError, ProbeResult};

/// Size of each slot in bytes. Large enough for the biggest template
/// (A32 BLX register: 12 words).
pub const SLOT_SIZE: usize = 48;

/// Size of one chunk (one executable page).
pub const CHUNK_SIZE: usize = 4096;

/// Slots carved from one chunk.
pub const SLOTS_PER_CHUNK: usize = CHUNK_SIZE / SLOT_SIZE;

const NIL: u16 = u16::MAX;

/// A reserved trampoline slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub addr: u32,
    pub size: usize,
}

struct FreeList {
    next: [u16; SLOTS_PER_CHUNK],
    head: u16,
    available: usize,
    used: [u64; 2],
}

impl FreeList {
    fn new() -> Self {
        let mut next = [NIL; SLOTS_PER_CHUNK];
        for (i, n) in next.iter_mut().enumerate().take(SLOTS_PER_CHUNK - 1) {
            *n = (i + 1) as u16;
        }
        Self {
            next,
            head: 0,
            available: SLOTS_PER_CHUNK,
            used: [0; 2],
        }
    }

    fn is_used(&self, idx: usize) -> bool {
        self.used[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_used(&mut self, idx: usize, used: bool) {
        if used {
            self.used[idx / 64] |= 1 << (idx % 64);
        } else {
            self.used[idx / 64] &= !(1 << (idx % 64));
        }
    }
}

/// One executable page subdivided into slots.
pub struct Chunk {
    base: u32,
    free: Mutex<FreeList>,
}

impl Chunk {
    fn new(base: u32) -> Self {
        Self {
            base,
            free: Mutex::new(FreeList::new()),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.base + (SLOTS_PER_CHUNK * SLOT_SIZE) as u32
    }

    pub fn count_available(&self) -> usize {
        self.free.lock().available
    }

    fn alloc(&self) -> Option<u32> {
        let mut list = self.free.lock();
        if list.head == NIL {
            return None;
        }
        let idx = list.head as usize;
        list.head = list.next[idx];
        list.next[idx] = NIL;
        list.available -= 1;
        list.set_used(idx, true);
        Some(self.base + (idx * SLOT_SIZE) as u32)
    }

    /// Free the slot at `addr`; returns the number of slots still available.
    fn free(&self, addr: u32) -> ProbeResult<usize> {
        let off = (addr - self.base) as usize;
        if off % SLOT_SIZE != 0 {
            return Err(ProbeError::InvalidSlot { addr });
        }
        let idx = off / SLOT_SIZE;
        let mut list = self.free.lock();
        if !list.is_used(idx) {
            return Err(ProbeError::InvalidSlot { addr });
        }
        list.set_used(idx, false);
        list.next[idx] = list.head;
        list.head = idx as u16;
        list.available += 1;
        Ok(list.available)
    }
}

/// Slot allocator over one address space.
pub struct SlotAllocator {
    space: Arc<dyn AddressSpace>,
    chunks: RwLock<Vec<Arc<Chunk>>>,
}

impl SlotAllocator {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            space,
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Reserve a slot for a trampoline of `size` bytes.
    pub fn alloc(&self, size: usize) -> ProbeResult<Slot> {
        if size > SLOT_SIZE {
            return Err(ProbeError::OutOfMemory);
        }

        {
            let chunks = self.chunks.read();
            for chunk in chunks.iter() {
                if let Some(addr) = chunk.alloc() {
                    debug!("insn_slot: allocated slot at {:#x}", addr);
                    return Ok(Slot {
                        addr,
                        size: SLOT_SIZE,
                    });
                }
            }
        }

        let page = self.space.alloc_exec_page().map_err(|e| {
            warn!("insn_slot: no executable page available: {:?}", e);
            ProbeError::OutOfMemory
        })?;
        let chunk = Arc::new(Chunk::new(page));
        let addr = chunk.alloc().ok_or(ProbeError::OutOfMemory)?;
        self.chunks.write().push(chunk);
        info!(
            "insn_slot: new chunk at {:#x} for context {}, slot {:#x}",
            page,
            self.space.id().0,
            addr
        );
        Ok(Slot {
            addr,
            size: SLOT_SIZE,
        })
    }

    /// Release a slot. Double frees and foreign addresses are reported.
    pub fn free(&self, slot: Slot) -> ProbeResult<()> {
        let chunk = {
            let chunks = self.chunks.read();
            chunks
                .iter()
                .find(|c| c.contains(slot.addr))
                .cloned()
                .ok_or(ProbeError::InvalidSlot { addr: slot.addr })?
        };

        let available = chunk.free(slot.addr)?;
        debug!("insn_slot: freed slot at {:#x}", slot.addr);

        if available == SLOTS_PER_CHUNK {
            // Allocation holds the read lock, so nothing can take a slot from
            // this chunk while the write lock is held.
            let mut chunks = self.chunks.write();
            let pos = chunks.iter().position(|c| Arc::ptr_eq(c, &chunk));
            if let (Some(pos), SLOTS_PER_CHUNK) = (pos, chunk.count_available()) {
                chunks.swap_remove(pos);
                drop(chunks);
                self.space.free_exec_page(chunk.base());
                info!("insn_slot: released empty chunk at {:#x}", chunk.base());
            }
        }
        Ok(())
    }

    /// Free slots across all chunks.
    pub fn count_available(&self) -> usize {
        self.chunks.read().iter().map(|c| c.count_available()).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether `addr` lies inside a slot handed out by this allocator.
    pub fn is_slot_address(&self, addr: u32) -> bool {
        self.chunks.read().iter().any(|c| c.contains(addr))
    }
}
