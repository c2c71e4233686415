//! Cross-context instruction access.
//!
//! Probes can live in the kernel or in another context's address space. The
//! engine reads and patches code only through [`AddressSpace`], which moves
//! bytes within a single page; the functions in this module walk a range
//! page by page and turn short transfers into [`ProbeError::PartialAccess`].

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};
use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::cache;
use crate::error::{ProbeError, ProbeResult};
use crate::insn::{Insn, Isa, thumb_insn_len};
use crate::platform::ContextId;

pub const PAGE_SIZE: usize = 4096;

#[inline]
fn page_base(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

#[inline]
fn page_remaining(addr: u32) -> usize {
    PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1))
}

/// An address space the engine can read, patch and allocate trampolines in.
pub trait AddressSpace: Send + Sync {
    /// Owning context (`ContextId::KERNEL` for the kernel).
    fn id(&self) -> ContextId;

    /// Read `buf.len()` bytes at `addr`. The range never crosses a page boundary.
    fn read_page(&self, addr: u32, buf: &mut [u8]) -> AxResult<usize>;

    /// Write `data` at `addr`, ignoring write protection on code pages.
    /// The range never crosses a page boundary.
    fn write_page(&self, addr: u32, data: &[u8]) -> AxResult<usize>;

    /// Make a code modification in `[start, end)` visible to instruction fetch.
    fn flush_icache(&self, start: u32, end: u32) {
        cache::flush_icache_range(start as usize, end as usize);
    }

    /// Supply one page-aligned, executable and writable page.
    fn alloc_exec_page(&self) -> AxResult<u32>;

    /// Return a page obtained from [`alloc_exec_page`](Self::alloc_exec_page).
    fn free_exec_page(&self, addr: u32);
}

// =============================================================================
// Range access
// =============================================================================

/// Read `buf.len()` bytes starting at `addr`.
pub fn read_into(space: &dyn AddressSpace, addr: u32, buf: &mut [u8]) -> ProbeResult<()> {
    let requested = buf.len();
    let mut done = 0;
    while done < requested {
        let cur = addr.wrapping_add(done as u32);
        let chunk = page_remaining(cur).min(requested - done);
        let (n, cause) = match space.read_page(cur, &mut buf[done..done + chunk]) {
            Ok(n) => (n, None),
            Err(e) => (0, Some(e)),
        };
        done += n.min(chunk);
        if n < chunk {
            return Err(ProbeError::PartialAccess {
                addr,
                transferred: done,
                requested,
                cause,
            });
        }
    }
    Ok(())
}

pub fn read(space: &dyn AddressSpace, addr: u32, len: usize) -> ProbeResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    read_into(space, addr, &mut buf)?;
    Ok(buf)
}

/// Write `data` at `addr` and flush the written range from the instruction
/// cache, including the prefix of a write that stopped early.
pub fn write(space: &dyn AddressSpace, addr: u32, data: &[u8]) -> ProbeResult<()> {
    let requested = data.len();
    let mut done = 0;
    let mut result = Ok(());
    while done < requested {
        let cur = addr.wrapping_add(done as u32);
        let chunk = page_remaining(cur).min(requested - done);
        let (n, cause) = match space.write_page(cur, &data[done..done + chunk]) {
            Ok(n) => (n, None),
            Err(e) => (0, Some(e)),
        };
        done += n.min(chunk);
        if n < chunk {
            result = Err(ProbeError::PartialAccess {
                addr,
                transferred: done,
                requested,
                cause,
            });
            break;
        }
    }
    if done > 0 {
        space.flush_icache(addr, addr.wrapping_add(done as u32));
    }
    if result.is_err() {
        warn!("access: partial write at {:#x}: {} of {} bytes", addr, done, requested);
    }
    result
}

pub fn read_u16(space: &dyn AddressSpace, addr: u32) -> ProbeResult<u16> {
    let mut buf = [0u8; 2];
    read_into(space, addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32(space: &dyn AddressSpace, addr: u32) -> ProbeResult<u32> {
    let mut buf = [0u8; 4];
    read_into(space, addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_u16(space: &dyn AddressSpace, addr: u32, value: u16) -> ProbeResult<()> {
    write(space, addr, &value.to_le_bytes())
}

pub fn write_u32(space: &dyn AddressSpace, addr: u32, value: u32) -> ProbeResult<()> {
    write(space, addr, &value.to_le_bytes())
}

/// Fetch the instruction at `addr` (Thumb bit clear) in the given instruction set.
pub fn fetch_insn(space: &dyn AddressSpace, addr: u32, isa: Isa) -> ProbeResult<Insn> {
    if addr % isa.alignment() != 0 {
        return Err(ProbeError::InvalidAddress { addr });
    }
    match isa {
        Isa::Arm => Ok(Insn::arm(read_u32(space, addr)?)),
        Isa::Thumb => {
            let hw1 = read_u16(space, addr)?;
            if thumb_insn_len(hw1) == 4 {
                let hw2 = read_u16(space, addr.wrapping_add(2))?;
                Ok(Insn::thumb32(hw1, hw2))
            } else {
                Ok(Insn::thumb16(hw1))
            }
        }
    }
}

// =============================================================================
// PagedMemory
// =============================================================================

/// Page permission bits.
pub mod perm {
    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    pub const EXEC: u8 = 1 << 2;
    pub const RX: u8 = READ | EXEC;
    pub const RW: u8 = READ | WRITE;
    pub const RWX: u8 = READ | WRITE | EXEC;
}

struct Page {
    data: Box<[u8; PAGE_SIZE]>,
    perms: u8,
}

impl Page {
    fn new(perms: u8) -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
            perms,
        }
    }
}

struct ExecArena {
    base: u32,
    pages: usize,
    next: usize,
    free: Vec<u32>,
}

/// Software-backed sparse address space.
///
/// Code pages are mapped read+exec; `write_page` patches them the way a
/// debugger patches another context's text, honoring only the mapping. An
/// arena of consecutive pages supplies trampoline memory.
pub struct PagedMemory {
    id: ContextId,
    pages: RwLock<HashMap<u32, Page>>,
    arena: Mutex<ExecArena>,
    flushes: Mutex<Vec<(u32, u32)>>,
}

impl PagedMemory {
    /// Default executable arena: 64 pages at 0x7000_0000.
    pub const DEFAULT_ARENA_BASE: u32 = 0x7000_0000;
    pub const DEFAULT_ARENA_PAGES: usize = 64;

    pub fn new(id: ContextId) -> Self {
        Self::with_exec_arena(id, Self::DEFAULT_ARENA_BASE, Self::DEFAULT_ARENA_PAGES)
    }

    /// Address space whose trampoline pages are carved from `[base, base + pages * 4K)`.
    pub fn with_exec_arena(id: ContextId, base: u32, pages: usize) -> Self {
        Self {
            id,
            pages: RwLock::new(HashMap::new()),
            arena: Mutex::new(ExecArena {
                base: page_base(base),
                pages,
                next: 0,
                free: Vec::new(),
            }),
            flushes: Mutex::new(Vec::new()),
        }
    }

    /// Map every page overlapping `[addr, addr + len)` with `perms`. Existing
    /// pages keep their contents and take the new permissions.
    pub fn map(&self, addr: u32, len: usize, perms: u8) {
        let mut pages = self.pages.write();
        let end = addr as u64 + len as u64;
        let mut page = page_base(addr) as u64;
        while page < end {
            pages
                .entry(page as u32)
                .and_modify(|p| p.perms = perms)
                .or_insert_with(|| Page::new(perms));
            page += PAGE_SIZE as u64;
        }
    }

    pub fn unmap(&self, addr: u32, len: usize) {
        let mut pages = self.pages.write();
        let end = addr as u64 + len as u64;
        let mut page = page_base(addr) as u64;
        while page < end {
            pages.remove(&(page as u32));
            page += PAGE_SIZE as u64;
        }
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.pages.read().contains_key(&page_base(addr))
    }

    /// Load bytes ignoring permissions (program loading). Pages must be mapped.
    pub fn load(&self, addr: u32, data: &[u8]) -> AxResult {
        let mut pages = self.pages.write();
        for (i, byte) in data.iter().enumerate() {
            let a = addr.wrapping_add(i as u32);
            match pages.get_mut(&page_base(a)) {
                Some(page) => page.data[a as usize & (PAGE_SIZE - 1)] = *byte,
                None => return ax_err!(BadAddress, "access: load into unmapped page"),
            }
        }
        Ok(())
    }

    /// Load a sequence of A32 words.
    pub fn load_words(&self, addr: u32, words: &[u32]) -> AxResult {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.load(addr, &bytes)
    }

    /// Load a sequence of Thumb half-words.
    pub fn load_halfwords(&self, addr: u32, halfwords: &[u16]) -> AxResult {
        let bytes: Vec<u8> = halfwords.iter().flat_map(|h| h.to_le_bytes()).collect();
        self.load(addr, &bytes)
    }

    /// Read a mapped byte for data access (interpreters, tests); requires `READ`.
    pub fn peek(&self, addr: u32) -> Option<u8> {
        let pages = self.pages.read();
        let page = pages.get(&page_base(addr))?;
        if page.perms & perm::READ == 0 {
            return None;
        }
        Some(page.data[addr as usize & (PAGE_SIZE - 1)])
    }

    /// Data store honoring `WRITE`.
    pub fn poke(&self, addr: u32, value: u8) -> bool {
        let mut pages = self.pages.write();
        match pages.get_mut(&page_base(addr)) {
            Some(page) if page.perms & perm::WRITE != 0 => {
                page.data[addr as usize & (PAGE_SIZE - 1)] = value;
                true
            }
            _ => false,
        }
    }

    /// Ranges flushed so far, oldest first.
    pub fn flushes(&self) -> Vec<(u32, u32)> {
        self.flushes.lock().clone()
    }

    pub fn exec_pages_in_use(&self) -> usize {
        let arena = self.arena.lock();
        arena.next - arena.free.len()
    }
}

impl AddressSpace for PagedMemory {
    fn id(&self) -> ContextId {
        self.id
    }

    fn read_page(&self, addr: u32, buf: &mut [u8]) -> AxResult<usize> {
        let pages = self.pages.read();
        let Some(page) = pages.get(&page_base(addr)) else {
            return ax_err!(BadAddress, "access: read from unmapped page");
        };
        if page.perms & (perm::READ | perm::EXEC) == 0 {
            return ax_err!(BadAddress, "access: page not readable");
        }
        let off = addr as usize & (PAGE_SIZE - 1);
        let n = buf.len().min(PAGE_SIZE - off);
        buf[..n].copy_from_slice(&page.data[off..off + n]);
        Ok(n)
    }

    fn write_page(&self, addr: u32, data: &[u8]) -> AxResult<usize> {
        let mut pages = self.pages.write();
        let Some(page) = pages.get_mut(&page_base(addr)) else {
            return ax_err!(BadAddress, "access: write to unmapped page");
        };
        let off = addr as usize & (PAGE_SIZE - 1);
        let n = data.len().min(PAGE_SIZE - off);
        page.data[off..off + n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush_icache(&self, start: u32, end: u32) {
        self.flushes.lock().push((start, end));
    }

    fn alloc_exec_page(&self) -> AxResult<u32> {
        let addr = {
            let mut arena = self.arena.lock();
            match arena.free.pop() {
                Some(addr) => addr,
                None if arena.next < arena.pages => {
                    let addr = arena.base + (arena.next * PAGE_SIZE) as u32;
                    arena.next += 1;
                    addr
                }
                None => return ax_err!(NoMemory, "access: executable arena exhausted"),
            }
        };
        self.map(addr, PAGE_SIZE, perm::RWX);
        Ok(addr)
    }

    fn free_exec_page(&self, addr: u32) {
        self.unmap(addr, PAGE_SIZE);
        self.arena.lock().free.push(addr);
    }
}

// =============================================================================
// KernelSpace
// =============================================================================

/// The current kernel address space, accessed directly.
///
/// Kernel text is assumed writable (the host maps it so before patching);
/// trampoline pages come from the global allocator, which must hand out
/// executable memory.
#[cfg(target_arch = "arm")]
pub struct KernelSpace;

#[cfg(target_arch = "arm")]
impl KernelSpace {
    const PAGE_LAYOUT: core::alloc::Layout =
        match core::alloc::Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid page layout"),
        };
}

#[cfg(target_arch = "arm")]
impl AddressSpace for KernelSpace {
    fn id(&self) -> ContextId {
        ContextId::KERNEL
    }

    fn read_page(&self, addr: u32, buf: &mut [u8]) -> AxResult<usize> {
        if addr == 0 {
            return ax_err!(BadAddress, "access: null kernel address");
        }
        unsafe {
            core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(buf.len())
    }

    fn write_page(&self, addr: u32, data: &[u8]) -> AxResult<usize> {
        if addr == 0 {
            return ax_err!(BadAddress, "access: null kernel address");
        }
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
        }
        Ok(data.len())
    }

    fn alloc_exec_page(&self) -> AxResult<u32> {
        let ptr = unsafe { alloc::alloc::alloc_zeroed(Self::PAGE_LAYOUT) };
        if ptr.is_null() {
            return ax_err!(NoMemory, "access: kernel page allocation failed");
        }
        Ok(ptr as usize as u32)
    }

    fn free_exec_page(&self, addr: u32) {
        unsafe { alloc::alloc::dealloc(addr as usize as *mut u8, Self::PAGE_LAYOUT) }
    }
}
