//! Instruction and data cache maintenance for code patching.

/// Flush instruction cache for the specified address range.
/// Required after writing a trampoline or a breakpoint so the CPU fetches the new code.
///
/// On ARMv7 (PL1):
/// 1. DCCMVAU - Clean data cache line to Point of Unification
/// 2. DSB - Data synchronization barrier
/// 3. ICIMVAU - Invalidate instruction cache line to PoU
/// 4. BPIALL - Invalidate branch predictor
/// 5. DSB + ISB
#[cfg(target_arch = "arm")]
pub fn flush_icache_range(start: usize, end: usize) {
    // Cortex-A7/A9/A15 all use 32 or 64 byte lines; 32 covers both.
    const CACHE_LINE_SIZE: usize = 32;

    let start_aligned = start & !(CACHE_LINE_SIZE - 1);

    unsafe {
        for addr in (start_aligned..end).step_by(CACHE_LINE_SIZE) {
            core::arch::asm!(
                "mcr p15, 0, {0}, c7, c11, 1",  // DCCMVAU
                in(reg) addr,
                options(nostack, preserves_flags)
            );
        }

        core::arch::asm!("dsb", options(nostack, preserves_flags));

        for addr in (start_aligned..end).step_by(CACHE_LINE_SIZE) {
            core::arch::asm!(
                "mcr p15, 0, {0}, c7, c5, 1",   // ICIMVAU
                in(reg) addr,
                options(nostack, preserves_flags)
            );
        }

        core::arch::asm!(
            "mcr p15, 0, {0}, c7, c5, 6",       // BPIALL
            "dsb",
            "isb",
            in(reg) 0usize,
            options(nostack, preserves_flags)
        );
    }

    trace!("flush_icache_range: {:#x} - {:#x}", start, end);
}

/// Host builds only patch software address spaces, which have no caches to maintain.
#[cfg(not(target_arch = "arm"))]
pub fn flush_icache_range(start: usize, end: usize) {
    trace!("flush_icache_range: {:#x} - {:#x} (no-op)", start, end);
}
