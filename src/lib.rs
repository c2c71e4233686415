//! ARM kprobe engine
//!
//! Dynamic instrumentation for 32-bit ARM code in both the A32 and the
//! Thumb/Thumb-2 instruction sets. Any instruction can be probed: it is
//! replaced by a diversion into the engine, and a relocated copy runs in an
//! out-of-line trampoline so execution continues as if nothing happened,
//! including instructions that read or write PC. Return probes hijack a
//! call's return address and report the return.
//!
//! # Modules
//!
//! - [`insn`] - A32 and Thumb instruction classification
//! - [`trampoline`] - trampoline templates and synthesis
//! - [`insn_slot`] - executable slot allocation
//! - [`access`] - reading and patching code in any address space
//! - [`probe`] - registry, trap delivery and return probes
//!
//! # Quick Start
//!
//! ```ignore
//! use axkprobe::probe::{self, ProbeAction, ProbeBuilder};
//!
//! // Initialize the subsystem (call once during boot)
//! axkprobe::init();
//!
//! let handle = probe::register_probe(
//!     ProbeBuilder::new()
//!         .with_addr(0xc000_8000)
//!         .with_entry_handler(|_regs| ProbeAction::Continue),
//! )?;
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

// =============================================================================
// Host services
// =============================================================================

pub mod platform;

// =============================================================================
// Instructions and trampolines
// =============================================================================

pub mod cache;
pub mod error;
pub mod insn;
pub mod insn_slot;
pub mod regs;
pub mod trampoline;

// =============================================================================
// Probes
// =============================================================================

pub mod access;
pub mod probe;
pub mod symbols;

pub use error::{ProbeError, ProbeResult};
pub use platform::ContextId;
pub use probe::{KprobeConfig, KprobeManager, ProbeAction, ProbeBuilder, ProbeHandle};
pub use regs::PtRegs;

// =============================================================================
// Initialization
// =============================================================================

/// Initialize the kprobe subsystem with the default configuration.
///
/// This should be called during kernel boot after the memory allocator is ready.
/// Symbolic probe locations additionally need [`init_with_symbols`].
pub fn init() {
    info!("Initializing axkprobe...");
    match probe::init(KprobeConfig::default()) {
        Ok(_) => info!("axkprobe initialization complete"),
        Err(e) => error!("axkprobe initialization failed: {}", e),
    }
}

/// Initialize the kprobe subsystem and load the kernel symbol table.
///
/// # Arguments
/// * `kallsyms` - kallsyms blob, page aligned
/// * `stext`, `etext` - bounds of the kernel text section
pub fn init_with_symbols(kallsyms: &'static [u8], stext: u64, etext: u64) {
    info!("Initializing axkprobe with symbol table...");
    if kallsyms.as_ptr() as usize % 4096 != 0 {
        warn!("  - kallsyms data at {:p} is not page-aligned", kallsyms.as_ptr());
    }
    match symbols::init(kallsyms, stext, etext) {
        Ok(()) => info!(
            "  - symbol table loaded ({} bytes, text {:#x} - {:#x})",
            kallsyms.len(),
            stext,
            etext
        ),
        Err(e) => error!("  - failed to load symbol table: {}", e),
    }
    init();
}
