//! Kprobe and kretprobe engine.
//!
//! A probe replaces one instruction with a diversion (an undefined-instruction
//! trap, or a branch into the trampoline's breakpoint slot). When the trap
//! fires, [`handle_trap`] runs the registered handlers and resumes in an
//! out-of-line trampoline that performs the displaced instruction.
//!
//! # Quick Start
//!
//! ```ignore
//! use axkprobe::probe::{self, KprobeConfig, ProbeAction, ProbeBuilder};
//!
//! probe::init(KprobeConfig::default())?;
//!
//! let handle = probe::register_probe(
//!     ProbeBuilder::new()
//!         .with_symbol("do_fork+0x10")
//!         .with_entry_handler(|regs| {
//!             info!("do_fork r0={:#x}", regs.arg(0));
//!             ProbeAction::Continue
//!         }),
//! )?;
//!
//! // From the undefined-instruction exception handler:
//! // if probe::handle_trap(ContextId::KERNEL, regs) { return; }
//!
//! probe::unregister_probe(handle)?;
//! ```

pub mod core;
pub mod handler;
pub mod manager;
pub mod retprobe;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{ProbeError, ProbeResult};
use crate::insn::Isa;
use crate::platform::ContextId;
use crate::regs::PtRegs;
use crate::symbols;

pub use self::core::{MAX_HANDLERS, ProbeCore, ProbeKey};
pub use manager::{KprobeManager, NotifyHook};
pub use retprobe::{DEFAULT_MAXACTIVE, DEFAULT_STACK_SCAN_DEPTH, Instance, InstancePool};

/// What a handler asks the engine to do after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Run the displaced instruction and carry on.
    Continue,
    /// Do not run the displaced instruction. Execution resumes at the PC the
    /// handler left in the registers, or after the probed instruction when
    /// the handler did not move it.
    Skip,
}

/// Probe callback. Receives the trapped registers with PC set to the probe address.
pub type Handler = Arc<dyn Fn(&mut PtRegs) -> ProbeAction + Send + Sync>;

/// Lifecycle of a probed site.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Trampoline ready, original instruction in place.
    Unarmed = 0,
    /// Diversion installed.
    Armed = 1,
    /// Original instruction restored, waiting for deliveries to drain.
    Disarming = 2,
    /// Slot released.
    Removed = 3,
}

impl ProbeState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => ProbeState::Unarmed,
            1 => ProbeState::Armed,
            2 => ProbeState::Disarming,
            _ => ProbeState::Removed,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeState::Unarmed => "unarmed",
            ProbeState::Armed => "armed",
            ProbeState::Disarming => "disarming",
            ProbeState::Removed => "removed",
        }
    }
}

/// How a probed site reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiversionMode {
    /// Overwrite the instruction with an undefined-instruction breakpoint.
    Trap,
    /// Overwrite the instruction with a branch to the trampoline's breakpoint
    /// slot. A32 sites and 32-bit Thumb sites within branch range only; other
    /// sites fall back to [`DiversionMode::Trap`].
    Branch,
}

/// Runtime configuration of a [`KprobeManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KprobeConfig {
    /// Instance pool size of a return probe that does not set its own.
    pub maxactive: usize,
    /// Words searched below a captured stack pointer when fixing up a
    /// hijacked return address.
    pub stack_scan_depth: usize,
    /// Diversion used when a registration does not choose one.
    pub diversion: DiversionMode,
}

impl Default for KprobeConfig {
    fn default() -> Self {
        Self {
            maxactive: DEFAULT_MAXACTIVE,
            stack_scan_depth: DEFAULT_STACK_SCAN_DEPTH,
            diversion: DiversionMode::Trap,
        }
    }
}

/// Description of a probe to register.
#[derive(Clone)]
pub struct ProbeBuilder {
    addr: Option<u32>,
    symbol: Option<String>,
    entry: Option<Handler>,
    exit: Option<Handler>,
    maxactive: Option<usize>,
    space: ContextId,
    notify: Option<u32>,
    diversion: Option<DiversionMode>,
}

impl Default for ProbeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeBuilder {
    pub fn new() -> Self {
        Self {
            addr: None,
            symbol: None,
            entry: None,
            exit: None,
            maxactive: None,
            space: ContextId::KERNEL,
            notify: None,
            diversion: None,
        }
    }

    /// Probe an interworking address (bit 0 set for Thumb code).
    pub fn with_addr(mut self, addr: u32) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Probe `name` or `name+offset`, resolved through the symbol table.
    pub fn with_symbol(mut self, location: &str) -> Self {
        self.symbol = Some(String::from(location));
        self
    }

    pub fn with_entry_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut PtRegs) -> ProbeAction + Send + Sync + 'static,
    {
        self.entry = Some(Arc::new(f));
        self
    }

    /// Handler run when the probed call returns. Makes this a return probe.
    pub fn with_exit_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut PtRegs) -> ProbeAction + Send + Sync + 'static,
    {
        self.exit = Some(Arc::new(f));
        self
    }

    pub fn with_maxactive(mut self, maxactive: usize) -> Self {
        self.maxactive = Some(maxactive);
        self
    }

    /// Probe inside another context's address space.
    pub fn with_space(mut self, space: ContextId) -> Self {
        self.space = space;
        self
    }

    /// Interrupt number handed to the notify hook on each hit in a
    /// non-kernel address space.
    pub fn with_notify(mut self, irq: u32) -> Self {
        self.notify = Some(irq);
        self
    }

    pub fn with_diversion(mut self, mode: DiversionMode) -> Self {
        self.diversion = Some(mode);
        self
    }

    pub fn space(&self) -> ContextId {
        self.space
    }

    pub fn is_return_probe(&self) -> bool {
        self.exit.is_some()
    }

    /// Interworking address the builder names.
    pub fn resolve(&self) -> ProbeResult<u32> {
        match (self.addr, &self.symbol) {
            (Some(addr), _) => Ok(addr),
            (None, Some(location)) => Ok(symbols::resolve(location)?),
            (None, None) => Err(ProbeError::InvalidAddress { addr: 0 }),
        }
    }
}

/// Token returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle {
    key: ProbeKey,
    isa: Isa,
    id: u64,
}

impl ProbeHandle {
    pub fn key(&self) -> ProbeKey {
        self.key
    }

    pub fn space(&self) -> ContextId {
        self.key.space
    }

    /// Interworking address of the probed instruction.
    pub fn addr(&self) -> u32 {
        match self.isa {
            Isa::Arm => self.key.addr,
            Isa::Thumb => self.key.addr | 1,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Snapshot of one probed site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub space: ContextId,
    /// Interworking address.
    pub addr: u32,
    pub symbol: Option<String>,
    pub isa: Isa,
    pub category: &'static str,
    pub state: ProbeState,
    pub diversion: DiversionMode,
    pub handlers: usize,
    pub hits: u64,
    pub nmissed: u64,
    pub live_instances: usize,
}

// =============================================================================
// Global manager
// =============================================================================

static MANAGER: RwLock<Option<Arc<KprobeManager>>> = RwLock::new(None);

/// Initialize the global manager. Later calls return the existing one.
///
/// On ARM targets the kernel address space is attached right away.
pub fn init(config: KprobeConfig) -> ProbeResult<Arc<KprobeManager>> {
    let mut global = MANAGER.write();
    if let Some(mgr) = global.as_ref() {
        return Ok(mgr.clone());
    }
    let mgr = Arc::new(KprobeManager::with_config(config));
    #[cfg(target_arch = "arm")]
    mgr.attach_space(Arc::new(crate::access::KernelSpace))?;
    *global = Some(mgr.clone());
    info!(
        "kprobe: initialized (maxactive={}, stack scan depth={}, diversion={:?})",
        config.maxactive, config.stack_scan_depth, config.diversion
    );
    Ok(mgr)
}

/// Drop the global manager. Probes it still holds stay installed.
pub fn shutdown() -> Option<Arc<KprobeManager>> {
    let mgr = MANAGER.write().take();
    if mgr.is_some() {
        info!("kprobe: global manager released");
    }
    mgr
}

/// The global manager.
pub fn manager() -> ProbeResult<Arc<KprobeManager>> {
    MANAGER.read().clone().ok_or(ProbeError::NotInitialized)
}

pub fn register_probe(builder: ProbeBuilder) -> ProbeResult<ProbeHandle> {
    manager()?.register(builder)
}

pub fn unregister_probe(handle: ProbeHandle) -> ProbeResult<Vec<ProbeError>> {
    manager()?.unregister(handle)
}

/// Entry point for the undefined-instruction exception handler.
///
/// Returns `false` when the trap does not belong to the engine; the caller
/// then handles it as usual.
pub fn handle_trap(space: ContextId, regs: &mut PtRegs) -> bool {
    let mgr = MANAGER.read().clone();
    match mgr {
        Some(mgr) => mgr.handle_trap(space, regs),
        None => false,
    }
}

/// List all probes of the global manager.
pub fn list_all() -> Vec<ProbeInfo> {
    manager().map(|m| m.list()).unwrap_or_default()
}
