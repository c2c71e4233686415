//! Error taxonomy for probe registration, trap delivery and memory access.

use axerrno::AxError;

use crate::platform::ContextId;
use crate::symbols;

/// Errors produced by the probe engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The instruction at `addr` cannot be relocated into a trampoline.
    DecodeUnsupported { addr: u32, reason: &'static str },
    /// PC substitution needs a scratch register but every candidate is in use.
    NoFreeRegister { addr: u32 },
    /// No slot or backing page could be allocated.
    OutOfMemory,
    /// A bounded table (handler set, instance pool, probe count) is full.
    CapacityExceeded(&'static str),
    /// A trap fired on an engine breakpoint with no matching probe.
    LookupMiss { addr: u32 },
    /// A cross-context read or write stopped early. `cause` is the backend
    /// error, absent when the backend just moved fewer bytes.
    PartialAccess {
        addr: u32,
        transferred: usize,
        requested: usize,
        cause: Option<AxError>,
    },
    /// Return-address fix-up did not find the hijacked slot within the scan depth.
    StackScanNotFound {
        context: ContextId,
        sp: u32,
        depth: usize,
    },
    /// The address is not a slot handed out by the allocator, or it is already free.
    InvalidSlot { addr: u32 },
    /// A return-probe instance was released while not live.
    InvalidInstance { index: usize },
    /// The address is misaligned or outside any known address space.
    InvalidAddress { addr: u32 },
    /// No probe, handle or address space matches the request.
    NotFound,
    /// The object is already registered.
    AlreadyExists,
    /// The request is malformed.
    InvalidArgument(&'static str),
    /// The global manager has not been initialized.
    NotInitialized,
    /// Symbol resolution failed.
    Symbol(symbols::Error),
}

pub type ProbeResult<T> = Result<T, ProbeError>;

impl core::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DecodeUnsupported { addr, reason } => {
                write!(f, "Cannot probe instruction at {:#x}: {}", addr, reason)
            }
            Self::NoFreeRegister { addr } => {
                write!(f, "No free scratch register for instruction at {:#x}", addr)
            }
            Self::OutOfMemory => write!(f, "Out of trampoline memory"),
            Self::CapacityExceeded(what) => write!(f, "Capacity exceeded: {}", what),
            Self::LookupMiss { addr } => write!(f, "No probe registered for trap at {:#x}", addr),
            Self::PartialAccess {
                addr,
                transferred,
                requested,
                cause,
            } => {
                write!(
                    f,
                    "Partial access at {:#x}: {} of {} bytes transferred",
                    addr, transferred, requested
                )?;
                match cause {
                    Some(e) => write!(f, " ({:?})", e),
                    None => Ok(()),
                }
            }
            Self::StackScanNotFound { context, sp, depth } => write!(
                f,
                "Hijacked return address of context {} not found within {} words below {:#x}",
                context.0, depth, sp
            ),
            Self::InvalidSlot { addr } => write!(f, "Invalid or already free slot {:#x}", addr),
            Self::InvalidInstance { index } => {
                write!(f, "Return instance {} released while not live", index)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid probe address {:#x}", addr),
            Self::NotFound => write!(f, "Probe not found"),
            Self::AlreadyExists => write!(f, "Already registered"),
            Self::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            Self::NotInitialized => write!(f, "Kprobe subsystem not initialized"),
            Self::Symbol(e) => write!(f, "Symbol lookup failed: {}", e),
        }
    }
}

impl core::error::Error for ProbeError {}

impl From<symbols::Error> for ProbeError {
    fn from(e: symbols::Error) -> Self {
        Self::Symbol(e)
    }
}

/// Report a broken engine invariant and stop.
///
/// Trap-time conditions that leave no safe way to resume (a breakpoint nobody owns, a
/// corrupted return instance) end here.
#[cold]
pub fn fatal(err: ProbeError) -> ! {
    error!("kprobe: fatal: {}", err);
    panic!("kprobe: {}", err)
}
