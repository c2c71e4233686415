//! Host services the engine needs from the kernel it runs in.
//!
//! The engine asks three things of its host: which CPU and execution context
//! is trapping, and when every context has left code it entered earlier. A
//! kernel supplies them through [`install_hooks`]; tests and plain host builds
//! get [`MockPlatform`], whose answers are set through atomics.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identity of an execution context (task) or of the address space it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl ContextId {
    /// The kernel address space / interrupt context.
    pub const KERNEL: ContextId = ContextId(0);
}

/// Operations the engine calls back into its host for.
pub trait PlatformOps {
    /// CPU taking the current trap.
    fn cpu_id() -> u32;

    /// Execution context running on this CPU.
    fn context_id() -> ContextId;

    /// Return once no context can still be executing code it entered before the call.
    fn synchronize();
}

// =============================================================================
// Kernel Hooks
// =============================================================================

/// Callbacks supplied by the host kernel.
#[cfg(feature = "kernel-hooks")]
#[derive(Clone, Copy)]
pub struct PlatformHooks {
    pub cpu_id: fn() -> u32,
    pub context_id: fn() -> u32,
    pub synchronize: fn(),
}

#[cfg(feature = "kernel-hooks")]
static HOOKS: spin::Once<PlatformHooks> = spin::Once::new();

/// Install the host kernel callbacks. Only the first call takes effect.
#[cfg(feature = "kernel-hooks")]
pub fn install_hooks(hooks: PlatformHooks) {
    HOOKS.call_once(|| hooks);
}

#[cfg(all(not(test), feature = "kernel-hooks"))]
pub struct HookPlatform;

#[cfg(all(not(test), feature = "kernel-hooks"))]
impl PlatformOps for HookPlatform {
    fn cpu_id() -> u32 {
        HOOKS.get().map_or(0, |h| (h.cpu_id)())
    }

    fn context_id() -> ContextId {
        HOOKS
            .get()
            .map_or(ContextId::KERNEL, |h| ContextId((h.context_id)()))
    }

    fn synchronize() {
        match HOOKS.get() {
            Some(h) => (h.synchronize)(),
            None => warn!("platform: synchronize called before hooks were installed"),
        }
    }
}

// =============================================================================
// Mock
// =============================================================================

static MOCK_CPU: AtomicU32 = AtomicU32::new(0);
static MOCK_CONTEXT: AtomicU32 = AtomicU32::new(1);
static MOCK_GRACE_PERIODS: AtomicU64 = AtomicU64::new(0);

/// Single-CPU stand-in whose answers tests set directly.
#[cfg(any(test, not(feature = "kernel-hooks")))]
pub struct MockPlatform;

#[cfg(any(test, not(feature = "kernel-hooks")))]
impl PlatformOps for MockPlatform {
    fn cpu_id() -> u32 {
        MOCK_CPU.load(Ordering::Relaxed)
    }

    fn context_id() -> ContextId {
        ContextId(MOCK_CONTEXT.load(Ordering::Relaxed))
    }

    // Nothing runs concurrently with the caller, so the grace period is immediate.
    fn synchronize() {
        MOCK_GRACE_PERIODS.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn set_mock_cpu_id(id: u32) {
    MOCK_CPU.store(id, Ordering::Relaxed);
}

/// Make `id` the context that subsequent traps are attributed to.
pub fn set_mock_context_id(id: ContextId) {
    MOCK_CONTEXT.store(id.0, Ordering::Relaxed);
}

/// Grace periods the mock has been asked for so far.
pub fn mock_sync_count() -> u64 {
    MOCK_GRACE_PERIODS.load(Ordering::SeqCst)
}

#[cfg(all(not(test), feature = "kernel-hooks"))]
pub type Platform = HookPlatform;

#[cfg(any(test, not(feature = "kernel-hooks")))]
pub type Platform = MockPlatform;

#[inline]
pub fn cpu_id() -> u32 {
    Platform::cpu_id()
}

#[inline]
pub fn context_id() -> ContextId {
    Platform::context_id()
}

/// Wait for a grace period.
#[inline]
pub fn synchronize() {
    Platform::synchronize()
}
