//! End-to-end probe tests.
//!
//! A caller makes a `BL` at address A to a function at A + 0x40 that returns
//! 42; the caller adds one. Programs run on the test interpreter, first
//! unprobed, then with an entry probe and a return probe on the call.

mod common;

use std::sync::{Arc, Mutex};

use axkprobe::probe::{DiversionMode, ProbeState};
use axkprobe::{ContextId, ProbeAction, ProbeBuilder};
use common::*;
use serial_test::serial;

const A: u32 = CODE;

fn load_arm_call(mem: &axkprobe::access::PagedMemory) {
    // bl A+0x40; add r0, r0, #1; halt
    mem.load_words(A, &[0xeb00_000e, 0xe280_0001, ARM_HALT]).unwrap();
    // mov r0, #42; bx lr
    mem.load_words(A + 0x40, &[0xe3a0_002a, 0xe12f_ff1e]).unwrap();
}

fn load_thumb_call(mem: &axkprobe::access::PagedMemory) {
    // bl A+0x40; adds r0, #1; halt
    mem.load_halfwords(A, &[0xf000, 0xf81e, 0x3001, THUMB_HALT])
        .unwrap();
    // movs r0, #42; bx lr
    mem.load_halfwords(A + 0x40, &[0x202a, 0x4770]).unwrap();
}

type Log = Arc<Mutex<Vec<(u32, u32)>>>;

fn recorder(log: &Log) -> impl Fn(&mut axkprobe::PtRegs) -> ProbeAction + Send + Sync + 'static {
    let log = log.clone();
    move |regs| {
        log.lock().unwrap().push((regs.pc_interworking(), regs.regs[0]));
        ProbeAction::Continue
    }
}

// =============================================================================
// Baselines
// =============================================================================

#[test]
fn test_arm_call_unprobed() {
    let mem = memory(ContextId::KERNEL);
    load_arm_call(&mem);
    let mut cpu = Cpu::new(&mem, A);
    assert_eq!(cpu.run(None), Ok(A + 8));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(cpu.regs.lr(), A + 4);
}

#[test]
fn test_thumb_call_unprobed() {
    let mem = memory(ContextId::KERNEL);
    load_thumb_call(&mem);
    let mut cpu = Cpu::new(&mem, A | 1);
    assert_eq!(cpu.run(None), Ok(A + 6));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(cpu.regs.lr(), (A + 4) | 1);
}

// =============================================================================
// Entry probes
// =============================================================================

#[test]
fn test_arm_entry_probe_on_call() {
    let mem = memory(ContextId::KERNEL);
    load_arm_call(&mem);
    let mgr = manager(&mem);
    let entries: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A)
            .with_entry_handler(recorder(&entries)),
    )
    .unwrap();

    let mut cpu = Cpu::new(&mem, A);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 8));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(cpu.regs.lr(), A + 4);
    assert_eq!(cpu.regs.sp(), STACK_TOP);
    assert_eq!(cpu.traps, 1);
    assert_eq!(*entries.lock().unwrap(), vec![(A, 0)]);
    assert_eq!(mgr.probe(ContextId::KERNEL, A).unwrap().hits(), 1);
}

#[test]
fn test_thumb_entry_probe_on_call() {
    let mem = memory(ContextId::KERNEL);
    load_thumb_call(&mem);
    let mgr = manager(&mem);
    let entries: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A | 1)
            .with_entry_handler(recorder(&entries)),
    )
    .unwrap();

    let mut cpu = Cpu::new(&mem, A | 1);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 6));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(cpu.regs.lr(), (A + 4) | 1);
    assert_eq!(cpu.traps, 1);
    assert_eq!(*entries.lock().unwrap(), vec![(A | 1, 0)]);
}

// =============================================================================
// Return probes
// =============================================================================

#[test]
#[serial]
fn test_arm_return_probe_on_call() {
    let mem = memory(ContextId::KERNEL);
    load_arm_call(&mem);
    let mgr = manager(&mem);
    let entries: Log = Arc::default();
    let exits: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A)
            .with_entry_handler(recorder(&entries))
            .with_exit_handler(recorder(&exits)),
    )
    .unwrap();

    let mut cpu = Cpu::new(&mem, A);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 8));
    assert_eq!(cpu.regs.regs[0], 43);
    // Site trap and return trampoline.
    assert_eq!(cpu.traps, 2);
    assert_eq!(*entries.lock().unwrap(), vec![(A, 0)]);
    // The exit handler sees the real return address and the callee's result.
    assert_eq!(*exits.lock().unwrap(), vec![(A + 4, 42)]);

    let info = &mgr.list()[0];
    assert_eq!(info.live_instances, 0);
    assert_eq!(info.nmissed, 0);
}

#[test]
#[serial]
fn test_thumb_return_probe_on_call() {
    let mem = memory(ContextId::KERNEL);
    load_thumb_call(&mem);
    let mgr = manager(&mem);
    let exits: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A | 1)
            .with_exit_handler(recorder(&exits)),
    )
    .unwrap();

    let mut cpu = Cpu::new(&mem, A | 1);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 6));
    assert_eq!(cpu.regs.regs[0], 43);
    assert!(cpu.regs.is_thumb());
    assert_eq!(cpu.traps, 2);
    assert_eq!(*exits.lock().unwrap(), vec![((A + 4) | 1, 42)]);
}

#[test]
#[serial]
fn test_return_probe_on_function_entry() {
    let mem = memory(ContextId::KERNEL);
    load_arm_call(&mem);
    let mgr = manager(&mem);
    let exits: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A + 0x40)
            .with_exit_handler(recorder(&exits)),
    )
    .unwrap();

    let mut cpu = Cpu::new(&mem, A);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 8));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(*exits.lock().unwrap(), vec![(A + 4, 42)]);
}

// =============================================================================
// Branch diversion
// =============================================================================

#[test]
#[serial]
fn test_arm_branch_diversion() {
    let mem = memory(ContextId::KERNEL);
    load_arm_call(&mem);
    let mgr = manager(&mem);
    let exits: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A)
            .with_diversion(DiversionMode::Branch)
            .with_exit_handler(recorder(&exits)),
    )
    .unwrap();

    // The site is now an unconditional B into the trampoline.
    assert_eq!(read_u32(&mem, A) >> 24, 0xea);
    let info = &mgr.list()[0];
    assert_eq!(info.diversion, DiversionMode::Branch);
    assert_eq!(info.state, ProbeState::Armed);

    let mut cpu = Cpu::new(&mem, A);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 8));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(*exits.lock().unwrap(), vec![(A + 4, 42)]);
    assert_eq!(mgr.list()[0].hits, 1);
}

#[test]
fn test_thumb32_branch_diversion() {
    let mem = memory(ContextId::KERNEL);
    load_thumb_call(&mem);
    let mgr = manager(&mem);
    let entries: Log = Arc::default();
    mgr.register(
        ProbeBuilder::new()
            .with_addr(A | 1)
            .with_diversion(DiversionMode::Branch)
            .with_entry_handler(recorder(&entries)),
    )
    .unwrap();
    assert_eq!(mgr.list()[0].diversion, DiversionMode::Branch);

    let mut cpu = Cpu::new(&mem, A | 1);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 6));
    assert_eq!(cpu.regs.regs[0], 43);
    assert_eq!(*entries.lock().unwrap(), vec![(A | 1, 0)]);
}

#[test]
fn test_thumb16_branch_diversion_falls_back_to_trap() {
    let mem = memory(ContextId::KERNEL);
    load_thumb_call(&mem);
    let mgr = manager(&mem);
    // adds r0, #1 is a 16-bit instruction.
    mgr.register(
        ProbeBuilder::new()
            .with_addr((A + 4) | 1)
            .with_diversion(DiversionMode::Branch)
            .with_entry_handler(|_| ProbeAction::Continue),
    )
    .unwrap();
    assert_eq!(mgr.list()[0].diversion, DiversionMode::Trap);
    assert_eq!(access_u16(&mem, A + 4), 0xde18);

    let mut cpu = Cpu::new(&mem, A | 1);
    assert_eq!(cpu.run(Some(&mgr)), Ok(A + 6));
    assert_eq!(cpu.regs.regs[0], 43);
}

fn access_u16(mem: &axkprobe::access::PagedMemory, addr: u32) -> u16 {
    axkprobe::access::read_u16(mem, addr).unwrap()
}
