//! Execution equivalence of relocated instructions.
//!
//! Each program runs twice on the test interpreter: once as is, once with a
//! probe on its first instruction (or the one named). The probed run must
//! halt at the same place with the same registers and memory, so the
//! trampoline reproduced every PC-dependent effect.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use axkprobe::access::PagedMemory;
use axkprobe::probe::DiversionMode;
use axkprobe::regs::{CPSR_T, CPSR_Z};
use axkprobe::{ContextId, KprobeManager, ProbeAction, ProbeBuilder, ProbeError, PtRegs};
use common::*;
use test_case::test_case;

const A: u32 = CODE;

struct Setup {
    r0: u32,
    r1: u32,
    r3: u32,
    cpsr: u32,
}

const PLAIN: Setup = Setup {
    r0: 0,
    r1: 0,
    r3: 0,
    cpsr: 0,
};

fn start(mem: &std::sync::Arc<PagedMemory>, entry: u32, setup: &Setup) -> Cpu {
    let mut cpu = Cpu::new(mem, entry);
    cpu.regs.regs[0] = setup.r0;
    cpu.regs.regs[1] = setup.r1;
    cpu.regs.regs[3] = setup.r3;
    cpu.regs.cpsr |= setup.cpsr;
    cpu
}

/// Run `load`ed code from `entry` with and without a probe at `site`.
/// Returns both final states, unprobed first.
fn compare(
    load: impl Fn(&PagedMemory),
    entry: u32,
    site: u32,
    setup: &Setup,
    mode: DiversionMode,
) -> (Cpu, Cpu) {
    let plain_mem = memory(ContextId::KERNEL);
    load(&plain_mem);
    let mut plain = start(&plain_mem, entry, setup);
    let plain_halt = plain.run(None).unwrap();

    let mem = memory(ContextId::KERNEL);
    load(&mem);
    let mgr = manager(&mem);
    mgr.register(
        ProbeBuilder::new()
            .with_addr(site)
            .with_diversion(mode)
            .with_entry_handler(|_| ProbeAction::Continue),
    )
    .unwrap();
    let mut probed = start(&mem, entry, setup);
    let probed_halt = probed.run(Some(&mgr)).unwrap();

    assert_eq!(probed_halt, plain_halt);
    assert_eq!(probed.regs, plain.regs);
    assert_eq!(probed.traps, 1);
    assert_eq!(mgr.probe(ContextId::KERNEL, site).unwrap().hits(), 1);
    (plain, probed)
}

// =============================================================================
// A32
// =============================================================================

#[test_case(&[0xe3a0_0005, ARM_HALT], PLAIN ; "mov immediate")]
#[test_case(&[0xe59f_0008, ARM_HALT, ARM_HALT, ARM_HALT, 0xdead_beef], PLAIN ; "ldr literal")]
#[test_case(&[0xe08f_0001, ARM_HALT], Setup { r1: 0x20, ..PLAIN } ; "add reads pc")]
#[test_case(&[0xe28f_0010, ARM_HALT], PLAIN ; "adr")]
#[test_case(&[0xe08f_f001, 0xe3a0_0001, ARM_HALT, 0xe3a0_0002, ARM_HALT], Setup { r1: 4, ..PLAIN } ; "add writes pc")]
#[test_case(&[0x108f_f001, 0xe3a0_0001, ARM_HALT, 0xe3a0_0002, ARM_HALT], Setup { r1: 4, ..PLAIN } ; "conditional pc write taken")]
#[test_case(&[0x108f_f001, 0xe3a0_0001, ARM_HALT, 0xe3a0_0002, ARM_HALT], Setup { r1: 4, cpsr: CPSR_Z, ..PLAIN } ; "conditional pc write not taken")]
#[test_case(&[0xe59f_f004, 0xe3a0_0001, ARM_HALT, A + 16, 0xe3a0_0002, ARM_HALT], PLAIN ; "ldr pc literal")]
#[test_case(&[0x1a00_0001, 0xe3a0_0001, ARM_HALT, 0xe3a0_0002, ARM_HALT], PLAIN ; "bne taken")]
#[test_case(&[0x1a00_0001, 0xe3a0_0001, ARM_HALT, 0xe3a0_0002, ARM_HALT], Setup { cpsr: CPSR_Z, ..PLAIN } ; "bne not taken")]
#[test_case(&[0xe92d_8001, ARM_HALT], Setup { r0: 0x1234, ..PLAIN } ; "push with pc")]
#[test_case(&[0xe12f_ff13, ARM_HALT, ARM_HALT, 0xe3a0_0007, ARM_HALT], Setup { r3: A + 12, ..PLAIN } ; "bx register")]
fn test_arm_equivalence(code: &[u32], setup: Setup) {
    let (plain, probed) = compare(
        |mem| mem.load_words(A, code).unwrap(),
        A,
        A,
        &setup,
        DiversionMode::Trap,
    );
    // Stores land in the same place.
    for addr in [STACK_TOP - 8, STACK_TOP - 4] {
        assert_eq!(probed.load32(addr), plain.load32(addr));
    }
}

#[test]
fn test_arm_store_multiple_records_site_pc() {
    let (_, probed) = compare(
        |mem| mem.load_words(A, &[0xe92d_8001, ARM_HALT]).unwrap(),
        A,
        A,
        &Setup { r0: 7, ..PLAIN },
        DiversionMode::Trap,
    );
    assert_eq!(probed.regs.sp(), STACK_TOP - 8);
    assert_eq!(probed.load32(STACK_TOP - 8), Ok(7));
    assert_eq!(probed.load32(STACK_TOP - 4), Ok(A + 8));
}

#[test]
fn test_arm_literal_load_behind_site() {
    // b A+8; .word; ldr r0, [pc, #-12]; halt
    let (_, probed) = compare(
        |mem| {
            mem.load_words(A, &[0xea00_0000, 0x1357_9bdf, 0xe51f_000c, ARM_HALT])
                .unwrap()
        },
        A,
        A + 8,
        &PLAIN,
        DiversionMode::Trap,
    );
    assert_eq!(probed.regs.regs[0], 0x1357_9bdf);
}

#[test]
fn test_arm_blx_register() {
    // blx r3; add r0, r0, #1; halt; ...; mov r0, #7; bx lr
    let load = |mem: &PagedMemory| {
        mem.load_words(A, &[0xe12f_ff33, 0xe280_0001, ARM_HALT]).unwrap();
        mem.load_words(A + 0x40, &[0xe3a0_0007, 0xe12f_ff1e]).unwrap();
    };
    let (_, probed) = compare(
        load,
        A,
        A,
        &Setup {
            r3: A + 0x40,
            ..PLAIN
        },
        DiversionMode::Trap,
    );
    assert_eq!(probed.regs.regs[0], 8);
    assert_eq!(probed.regs.lr(), A + 4);
}

#[test]
fn test_arm_literal_load_through_branch_diversion() {
    let (_, probed) = compare(
        |mem| {
            mem.load_words(A, &[0xe59f_0008, ARM_HALT, ARM_HALT, ARM_HALT, 0xfeed_face])
                .unwrap()
        },
        A,
        A,
        &PLAIN,
        DiversionMode::Branch,
    );
    assert_eq!(probed.regs.regs[0], 0xfeed_face);
}

// =============================================================================
// Thumb
// =============================================================================

#[test_case(&[0x2005, THUMB_HALT], 0, PLAIN ; "movs immediate")]
#[test_case(&[0xbf00, 0x4801, THUMB_HALT, 0xbf00, 0xf00d, 0xcafe], 2, PLAIN ; "ldr literal misaligned")]
#[test_case(&[0x4801, THUMB_HALT, 0xf00d, 0xcafe, 0xbeef, 0xdead], 0, PLAIN ; "ldr literal aligned")]
#[test_case(&[0x4478, THUMB_HALT], 0, Setup { r0: 0x10, ..PLAIN } ; "add reads pc")]
#[test_case(&[0xbf00, 0xa001, THUMB_HALT], 2, PLAIN ; "adr")]
#[test_case(&[0x448f, 0x2001, THUMB_HALT, 0xbf00, 0x2002, THUMB_HALT], 0, Setup { r1: 4, ..PLAIN } ; "add writes pc")]
#[test_case(&[0xf20f, 0x0008, THUMB_HALT], 0, PLAIN ; "adr.w")]
#[test_case(&[0xf041, 0x0001, THUMB_HALT], 0, Setup { r1: 0x40, ..PLAIN } ; "orr.w immediate")]
#[test_case(&[0xb108, 0x2101, THUMB_HALT, 0x2102, THUMB_HALT], 0, PLAIN ; "cbz taken")]
#[test_case(&[0xb108, 0x2101, THUMB_HALT, 0x2102, THUMB_HALT], 0, Setup { r0: 1, ..PLAIN } ; "cbz not taken")]
#[test_case(&[0xd001, 0x2001, THUMB_HALT, 0x2002, THUMB_HALT], 0, Setup { cpsr: CPSR_Z, ..PLAIN } ; "beq taken")]
#[test_case(&[0xd001, 0x2001, THUMB_HALT, 0x2002, THUMB_HALT], 0, PLAIN ; "beq not taken")]
#[test_case(&[0xe001, 0x2001, THUMB_HALT, 0x2002, THUMB_HALT], 0, PLAIN ; "b")]
#[test_case(&[0x4718, THUMB_HALT, 0x2007, THUMB_HALT], 0, Setup { r3: (A + 4) | 1, ..PLAIN } ; "bx register")]
fn test_thumb_equivalence(code: &[u16], site: u32, setup: Setup) {
    compare(
        |mem| mem.load_halfwords(A, code).unwrap(),
        A | 1,
        (A + site) | 1,
        &setup,
        DiversionMode::Trap,
    );
}

#[test]
fn test_thumb_literal_load_behind_site() {
    // b A+8; nop; .word; ldr.w r1, [pc, #-8]; halt
    let (_, probed) = compare(
        |mem| {
            mem.load_halfwords(A, &[0xe002, 0xbf00, 0x9bdf, 0x1357, 0xf85f, 0x1008, THUMB_HALT])
                .unwrap()
        },
        A | 1,
        (A + 8) | 1,
        &PLAIN,
        DiversionMode::Trap,
    );
    assert_eq!(probed.regs.regs[1], 0x1357_9bdf);
}

#[test]
fn test_thumb_blx_register() {
    // blx r3; adds r0, #1; halt; ...; movs r0, #7; bx lr
    let load = |mem: &PagedMemory| {
        mem.load_halfwords(A, &[0x4798, 0x3001, THUMB_HALT]).unwrap();
        mem.load_halfwords(A + 0x40, &[0x2007, 0x4770]).unwrap();
    };
    let (_, probed) = compare(
        load,
        A | 1,
        A | 1,
        &Setup {
            r3: (A + 0x40) | 1,
            ..PLAIN
        },
        DiversionMode::Trap,
    );
    assert_eq!(probed.regs.regs[0], 8);
    assert_eq!(probed.regs.lr(), (A + 2) | 1);
}

#[test]
fn test_thumb_literal_load_through_branch_diversion() {
    let (_, probed) = compare(
        |mem| {
            mem.load_halfwords(A, &[0xf8df, 0x0004, THUMB_HALT, 0xbf00, 0x5678, 0x1234])
                .unwrap()
        },
        A | 1,
        A | 1,
        &PLAIN,
        DiversionMode::Branch,
    );
    assert_eq!(probed.regs.regs[0], 0x1234_5678);
}

// =============================================================================
// IT blocks
// =============================================================================

#[test]
fn test_thumb_it_block_members_are_refused() {
    // ite eq; movs r0, #1; movs r0, #2; adds r0, #1; halt
    let mem = memory(ContextId::KERNEL);
    mem.load_halfwords(A, &[0xbf0c, 0x2001, 0x2002, 0x3001, THUMB_HALT])
        .unwrap();
    let mgr = manager(&mem);

    for site in [A + 2, A + 4] {
        let result = mgr.register(
            ProbeBuilder::new()
                .with_addr(site | 1)
                .with_entry_handler(|_| ProbeAction::Continue),
        );
        assert_eq!(
            result.unwrap_err(),
            ProbeError::DecodeUnsupported {
                addr: site,
                reason: "inside an IT block",
            }
        );
    }
    assert!(matches!(
        mgr.register(
            ProbeBuilder::new()
                .with_addr(A | 1)
                .with_entry_handler(|_| ProbeAction::Continue)
        ),
        Err(ProbeError::DecodeUnsupported { addr: A, .. })
    ));
    assert_eq!(mgr.probe_count(), 0);
    assert_eq!(mem.peek(A + 4), Some(0x02));
    assert_eq!(mem.peek(A + 5), Some(0x20));

    // The first instruction after the block is an ordinary site.
    mgr.register(
        ProbeBuilder::new()
            .with_addr((A + 6) | 1)
            .with_entry_handler(|_| ProbeAction::Continue),
    )
    .unwrap();
    assert_eq!(mgr.probe_count(), 1);
}

/// Probe `movs r0, #1; halt` at A and count entry handler calls.
fn counted_thumb_site() -> (Arc<PagedMemory>, KprobeManager, Arc<AtomicU32>) {
    let mem = memory(ContextId::KERNEL);
    mem.load_halfwords(A, &[0x2001, THUMB_HALT]).unwrap();
    let mgr = manager(&mem);
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    mgr.register(ProbeBuilder::new().with_addr(A | 1).with_entry_handler(
        move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            ProbeAction::Continue
        },
    ))
    .unwrap();
    (mem, mgr, calls)
}

fn thumb_trap(it: u8, flags: u32) -> PtRegs {
    let mut regs = PtRegs::new();
    regs.set_pc(A);
    regs.regs[13] = STACK_TOP;
    regs.cpsr = CPSR_T | flags;
    regs.set_itstate(it);
    regs
}

#[test]
fn test_last_it_instruction_with_failed_condition_is_skipped() {
    let (_mem, mgr, calls) = counted_thumb_site();
    // Last instruction of an EQ block, Z clear.
    let mut regs = thumb_trap(0x08, 0);
    assert!(mgr.handle_trap(ContextId::KERNEL, &mut regs));
    assert_eq!(regs.pc_interworking(), (A + 2) | 1);
    assert_eq!(regs.itstate(), 0);
    assert_eq!(regs.cpsr, CPSR_T);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(mgr.probe(ContextId::KERNEL, A).unwrap().hits(), 0);
}

#[test]
fn test_last_it_instruction_with_passed_condition_runs() {
    let (mem, mgr, calls) = counted_thumb_site();
    let mut regs = thumb_trap(0x08, CPSR_Z);
    assert!(mgr.handle_trap(ContextId::KERNEL, &mut regs));
    assert_eq!(regs.itstate(), 0);
    assert!(regs.is_thumb());
    assert_ne!(regs.pc(), A);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The trampoline carries on to the halt after the site.
    let mut cpu = Cpu::new(&mem, A | 1);
    cpu.regs = regs;
    cpu.run(Some(&mgr)).unwrap();
    assert_eq!(cpu.regs.regs[0], 1);
}

#[test]
fn test_failed_condition_inside_block_advances_itstate() {
    let (_mem, mgr, calls) = counted_thumb_site();
    // First instruction of ITE EQ, Z clear: skipped, the else arm comes next.
    let mut regs = thumb_trap(0x0c, 0);
    assert!(mgr.handle_trap(ContextId::KERNEL, &mut regs));
    assert_eq!(regs.pc_interworking(), (A + 2) | 1);
    assert_eq!(regs.itstate(), 0x18);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
#[should_panic(expected = "trapped inside an IT block")]
fn test_executed_site_inside_block_is_fatal() {
    let (_mem, mgr, _calls) = counted_thumb_site();
    let mut regs = thumb_trap(0x0c, CPSR_Z);
    mgr.handle_trap(ContextId::KERNEL, &mut regs);
}
