//! Shared test fixtures.
//!
//! `Cpu` is a small A32/Thumb interpreter over `PagedMemory`. It covers the
//! instructions used by the test programs and by every trampoline template,
//! and hands undefined-instruction traps to a `KprobeManager` the way an
//! exception vector would.

#![allow(dead_code)]

use std::sync::Arc;

use axkprobe::access::{self, PagedMemory, perm};
use axkprobe::insn::{Cond, arm, thumb, thumb_insn_len};
use axkprobe::regs::{CPSR_C, CPSR_N, CPSR_V, CPSR_Z, PtRegs};
use axkprobe::{ContextId, KprobeManager};

// =============================================================================
// Memory layout
// =============================================================================

pub const CODE: u32 = 0x0001_0000;
pub const CODE_LEN: usize = 0x4000;
pub const STACK_BASE: u32 = 0x0007_0000;
pub const STACK_TOP: u32 = 0x0008_0000;
pub const DATA: u32 = 0x0009_0000;
/// Trampoline arena, within branch range of `CODE`.
pub const ARENA: u32 = 0x0010_0000;
pub const ARENA_PAGES: usize = 16;

/// Stops the interpreter (A32). Not an engine breakpoint.
pub const ARM_HALT: u32 = 0xe7fd_eafd;
/// Stops the interpreter (Thumb).
pub const THUMB_HALT: u16 = 0xdeff;

const STEP_LIMIT: usize = 100_000;

/// Address space with code, stack and data mapped and a nearby trampoline arena.
pub fn memory(id: ContextId) -> Arc<PagedMemory> {
    let mem = PagedMemory::with_exec_arena(id, ARENA, ARENA_PAGES);
    mem.map(CODE, CODE_LEN, perm::RX);
    mem.map(STACK_BASE, (STACK_TOP - STACK_BASE) as usize, perm::RW);
    mem.map(DATA, 0x1000, perm::RW);
    Arc::new(mem)
}

/// Manager with `mem` attached.
pub fn manager(mem: &Arc<PagedMemory>) -> KprobeManager {
    let mgr = KprobeManager::new();
    mgr.attach_space(mem.clone()).unwrap();
    mgr
}

pub fn read_u32(mem: &PagedMemory, addr: u32) -> u32 {
    access::read_u32(mem, addr).unwrap()
}

// =============================================================================
// Interpreter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fetch or data access outside mapped memory.
    Unmapped(u32),
    /// Undefined instruction nobody claimed, or an encoding the interpreter lacks.
    Undefined(u32),
    /// A halt instruction was reached before the requested stop address.
    Halted(u32),
    StepLimit,
}

pub struct Cpu {
    pub mem: Arc<PagedMemory>,
    pub space: ContextId,
    pub regs: PtRegs,
    /// Undefined-instruction traps handed to the manager.
    pub traps: usize,
    pub steps: usize,
}

impl Cpu {
    /// Start at `entry`, an interworking address, with an empty stack.
    pub fn new(mem: &Arc<PagedMemory>, entry: u32) -> Self {
        let mut regs = PtRegs::new();
        regs.regs[13] = STACK_TOP;
        regs.branch_exchange(entry);
        Self {
            space: access::AddressSpace::id(mem.as_ref()),
            mem: mem.clone(),
            regs,
            traps: 0,
            steps: 0,
        }
    }

    /// Run to a halt instruction; returns its address.
    pub fn run(&mut self, mgr: Option<&KprobeManager>) -> Result<u32, Fault> {
        loop {
            if let Some(pc) = self.step(mgr)? {
                return Ok(pc);
            }
        }
    }

    /// Run until PC reaches `stop` (interworking bit ignored).
    pub fn run_until(&mut self, mgr: Option<&KprobeManager>, stop: u32) -> Result<(), Fault> {
        while self.regs.pc() != stop & !1 {
            if let Some(pc) = self.step(mgr)? {
                return Err(Fault::Halted(pc));
            }
        }
        Ok(())
    }

    /// Execute one instruction. Returns the PC of a halt instruction.
    pub fn step(&mut self, mgr: Option<&KprobeManager>) -> Result<Option<u32>, Fault> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(Fault::StepLimit);
        }
        let pc = self.regs.pc();
        if self.regs.is_thumb() {
            let hw1 = self.fetch16(pc)?;
            if hw1 == THUMB_HALT {
                return Ok(Some(pc));
            }
            if thumb_insn_len(hw1) == 4 {
                let hw2 = self.fetch16(pc.wrapping_add(2))?;
                if thumb::is_udf32(hw1, hw2) {
                    self.trap(mgr, pc)?;
                } else {
                    self.exec_thumb32(pc, hw1 as u32, hw2 as u32)?;
                }
            } else if thumb::is_udf16(hw1) {
                self.trap(mgr, pc)?;
            } else {
                self.exec_thumb16(pc, hw1 as u32)?;
            }
        } else {
            let word = self.fetch32(pc)?;
            if word == ARM_HALT {
                return Ok(Some(pc));
            }
            if arm::is_udf(word) {
                self.trap(mgr, pc)?;
            } else {
                self.exec_arm(pc, word)?;
            }
        }
        Ok(None)
    }

    fn trap(&mut self, mgr: Option<&KprobeManager>, pc: u32) -> Result<(), Fault> {
        let Some(mgr) = mgr else {
            return Err(Fault::Undefined(pc));
        };
        self.traps += 1;
        if mgr.handle_trap(self.space, &mut self.regs) {
            Ok(())
        } else {
            Err(Fault::Undefined(pc))
        }
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    fn fetch16(&self, addr: u32) -> Result<u16, Fault> {
        access::read_u16(self.mem.as_ref(), addr).map_err(|_| Fault::Unmapped(addr))
    }

    fn fetch32(&self, addr: u32) -> Result<u32, Fault> {
        access::read_u32(self.mem.as_ref(), addr).map_err(|_| Fault::Unmapped(addr))
    }

    pub fn load8(&self, addr: u32) -> Result<u8, Fault> {
        self.mem.peek(addr).ok_or(Fault::Unmapped(addr))
    }

    pub fn load32(&self, addr: u32) -> Result<u32, Fault> {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.load8(addr.wrapping_add(i as u32))?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn store8(&self, addr: u32, value: u8) -> Result<(), Fault> {
        if self.mem.poke(addr, value) {
            Ok(())
        } else {
            Err(Fault::Unmapped(addr))
        }
    }

    fn store32(&self, addr: u32, value: u32) -> Result<(), Fault> {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.store8(addr.wrapping_add(i as u32), b)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Registers and flags
    // -------------------------------------------------------------------------

    fn reg(&self, r: u32) -> u32 {
        self.regs.regs[r as usize]
    }

    fn set_reg(&mut self, r: u32, value: u32) {
        self.regs.regs[r as usize] = value;
    }

    /// A32 register read: PC reads as the instruction address plus 8.
    fn arm_reg(&self, r: u32, pc: u32) -> u32 {
        if r == 15 { pc.wrapping_add(8) } else { self.reg(r) }
    }

    /// Thumb register read: PC reads as the instruction address plus 4.
    fn thumb_reg(&self, r: u32, pc: u32) -> u32 {
        if r == 15 { pc.wrapping_add(4) } else { self.reg(r) }
    }

    fn carry(&self) -> bool {
        self.regs.cpsr & CPSR_C != 0
    }

    fn set_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.regs.cpsr |= flag;
        } else {
            self.regs.cpsr &= !flag;
        }
    }

    fn set_flags(&mut self, result: u32, carry: bool, overflow: Option<bool>) {
        self.set_flag(CPSR_N, result >> 31 != 0);
        self.set_flag(CPSR_Z, result == 0);
        self.set_flag(CPSR_C, carry);
        if let Some(v) = overflow {
            self.set_flag(CPSR_V, v);
        }
    }

    // -------------------------------------------------------------------------
    // A32
    // -------------------------------------------------------------------------

    fn exec_arm(&mut self, pc: u32, w: u32) -> Result<(), Fault> {
        let next = pc.wrapping_add(4);
        let cond = w >> 28;
        if cond == 0xf {
            if (w >> 25) & 7 == 0b101 {
                // blx imm
                let disp = sext((w & 0x00ff_ffff) << 2 | ((w >> 24) & 1) << 1, 26);
                self.regs.set_lr(next);
                self.regs
                    .branch_exchange(pc.wrapping_add(8).wrapping_add(disp as u32) | 1);
                return Ok(());
            }
            return Err(Fault::Undefined(pc));
        }

        self.regs.set_pc(next);
        if !Cond(cond as u8).passed(self.regs.cpsr) {
            return Ok(());
        }

        if w & 0x0fff_ffd0 == 0x012f_ff10 {
            // bx / blx register
            let target = self.arm_reg(w & 0xf, pc);
            if w & 0x20 != 0 {
                self.regs.set_lr(next);
            }
            self.regs.branch_exchange(target);
            return Ok(());
        }

        match (w >> 25) & 7 {
            0b101 => {
                let disp = sext((w & 0x00ff_ffff) << 2, 26);
                if w & (1 << 24) != 0 {
                    self.regs.set_lr(next);
                }
                self.regs.set_pc(pc.wrapping_add(8).wrapping_add(disp as u32));
                Ok(())
            }
            0b100 => self.arm_block(pc, w),
            0b010 => self.arm_single(pc, w, w & 0xfff),
            0b011 if w & 0x10 == 0 => {
                let rm = self.arm_reg(w & 0xf, pc);
                let (offset, _) = imm_shift(rm, (w >> 5) & 3, (w >> 7) & 0x1f, self.carry());
                self.arm_single(pc, w, offset)
            }
            0b000 | 0b001 => self.arm_data(pc, w),
            _ => Err(Fault::Undefined(pc)),
        }
    }

    fn arm_data(&mut self, pc: u32, w: u32) -> Result<(), Fault> {
        let rd = (w >> 12) & 0xf;
        let imm16 = (w >> 4) & 0xf000 | w & 0xfff;
        match w & 0x0ff0_0000 {
            0x0300_0000 => {
                self.set_reg(rd, imm16);
                return Ok(());
            }
            0x0340_0000 => {
                let low = self.reg(rd) & 0xffff;
                self.set_reg(rd, imm16 << 16 | low);
                return Ok(());
            }
            _ => {}
        }
        if w & 0x0fe0_00f0 == 0x0000_0090 {
            let product = self.reg(w & 0xf).wrapping_mul(self.reg((w >> 8) & 0xf));
            self.set_reg((w >> 16) & 0xf, product);
            return Ok(());
        }

        let imm = w & (1 << 25) != 0;
        if !imm && w & 0x90 == 0x90 {
            return Err(Fault::Undefined(pc));
        }
        let opcode = (w >> 21) & 0xf;
        let s = w & (1 << 20) != 0;
        if !s && (8..=11).contains(&opcode) {
            return Err(Fault::Undefined(pc));
        }

        let carry = self.carry();
        let (op2, shifter_carry) = if imm {
            let rot = ((w >> 8) & 0xf) * 2;
            let value = (w & 0xff).rotate_right(rot);
            (value, if rot == 0 { carry } else { value >> 31 != 0 })
        } else {
            let rm = self.arm_reg(w & 0xf, pc);
            let kind = (w >> 5) & 3;
            if w & 0x10 != 0 {
                let amount = self.reg((w >> 8) & 0xf) & 0xff;
                shift_c(rm, kind, amount, carry)
            } else {
                imm_shift(rm, kind, (w >> 7) & 0x1f, carry)
            }
        };
        let rn = self.arm_reg((w >> 16) & 0xf, pc);

        let (result, c, v) = match opcode {
            0x0 | 0x8 => (rn & op2, shifter_carry, None),
            0x1 | 0x9 => (rn ^ op2, shifter_carry, None),
            0x2 | 0xa => with_overflow(add_with_carry(rn, !op2, true)),
            0x3 => with_overflow(add_with_carry(op2, !rn, true)),
            0x4 | 0xb => with_overflow(add_with_carry(rn, op2, false)),
            0x5 => with_overflow(add_with_carry(rn, op2, carry)),
            0x6 => with_overflow(add_with_carry(rn, !op2, carry)),
            0x7 => with_overflow(add_with_carry(op2, !rn, carry)),
            0xc => (rn | op2, shifter_carry, None),
            0xd => (op2, shifter_carry, None),
            0xe => (rn & !op2, shifter_carry, None),
            _ => (!op2, shifter_carry, None),
        };

        if !(8..=11).contains(&opcode) {
            if rd == 15 {
                if s {
                    return Err(Fault::Undefined(pc));
                }
                self.regs.branch_exchange(result);
                return Ok(());
            }
            self.set_reg(rd, result);
        }
        if s {
            self.set_flags(result, c, v);
        }
        Ok(())
    }

    fn arm_single(&mut self, pc: u32, w: u32, offset: u32) -> Result<(), Fault> {
        let pre = w & (1 << 24) != 0;
        let up = w & (1 << 23) != 0;
        let byte = w & (1 << 22) != 0;
        let load = w & (1 << 20) != 0;
        let writeback = !pre || w & (1 << 21) != 0;
        let rn = (w >> 16) & 0xf;
        let rt = (w >> 12) & 0xf;

        let base = self.arm_reg(rn, pc);
        let offset_addr = if up {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if pre { offset_addr } else { base };

        if load {
            let value = if byte {
                self.load8(addr)? as u32
            } else {
                self.load32(addr)?
            };
            if writeback && rn != 15 {
                self.set_reg(rn, offset_addr);
            }
            if rt == 15 {
                self.regs.branch_exchange(value);
            } else {
                self.set_reg(rt, value);
            }
        } else {
            let value = self.arm_reg(rt, pc);
            if byte {
                self.store8(addr, value as u8)?;
            } else {
                self.store32(addr, value)?;
            }
            if writeback && rn != 15 {
                self.set_reg(rn, offset_addr);
            }
        }
        Ok(())
    }

    fn arm_block(&mut self, pc: u32, w: u32) -> Result<(), Fault> {
        if w & (1 << 22) != 0 {
            return Err(Fault::Undefined(pc));
        }
        let pre = w & (1 << 24) != 0;
        let up = w & (1 << 23) != 0;
        let writeback = w & (1 << 21) != 0;
        let load = w & (1 << 20) != 0;
        let rn = (w >> 16) & 0xf;
        let list = w & 0xffff;
        let n = list.count_ones() * 4;

        let base = self.reg(rn);
        let mut addr = match (pre, up) {
            (false, true) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(n).wrapping_add(4),
            (true, false) => base.wrapping_sub(n),
        };
        let final_base = if up {
            base.wrapping_add(n)
        } else {
            base.wrapping_sub(n)
        };

        if load {
            let mut values = Vec::new();
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                values.push((r, self.load32(addr)?));
                addr = addr.wrapping_add(4);
            }
            if writeback && list & (1 << rn) == 0 {
                self.set_reg(rn, final_base);
            }
            for (r, value) in values {
                if r == 15 {
                    self.regs.branch_exchange(value);
                } else {
                    self.set_reg(r, value);
                }
            }
        } else {
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                self.store32(addr, self.arm_reg(r, pc))?;
                addr = addr.wrapping_add(4);
            }
            if writeback {
                self.set_reg(rn, final_base);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Thumb, 16-bit
    // -------------------------------------------------------------------------

    fn exec_thumb16(&mut self, pc: u32, h: u32) -> Result<(), Fault> {
        let next = pc.wrapping_add(2);
        let literal_base = pc.wrapping_add(4) & !3;
        let lo = |shift: u32| (h >> shift) & 7;
        self.regs.set_pc(next);

        match h >> 11 {
            0b00000 => {
                // lsls rd, rm, #imm5 (movs rd, rm)
                let (r, c) = imm_shift(self.reg(lo(3)), 0, (h >> 6) & 0x1f, self.carry());
                self.set_reg(lo(0), r);
                self.set_flags(r, c, None);
            }
            0b00011 => {
                let rn = self.reg(lo(3));
                let op = if h & (1 << 10) != 0 {
                    (h >> 6) & 7
                } else {
                    self.reg(lo(6))
                };
                let (r, c, v) = if h & (1 << 9) != 0 {
                    add_with_carry(rn, !op, true)
                } else {
                    add_with_carry(rn, op, false)
                };
                self.set_reg(lo(0), r);
                self.set_flags(r, c, Some(v));
            }
            0b00100..=0b00111 => {
                let rdn = lo(8);
                let imm = h & 0xff;
                let cur = self.reg(rdn);
                match (h >> 11) & 3 {
                    0 => {
                        self.set_reg(rdn, imm);
                        let c = self.carry();
                        self.set_flags(imm, c, None);
                    }
                    1 => {
                        let (r, c, v) = add_with_carry(cur, !imm, true);
                        self.set_flags(r, c, Some(v));
                    }
                    2 => {
                        let (r, c, v) = add_with_carry(cur, imm, false);
                        self.set_reg(rdn, r);
                        self.set_flags(r, c, Some(v));
                    }
                    _ => {
                        let (r, c, v) = add_with_carry(cur, !imm, true);
                        self.set_reg(rdn, r);
                        self.set_flags(r, c, Some(v));
                    }
                }
            }
            0b01000 if h & (1 << 10) != 0 => {
                // High-register operations and branch exchange.
                let rm = (h >> 3) & 0xf;
                let rdn = (h >> 4) & 8 | h & 7;
                let rm_val = self.thumb_reg(rm, pc);
                match (h >> 8) & 3 {
                    0 => {
                        let r = self.thumb_reg(rdn, pc).wrapping_add(rm_val);
                        if rdn == 15 {
                            self.regs.set_pc(r & !1);
                        } else {
                            self.set_reg(rdn, r);
                        }
                    }
                    1 => {
                        let (r, c, v) = add_with_carry(self.thumb_reg(rdn, pc), !rm_val, true);
                        self.set_flags(r, c, Some(v));
                    }
                    2 => {
                        if rdn == 15 {
                            self.regs.set_pc(rm_val & !1);
                        } else {
                            self.set_reg(rdn, rm_val);
                        }
                    }
                    _ => {
                        if h & 0x80 != 0 {
                            self.regs.set_lr(next | 1);
                        }
                        self.regs.branch_exchange(rm_val);
                    }
                }
            }
            0b01001 => {
                let value = self.load32(literal_base.wrapping_add((h & 0xff) * 4))?;
                self.set_reg(lo(8), value);
            }
            0b01100 | 0b01101 => {
                let addr = self.reg(lo(3)).wrapping_add(((h >> 6) & 0x1f) * 4);
                if h & (1 << 11) != 0 {
                    let value = self.load32(addr)?;
                    self.set_reg(lo(0), value);
                } else {
                    self.store32(addr, self.reg(lo(0)))?;
                }
            }
            0b10100 => {
                self.set_reg(lo(8), literal_base.wrapping_add((h & 0xff) * 4));
            }
            0b10110 | 0b10111 => return self.thumb_misc(pc, h),
            0b11010 | 0b11011 => {
                let cond = (h >> 8) & 0xf;
                if cond >= 0xe {
                    return Err(Fault::Undefined(pc));
                }
                if Cond(cond as u8).passed(self.regs.cpsr) {
                    let disp = sext((h & 0xff) << 1, 9);
                    self.regs.set_pc(pc.wrapping_add(4).wrapping_add(disp as u32));
                }
            }
            0b11100 => {
                let disp = sext((h & 0x7ff) << 1, 12);
                self.regs.set_pc(pc.wrapping_add(4).wrapping_add(disp as u32));
            }
            _ => return Err(Fault::Undefined(pc)),
        }
        Ok(())
    }

    fn thumb_misc(&mut self, pc: u32, h: u32) -> Result<(), Fault> {
        let sp = self.reg(13);
        if h & 0xff00 == 0xb000 {
            let imm = (h & 0x7f) * 4;
            let sp = if h & 0x80 != 0 {
                sp.wrapping_sub(imm)
            } else {
                sp.wrapping_add(imm)
            };
            self.set_reg(13, sp);
        } else if h & 0xf500 == 0xb100 {
            // cbz / cbnz
            let nonzero = h & (1 << 11) != 0;
            let disp = ((h >> 9) & 1) << 6 | ((h >> 3) & 0x1f) << 1;
            if (self.reg(h & 7) != 0) == nonzero {
                self.regs.set_pc(pc.wrapping_add(4).wrapping_add(disp));
            }
        } else if h & 0xfe00 == 0xb400 {
            // push
            let list = h & 0xff | (h & 0x100) << 6;
            let mut addr = sp.wrapping_sub(list.count_ones() * 4);
            self.set_reg(13, addr);
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                self.store32(addr, self.reg(r))?;
                addr = addr.wrapping_add(4);
            }
        } else if h & 0xfe00 == 0xbc00 {
            // pop
            let list = h & 0xff | (h & 0x100) << 7;
            let mut addr = sp;
            let mut target = None;
            for r in (0..16).filter(|r| list & (1 << r) != 0) {
                let value = self.load32(addr)?;
                addr = addr.wrapping_add(4);
                if r == 15 {
                    target = Some(value);
                } else {
                    self.set_reg(r, value);
                }
            }
            self.set_reg(13, addr);
            if let Some(target) = target {
                self.regs.branch_exchange(target);
            }
        } else if h != 0xbf00 {
            return Err(Fault::Undefined(pc));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Thumb, 32-bit
    // -------------------------------------------------------------------------

    fn exec_thumb32(&mut self, pc: u32, h1: u32, h2: u32) -> Result<(), Fault> {
        let next = pc.wrapping_add(4);
        let literal_base = pc.wrapping_add(4) & !3;
        self.regs.set_pc(next);

        if h1 & 0xf800 == 0xf000 && h2 & 0x8000 != 0 {
            return self.thumb_branch32(pc, h1, h2);
        }

        // ldr.w rt, [pc, #±imm12]
        if h1 & 0xff7f == 0xf85f {
            let imm = h2 & 0xfff;
            let addr = if h1 & 0x80 != 0 {
                literal_base.wrapping_add(imm)
            } else {
                literal_base.wrapping_sub(imm)
            };
            let value = self.load32(addr)?;
            self.thumb_load_result(h2 >> 12, value);
            return Ok(());
        }

        let rn = h1 & 0xf;
        let rt = h2 >> 12;
        match h1 & 0xfff0 {
            // ldr.w / str.w rt, [rn, #imm12]
            0xf8c0 | 0xf8d0 => {
                let addr = self.reg(rn).wrapping_add(h2 & 0xfff);
                if h1 & 0x10 != 0 {
                    let value = self.load32(addr)?;
                    self.thumb_load_result(rt, value);
                } else {
                    self.store32(addr, self.reg(rt))?;
                }
                Ok(())
            }
            // ldr / str rt, [rn, #±imm8] with index and writeback
            0xf840 | 0xf850 if h2 & 0x0800 != 0 => {
                let pre = h2 & (1 << 10) != 0;
                let up = h2 & (1 << 9) != 0;
                let writeback = h2 & (1 << 8) != 0;
                let imm = h2 & 0xff;
                let base = self.reg(rn);
                let offset_addr = if up {
                    base.wrapping_add(imm)
                } else {
                    base.wrapping_sub(imm)
                };
                let addr = if pre { offset_addr } else { base };
                if h1 & 0x10 != 0 {
                    let value = self.load32(addr)?;
                    if writeback {
                        self.set_reg(rn, offset_addr);
                    }
                    self.thumb_load_result(rt, value);
                } else {
                    self.store32(addr, self.reg(rt))?;
                    if writeback {
                        self.set_reg(rn, offset_addr);
                    }
                }
                Ok(())
            }
            _ => self.thumb_data32(pc, h1, h2, literal_base),
        }
    }

    fn thumb_load_result(&mut self, rt: u32, value: u32) {
        if rt == 15 {
            self.regs.branch_exchange(value);
        } else {
            self.set_reg(rt, value);
        }
    }

    fn thumb_branch32(&mut self, pc: u32, h1: u32, h2: u32) -> Result<(), Fault> {
        let next = pc.wrapping_add(4);
        let s = (h1 >> 10) & 1;
        let j1 = (h2 >> 13) & 1;
        let j2 = (h2 >> 11) & 1;
        let i1 = !(j1 ^ s) & 1;
        let i2 = !(j2 ^ s) & 1;
        let t4 = |imm11: u32| {
            sext(
                s << 24 | i1 << 23 | i2 << 22 | (h1 & 0x3ff) << 12 | imm11 << 1,
                25,
            ) as u32
        };

        match h2 & 0x5000 {
            // bl
            0x5000 => {
                self.regs.set_lr(next | 1);
                self.regs.set_pc(next.wrapping_add(t4(h2 & 0x7ff)));
            }
            // blx imm
            0x4000 => {
                self.regs.set_lr(next | 1);
                let target = (next & !3).wrapping_add(t4(h2 & 0x7fe));
                self.regs.branch_exchange(target);
            }
            // b.w
            0x1000 => self.regs.set_pc(next.wrapping_add(t4(h2 & 0x7ff))),
            _ => {
                let cond = (h1 >> 6) & 0xf;
                if cond >= 0xe {
                    return Err(Fault::Undefined(pc));
                }
                if Cond(cond as u8).passed(self.regs.cpsr) {
                    let disp =
                        sext(s << 20 | j2 << 19 | j1 << 18 | (h1 & 0x3f) << 12 | (h2 & 0x7ff) << 1, 21);
                    self.regs.set_pc(next.wrapping_add(disp as u32));
                }
            }
        }
        Ok(())
    }

    fn thumb_data32(&mut self, pc: u32, h1: u32, h2: u32, literal_base: u32) -> Result<(), Fault> {
        if h2 & 0x8000 != 0 {
            return Err(Fault::Undefined(pc));
        }
        let rn = h1 & 0xf;
        let rd = (h2 >> 8) & 0xf;
        let imm12 = ((h1 >> 10) & 1) << 11 | ((h2 >> 12) & 7) << 8 | h2 & 0xff;

        match h1 & 0xfbf0 {
            // addw / subw, adr.w
            0xf200 | 0xf2a0 => {
                let base = if rn == 15 { literal_base } else { self.reg(rn) };
                let value = if h1 & 0xfbf0 == 0xf200 {
                    base.wrapping_add(imm12)
                } else {
                    base.wrapping_sub(imm12)
                };
                self.set_reg(rd, value);
                return Ok(());
            }
            _ => {}
        }
        if h1 & 0xfbe0 == 0xf040 {
            // orr.w / mov.w rd, rn, #imm
            let imm = thumb_expand_imm(imm12);
            let value = if rn == 15 { imm } else { self.reg(rn) | imm };
            self.set_reg(rd, value);
            if h1 & 0x10 != 0 {
                let c = self.carry();
                self.set_flags(value, c, None);
            }
            return Ok(());
        }
        Err(Fault::Undefined(pc))
    }
}

// =============================================================================
// Arithmetic helpers
// =============================================================================

fn sext(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let unsigned = a as u64 + b as u64 + carry_in as u64;
    let signed = a as i32 as i64 + b as i32 as i64 + carry_in as i64;
    let result = unsigned as u32;
    (result, unsigned > u32::MAX as u64, result as i32 as i64 != signed)
}

fn with_overflow((r, c, v): (u32, bool, bool)) -> (u32, bool, Option<bool>) {
    (r, c, Some(v))
}

fn shift_c(value: u32, kind: u32, amount: u32, carry: bool) -> (u32, bool) {
    if amount == 0 {
        return (value, carry);
    }
    match kind {
        0 => match amount {
            1..=31 => (value << amount, (value >> (32 - amount)) & 1 != 0),
            32 => (0, value & 1 != 0),
            _ => (0, false),
        },
        1 => match amount {
            1..=31 => (value >> amount, (value >> (amount - 1)) & 1 != 0),
            32 => (0, value >> 31 != 0),
            _ => (0, false),
        },
        2 => {
            let amount = amount.min(32);
            if amount < 32 {
                (
                    ((value as i32) >> amount) as u32,
                    (value >> (amount - 1)) & 1 != 0,
                )
            } else {
                let r = ((value as i32) >> 31) as u32;
                (r, r & 1 != 0)
            }
        }
        _ => {
            let r = value.rotate_right(amount % 32);
            (r, r >> 31 != 0)
        }
    }
}

/// Shift by an immediate amount, where 0 encodes 32 (LSR, ASR) or RRX (ROR).
fn imm_shift(value: u32, kind: u32, imm5: u32, carry: bool) -> (u32, bool) {
    match (kind, imm5) {
        (0, 0) => (value, carry),
        (1 | 2, 0) => shift_c(value, kind, 32, carry),
        (3, 0) => ((carry as u32) << 31 | value >> 1, value & 1 != 0),
        _ => shift_c(value, kind, imm5, carry),
    }
}

fn thumb_expand_imm(imm12: u32) -> u32 {
    if imm12 >> 10 == 0 {
        let b = imm12 & 0xff;
        match (imm12 >> 8) & 3 {
            0 => b,
            1 => b << 16 | b,
            2 => b << 24 | b << 8,
            _ => b.wrapping_mul(0x0101_0101),
        }
    } else {
        (0x80 | imm12 & 0x7f).rotate_right(imm12 >> 7)
    }
}
