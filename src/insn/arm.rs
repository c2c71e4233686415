//! A32 instruction classifier.
//!
//! Decoding follows the top-level encoding table of the ARMv7-A architecture
//! (bits 27:25 and bit 4), checked in this order:
//!
//! 1. permanently undefined and breakpoint encodings, then the unconditional space
//! 2. the branch family (B, BL, BX, BLX)
//! 3. co-processor instructions and SVC
//! 4. data-processing, multiply, misc and load/store forms
//! 5. load/store multiple

use super::branch;
use super::{
    BranchInfo, BranchKind, Cond, DecodeResult, PcField, PcFields, PcRef, REG_LR, REG_PC, REG_SP,
    Reg, RegSet,
};

#[inline]
fn reg(word: u32, shift: u32) -> Reg {
    ((word >> shift) & 0xf) as Reg
}

#[inline]
fn bit(word: u32, n: u32) -> bool {
    word & (1 << n) != 0
}

/// UDF, including the engine's own breakpoint encodings.
pub fn is_udf(word: u32) -> bool {
    word & 0x0ff0_00f0 == 0x07f0_00f0
}

pub fn is_bkpt(word: u32) -> bool {
    word & 0x0ff0_00f0 == 0x0120_0070
}

/// Classify an A32 instruction word.
pub fn classify(word: u32) -> DecodeResult {
    let cond = Cond::of_arm(word);

    if is_udf(word) || is_bkpt(word) {
        return DecodeResult::Undefined;
    }
    if cond.0 == 0xf {
        return classify_unconditional(word);
    }

    if let Some(result) = classify_branch(word, cond) {
        return result;
    }

    match (word >> 25) & 7 {
        0b110 | 0b111 => classify_coprocessor(word, cond),
        0b000 => classify_dp_misc(word, cond),
        0b001 => classify_dp_immediate(word, cond),
        0b010 | 0b011 => classify_load_store(word, cond),
        _ => classify_load_store_multiple(word, cond),
    }
}

fn classify_unconditional(word: u32) -> DecodeResult {
    let cond = Cond::AL;
    match (word >> 25) & 7 {
        // BLX immediate
        0b101 => DecodeResult::Branch(BranchInfo {
            kind: BranchKind::LinkExchange,
            cond,
            field: word & 0x01ff_ffff,
            displacement: branch::arm_blx_displacement(word),
        }),
        0b010 | 0b011 => {
            // CLREX, DSB, DMB, ISB
            if word & 0xffff_ff00 == 0xf57f_f000 {
                return DecodeResult::System {
                    regs: RegSet::EMPTY,
                    cond,
                };
            }
            // PLI / PLD / PLDW: 1111 01x1 x x01 ...
            if word & 0x0110_0000 == 0x0110_0000 || word & 0x0170_0000 == 0x0050_0000 {
                let rn = reg(word, 16);
                let register_form = bit(word, 25);
                let mut regs = RegSet::EMPTY.with(rn);
                if register_form {
                    if bit(word, 4) {
                        return DecodeResult::Undefined;
                    }
                    let rm = reg(word, 0);
                    if rm == REG_PC {
                        return DecodeResult::Unsupported("preload with pc offset register");
                    }
                    regs = regs.with(rm);
                }
                let pc = if rn == REG_PC {
                    PcRef::field(PcField::ArmRn)
                } else {
                    PcRef::None
                };
                return DecodeResult::LoadStore {
                    pc,
                    store: false,
                    regs,
                    cond,
                };
            }
            DecodeResult::Undefined
        }
        // SRS / RFE
        0b100 => DecodeResult::Unsupported("exception return or state save"),
        0b110 | 0b111 => {
            if word & 0x0f00_0000 == 0x0f00_0000 {
                return DecodeResult::Undefined;
            }
            classify_coprocessor(word, cond)
        }
        _ => {
            // CPS / SETEND and the rest of the memory-hint space
            if word & 0x0ff0_0000 == 0x0100_0000 {
                return DecodeResult::Unsupported("processor state change");
            }
            DecodeResult::Undefined
        }
    }
}

fn classify_branch(word: u32, cond: Cond) -> Option<DecodeResult> {
    if (word >> 25) & 7 == 0b101 {
        let link = bit(word, 24);
        let kind = if link {
            BranchKind::Link
        } else if cond.is_always() {
            BranchKind::Unconditional
        } else {
            BranchKind::Conditional
        };
        return Some(DecodeResult::Branch(BranchInfo {
            kind,
            cond,
            field: word & 0x00ff_ffff,
            displacement: branch::arm_b_displacement(word),
        }));
    }

    match word & 0x0fff_fff0 {
        // BX
        0x012f_ff10 => Some(DecodeResult::BranchRegister {
            rm: reg(word, 0),
            link: false,
            cond,
        }),
        // BXJ
        0x012f_ff20 => Some(DecodeResult::Unsupported("bxj")),
        // BLX register
        0x012f_ff30 => {
            let rm = reg(word, 0);
            if rm == REG_PC || rm == REG_SP {
                return Some(DecodeResult::Unsupported("blx via pc or sp"));
            }
            Some(DecodeResult::BranchRegister {
                rm,
                link: true,
                cond,
            })
        }
        _ => None,
    }
}

fn classify_coprocessor(word: u32, cond: Cond) -> DecodeResult {
    // SVC
    if word & 0x0f00_0000 == 0x0f00_0000 {
        return DecodeResult::System {
            regs: RegSet::EMPTY,
            cond,
        };
    }

    // MCRR / MRRC
    if word & 0x0fe0_0000 == 0x0c40_0000 {
        let rt = reg(word, 12);
        let rt2 = reg(word, 16);
        if rt == REG_PC || rt2 == REG_PC {
            return DecodeResult::Unsupported("co-processor transfer with pc");
        }
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::of(&[rt, rt2]),
            cond,
        };
    }

    // LDC / STC
    if (word >> 25) & 7 == 0b110 {
        let rn = reg(word, 16);
        let writeback = bit(word, 21) || !bit(word, 24);
        let pc = if rn == REG_PC {
            if writeback {
                return DecodeResult::Unsupported("co-processor literal with writeback");
            }
            PcRef::field(PcField::ArmRn)
        } else {
            PcRef::None
        };
        return DecodeResult::Coprocessor {
            pc,
            regs: RegSet::EMPTY.with(rn),
            cond,
        };
    }

    // CDP
    if !bit(word, 4) {
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::EMPTY,
            cond,
        };
    }

    // MCR / MRC. MRC with Rt == PC moves flags into APSR and does not branch.
    let rt = reg(word, 12);
    let to_arm = bit(word, 20);
    if rt == REG_PC {
        if !to_arm {
            return DecodeResult::Unsupported("mcr from pc");
        }
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::EMPTY,
            cond,
        };
    }
    DecodeResult::Coprocessor {
        pc: PcRef::None,
        regs: RegSet::EMPTY.with(rt),
        cond,
    }
}

/// Data-processing with Rd/Rn/Rm/Rs fields, shared by the register and immediate forms.
fn data_processing(word: u32, cond: Cond) -> DecodeResult {
    let opcode = (word >> 21) & 0xf;
    let set_flags = bit(word, 20);
    let immediate = bit(word, 25);
    let shift_by_reg = !immediate && bit(word, 4);
    let rn = reg(word, 16);
    let rd = reg(word, 12);

    let is_compare = (0x8..=0xb).contains(&opcode);
    let uses_rn = opcode != 0xd && opcode != 0xf;

    let mut regs = RegSet::EMPTY;
    if uses_rn {
        regs = regs.with(rn);
    }
    if !is_compare {
        regs = regs.with(rd);
    }

    let mut fields = PcFields::EMPTY;
    if uses_rn && rn == REG_PC {
        fields = fields.with(PcField::ArmRn);
    }

    if !immediate {
        let rm = reg(word, 0);
        regs = regs.with(rm);
        if rm == REG_PC {
            fields = fields.with(PcField::ArmRm);
        }
        if shift_by_reg {
            let rs = reg(word, 8);
            regs = regs.with(rs);
            if rs == REG_PC || !fields.is_empty() || (!is_compare && rd == REG_PC) {
                return DecodeResult::Unsupported("register-shifted operand with pc");
            }
        }
    }

    let writes = !is_compare && rd == REG_PC;
    if writes && set_flags {
        return DecodeResult::Unsupported("exception return");
    }

    let pc = if fields.is_empty() && !writes {
        PcRef::None
    } else {
        PcRef::Fields { fields, writes }
    };
    DecodeResult::DataProcessing { pc, regs, cond }
}

fn classify_dp_immediate(word: u32, cond: Cond) -> DecodeResult {
    // MOVW / MOVT
    if word & 0x0fb0_0000 == 0x0300_0000 {
        let rd = reg(word, 12);
        if rd == REG_PC {
            return DecodeResult::Unsupported("movw/movt to pc");
        }
        return DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet::EMPTY.with(rd),
            cond,
        };
    }
    // MSR immediate and hints
    if word & 0x0fb0_0000 == 0x0320_0000 {
        return DecodeResult::System {
            regs: RegSet::EMPTY,
            cond,
        };
    }
    data_processing(word, cond)
}

fn fields_without_pc(regs: &[Reg], cond: Cond, reason: &'static str) -> DecodeResult {
    let set = RegSet::of(regs);
    if set.contains(REG_PC) {
        return DecodeResult::Unsupported(reason);
    }
    DecodeResult::DataProcessing {
        pc: PcRef::None,
        regs: set,
        cond,
    }
}

fn classify_dp_misc(word: u32, cond: Cond) -> DecodeResult {
    let op1 = (word >> 20) & 0x1f;
    let op2 = (word >> 4) & 0xf;

    // Multiply and multiply-accumulate
    if op1 & 0x10 == 0 && op2 == 0b1001 {
        return fields_without_pc(
            &[reg(word, 16), reg(word, 12), reg(word, 8), reg(word, 0)],
            cond,
            "multiply with pc",
        );
    }

    // Synchronization primitives (SWP, LDREX, STREX)
    if op1 & 0x10 != 0 && op2 == 0b1001 {
        let regs = RegSet::of(&[reg(word, 16), reg(word, 12), reg(word, 0)]);
        if regs.contains(REG_PC) {
            return DecodeResult::Unsupported("exclusive access with pc");
        }
        return DecodeResult::LoadStore {
            pc: PcRef::None,
            store: !bit(word, 20),
            regs,
            cond,
        };
    }

    // Extra load/store: LDRH, STRH, LDRSB, LDRSH, LDRD, STRD
    if op2 & 0b1001 == 0b1001 {
        return classify_extra_load_store(word, cond);
    }

    // Miscellaneous and halfword multiply: op1 = 10xx0
    if op1 & 0b11001 == 0b10000 {
        return classify_misc(word, cond);
    }

    data_processing(word, cond)
}

fn classify_misc(word: u32, cond: Cond) -> DecodeResult {
    let op = (word >> 21) & 3;
    let op2 = (word >> 4) & 0xf;

    // Halfword multiply
    if op2 & 0b1001 == 0b1000 {
        return fields_without_pc(
            &[reg(word, 16), reg(word, 12), reg(word, 8), reg(word, 0)],
            cond,
            "multiply with pc",
        );
    }

    match op2 & 7 {
        // MRS / MSR register
        0 => {
            let r = if op & 1 == 0 { reg(word, 12) } else { reg(word, 0) };
            if r == REG_PC {
                return DecodeResult::Unsupported("status register move with pc");
            }
            DecodeResult::System {
                regs: RegSet::EMPTY.with(r),
                cond,
            }
        }
        // CLZ
        1 if op == 3 => fields_without_pc(&[reg(word, 12), reg(word, 0)], cond, "clz with pc"),
        // QADD, QSUB, QDADD, QDSUB
        5 => fields_without_pc(
            &[reg(word, 16), reg(word, 12), reg(word, 0)],
            cond,
            "saturating op with pc",
        ),
        6 if op == 3 => DecodeResult::Unsupported("exception return"),
        7 if op == 3 => DecodeResult::Unsupported("secure monitor call"),
        7 if op == 2 => DecodeResult::Unsupported("hypervisor call"),
        _ => DecodeResult::Undefined,
    }
}

fn classify_extra_load_store(word: u32, cond: Cond) -> DecodeResult {
    let op2 = (word >> 5) & 3;
    let load = bit(word, 20);
    let immediate = bit(word, 22);
    let pre = bit(word, 24);
    let writeback = bit(word, 21) || !pre;
    let rn = reg(word, 16);
    let rt = reg(word, 12);
    let dual = !load && op2 >= 2;
    let store = (!load && op2 == 1) || (!load && op2 == 3);

    let mut regs = RegSet::EMPTY.with(rn).with(rt);
    if dual {
        if rt & 1 != 0 || rt == REG_LR {
            return DecodeResult::Unsupported("unpredictable register pair");
        }
        regs = regs.with(rt + 1);
    }
    if rt == REG_PC {
        return DecodeResult::Unsupported("halfword or dual transfer of pc");
    }
    if !immediate {
        let rm = reg(word, 0);
        if rm == REG_PC {
            return DecodeResult::Unsupported("pc as offset register");
        }
        regs = regs.with(rm);
    }

    let pc = if rn == REG_PC {
        if writeback {
            return DecodeResult::Unsupported("pc base with writeback");
        }
        PcRef::field(PcField::ArmRn)
    } else {
        PcRef::None
    };
    DecodeResult::LoadStore {
        pc,
        store,
        regs,
        cond,
    }
}

fn classify_load_store(word: u32, cond: Cond) -> DecodeResult {
    let register_form = bit(word, 25);

    // Media instructions (includes the UDF space already filtered out).
    // Several forms use 1111 as a "no register" marker, so only Rd is checked.
    if register_form && bit(word, 4) {
        if reg(word, 12) == REG_PC {
            return DecodeResult::Unsupported("media instruction with pc");
        }
        let regs = RegSet::of(&[reg(word, 16), reg(word, 12), reg(word, 8), reg(word, 0)]);
        return DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet(regs.0 & !(1u16 << REG_PC)),
            cond,
        };
    }

    let pre = bit(word, 24);
    let byte = bit(word, 22);
    let load = bit(word, 20);
    let writeback = bit(word, 21) || !pre;
    let unprivileged = !pre && bit(word, 21);
    let rn = reg(word, 16);
    let rt = reg(word, 12);

    let mut regs = RegSet::EMPTY.with(rn).with(rt);
    if register_form {
        let rm = reg(word, 0);
        if rm == REG_PC {
            return DecodeResult::Unsupported("pc as offset register");
        }
        regs = regs.with(rm);
    }
    if unprivileged && regs.contains(REG_PC) {
        return DecodeResult::Unsupported("unprivileged transfer with pc");
    }

    let mut fields = PcFields::EMPTY;
    let mut writes = false;
    if rn == REG_PC {
        if writeback {
            return DecodeResult::Unsupported("pc base with writeback");
        }
        fields = fields.with(PcField::ArmRn);
    }
    if rt == REG_PC {
        if byte {
            return DecodeResult::Unsupported("byte transfer of pc");
        }
        if load {
            writes = true;
        } else {
            fields = fields.with(PcField::ArmRd);
        }
    }

    let pc = if fields.is_empty() && !writes {
        PcRef::None
    } else {
        PcRef::Fields { fields, writes }
    };
    DecodeResult::LoadStore {
        pc,
        store: !load,
        regs,
        cond,
    }
}

fn classify_load_store_multiple(word: u32, cond: Cond) -> DecodeResult {
    let rn = reg(word, 16);
    let list = RegSet((word & 0xffff) as u16);
    let load = bit(word, 20);
    let writeback = bit(word, 21);

    if bit(word, 22) {
        return DecodeResult::Unsupported("user-bank or exception-return transfer");
    }
    if rn == REG_PC {
        return DecodeResult::Unsupported("pc as base register");
    }
    if list.is_empty() {
        return DecodeResult::Unsupported("empty register list");
    }
    if load && list.contains(REG_PC) {
        return DecodeResult::Unsupported("register list loads pc");
    }

    DecodeResult::LoadStoreMultiple {
        base: rn,
        list,
        load,
        writeback,
        pc_in_list: list.contains(REG_PC),
        cond,
    }
}
