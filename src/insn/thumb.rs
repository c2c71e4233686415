//! Thumb and Thumb-2 instruction classifier.
//!
//! 16-bit instructions only reach PC through the high-register forms
//! (`ADD`, `MOV`, `CMP`, `BX`, `BLX`), the literal load and `ADR`. 32-bit
//! instructions are split on `op1 = hw1[12:11]`, `op2 = hw1[10:4]` and
//! `op = hw2[15]` as in the architecture's encoding table.

use super::branch;
use super::{
    BranchInfo, BranchKind, Cond, DecodeResult, LiteralForm, PcField, PcFields, PcRef, REG_LR,
    REG_PC, REG_SP, Reg, RegSet,
};

#[inline]
fn low(hw: u16, shift: u32) -> Reg {
    ((hw >> shift) & 7) as Reg
}

#[inline]
fn nibble(hw: u16, shift: u32) -> Reg {
    ((hw >> shift) & 0xf) as Reg
}

#[inline]
fn bit(hw: u16, n: u32) -> bool {
    hw & (1 << n) != 0
}

pub fn is_udf16(hw: u16) -> bool {
    hw & 0xff00 == 0xde00
}

pub fn is_udf32(hw1: u16, hw2: u16) -> bool {
    hw1 & 0xfff0 == 0xf7f0 && hw2 & 0xf000 == 0xa000
}

/// `IT` with a nonzero mask; `0xbfx0` are hints.
pub fn is_it(hw: u16) -> bool {
    hw & 0xff00 == 0xbf00 && hw & 0xf != 0
}

/// Instructions conditioned by an `IT`, one to four.
pub fn it_block_len(hw: u16) -> usize {
    4 - (hw & 0xf).trailing_zeros() as usize
}

/// Whether the instruction at `addr` sits inside an IT block.
///
/// `read` returns the halfword at an address, or `None` when it cannot be
/// fetched. A halfword that only looks like `IT` because it is the second half
/// of a 32-bit instruction still counts, so the answer errs towards `true`.
pub fn in_it_block(addr: u32, read: impl Fn(u32) -> Option<u16>) -> bool {
    // The IT itself and up to three 32-bit instructions can precede `addr`.
    for back in (2..=14).step_by(2) {
        let it_addr = addr.wrapping_sub(back);
        let Some(hw) = read(it_addr) else {
            continue;
        };
        if !is_it(hw) {
            continue;
        }
        let mut pos = it_addr.wrapping_add(2);
        for _ in 0..it_block_len(hw) {
            if pos == addr {
                return true;
            }
            let Some(next) = read(pos) else {
                break;
            };
            pos = pos.wrapping_add(super::thumb_insn_len(next) as u32);
        }
    }
    false
}

// =============================================================================
// 16-bit
// =============================================================================

/// Classify a 16-bit Thumb instruction.
pub fn classify16(hw: u16) -> DecodeResult {
    let cond = Cond::AL;

    if is_udf16(hw) || hw & 0xff00 == 0xbe00 {
        return DecodeResult::Undefined;
    }

    match hw >> 10 {
        // Special data processing and branch exchange
        0b010001 => return classify_hi_reg(hw),
        // LDR (literal)
        0b010010 | 0b010011 => {
            let rt = low(hw, 8);
            return DecodeResult::LoadStore {
                pc: PcRef::Literal {
                    form: LiteralForm::Thumb16Load { rt },
                    offset: ((hw & 0xff) as i32) << 2,
                    writes: false,
                },
                store: false,
                regs: RegSet::EMPTY.with(rt),
                cond,
            };
        }
        // ADR
        0b101000 | 0b101001 => {
            let rd = low(hw, 8);
            return DecodeResult::DataProcessing {
                pc: PcRef::Literal {
                    form: LiteralForm::Thumb16Adr { rd },
                    offset: ((hw & 0xff) as i32) << 2,
                    writes: false,
                },
                regs: RegSet::EMPTY.with(rd),
                cond,
            };
        }
        _ => {}
    }

    match hw >> 12 {
        // Conditional branch and SVC
        0xd => {
            let c = ((hw >> 8) & 0xf) as u8;
            if c == 0xf {
                return DecodeResult::System {
                    regs: RegSet::EMPTY,
                    cond,
                };
            }
            DecodeResult::Branch(BranchInfo {
                kind: BranchKind::Conditional,
                cond: Cond(c),
                field: (hw & 0xff) as u32,
                displacement: branch::thumb_b_t1_displacement(hw),
            })
        }
        0xe => DecodeResult::Branch(BranchInfo {
            kind: BranchKind::Unconditional,
            cond,
            field: (hw & 0x7ff) as u32,
            displacement: branch::thumb_b_t2_displacement(hw),
        }),
        0xb => classify_misc16(hw),
        // LDM / STM
        0xc => {
            let rn = low(hw, 8);
            let list = RegSet(hw & 0xff);
            let load = bit(hw, 11);
            if list.is_empty() {
                return DecodeResult::Unsupported("empty register list");
            }
            DecodeResult::LoadStoreMultiple {
                base: rn,
                list,
                load,
                writeback: !load || !list.contains(rn),
                pc_in_list: false,
                cond,
            }
        }
        // Load/store register and immediate offset, SP-relative
        0x5..=0x9 => {
            let store = match hw >> 12 {
                0x5 => (hw >> 9) & 7 <= 2,
                _ => !bit(hw, 11),
            };
            let mut regs = RegSet::of(&[low(hw, 0), low(hw, 3), low(hw, 6)]);
            if hw >> 12 == 0x9 {
                regs = RegSet::of(&[low(hw, 8), REG_SP]);
            }
            DecodeResult::LoadStore {
                pc: PcRef::None,
                store,
                regs,
                cond,
            }
        }
        // Shift, add, subtract, move, compare and the low-register data-processing block
        _ => DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet::of(&[low(hw, 0), low(hw, 3), low(hw, 6), low(hw, 8)]),
            cond,
        },
    }
}

fn classify_hi_reg(hw: u16) -> DecodeResult {
    let cond = Cond::AL;
    let op = (hw >> 8) & 3;
    let rm = nibble(hw, 3);
    let rdn = (((hw >> 7) & 1) << 3 | (hw & 7)) as Reg;

    match op {
        // BX / BLX
        0b11 => {
            let link = bit(hw, 7);
            if link && (rm == REG_PC || rm == REG_SP) {
                return DecodeResult::Unsupported("blx via pc or sp");
            }
            DecodeResult::BranchRegister { rm, link, cond }
        }
        // CMP
        0b01 => {
            if rm == REG_PC || rdn == REG_PC {
                return DecodeResult::Unsupported("compare with pc");
            }
            DecodeResult::DataProcessing {
                pc: PcRef::None,
                regs: RegSet::of(&[rm, rdn]),
                cond,
            }
        }
        // ADD (reads Rdn) / MOV
        _ => {
            let add = op == 0b00;
            let mut fields = PcFields::EMPTY;
            if rm == REG_PC {
                fields = fields.with(PcField::ThumbHiRm);
            }
            if add && rdn == REG_PC {
                fields = fields.with(PcField::ThumbHiRdn);
            }
            let writes = rdn == REG_PC;
            let pc = if fields.is_empty() && !writes {
                PcRef::None
            } else {
                PcRef::Fields { fields, writes }
            };
            DecodeResult::DataProcessing {
                pc,
                regs: RegSet::of(&[rm, rdn]),
                cond,
            }
        }
    }
}

fn classify_misc16(hw: u16) -> DecodeResult {
    let cond = Cond::AL;

    // CBZ / CBNZ
    if hw & 0xf500 == 0xb100 {
        return DecodeResult::Branch(BranchInfo {
            kind: BranchKind::CompareZero {
                rn: low(hw, 0),
                nonzero: bit(hw, 11),
            },
            cond,
            field: ((hw >> 3) & 0x7f) as u32,
            displacement: branch::thumb_cbz_displacement(hw),
        });
    }

    // IT and hints
    if hw & 0xff00 == 0xbf00 {
        if hw & 0xf != 0 {
            return DecodeResult::Unsupported("it block");
        }
        return DecodeResult::System {
            regs: RegSet::EMPTY,
            cond,
        };
    }

    // PUSH
    if hw & 0xfe00 == 0xb400 {
        let mut list = RegSet(hw & 0xff);
        if bit(hw, 8) {
            list = list.with(REG_LR);
        }
        return DecodeResult::LoadStoreMultiple {
            base: REG_SP,
            list,
            load: false,
            writeback: true,
            pc_in_list: false,
            cond,
        };
    }

    // POP
    if hw & 0xfe00 == 0xbc00 {
        if bit(hw, 8) {
            return DecodeResult::Unsupported("register list loads pc");
        }
        return DecodeResult::LoadStoreMultiple {
            base: REG_SP,
            list: RegSet(hw & 0xff),
            load: true,
            writeback: true,
            pc_in_list: false,
            cond,
        };
    }

    // SETEND / CPS
    if hw & 0xffe0 == 0xb640 || hw & 0xffe8 == 0xb660 {
        return DecodeResult::System {
            regs: RegSet::EMPTY,
            cond,
        };
    }

    // ADD/SUB SP, extend, reverse
    DecodeResult::DataProcessing {
        pc: PcRef::None,
        regs: RegSet::of(&[low(hw, 0), low(hw, 3), REG_SP]),
        cond,
    }
}

// =============================================================================
// 32-bit
// =============================================================================

/// Classify a 32-bit Thumb-2 instruction given as its two half-words.
pub fn classify32(hw1: u16, hw2: u16) -> DecodeResult {
    if is_udf32(hw1, hw2) {
        return DecodeResult::Undefined;
    }

    let op1 = (hw1 >> 11) & 3;
    let op2 = (hw1 >> 4) & 0x7f;
    let op = hw2 >> 15;

    match op1 {
        0b01 => {
            if op2 & 0b1100100 == 0b0000000 {
                classify_ldm_stm(hw1, hw2)
            } else if op2 & 0b1100100 == 0b0000100 {
                classify_dual_exclusive(hw1, hw2)
            } else if op2 & 0b1100000 == 0b0100000 {
                classify_dp_register(hw1, hw2, true)
            } else {
                classify_coprocessor(hw1, hw2)
            }
        }
        0b10 => {
            if op == 1 {
                classify_branch_misc(hw1, hw2)
            } else if !bit(hw1, 9) {
                classify_dp_modified_immediate(hw1, hw2)
            } else {
                classify_plain_immediate(hw1, hw2)
            }
        }
        _ => {
            if op2 & 0b1110001 == 0b0000000 {
                classify_store_single(hw1, hw2)
            } else if op2 & 0b1100001 == 0b0000001 {
                classify_load_single(hw1, hw2, (op2 >> 1) & 3)
            } else if op2 & 0b1110000 == 0b0100000 {
                classify_dp_register(hw1, hw2, false)
            } else if op2 & 0b1110001 == 0b0010000 {
                classify_simd_element(hw1, hw2)
            } else if op2 & 0b1111000 == 0b0111000 {
                // Long multiply: RdLo in bits 15:12, RdHi in 11:8. SDIV and UDIV
                // (op1 = 001 / 011) keep 1111 in the RdLo field and write bits 11:8.
                let divide = (hw1 >> 4) & 0b101 == 0b001;
                let regs = if divide {
                    RegSet::of(&[nibble(hw1, 0), nibble(hw2, 8), nibble(hw2, 0)])
                } else {
                    RegSet::of(&[nibble(hw1, 0), nibble(hw2, 12), nibble(hw2, 8), nibble(hw2, 0)])
                };
                if regs.contains(REG_PC) {
                    return DecodeResult::Unsupported("long multiply with pc");
                }
                DecodeResult::DataProcessing {
                    pc: PcRef::None,
                    regs,
                    cond: Cond::AL,
                }
            } else if op2 & 0b1110000 == 0b0110000 {
                // Ra = 1111 selects the non-accumulating forms.
                let ra = nibble(hw2, 12);
                let operands = RegSet::of(&[nibble(hw1, 0), nibble(hw2, 8), nibble(hw2, 0)]);
                if operands.contains(REG_PC) {
                    return DecodeResult::Unsupported("multiply with pc");
                }
                let regs = if ra == REG_PC { operands } else { operands.with(ra) };
                DecodeResult::DataProcessing {
                    pc: PcRef::None,
                    regs,
                    cond: Cond::AL,
                }
            } else if op2 & 0b1000000 == 0b1000000 {
                classify_coprocessor(hw1, hw2)
            } else {
                DecodeResult::Undefined
            }
        }
    }
}

fn classify_ldm_stm(hw1: u16, hw2: u16) -> DecodeResult {
    let mode = (hw1 >> 7) & 3;
    if mode == 0b00 || mode == 0b11 {
        return DecodeResult::Unsupported("exception return or state save");
    }
    let rn = nibble(hw1, 0);
    let load = bit(hw1, 4);
    let list = RegSet(hw2);
    if rn == REG_PC {
        return DecodeResult::Unsupported("pc as base register");
    }
    if list.contains(REG_PC) {
        return DecodeResult::Unsupported(if load {
            "register list loads pc"
        } else {
            "register list stores pc"
        });
    }
    if list.is_empty() {
        return DecodeResult::Unsupported("empty register list");
    }
    DecodeResult::LoadStoreMultiple {
        base: rn,
        list,
        load,
        writeback: bit(hw1, 5),
        pc_in_list: false,
        cond: Cond::AL,
    }
}

fn classify_dual_exclusive(hw1: u16, hw2: u16) -> DecodeResult {
    let cond = Cond::AL;
    let op1 = (hw1 >> 7) & 3;
    let op2 = (hw1 >> 4) & 3;
    let rn = nibble(hw1, 0);
    let rt = nibble(hw2, 12);
    let rt2 = nibble(hw2, 8);
    let load = bit(hw1, 4);

    if op1 == 0b01 && op2 == 0b01 && (hw2 >> 4) & 0xf <= 1 {
        return DecodeResult::Unsupported("table branch");
    }

    if op1 <= 1 && op2 <= 1 {
        // LDREX / STREX family; Rd lives in bits 3:0 for the stores.
        let regs = RegSet::of(&[rn, rt, nibble(hw2, 0)]);
        let regs = if op1 == 0 { regs } else { regs.with(rt2) };
        if rn == REG_PC || rt == REG_PC {
            return DecodeResult::Unsupported("exclusive access with pc");
        }
        return DecodeResult::LoadStore {
            pc: PcRef::None,
            store: !load,
            regs: RegSet(regs.0 & !(1u16 << REG_PC)),
            cond,
        };
    }

    // LDRD / STRD
    if rt == REG_PC || rt2 == REG_PC {
        return DecodeResult::Unsupported("dual transfer of pc");
    }
    let regs = RegSet::of(&[rn, rt, rt2]);
    let writeback = bit(hw1, 5);
    if rn == REG_PC {
        if !load || writeback {
            return DecodeResult::Unsupported("pc base with writeback");
        }
        let imm = ((hw2 & 0xff) as i32) << 2;
        return DecodeResult::LoadStore {
            pc: PcRef::Literal {
                form: LiteralForm::Thumb32Dual { rt, rt2 },
                offset: if bit(hw1, 7) { imm } else { -imm },
                writes: false,
            },
            store: false,
            regs: RegSet::of(&[rt, rt2]),
            cond,
        };
    }
    DecodeResult::LoadStore {
        pc: PcRef::None,
        store: !load,
        regs,
        cond,
    }
}

/// Shared PC checks for the data-processing forms. Rd = 1111 is legal only as
/// the flag-setting compare aliases (TST, TEQ, CMP, CMN) and Rn = 1111 only
/// as the MOV/MVN aliases of ORR/ORN.
fn dp_pc_check(op: u16, set_flags: bool, rn: Reg, rd: Reg) -> Option<DecodeResult> {
    let compare = set_flags && matches!(op, 0b0000 | 0b0100 | 0b1000 | 0b1101);
    let move_alias = matches!(op, 0b0010 | 0b0011);
    if rd == REG_PC && !compare {
        return Some(DecodeResult::Unsupported("data-processing writes pc"));
    }
    if rn == REG_PC && !move_alias {
        return Some(DecodeResult::Unsupported("data-processing reads pc"));
    }
    None
}

fn classify_dp_register(hw1: u16, hw2: u16, shifted: bool) -> DecodeResult {
    let rn = nibble(hw1, 0);
    let rd = nibble(hw2, 8);
    let rm = nibble(hw2, 0);
    if rm == REG_PC {
        return DecodeResult::Unsupported("data-processing reads pc");
    }
    if shifted {
        if let Some(rejected) = dp_pc_check((hw1 >> 5) & 0xf, bit(hw1, 4), rn, rd) {
            return rejected;
        }
    } else if rd == REG_PC {
        // Register-shifted moves, extends and parallel arithmetic use Rn = 1111
        // as a marker, never PC as an operand.
        return DecodeResult::Unsupported("data-processing writes pc");
    }
    DecodeResult::DataProcessing {
        pc: PcRef::None,
        regs: RegSet(RegSet::of(&[rn, rd, rm]).0 & !(1u16 << REG_PC)),
        cond: Cond::AL,
    }
}

fn classify_dp_modified_immediate(hw1: u16, hw2: u16) -> DecodeResult {
    let rn = nibble(hw1, 0);
    let rd = nibble(hw2, 8);
    if let Some(rejected) = dp_pc_check((hw1 >> 5) & 0xf, bit(hw1, 4), rn, rd) {
        return rejected;
    }
    DecodeResult::DataProcessing {
        pc: PcRef::None,
        regs: RegSet(RegSet::of(&[rn, rd]).0 & !(1u16 << REG_PC)),
        cond: Cond::AL,
    }
}

fn classify_plain_immediate(hw1: u16, hw2: u16) -> DecodeResult {
    let cond = Cond::AL;
    let op = (hw1 >> 4) & 0x1f;
    let rn = nibble(hw1, 0);
    let rd = nibble(hw2, 8);

    if rd == REG_PC {
        return DecodeResult::Unsupported("immediate form writes pc");
    }

    // ADDW / SUBW with PC base is ADR.
    if rn == REG_PC && (op == 0b00000 || op == 0b01010) {
        let imm = ((((hw1 >> 10) & 1) << 11) | (((hw2 >> 12) & 7) << 8) | (hw2 & 0xff)) as i32;
        return DecodeResult::DataProcessing {
            pc: PcRef::Literal {
                form: LiteralForm::Thumb32Adr { rd },
                offset: if op == 0 { imm } else { -imm },
                writes: false,
            },
            regs: RegSet::EMPTY.with(rd),
            cond,
        };
    }

    match op {
        // MOVW / MOVT
        0b00100 | 0b01100 => DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet::EMPTY.with(rd),
            cond,
        },
        // BFI with Rn = 1111 is BFC
        0b10110 => DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet(RegSet::of(&[rn, rd]).0 & !(1u16 << REG_PC)),
            cond,
        },
        _ if rn == REG_PC => DecodeResult::Unsupported("immediate form reads pc"),
        _ => DecodeResult::DataProcessing {
            pc: PcRef::None,
            regs: RegSet::of(&[rn, rd]),
            cond,
        },
    }
}

fn classify_branch_misc(hw1: u16, hw2: u16) -> DecodeResult {
    let cond = Cond::AL;
    let link = bit(hw2, 14);
    let t4 = bit(hw2, 12);

    match (link, t4) {
        (false, false) => {
            if (hw1 >> 7) & 7 != 0b111 {
                let c = Cond(((hw1 >> 6) & 0xf) as u8);
                return DecodeResult::Branch(BranchInfo {
                    kind: BranchKind::Conditional,
                    cond: c,
                    field: ((hw1 as u32 & 0x43f) << 16) | (hw2 as u32 & 0x2fff),
                    displacement: branch::thumb_b_t3_displacement(hw1, hw2),
                });
            }
            classify_control(hw1, hw2)
        }
        (false, true) => DecodeResult::Branch(BranchInfo {
            kind: BranchKind::Unconditional,
            cond,
            field: ((hw1 as u32 & 0x7ff) << 16) | (hw2 as u32 & 0x2fff),
            displacement: branch::thumb_b_t4_displacement(hw1, hw2),
        }),
        (true, false) => {
            if hw2 & 1 != 0 {
                return DecodeResult::Undefined;
            }
            DecodeResult::Branch(BranchInfo {
                kind: BranchKind::LinkExchange,
                cond,
                field: ((hw1 as u32 & 0x7ff) << 16) | (hw2 as u32 & 0x2fff),
                displacement: branch::thumb_blx_displacement(hw1, hw2),
            })
        }
        (true, true) => DecodeResult::Branch(BranchInfo {
            kind: BranchKind::Link,
            cond,
            field: ((hw1 as u32 & 0x7ff) << 16) | (hw2 as u32 & 0x2fff),
            displacement: branch::thumb_b_t4_displacement(hw1, hw2),
        }),
    }
}

fn classify_control(hw1: u16, hw2: u16) -> DecodeResult {
    let cond = Cond::AL;
    let op = (hw1 >> 4) & 0x7f;
    match op {
        // MSR
        0b0111000 | 0b0111001 => {
            let rn = nibble(hw1, 0);
            if rn == REG_PC {
                return DecodeResult::Unsupported("status register move with pc");
            }
            DecodeResult::System {
                regs: RegSet::EMPTY.with(rn),
                cond,
            }
        }
        // Hints, CPS, barriers, CLREX
        0b0111010 | 0b0111011 => DecodeResult::System {
            regs: RegSet::EMPTY,
            cond,
        },
        0b0111100 => DecodeResult::Unsupported("bxj"),
        0b0111101 => DecodeResult::Unsupported("exception return"),
        // MRS
        0b0111110 | 0b0111111 => {
            let rd = nibble(hw2, 8);
            if rd == REG_PC {
                return DecodeResult::Unsupported("status register move with pc");
            }
            DecodeResult::System {
                regs: RegSet::EMPTY.with(rd),
                cond,
            }
        }
        0b1111111 => DecodeResult::Unsupported("secure monitor call"),
        0b1111110 => DecodeResult::Unsupported("hypervisor call"),
        _ => DecodeResult::Undefined,
    }
}

fn classify_store_single(hw1: u16, hw2: u16) -> DecodeResult {
    let rn = nibble(hw1, 0);
    let rt = nibble(hw2, 12);
    if rn == REG_PC || rt == REG_PC {
        return DecodeResult::Unsupported("store with pc");
    }
    let mut regs = RegSet::of(&[rn, rt]);
    // Register-offset form: bit 7 clear and hw2[11:6] == 0.
    if !bit(hw1, 7) && hw2 & 0x0fc0 == 0 {
        let rm = nibble(hw2, 0);
        if rm == REG_PC {
            return DecodeResult::Unsupported("pc as offset register");
        }
        regs = regs.with(rm);
    }
    DecodeResult::LoadStore {
        pc: PcRef::None,
        store: true,
        regs,
        cond: Cond::AL,
    }
}

/// `size` is hw1[6:5]: 0 byte, 1 halfword, 2 word.
fn classify_load_single(hw1: u16, hw2: u16, size: u16) -> DecodeResult {
    let cond = Cond::AL;
    let rn = nibble(hw1, 0);
    let rt = nibble(hw2, 12);

    if size == 3 {
        return DecodeResult::Undefined;
    }

    // Byte and halfword loads into PC are preload hints; they have no
    // architectural effect and run unmodified.
    if size < 2 && rt == REG_PC {
        return DecodeResult::System {
            regs: RegSet(RegSet::EMPTY.with(rn).0 & !(1u16 << REG_PC)),
            cond,
        };
    }

    if rn == REG_PC {
        let imm = (hw2 & 0xfff) as i32;
        return DecodeResult::LoadStore {
            pc: PcRef::Literal {
                form: LiteralForm::Thumb32Load { rt },
                offset: if bit(hw1, 7) { imm } else { -imm },
                writes: rt == REG_PC,
            },
            store: false,
            regs: RegSet(RegSet::EMPTY.with(rt).0 & !(1u16 << REG_PC)),
            cond,
        };
    }

    let mut regs = RegSet::of(&[rn, rt]);
    if !bit(hw1, 7) && hw2 & 0x0fc0 == 0 {
        let rm = nibble(hw2, 0);
        if rm == REG_PC {
            return DecodeResult::Unsupported("pc as offset register");
        }
        regs = regs.with(rm);
    }
    let pc = if rt == REG_PC {
        PcRef::Fields {
            fields: PcFields::EMPTY,
            writes: true,
        }
    } else {
        PcRef::None
    };
    DecodeResult::LoadStore {
        pc,
        store: false,
        regs: RegSet(regs.0 & !(1u16 << REG_PC)),
        cond,
    }
}

/// Advanced SIMD element or structure load/store (`VLDn` / `VSTn`).
fn classify_simd_element(hw1: u16, hw2: u16) -> DecodeResult {
    let rn = nibble(hw1, 0);
    let rm = nibble(hw2, 0);
    if rn == REG_PC {
        return DecodeResult::Unsupported("pc as base register");
    }
    // Rm = 1101 and 1111 select the writeback-only and plain forms.
    let regs = if rm == REG_SP || rm == REG_PC {
        RegSet::EMPTY.with(rn)
    } else {
        RegSet::of(&[rn, rm])
    };
    DecodeResult::Coprocessor {
        pc: PcRef::None,
        regs,
        cond: Cond::AL,
    }
}

fn classify_coprocessor(hw1: u16, hw2: u16) -> DecodeResult {
    let cond = Cond::AL;
    let rn = nibble(hw1, 0);
    let rt = nibble(hw2, 12);

    // MCRR / MRRC
    if hw1 & 0xefe0 == 0xec40 {
        if rn == REG_PC || rt == REG_PC {
            return DecodeResult::Unsupported("co-processor transfer with pc");
        }
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::of(&[rn, rt]),
            cond,
        };
    }
    // LDC / STC
    if hw1 & 0xee00 == 0xec00 {
        if rn == REG_PC {
            return DecodeResult::Unsupported("co-processor literal");
        }
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::EMPTY.with(rn),
            cond,
        };
    }
    // MCR / MRC
    if hw1 & 0xef00 == 0xee00 && bit(hw2, 4) {
        if rt == REG_PC {
            if !bit(hw1, 4) {
                return DecodeResult::Unsupported("mcr from pc");
            }
            return DecodeResult::Coprocessor {
                pc: PcRef::None,
                regs: RegSet::EMPTY,
                cond,
            };
        }
        return DecodeResult::Coprocessor {
            pc: PcRef::None,
            regs: RegSet::EMPTY.with(rt),
            cond,
        };
    }
    // CDP and the Advanced SIMD / VFP data-processing space
    DecodeResult::Coprocessor {
        pc: PcRef::None,
        regs: RegSet::EMPTY,
        cond,
    }
}
