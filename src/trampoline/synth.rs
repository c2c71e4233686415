//! Trampoline synthesis.
//!
//! Picks a template from the decode result, rewrites PC operands onto a
//! scratch register, and bakes every address the sequence needs into its
//! literal pool.

use super::template::{
    ARM_NOP, THUMB_NOP, arm_branch, arm_link, arm_link_register, arm_pc_read, arm_pc_write,
    arm_simple, arm_store_pc, arm_str_imm, thumb_addw0, thumb_branch, thumb_generic,
    thumb_ldr_imm0, thumb_link, thumb_link_register, thumb_pc_read, thumb_pc_write,
};
use super::{LinkInfo, TemplateKind, Trampoline};
use crate::error::{ProbeError, ProbeResult};
use crate::insn::{
    BranchInfo, BranchKind, Cond, DecodeResult, Insn, Isa, LiteralForm, PcField, PcFields, PcRef,
    REG_PC, REG_SP, Reg, RegSet, branch,
};

/// Highest register usable as scratch.
const MAX_SCRATCH: Reg = 12;

#[derive(Debug, Clone, Copy, Default)]
pub struct SynthOptions {
    /// Shared return trampoline; when set, call-like templates get a hijack entry.
    pub return_trampoline: Option<u32>,
}

/// How the value PC reads as is derived from the instruction address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcBias {
    /// `addr + n`.
    Plus(u32),
    /// `Align(addr + 4, 4) + offset`.
    AlignedPlus4(i32),
}

impl PcBias {
    pub fn apply(self, addr: u32) -> u32 {
        match self {
            PcBias::Plus(n) => addr.wrapping_add(n),
            PcBias::AlignedPlus4(offset) => (addr.wrapping_add(4) & !3).wrapping_add(offset as u32),
        }
    }
}

/// PC value table, per instruction set and kind of PC reference.
pub fn pc_bias(isa: Isa, pc: &PcRef) -> PcBias {
    match (isa, pc) {
        (Isa::Arm, _) => PcBias::Plus(8),
        (Isa::Thumb, PcRef::Literal { offset, .. }) => PcBias::AlignedPlus4(*offset),
        (Isa::Thumb, _) => PcBias::Plus(4),
    }
}

/// Build the trampoline for the instruction `insn` located at `addr`.
///
/// `addr` is the instruction address with the Thumb bit clear.
pub fn synthesize(
    addr: u32,
    insn: &Insn,
    decoded: &DecodeResult,
    options: &SynthOptions,
) -> ProbeResult<Trampoline> {
    let cont = continuation(addr, insn);

    match *decoded {
        DecodeResult::Undefined => Err(ProbeError::DecodeUnsupported {
            addr,
            reason: "undefined instruction",
        }),
        DecodeResult::Unsupported(reason) => Err(ProbeError::DecodeUnsupported { addr, reason }),
        DecodeResult::Branch(info) => synth_branch(addr, insn, &info, cont, options),
        DecodeResult::BranchRegister { rm, link, cond } => {
            if rm == REG_PC {
                return synth_bx_pc(addr, insn, cond, cont);
            }
            if link {
                return Ok(match insn.isa {
                    Isa::Arm => arm_link_reg(cond, rm, cont, cont, options),
                    Isa::Thumb => thumb_link_reg(rm, cont, options),
                });
            }
            Ok(verbatim(insn, cont))
        }
        DecodeResult::LoadStoreMultiple {
            base,
            list,
            writeback,
            pc_in_list: true,
            cond,
            ..
        } => arm_store_pc(addr, insn.raw, base, list, writeback, cond, cont),
        _ => {
            let pc = decoded.pc_ref();
            match pc {
                PcRef::None => Ok(verbatim(insn, cont)),
                // Only writes PC: the copy jumps exactly where the original would.
                PcRef::Fields { fields, writes: true } if fields.is_empty() => {
                    Ok(verbatim(insn, cont))
                }
                _ => {
                    let regs = decoded.regs();
                    if regs.contains(REG_SP) {
                        return Err(ProbeError::DecodeUnsupported {
                            addr,
                            reason: "pc combined with sp",
                        });
                    }
                    let scratch = regs
                        .first_free(MAX_SCRATCH)
                        .ok_or(ProbeError::NoFreeRegister { addr })?;
                    let pc_value = pc_bias(insn.isa, &pc).apply(addr);
                    match insn.isa {
                        Isa::Arm => Ok(arm_pc_relative(
                            insn.raw,
                            decoded.cond(),
                            &pc,
                            scratch,
                            pc_value,
                            cont,
                        )),
                        Isa::Thumb => Ok(thumb_pc_relative(insn, &pc, scratch, pc_value, cont)),
                    }
                }
            }
        }
    }
}

/// Interworking address of the instruction after the probed one.
fn continuation(addr: u32, insn: &Insn) -> u32 {
    let next = addr.wrapping_add(insn.len as u32);
    match insn.isa {
        Isa::Arm => next,
        Isa::Thumb => next | 1,
    }
}

fn verbatim(insn: &Insn, cont: u32) -> Trampoline {
    match insn.isa {
        Isa::Arm => {
            let mut t = Trampoline::from_words(TemplateKind::Simple, &arm_simple::WORDS);
            t.set_word(arm_simple::INSN, insn.raw);
            t.set_word(arm_simple::CONT, cont);
            t
        }
        Isa::Thumb => {
            let mut t = Trampoline::from_halfwords(TemplateKind::Simple, &thumb_generic::HALFWORDS);
            t.set_halfword(thumb_generic::INSN, insn.hw1());
            if insn.is_thumb32() {
                t.set_halfword(thumb_generic::INSN + 1, insn.hw2());
            }
            t.set_literal(thumb_generic::CONT, cont);
            t
        }
    }
}

// =============================================================================
// Branches
// =============================================================================

fn synth_branch(
    addr: u32,
    insn: &Insn,
    info: &BranchInfo,
    cont: u32,
    options: &SynthOptions,
) -> ProbeResult<Trampoline> {
    let target = branch::destination(addr, insn.isa, info);
    let t = match (insn.isa, info.kind) {
        (Isa::Arm, BranchKind::Link | BranchKind::LinkExchange) => {
            arm_link(info.cond, target, cont, options)
        }
        (Isa::Arm, BranchKind::CompareZero { .. }) => {
            return Err(ProbeError::DecodeUnsupported {
                addr,
                reason: "compare-and-branch in A32",
            });
        }
        (Isa::Arm, _) => arm_branch_to(info.cond, target, cont),
        (Isa::Thumb, BranchKind::Link | BranchKind::LinkExchange) => {
            thumb_link(target, cont, options)
        }
        (Isa::Thumb, BranchKind::CompareZero { .. }) => {
            let h1 = (insn.hw1() & thumb_branch::CBZ_KEEP) | thumb_branch::CBZ_SKIP;
            thumb_branch_to(h1, target, cont)
        }
        (Isa::Thumb, _) => {
            let h1 = if info.cond.is_always() {
                thumb_branch::ALWAYS_SKIP
            } else {
                thumb_branch::COND_SKIP | (info.cond.0 as u16) << 8
            };
            thumb_branch_to(h1, target, cont)
        }
    };
    Ok(t)
}

/// BX PC switches to A32 at the pipeline PC.
fn synth_bx_pc(addr: u32, insn: &Insn, cond: Cond, cont: u32) -> ProbeResult<Trampoline> {
    match insn.isa {
        Isa::Arm => Ok(arm_branch_to(cond, addr.wrapping_add(8), cont)),
        Isa::Thumb => {
            if addr % 4 != 0 {
                return Err(ProbeError::DecodeUnsupported {
                    addr,
                    reason: "bx pc from a misaligned address",
                });
            }
            Ok(thumb_branch_to(
                thumb_branch::ALWAYS_SKIP,
                addr.wrapping_add(4),
                cont,
            ))
        }
    }
}

fn arm_branch_to(cond: Cond, target: u32, cont: u32) -> Trampoline {
    let mut t = Trampoline::from_words(TemplateKind::Branch, &arm_branch::WORDS);
    for i in arm_branch::CONDITIONAL {
        t.or_word(i, (cond.0 as u32) << 28);
    }
    t.set_word(arm_branch::TARGET, target);
    t.set_word(arm_branch::CONT, cont);
    t
}

fn arm_link(cond: Cond, target: u32, ret: u32, options: &SynthOptions) -> Trampoline {
    let mut t = Trampoline::from_words(TemplateKind::Link, &arm_link::WORDS);
    for i in arm_link::CONDITIONAL {
        t.or_word(i, (cond.0 as u32) << 28);
    }
    t.set_word(arm_link::RETURN, ret);
    t.set_word(arm_link::TARGET, target);
    t.set_word(arm_link::CONT, ret);
    t.set_word(arm_link::HIJACK, options.return_trampoline.unwrap_or(ret));
    t.hijack_entry = options
        .return_trampoline
        .map(|_| (arm_link::HIJACK_ENTRY * 4) as u32);
    t.link = Some(LinkInfo {
        cond,
        return_addr: ret,
    });
    t
}

fn arm_link_reg(cond: Cond, rm: Reg, ret: u32, cont: u32, options: &SynthOptions) -> Trampoline {
    let mut t = Trampoline::from_words(TemplateKind::LinkRegister, &arm_link_register::WORDS);
    for i in arm_link_register::CONDITIONAL {
        t.or_word(i, (cond.0 as u32) << 28);
    }
    for i in arm_link_register::TARGET_REG {
        t.or_word(i, (rm as u32) << 12);
    }
    t.set_word(arm_link_register::RETURN, ret);
    t.set_word(arm_link_register::CONT, cont);
    t.set_word(
        arm_link_register::HIJACK,
        options.return_trampoline.unwrap_or(ret),
    );
    t.hijack_entry = options
        .return_trampoline
        .map(|_| (arm_link_register::HIJACK_ENTRY * 4) as u32);
    t.link = Some(LinkInfo {
        cond,
        return_addr: ret,
    });
    t
}

fn thumb_branch_to(h1: u16, target: u32, cont: u32) -> Trampoline {
    let mut t = Trampoline::from_halfwords(TemplateKind::Branch, &thumb_branch::HALFWORDS);
    t.set_halfword(thumb_branch::BRANCH, h1);
    t.set_literal(thumb_branch::CONT, cont);
    t.set_literal(thumb_branch::TARGET, target);
    t
}

fn thumb_link(target: u32, ret: u32, options: &SynthOptions) -> Trampoline {
    let mut t = Trampoline::from_halfwords(TemplateKind::Link, &thumb_link::HALFWORDS);
    t.set_literal(thumb_link::RETURN, ret);
    t.set_literal(thumb_link::TARGET, target);
    t.set_literal(thumb_link::HIJACK, options.return_trampoline.unwrap_or(ret));
    t.hijack_entry = options.return_trampoline.map(|_| thumb_link::HIJACK_ENTRY);
    t.link = Some(LinkInfo {
        cond: Cond::AL,
        return_addr: ret,
    });
    t
}

fn thumb_link_reg(rm: Reg, ret: u32, options: &SynthOptions) -> Trampoline {
    let mut t =
        Trampoline::from_halfwords(TemplateKind::LinkRegister, &thumb_link_register::HALFWORDS);
    for i in thumb_link_register::TARGET_REG {
        t.or_halfword(i, (rm as u16) << 12);
    }
    t.set_literal(thumb_link_register::RETURN, ret);
    t.set_literal(
        thumb_link_register::HIJACK,
        options.return_trampoline.unwrap_or(ret),
    );
    t.hijack_entry = options
        .return_trampoline
        .map(|_| thumb_link_register::HIJACK_ENTRY);
    t.link = Some(LinkInfo {
        cond: Cond::AL,
        return_addr: ret,
    });
    t
}

// =============================================================================
// PC-relative instructions
// =============================================================================

fn arm_field_shift(field: PcField) -> u32 {
    match field {
        PcField::ArmRn => 16,
        PcField::ArmRd => 12,
        PcField::ArmRs => 8,
        _ => 0,
    }
}

/// Replace every PC-naming field of an A32 word by `scratch`; a PC destination
/// (always bits 15:12) is redirected too.
fn rewrite_arm(word: u32, fields: PcFields, writes: bool, scratch: Reg) -> u32 {
    let mut out = word;
    for field in [PcField::ArmRn, PcField::ArmRd, PcField::ArmRs, PcField::ArmRm] {
        if fields.contains(field) || (writes && field == PcField::ArmRd) {
            let shift = arm_field_shift(field);
            out = (out & !(0xf << shift)) | (scratch as u32) << shift;
        }
    }
    out
}

fn arm_pc_relative(
    word: u32,
    cond: Cond,
    pc: &PcRef,
    scratch: Reg,
    pc_value: u32,
    cont: u32,
) -> Trampoline {
    let (fields, writes) = match *pc {
        PcRef::Fields { fields, writes } => (fields, writes),
        _ => (PcFields::EMPTY, pc.writes_pc()),
    };
    let insn = rewrite_arm(word, fields, writes, scratch);
    let s = (scratch as u32) << 12;

    if !writes {
        let mut t = Trampoline::from_words(TemplateKind::PcRead, &arm_pc_read::WORDS);
        for i in arm_pc_read::SCRATCH {
            t.or_word(i, s);
        }
        t.set_word(arm_pc_read::INSN, insn);
        t.set_word(arm_pc_read::CONT, cont);
        t.set_word(arm_pc_read::PC_VALUE, pc_value);
        return t;
    }

    let mut t = Trampoline::from_words(TemplateKind::PcWrite, &arm_pc_write::WORDS);
    for i in arm_pc_write::SCRATCH {
        t.or_word(i, s);
    }
    if cond.is_always() {
        t.set_word(arm_pc_write::NOT_TAKEN, ARM_NOP);
    } else {
        t.or_word(arm_pc_write::NOT_TAKEN, (cond.invert().0 as u32) << 28);
    }
    t.set_word(arm_pc_write::INSN, insn);
    t.set_word(arm_pc_write::PC_VALUE, pc_value);
    t.set_word(arm_pc_write::CONT, cont);
    t
}

/// Offset of the PC slot written by an STM, relative to the base register
/// after the STM has executed.
fn stm_pc_offset(word: u32, count: u32, writeback: bool) -> i32 {
    let pre = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let n = count as i32 * 4;
    match (pre, up, writeback) {
        (false, true, false) => n - 4,
        (true, true, false) => n,
        (false, false, false) => 0,
        (true, false, false) => -4,
        (false, true, true) => -4,
        (true, true, true) => 0,
        (false, false, true) => n,
        (true, false, true) => n - 4,
    }
}

fn arm_store_pc(
    addr: u32,
    word: u32,
    base: Reg,
    list: RegSet,
    writeback: bool,
    cond: Cond,
    cont: u32,
) -> ProbeResult<Trampoline> {
    let scratch = list
        .with(base)
        .first_free(MAX_SCRATCH)
        .ok_or(ProbeError::NoFreeRegister { addr })?;
    let mut offset = stm_pc_offset(word, list.count(), writeback);
    if base == REG_SP {
        // The scratch spill sits on top of the stored block.
        offset += 4;
    }

    let mut t = Trampoline::from_words(TemplateKind::StorePc, &arm_store_pc::WORDS);
    for i in arm_store_pc::SCRATCH {
        t.or_word(i, (scratch as u32) << 12);
    }
    t.set_word(arm_store_pc::INSN, word);
    t.set_word(
        arm_store_pc::FIXUP,
        arm_str_imm(cond.0, scratch, base, offset),
    );
    t.set_word(arm_store_pc::CONT, cont);
    t.set_word(arm_store_pc::PC_VALUE, addr.wrapping_add(8));
    Ok(t)
}

/// Rewrite a Thumb instruction onto `scratch`. Returns the new half-words
/// (the second is `None` for 16-bit results).
fn rewrite_thumb(insn: &Insn, pc: &PcRef, scratch: Reg) -> (u16, Option<u16>) {
    let s = scratch as u16;
    match *pc {
        PcRef::Literal { form, writes, .. } => {
            let (hw1, hw2) = match form {
                LiteralForm::Thumb16Load { rt } => thumb_ldr_imm0(rt, scratch),
                LiteralForm::Thumb16Adr { rd } | LiteralForm::Thumb32Adr { rd } => {
                    thumb_addw0(rd, scratch)
                }
                LiteralForm::Thumb32Load { .. } => {
                    let hw2 = if writes { s << 12 } else { insn.hw2() & 0xf000 };
                    (((insn.hw1() | 0x0080) & 0xfff0) | s, hw2)
                }
                LiteralForm::Thumb32Dual { .. } => (
                    ((insn.hw1() | 0x0180) & !0x0020 & 0xfff0) | s,
                    insn.hw2() & 0xff00,
                ),
            };
            (hw1, Some(hw2))
        }
        PcRef::Fields { fields, writes } => {
            let mut hw = insn.hw1();
            if fields.contains(PcField::ThumbHiRm) {
                hw = (hw & !0x0078) | s << 3;
            }
            if fields.contains(PcField::ThumbHiRdn) || writes {
                hw = (hw & !0x0087) | (s & 8) << 4 | (s & 7);
            }
            (hw, None)
        }
        PcRef::None => (insn.hw1(), insn.is_thumb32().then(|| insn.hw2())),
    }
}

fn thumb_pc_relative(
    insn: &Insn,
    pc: &PcRef,
    scratch: Reg,
    pc_value: u32,
    cont: u32,
) -> Trampoline {
    let (hw1, hw2) = rewrite_thumb(insn, pc, scratch);
    let s = (scratch as u16) << 12;

    if !pc.writes_pc() {
        let mut t = Trampoline::from_halfwords(TemplateKind::PcRead, &thumb_pc_read::HALFWORDS);
        for i in thumb_pc_read::SCRATCH {
            t.or_halfword(i, s);
        }
        t.set_halfword(thumb_pc_read::INSN, hw1);
        t.set_halfword(thumb_pc_read::INSN + 1, hw2.unwrap_or(THUMB_NOP));
        t.set_literal(thumb_pc_read::CONT, cont);
        t.set_literal(thumb_pc_read::PC_VALUE, pc_value);
        return t;
    }

    let mut t = Trampoline::from_halfwords(TemplateKind::PcWrite, &thumb_pc_write::HALFWORDS);
    for i in thumb_pc_write::SCRATCH {
        t.or_halfword(i, s);
    }
    t.set_halfword(thumb_pc_write::INSN, hw1);
    t.set_halfword(thumb_pc_write::INSN + 1, hw2.unwrap_or(THUMB_NOP));
    if matches!(pc, PcRef::Literal { .. }) {
        // Loads into PC interwork on bit 0 of the loaded value.
        t.set_halfword(thumb_pc_write::THUMB_BIT, THUMB_NOP);
        t.set_halfword(thumb_pc_write::THUMB_BIT + 1, THUMB_NOP);
    } else {
        t.or_halfword(thumb_pc_write::THUMB_BIT, scratch as u16);
        t.or_halfword(thumb_pc_write::THUMB_BIT + 1, (scratch as u16) << 8);
    }
    t.set_literal(thumb_pc_write::PC_VALUE, pc_value);
    t
}
