//! Instruction classification for the A32 and Thumb/Thumb-2 encodings.
//!
//! Classification is a pure, total function from an instruction word to a
//! [`DecodeResult`]: every bit pattern maps to a variant, with [`DecodeResult::Undefined`]
//! and [`DecodeResult::Unsupported`] as explicit outcomes. The result tells the
//! trampoline synthesizer which template to use, which operand fields name PC,
//! and which registers the instruction touches.

pub mod arm;
pub mod branch;
pub mod thumb;

use core::fmt;

use crate::regs::CPSR_C;
use crate::regs::CPSR_N;
use crate::regs::CPSR_V;
use crate::regs::CPSR_Z;

/// Register number (0-15).
pub type Reg = u8;

pub const REG_SP: Reg = 13;
pub const REG_LR: Reg = 14;
pub const REG_PC: Reg = 15;

/// Instruction set of a code location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    /// A32, fixed 32-bit words.
    Arm,
    /// Thumb, 16-bit half-words or 32-bit Thumb-2 pairs.
    Thumb,
}

impl Isa {
    /// Instruction set selected by an interworking address.
    pub fn from_interworking(addr: u32) -> Self {
        if addr & 1 != 0 { Isa::Thumb } else { Isa::Arm }
    }

    /// Required alignment of an instruction address.
    pub fn alignment(self) -> u32 {
        match self {
            Isa::Arm => 4,
            Isa::Thumb => 2,
        }
    }
}

/// One instruction as read from memory.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub isa: Isa,
    /// A32 word, Thumb half-word, or Thumb-2 pair packed as `hw1 << 16 | hw2`.
    pub raw: u32,
    /// Length in bytes (2 or 4).
    pub len: u8,
}

impl Insn {
    pub const fn arm(word: u32) -> Self {
        Self {
            isa: Isa::Arm,
            raw: word,
            len: 4,
        }
    }

    pub const fn thumb16(hw: u16) -> Self {
        Self {
            isa: Isa::Thumb,
            raw: hw as u32,
            len: 2,
        }
    }

    pub const fn thumb32(hw1: u16, hw2: u16) -> Self {
        Self {
            isa: Isa::Thumb,
            raw: (hw1 as u32) << 16 | hw2 as u32,
            len: 4,
        }
    }

    /// Build from a Thumb half-word pair; the second half-word is ignored for 16-bit forms.
    pub fn thumb(hw1: u16, hw2: u16) -> Self {
        if thumb_insn_len(hw1) == 4 {
            Self::thumb32(hw1, hw2)
        } else {
            Self::thumb16(hw1)
        }
    }

    pub fn is_thumb32(&self) -> bool {
        self.isa == Isa::Thumb && self.len == 4
    }

    /// First half-word of a Thumb instruction.
    pub fn hw1(&self) -> u16 {
        if self.is_thumb32() {
            (self.raw >> 16) as u16
        } else {
            self.raw as u16
        }
    }

    /// Second half-word of a 32-bit Thumb instruction.
    pub fn hw2(&self) -> u16 {
        self.raw as u16
    }

    /// Memory image (little-endian, Thumb-2 as two consecutive half-words).
    pub fn to_bytes(&self) -> ([u8; 4], usize) {
        let mut out = [0u8; 4];
        match (self.isa, self.len) {
            (Isa::Arm, _) => out.copy_from_slice(&self.raw.to_le_bytes()),
            (Isa::Thumb, 2) => out[..2].copy_from_slice(&(self.raw as u16).to_le_bytes()),
            (Isa::Thumb, _) => {
                out[..2].copy_from_slice(&self.hw1().to_le_bytes());
                out[2..].copy_from_slice(&self.hw2().to_le_bytes());
            }
        }
        (out, self.len as usize)
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.isa, self.len) {
            (Isa::Arm, _) => write!(f, "A32({:08x})", self.raw),
            (Isa::Thumb, 2) => write!(f, "T16({:04x})", self.raw),
            (Isa::Thumb, _) => write!(f, "T32({:04x} {:04x})", self.hw1(), self.hw2()),
        }
    }
}

/// Length of a Thumb instruction from its first half-word.
///
/// Only the top five bits matter: `0b11101`, `0b11110` and `0b11111` open a 32-bit
/// instruction, everything else is a complete 16-bit instruction.
#[inline]
pub const fn thumb_insn_len(hw1: u16) -> usize {
    if hw1 & 0xe000 == 0xe000 && hw1 & 0x1800 != 0 { 4 } else { 2 }
}

/// Set of core registers, bit N = rN.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RegSet(pub u16);

impl RegSet {
    pub const EMPTY: RegSet = RegSet(0);

    pub fn of(regs: &[Reg]) -> Self {
        regs.iter().fold(Self::EMPTY, |set, &r| set.with(r))
    }

    #[must_use]
    pub const fn with(self, r: Reg) -> Self {
        RegSet(self.0 | 1 << (r & 0xf))
    }

    pub const fn contains(self, r: Reg) -> bool {
        self.0 & (1 << (r & 0xf)) != 0
    }

    #[must_use]
    pub const fn union(self, other: RegSet) -> Self {
        RegSet(self.0 | other.0)
    }

    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest register in the set.
    pub fn lowest(self) -> Option<Reg> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros() as Reg) }
    }

    /// Lowest register in `0..=max` that is not in the set.
    pub fn first_free(self, max: Reg) -> Option<Reg> {
        (0..=max).find(|&r| !self.contains(r))
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        (0..16u8).filter(move |&r| self.contains(r))
    }
}

impl fmt::Debug for RegSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(RegName)).finish()
    }
}

struct RegName(Reg);

impl fmt::Debug for RegName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            13 => write!(f, "sp"),
            14 => write!(f, "lr"),
            15 => write!(f, "pc"),
            n => write!(f, "r{}", n),
        }
    }
}

/// Condition field (bits 31:28 of an A32 word, or the cond field of a Thumb branch).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cond(pub u8);

impl Cond {
    pub const EQ: Cond = Cond(0x0);
    pub const NE: Cond = Cond(0x1);
    pub const CS: Cond = Cond(0x2);
    pub const CC: Cond = Cond(0x3);
    pub const MI: Cond = Cond(0x4);
    pub const PL: Cond = Cond(0x5);
    pub const VS: Cond = Cond(0x6);
    pub const VC: Cond = Cond(0x7);
    pub const HI: Cond = Cond(0x8);
    pub const LS: Cond = Cond(0x9);
    pub const GE: Cond = Cond(0xa);
    pub const LT: Cond = Cond(0xb);
    pub const GT: Cond = Cond(0xc);
    pub const LE: Cond = Cond(0xd);
    pub const AL: Cond = Cond(0xe);

    pub fn of_arm(word: u32) -> Self {
        Cond((word >> 28) as u8)
    }

    pub fn is_always(self) -> bool {
        self.0 >= 0xe
    }

    /// Opposite condition. Only meaningful for conditions below AL.
    pub fn invert(self) -> Self {
        Cond(self.0 ^ 1)
    }

    /// Evaluate against the NZCV flags of `cpsr`.
    pub fn passed(self, cpsr: u32) -> bool {
        let n = cpsr & CPSR_N != 0;
        let z = cpsr & CPSR_Z != 0;
        let c = cpsr & CPSR_C != 0;
        let v = cpsr & CPSR_V != 0;
        let base = match self.0 >> 1 {
            0 => z,
            1 => c,
            2 => n,
            3 => v,
            4 => c && !z,
            5 => n == v,
            6 => n == v && !z,
            _ => return true,
        };
        if self.0 & 1 != 0 { !base } else { base }
    }
}

impl fmt::Debug for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 16] = [
            "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
            "al", "nv",
        ];
        f.write_str(NAMES[(self.0 & 0xf) as usize])
    }
}

/// Register fields that can name PC and are rewritten to a scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcField {
    /// A32 bits 19:16.
    ArmRn,
    /// A32 bits 15:12 (Rd or Rt).
    ArmRd,
    /// A32 bits 11:8.
    ArmRs,
    /// A32 bits 3:0.
    ArmRm,
    /// Thumb high-register Rm, bits 6:3.
    ThumbHiRm,
    /// Thumb high-register Rdn, bit 7 and bits 2:0.
    ThumbHiRdn,
}

impl PcField {
    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

/// A small set of [`PcField`]s.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PcFields(u8);

impl PcFields {
    pub const EMPTY: PcFields = PcFields(0);

    #[must_use]
    pub const fn with(self, field: PcField) -> Self {
        PcFields(self.0 | field.bit())
    }

    pub const fn contains(self, field: PcField) -> bool {
        self.0 & field.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for PcFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const ALL: [PcField; 6] = [
            PcField::ArmRn,
            PcField::ArmRd,
            PcField::ArmRs,
            PcField::ArmRm,
            PcField::ThumbHiRm,
            PcField::ThumbHiRdn,
        ];
        f.debug_set()
            .entries(ALL.iter().filter(|&&x| self.contains(x)))
            .finish()
    }
}

/// Thumb encodings whose PC operand is implicit and gets folded into a base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralForm {
    /// `LDR Rt, [PC, #imm8]` (16-bit).
    Thumb16Load { rt: Reg },
    /// `ADR Rd, #imm8` (16-bit).
    Thumb16Adr { rd: Reg },
    /// LDR/LDRB/LDRH/LDRSB/LDRSH/PLD literal (32-bit).
    Thumb32Load { rt: Reg },
    /// LDRD literal.
    Thumb32Dual { rt: Reg, rt2: Reg },
    /// ADDW/SUBW with PC base.
    Thumb32Adr { rd: Reg },
}

/// How an instruction depends on the program counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcRef {
    None,
    /// PC appears in register fields.
    Fields { fields: PcFields, writes: bool },
    /// PC-relative address `Align(PC, 4) + offset`.
    Literal {
        form: LiteralForm,
        offset: i32,
        writes: bool,
    },
}

impl PcRef {
    pub fn uses_pc(&self) -> bool {
        !matches!(self, PcRef::None)
    }

    pub fn writes_pc(&self) -> bool {
        match self {
            PcRef::Fields { writes, .. } | PcRef::Literal { writes, .. } => *writes,
            _ => false,
        }
    }

    fn field(field: PcField) -> Self {
        PcRef::Fields {
            fields: PcFields::EMPTY.with(field),
            writes: false,
        }
    }
}

/// Immediate-displacement branch sub-kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Unconditional,
    Conditional,
    /// BL: writes the return address to LR.
    Link,
    /// BLX immediate: writes LR and switches instruction set.
    LinkExchange,
    /// CBZ / CBNZ.
    CompareZero { rn: Reg, nonzero: bool },
}

/// Decoded immediate branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    pub kind: BranchKind,
    pub cond: Cond,
    /// Raw displacement bits as encoded.
    pub field: u32,
    /// Signed byte offset from the PC base, after sign extension and scaling.
    pub displacement: i32,
}

impl BranchInfo {
    pub fn is_link(&self) -> bool {
        matches!(self.kind, BranchKind::Link | BranchKind::LinkExchange)
    }
}

/// Semantic category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    Branch(BranchInfo),
    /// BX / BLX register.
    BranchRegister { rm: Reg, link: bool, cond: Cond },
    DataProcessing { pc: PcRef, regs: RegSet, cond: Cond },
    LoadStore {
        pc: PcRef,
        store: bool,
        regs: RegSet,
        cond: Cond,
    },
    LoadStoreMultiple {
        base: Reg,
        list: RegSet,
        load: bool,
        writeback: bool,
        /// STM whose list stores PC. LDM loading PC and PC-based forms are rejected.
        pc_in_list: bool,
        cond: Cond,
    },
    Coprocessor { pc: PcRef, regs: RegSet, cond: Cond },
    /// Hints, barriers, status-register moves, supervisor calls.
    System { regs: RegSet, cond: Cond },
    /// Permanently undefined or breakpoint-occupying encodings.
    Undefined,
    /// Valid encodings that cannot be relocated.
    Unsupported(&'static str),
}

impl DecodeResult {
    /// Whether a trampoline can be synthesized for this result.
    pub fn is_probeable(&self) -> bool {
        !matches!(self, DecodeResult::Undefined | DecodeResult::Unsupported(_))
    }

    pub fn cond(&self) -> Cond {
        match *self {
            DecodeResult::Branch(b) => b.cond,
            DecodeResult::BranchRegister { cond, .. }
            | DecodeResult::DataProcessing { cond, .. }
            | DecodeResult::LoadStore { cond, .. }
            | DecodeResult::LoadStoreMultiple { cond, .. }
            | DecodeResult::Coprocessor { cond, .. }
            | DecodeResult::System { cond, .. } => cond,
            DecodeResult::Undefined | DecodeResult::Unsupported(_) => Cond::AL,
        }
    }

    /// How the instruction depends on PC.
    pub fn pc_ref(&self) -> PcRef {
        match *self {
            DecodeResult::DataProcessing { pc, .. }
            | DecodeResult::LoadStore { pc, .. }
            | DecodeResult::Coprocessor { pc, .. } => pc,
            _ => PcRef::None,
        }
    }

    /// Registers the instruction reads or writes.
    pub fn regs(&self) -> RegSet {
        match *self {
            DecodeResult::DataProcessing { regs, .. }
            | DecodeResult::LoadStore { regs, .. }
            | DecodeResult::Coprocessor { regs, .. }
            | DecodeResult::System { regs, .. } => regs,
            DecodeResult::LoadStoreMultiple { base, list, .. } => list.with(base),
            DecodeResult::BranchRegister { rm, link, .. } => {
                let set = RegSet::EMPTY.with(rm);
                if link { set.with(REG_LR) } else { set }
            }
            DecodeResult::Branch(b) => match b.kind {
                BranchKind::CompareZero { rn, .. } => RegSet::EMPTY.with(rn),
                BranchKind::Link | BranchKind::LinkExchange => RegSet::EMPTY.with(REG_LR),
                _ => RegSet::EMPTY,
            },
            DecodeResult::Undefined | DecodeResult::Unsupported(_) => RegSet::EMPTY,
        }
    }

    /// Short category name for listings and logs.
    pub fn category(&self) -> &'static str {
        match self {
            DecodeResult::Branch(_) => "branch",
            DecodeResult::BranchRegister { .. } => "branch-register",
            DecodeResult::DataProcessing { .. } => "data-processing",
            DecodeResult::LoadStore { .. } => "load-store",
            DecodeResult::LoadStoreMultiple { .. } => "load-store-multiple",
            DecodeResult::Coprocessor { .. } => "coprocessor",
            DecodeResult::System { .. } => "system",
            DecodeResult::Undefined => "undefined",
            DecodeResult::Unsupported(_) => "unsupported",
        }
    }
}

/// Classify one instruction.
pub fn classify(insn: &Insn) -> DecodeResult {
    match (insn.isa, insn.len) {
        (Isa::Arm, _) => arm::classify(insn.raw),
        (Isa::Thumb, 2) => thumb::classify16(insn.raw as u16),
        (Isa::Thumb, _) => thumb::classify32(insn.hw1(), insn.hw2()),
    }
}
