//! Trampoline templates.
//!
//! Each template is a fixed instruction sequence with register fields and
//! condition fields left zero and literal words left as placeholders. The
//! synthesizer copies a template, ORs the scratch register, the operand
//! register and the condition into the marked words, and fills the literals.
//!
//! Every template starts with the trampoline breakpoint slot at offset 0,
//! so a branch-diverted site can land on it. Literals hold absolute
//! addresses; no instruction in a template is PC-relative across the
//! trampoline boundary, which makes the sequence position-independent.

// =============================================================================
// Breakpoint encodings
// =============================================================================

/// A32 breakpoint installed at a probed site (permanently undefined, imm = 0x1f8).
pub const ARM_SITE_BKPT: u32 = 0xe7f0_01f8;
/// A32 breakpoint at offset 0 of every A32 trampoline.
pub const ARM_SLOT_BKPT: u32 = 0xe7f0_01f9;
/// A32 breakpoint forming the shared return trampoline.
pub const ARM_RETURN_BKPT: u32 = 0xe7f0_01fa;

/// 16-bit Thumb breakpoint installed at a probed site.
pub const THUMB_SITE_BKPT: u16 = 0xde18;
/// 32-bit Thumb breakpoint installed over a 32-bit instruction.
pub const THUMB2_SITE_BKPT: (u16, u16) = (0xf7f0, 0xa018);
/// Thumb breakpoint at offset 0 of every Thumb trampoline.
pub const THUMB_SLOT_BKPT: u16 = 0xde19;

pub const ARM_NOP: u32 = 0xe1a0_0000; // mov r0, r0
pub const THUMB_NOP: u16 = 0xbf00;

/// Whether an A32 word is one of the engine's own breakpoints.
pub fn is_arm_breakpoint(word: u32) -> bool {
    matches!(word, ARM_SITE_BKPT | ARM_SLOT_BKPT | ARM_RETURN_BKPT)
}

/// Whether a Thumb half-word pair starts with one of the engine's own breakpoints.
pub fn is_thumb_breakpoint(hw1: u16, hw2: u16) -> bool {
    hw1 == THUMB_SITE_BKPT || hw1 == THUMB_SLOT_BKPT || (hw1, hw2) == THUMB2_SITE_BKPT
}

// =============================================================================
// A32 encodings
// =============================================================================

/// Offsets of the register fields in an A32 word.
pub const ARM_RN_SHIFT: u32 = 16;
pub const ARM_RD_SHIFT: u32 = 12;
pub const ARM_RS_SHIFT: u32 = 8;
pub const ARM_RM_SHIFT: u32 = 0;

const ARM_PUSH: u32 = 0xe52d_0004; // str rS, [sp, #-4]!
const ARM_PUSH_C: u32 = 0x052d_0004;
const ARM_POP: u32 = 0xe49d_0004; // ldr rS, [sp], #4
const ARM_LDR_SP4: u32 = 0xe59d_0004; // ldr rS, [sp, #4]
const ARM_LDR_LIT: u32 = 0xe59f_0000; // ldr rS, [pc, #imm]
const ARM_LDR_LIT_C: u32 = 0x059f_0000;
const ARM_LDR_PC_M4: u32 = 0xe51f_f004; // ldr pc, [pc, #-4]
const ARM_LDR_PC_SP8: u32 = 0xe49d_f008; // ldr pc, [sp], #8
const ARM_LDR_PC_SP4_C: u32 = 0x049d_f004; // ldr<c> pc, [sp], #4
const ARM_REG_LR: u32 = 14 << 12;
const ARM_REG_PC: u32 = 15 << 12;
const PLACEHOLDER: u32 = 0;

/// `STR<c> rt, [rn, #±offset]`.
pub fn arm_str_imm(cond: u8, rt: u8, rn: u8, offset: i32) -> u32 {
    let up = (offset >= 0) as u32;
    (cond as u32) << 28
        | 0x0500_0000
        | up << 23
        | (rn as u32) << 16
        | (rt as u32) << 12
        | offset.unsigned_abs() & 0xfff
}

/// Simple: the original instruction, then a jump to the continuation.
pub mod arm_simple {
    use super::*;

    pub const WORDS: [u32; 4] = [ARM_SLOT_BKPT, PLACEHOLDER, ARM_LDR_PC_M4, PLACEHOLDER];
    pub const INSN: usize = 1;
    pub const CONT: usize = 3;
}

/// PC read: spill the scratch register, load the PC value, run the rewritten
/// instruction, restore, continue.
pub mod arm_pc_read {
    use super::*;

    pub const WORDS: [u32; 8] = [
        ARM_SLOT_BKPT,
        ARM_PUSH,
        ARM_LDR_LIT | 12,
        PLACEHOLDER,
        ARM_POP,
        ARM_LDR_PC_M4,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    /// Words taking the scratch register in bits 15:12.
    pub const SCRATCH: [usize; 3] = [1, 2, 4];
    pub const INSN: usize = 3;
    pub const CONT: usize = 6;
    pub const PC_VALUE: usize = 7;
}

/// PC write: the rewritten instruction computes the destination into the
/// scratch register, which is then pushed and popped into PC while the
/// scratch register's original value is restored.
pub mod arm_pc_write {
    use super::*;

    pub const WORDS: [u32; 10] = [
        ARM_SLOT_BKPT,
        ARM_PUSH,
        ARM_LDR_LIT | 16,
        PLACEHOLDER,
        ARM_LDR_LIT_C | 12,
        ARM_PUSH,
        ARM_LDR_SP4,
        ARM_LDR_PC_SP8,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    pub const SCRATCH: [usize; 5] = [1, 2, 4, 5, 6];
    pub const INSN: usize = 3;
    /// Loads the continuation when the condition fails; NOP when unconditional.
    pub const NOT_TAKEN: usize = 4;
    pub const PC_VALUE: usize = 8;
    pub const CONT: usize = 9;
}

/// B<c> and BX PC.
pub mod arm_branch {
    use super::*;

    pub const WORDS: [u32; 5] = [
        ARM_SLOT_BKPT,
        ARM_LDR_LIT_C | ARM_REG_PC,
        ARM_LDR_LIT | ARM_REG_PC,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    pub const CONDITIONAL: [usize; 1] = [1];
    pub const TARGET: usize = 3;
    pub const CONT: usize = 4;
}

/// BL<c> and BLX immediate, with a second entry loading the hijack address into LR.
pub mod arm_link {
    use super::*;

    pub const WORDS: [u32; 11] = [
        ARM_SLOT_BKPT,
        ARM_LDR_LIT_C | ARM_REG_LR | 16,
        ARM_LDR_LIT_C | ARM_REG_PC | 16,
        ARM_LDR_LIT | ARM_REG_PC | 16,
        ARM_LDR_LIT_C | ARM_REG_LR | 16,
        ARM_LDR_LIT_C | ARM_REG_PC | 4,
        ARM_LDR_LIT | ARM_REG_PC | 4,
        PLACEHOLDER,
        PLACEHOLDER,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    pub const CONDITIONAL: [usize; 4] = [1, 2, 4, 5];
    pub const HIJACK_ENTRY: usize = 4;
    pub const RETURN: usize = 7;
    pub const TARGET: usize = 8;
    pub const CONT: usize = 9;
    pub const HIJACK: usize = 10;
}

/// BLX<c> Rm: the target is pushed before LR is overwritten, then popped into PC.
pub mod arm_link_register {
    use super::*;

    pub const WORDS: [u32; 12] = [
        ARM_SLOT_BKPT,
        ARM_PUSH_C,
        ARM_LDR_LIT_C | ARM_REG_LR | 20,
        ARM_LDR_PC_SP4_C,
        ARM_LDR_LIT | ARM_REG_PC | 16,
        ARM_PUSH_C,
        ARM_LDR_LIT_C | ARM_REG_LR | 12,
        ARM_LDR_PC_SP4_C,
        ARM_LDR_LIT | ARM_REG_PC,
        PLACEHOLDER,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    pub const CONDITIONAL: [usize; 6] = [1, 2, 3, 5, 6, 7];
    /// Words taking the target register in bits 15:12.
    pub const TARGET_REG: [usize; 2] = [1, 5];
    pub const HIJACK_ENTRY: usize = 5;
    pub const RETURN: usize = 9;
    pub const CONT: usize = 10;
    pub const HIJACK: usize = 11;
}

/// STM storing PC: the STM runs as is, then the stored PC slot is overwritten
/// with the value PC would have held at the probed site.
pub mod arm_store_pc {
    use super::*;

    pub const WORDS: [u32; 9] = [
        ARM_SLOT_BKPT,
        PLACEHOLDER,
        ARM_PUSH,
        ARM_LDR_LIT | 12,
        PLACEHOLDER,
        ARM_POP,
        ARM_LDR_PC_M4,
        PLACEHOLDER,
        PLACEHOLDER,
    ];
    pub const SCRATCH: [usize; 3] = [2, 3, 5];
    pub const INSN: usize = 1;
    pub const FIXUP: usize = 4;
    pub const CONT: usize = 7;
    pub const PC_VALUE: usize = 8;
}

// =============================================================================
// Thumb encodings
// =============================================================================
//
// Thumb templates are half-word arrays. 32-bit instructions occupy two entries
// (first half-word first) and 32-bit literals occupy two entries (low half
// first). Literal loads use `Align(PC, 4)`, so every literal sits on a 4-byte
// boundary relative to the 4-byte-aligned slot base.

const T_PUSH: [u16; 2] = [0xf84d, 0x0d04]; // str.w rS, [sp, #-4]!
const T_POP: [u16; 2] = [0xf85d, 0x0b04]; // ldr.w rS, [sp], #4
const T_LDR_SP4: [u16; 2] = [0xf8dd, 0x0004]; // ldr.w rS, [sp, #4]
const T_LDR_LIT: u16 = 0xf8df; // ldr.w rT, [pc, #imm]
const T_LDR_PC_SP8: [u16; 2] = [0xf85d, 0xfb08]; // ldr.w pc, [sp], #8
const T_LDR_PC_SP4: [u16; 2] = [0xf85d, 0xfb04]; // ldr.w pc, [sp], #4
const T_ORR1: [u16; 2] = [0xf040, 0x0001]; // orr.w rS, rS, #1
const T_LR: u16 = 14 << 12;
const T_PC: u16 = 15 << 12;
const HP: u16 = 0;

/// `LDR.W rt, [rn, #0]`.
pub fn thumb_ldr_imm0(rt: u8, rn: u8) -> (u16, u16) {
    (0xf8d0 | rn as u16, (rt as u16) << 12)
}

/// `ADDW rd, rn, #0`.
pub fn thumb_addw0(rd: u8, rn: u8) -> (u16, u16) {
    (0xf200 | rn as u16, (rd as u16) << 8)
}

/// Generic: the original instruction (a 16-bit one padded with NOP), then a
/// jump to the continuation.
pub mod thumb_generic {
    use super::*;

    pub const HALFWORDS: [u16; 8] = [
        THUMB_SLOT_BKPT,
        HP,
        THUMB_NOP,
        THUMB_NOP,
        T_LDR_LIT,
        T_PC,
        HP,
        HP,
    ];
    pub const INSN: usize = 1;
    pub const CONT: usize = 6;
}

pub mod thumb_pc_read {
    use super::*;

    pub const HALFWORDS: [u16; 16] = [
        THUMB_SLOT_BKPT,
        T_PUSH[0],
        T_PUSH[1],
        T_LDR_LIT,
        20,
        HP,
        THUMB_NOP,
        T_POP[0],
        T_POP[1],
        THUMB_NOP,
        T_LDR_LIT,
        T_PC,
        HP,
        HP,
        HP,
        HP,
    ];
    /// Second half-words taking the scratch register in bits 15:12.
    pub const SCRATCH: [usize; 3] = [2, 4, 8];
    pub const INSN: usize = 5;
    pub const CONT: usize = 12;
    pub const PC_VALUE: usize = 14;
}

pub mod thumb_pc_write {
    use super::*;

    pub const HALFWORDS: [u16; 18] = [
        THUMB_SLOT_BKPT,
        T_PUSH[0],
        T_PUSH[1],
        T_LDR_LIT,
        24,
        HP,
        THUMB_NOP,
        T_ORR1[0],
        T_ORR1[1],
        T_PUSH[0],
        T_PUSH[1],
        T_LDR_SP4[0],
        T_LDR_SP4[1],
        T_LDR_PC_SP8[0],
        T_LDR_PC_SP8[1],
        THUMB_NOP,
        HP,
        HP,
    ];
    pub const SCRATCH: [usize; 4] = [2, 4, 10, 12];
    pub const INSN: usize = 5;
    /// `ORR.W rS, rS, #1`, replaced by two NOPs for interworking loads.
    pub const THUMB_BIT: usize = 7;
    pub const PC_VALUE: usize = 16;
}

/// B<c>, B, CBZ/CBNZ and BX PC. The copied branch jumps over the not-taken
/// path to the target load.
pub mod thumb_branch {
    use super::*;

    pub const HALFWORDS: [u16; 10] = [
        THUMB_SLOT_BKPT,
        HP,
        T_LDR_LIT,
        T_PC | 4,
        T_LDR_LIT,
        T_PC | 4,
        HP,
        HP,
        HP,
        HP,
    ];
    pub const BRANCH: usize = 1;
    pub const CONT: usize = 6;
    pub const TARGET: usize = 8;

    /// `B<c>` (T1) and `B` (T2) to offset 8 from offset 2.
    pub const COND_SKIP: u16 = 0xd001;
    pub const ALWAYS_SKIP: u16 = 0xe001;
    /// Clears `i:imm5` of a CBZ/CBNZ; `imm5 = 1` reaches offset 8.
    pub const CBZ_KEEP: u16 = 0xfd07;
    pub const CBZ_SKIP: u16 = 1 << 3;
}

pub mod thumb_link {
    use super::*;

    pub const HALFWORDS: [u16; 16] = [
        THUMB_SLOT_BKPT,
        THUMB_NOP,
        T_LDR_LIT,
        T_LR | 12,
        T_LDR_LIT,
        T_PC | 12,
        T_LDR_LIT,
        T_LR | 12,
        T_LDR_LIT,
        T_PC | 4,
        HP,
        HP,
        HP,
        HP,
        HP,
        HP,
    ];
    /// Byte offset of the hijack entry.
    pub const HIJACK_ENTRY: u32 = 12;
    pub const RETURN: usize = 10;
    pub const TARGET: usize = 12;
    pub const HIJACK: usize = 14;
}

pub mod thumb_link_register {
    use super::*;

    pub const HALFWORDS: [u16; 18] = [
        THUMB_SLOT_BKPT,
        THUMB_NOP,
        T_PUSH[0],
        T_PUSH[1],
        T_LDR_LIT,
        T_LR | 16,
        T_LDR_PC_SP4[0],
        T_LDR_PC_SP4[1],
        T_PUSH[0],
        T_PUSH[1],
        T_LDR_LIT,
        T_LR | 8,
        T_LDR_PC_SP4[0],
        T_LDR_PC_SP4[1],
        HP,
        HP,
        HP,
        HP,
    ];
    pub const TARGET_REG: [usize; 2] = [3, 9];
    pub const HIJACK_ENTRY: u32 = 16;
    pub const RETURN: usize = 14;
    pub const HIJACK: usize = 16;
}
