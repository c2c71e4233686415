//! Branch displacement decoding and encoding.
//!
//! Displacements are sign-extended and scaled exactly as the architecture
//! defines them; destinations are returned as interworking addresses (bit 0
//! set when the destination executes in Thumb state).

use super::{BranchInfo, BranchKind, Isa};

/// Sign-extend the low `bits` bits of `value`.
#[inline]
pub const fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

// =============================================================================
// A32
// =============================================================================

/// Byte displacement of A32 B/BL (imm24 scaled by 4).
pub const fn arm_b_displacement(word: u32) -> i32 {
    sign_extend(word & 0x00ff_ffff, 24) << 2
}

/// Byte displacement of A32 BLX immediate (imm24:H:0).
pub const fn arm_blx_displacement(word: u32) -> i32 {
    (arm_b_displacement(word)) | (((word >> 24) & 1) << 1) as i32
}

/// Encode A32 B/BL with the given condition. `None` if out of range or misaligned.
pub fn encode_arm_branch(cond: u8, link: bool, displacement: i32) -> Option<u32> {
    if displacement & 3 != 0 || !(-(1 << 25)..(1 << 25)).contains(&displacement) {
        return None;
    }
    let imm24 = ((displacement >> 2) as u32) & 0x00ff_ffff;
    Some((cond as u32) << 28 | 0x0a00_0000 | (link as u32) << 24 | imm24)
}

/// Encode A32 BLX immediate (always unconditional).
pub fn encode_arm_blx(displacement: i32) -> Option<u32> {
    if displacement & 1 != 0 || !(-(1 << 25)..(1 << 25)).contains(&displacement) {
        return None;
    }
    let h = ((displacement >> 1) & 1) as u32;
    let imm24 = ((displacement >> 2) as u32) & 0x00ff_ffff;
    Some(0xfa00_0000 | h << 24 | imm24)
}

// =============================================================================
// Thumb
// =============================================================================

/// 16-bit conditional branch (T1): imm8 scaled by 2.
pub const fn thumb_b_t1_displacement(hw: u16) -> i32 {
    sign_extend((hw & 0xff) as u32, 8) << 1
}

/// 16-bit unconditional branch (T2): imm11 scaled by 2.
pub const fn thumb_b_t2_displacement(hw: u16) -> i32 {
    sign_extend((hw & 0x7ff) as u32, 11) << 1
}

/// CBZ/CBNZ: i:imm5:0, zero-extended (forward only).
pub const fn thumb_cbz_displacement(hw: u16) -> i32 {
    ((((hw >> 9) & 1) << 6) | (((hw >> 3) & 0x1f) << 1)) as i32
}

/// 32-bit conditional branch (T3): S:J2:J1:imm6:imm11:0, 21 bits.
pub const fn thumb_b_t3_displacement(hw1: u16, hw2: u16) -> i32 {
    let s = ((hw1 >> 10) & 1) as u32;
    let imm6 = (hw1 & 0x3f) as u32;
    let j1 = ((hw2 >> 13) & 1) as u32;
    let j2 = ((hw2 >> 11) & 1) as u32;
    let imm11 = (hw2 & 0x7ff) as u32;
    sign_extend(s << 20 | j2 << 19 | j1 << 18 | imm6 << 12 | imm11 << 1, 21)
}

/// 32-bit B (T4) and BL: S:I1:I2:imm10:imm11:0, 25 bits, with I = NOT(J XOR S).
pub const fn thumb_b_t4_displacement(hw1: u16, hw2: u16) -> i32 {
    let s = ((hw1 >> 10) & 1) as u32;
    let imm10 = (hw1 & 0x3ff) as u32;
    let j1 = ((hw2 >> 13) & 1) as u32;
    let j2 = ((hw2 >> 11) & 1) as u32;
    let imm11 = (hw2 & 0x7ff) as u32;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    sign_extend(s << 24 | i1 << 23 | i2 << 22 | imm10 << 12 | imm11 << 1, 25)
}

/// BLX immediate (T2): S:I1:I2:imm10H:imm10L:00, relative to `Align(PC, 4)`.
pub const fn thumb_blx_displacement(hw1: u16, hw2: u16) -> i32 {
    thumb_b_t4_displacement(hw1, hw2 & !1)
}

fn t4_fields(displacement: i32) -> (u16, u16) {
    let v = displacement as u32;
    let s = (v >> 24) & 1;
    let i1 = (v >> 23) & 1;
    let i2 = (v >> 22) & 1;
    let j1 = !(i1 ^ s) & 1;
    let j2 = !(i2 ^ s) & 1;
    let imm10 = (v >> 12) & 0x3ff;
    let imm11 = (v >> 1) & 0x7ff;
    let hw1 = (s << 10 | imm10) as u16;
    let hw2 = (j1 << 13 | j2 << 11 | imm11) as u16;
    (hw1, hw2)
}

fn fits(displacement: i32, bits: u32) -> bool {
    let lim = 1i32 << (bits - 1);
    (-lim..lim).contains(&displacement)
}

/// Encode 16-bit conditional branch (T1).
pub fn encode_thumb_b_t1(cond: u8, displacement: i32) -> Option<u16> {
    if displacement & 1 != 0 || !fits(displacement, 9) || cond >= 0xe {
        return None;
    }
    Some(0xd000 | (cond as u16) << 8 | ((displacement >> 1) as u16 & 0xff))
}

/// Encode 16-bit unconditional branch (T2).
pub fn encode_thumb_b_t2(displacement: i32) -> Option<u16> {
    if displacement & 1 != 0 || !fits(displacement, 12) {
        return None;
    }
    Some(0xe000 | ((displacement >> 1) as u16 & 0x7ff))
}

/// Encode 32-bit conditional branch (T3).
pub fn encode_thumb_b_t3(cond: u8, displacement: i32) -> Option<(u16, u16)> {
    if displacement & 1 != 0 || !fits(displacement, 21) || cond >= 0xe {
        return None;
    }
    let v = displacement as u32;
    let s = (v >> 20) & 1;
    let j2 = (v >> 19) & 1;
    let j1 = (v >> 18) & 1;
    let imm6 = (v >> 12) & 0x3f;
    let imm11 = (v >> 1) & 0x7ff;
    let hw1 = 0xf000 | (s << 10 | (cond as u32) << 6 | imm6) as u16;
    let hw2 = 0x8000 | (j1 << 13 | j2 << 11 | imm11) as u16;
    Some((hw1, hw2))
}

/// Encode 32-bit unconditional branch (T4).
pub fn encode_thumb_b_t4(displacement: i32) -> Option<(u16, u16)> {
    if displacement & 1 != 0 || !fits(displacement, 25) {
        return None;
    }
    let (hw1, hw2) = t4_fields(displacement);
    Some((0xf000 | hw1, 0x9000 | hw2))
}

/// Encode BL (T1).
pub fn encode_thumb_bl(displacement: i32) -> Option<(u16, u16)> {
    if displacement & 1 != 0 || !fits(displacement, 25) {
        return None;
    }
    let (hw1, hw2) = t4_fields(displacement);
    Some((0xf000 | hw1, 0xd000 | hw2))
}

/// Encode BLX immediate (T2).
pub fn encode_thumb_blx(displacement: i32) -> Option<(u16, u16)> {
    if displacement & 3 != 0 || !fits(displacement, 25) {
        return None;
    }
    let (hw1, hw2) = t4_fields(displacement);
    Some((0xf000 | hw1, 0xc000 | hw2))
}

// =============================================================================
// Destinations
// =============================================================================

/// Value PC reads as when executing at `addr`.
#[inline]
pub const fn pc_value(addr: u32, isa: Isa) -> u32 {
    match isa {
        Isa::Arm => addr.wrapping_add(8),
        Isa::Thumb => addr.wrapping_add(4),
    }
}

/// Interworking destination of an immediate branch executed at `addr`.
pub fn destination(addr: u32, isa: Isa, info: &BranchInfo) -> u32 {
    let pc = pc_value(addr, isa);
    match (isa, info.kind) {
        // A32 -> Thumb
        (Isa::Arm, BranchKind::LinkExchange) => pc.wrapping_add(info.displacement as u32) | 1,
        (Isa::Arm, _) => pc.wrapping_add(info.displacement as u32) & !3,
        // Thumb -> A32
        (Isa::Thumb, BranchKind::LinkExchange) => (pc & !3).wrapping_add(info.displacement as u32),
        (Isa::Thumb, _) => pc.wrapping_add(info.displacement as u32) | 1,
    }
}
