//! Captured register state handed to probe handlers.

/// Thumb execution state bit in CPSR.
pub const CPSR_T: u32 = 1 << 5;
pub const CPSR_N: u32 = 1 << 31;
pub const CPSR_Z: u32 = 1 << 30;
pub const CPSR_C: u32 = 1 << 29;
pub const CPSR_V: u32 = 1 << 28;

pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;

/// AArch32 register frame as saved by the exception entry code.
///
/// `regs[15]` is the address of the trapping instruction, not the pipeline-visible PC.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtRegs {
    pub regs: [u32; 16],
    pub cpsr: u32,
}

impl PtRegs {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.regs[PC]
    }

    #[inline]
    pub fn set_pc(&mut self, pc: u32) {
        self.regs[PC] = pc;
    }

    #[inline]
    pub fn sp(&self) -> u32 {
        self.regs[SP]
    }

    #[inline]
    pub fn lr(&self) -> u32 {
        self.regs[LR]
    }

    #[inline]
    pub fn set_lr(&mut self, lr: u32) {
        self.regs[LR] = lr;
    }

    /// Argument or return-value register (r0-r3).
    #[inline]
    pub fn arg(&self, idx: usize) -> u32 {
        if idx < 4 { self.regs[idx] } else { 0 }
    }

    #[inline]
    pub fn is_thumb(&self) -> bool {
        self.cpsr & CPSR_T != 0
    }

    #[inline]
    pub fn set_thumb(&mut self, thumb: bool) {
        if thumb {
            self.cpsr |= CPSR_T;
        } else {
            self.cpsr &= !CPSR_T;
        }
    }

    /// Jump to an interworking address: bit 0 selects Thumb state.
    pub fn branch_exchange(&mut self, target: u32) {
        self.set_thumb(target & 1 != 0);
        self.set_pc(target & !1);
    }

    /// Interworking form of the current PC (bit 0 set in Thumb state).
    pub fn pc_interworking(&self) -> u32 {
        self.pc() | self.is_thumb() as u32
    }

    /// Thumb IT execution state, IT[7:2] from CPSR[15:10] and IT[1:0] from CPSR[26:25].
    #[inline]
    pub fn itstate(&self) -> u8 {
        (((self.cpsr >> 25) & 0x3) | ((self.cpsr >> 8) & 0xfc)) as u8
    }

    #[inline]
    pub fn set_itstate(&mut self, it: u8) {
        let it = it as u32;
        self.cpsr = (self.cpsr & !CPSR_IT_MASK) | ((it & 0x3) << 25) | ((it & 0xfc) << 8);
    }
}

const CPSR_IT_MASK: u32 = (0x3 << 25) | (0x3f << 10);

/// ITSTATE after the current instruction of an IT block has executed.
pub fn it_advance(it: u8) -> u8 {
    if it & 0x7 == 0 {
        0
    } else {
        (it & 0xe0) | ((it << 1) & 0x1f)
    }
}
