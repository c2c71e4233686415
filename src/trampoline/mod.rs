//! Out-of-line trampolines.
//!
//! A trampoline is a short, position-independent code sequence that performs
//! the effect of one displaced instruction and then continues at the
//! instruction after the probed site. It is synthesized without knowing where
//! it will live; only its entry offsets are needed once a slot is assigned.

pub mod synth;
pub mod template;

use core::fmt;

use crate::insn::{Cond, Isa};
use crate::insn_slot::SLOT_SIZE;

pub use synth::{SynthOptions, pc_bias, synthesize};

/// Template family a trampoline was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Simple,
    PcRead,
    PcWrite,
    Branch,
    Link,
    LinkRegister,
    StorePc,
}

/// Call-like instruction information needed by return probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub cond: Cond,
    /// Interworking address the call would return to.
    pub return_addr: u32,
}

/// A synthesized trampoline with its typed layout.
#[derive(Clone)]
pub struct Trampoline {
    buf: [u8; SLOT_SIZE],
    len: usize,
    pub isa: Isa,
    pub kind: TemplateKind,
    /// Byte offset of the entry point (just past the breakpoint slot).
    pub entry: u32,
    /// Byte offset of the entry that loads the hijack address into LR.
    pub hijack_entry: Option<u32>,
    pub link: Option<LinkInfo>,
}

impl Trampoline {
    pub(crate) fn from_words(kind: TemplateKind, words: &[u32]) -> Self {
        let mut buf = [0u8; SLOT_SIZE];
        for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self {
            buf,
            len: words.len() * 4,
            isa: Isa::Arm,
            kind,
            entry: 4,
            hijack_entry: None,
            link: None,
        }
    }

    pub(crate) fn from_halfwords(kind: TemplateKind, halfwords: &[u16]) -> Self {
        let mut buf = [0u8; SLOT_SIZE];
        for (chunk, hw) in buf.chunks_exact_mut(2).zip(halfwords) {
            chunk.copy_from_slice(&hw.to_le_bytes());
        }
        Self {
            buf,
            len: halfwords.len() * 2,
            isa: Isa::Thumb,
            kind,
            entry: 2,
            hijack_entry: None,
            link: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of the trampoline breakpoint slot.
    pub fn breakpoint(&self) -> u32 {
        0
    }

    /// Interworking address of the entry point once placed at `base`.
    pub fn entry_addr(&self, base: u32) -> u32 {
        self.interworking(base + self.entry)
    }

    /// Interworking address of the hijack entry once placed at `base`.
    pub fn hijack_addr(&self, base: u32) -> Option<u32> {
        self.hijack_entry.map(|off| self.interworking(base + off))
    }

    fn interworking(&self, addr: u32) -> u32 {
        match self.isa {
            Isa::Arm => addr,
            Isa::Thumb => addr | 1,
        }
    }

    pub fn word(&self, index: usize) -> u32 {
        let off = index * 4;
        u32::from_le_bytes([
            self.buf[off],
            self.buf[off + 1],
            self.buf[off + 2],
            self.buf[off + 3],
        ])
    }

    pub(crate) fn set_word(&mut self, index: usize, word: u32) {
        let off = index * 4;
        self.buf[off..off + 4].copy_from_slice(&word.to_le_bytes());
    }

    pub(crate) fn or_word(&mut self, index: usize, bits: u32) {
        let word = self.word(index);
        self.set_word(index, word | bits);
    }

    pub fn halfword(&self, index: usize) -> u16 {
        let off = index * 2;
        u16::from_le_bytes([self.buf[off], self.buf[off + 1]])
    }

    pub(crate) fn set_halfword(&mut self, index: usize, hw: u16) {
        let off = index * 2;
        self.buf[off..off + 2].copy_from_slice(&hw.to_le_bytes());
    }

    pub(crate) fn or_halfword(&mut self, index: usize, bits: u16) {
        let hw = self.halfword(index);
        self.set_halfword(index, hw | bits);
    }

    /// Store a 32-bit literal at half-word index `index` (low half first).
    pub(crate) fn set_literal(&mut self, index: usize, value: u32) {
        self.set_halfword(index, value as u16);
        self.set_halfword(index + 1, (value >> 16) as u16);
    }

    pub fn literal(&self, index: usize) -> u32 {
        self.halfword(index) as u32 | (self.halfword(index + 1) as u32) << 16
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("isa", &self.isa)
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("entry", &self.entry)
            .field("hijack_entry", &self.hijack_entry)
            .field("link", &self.link)
            .finish()
    }
}
