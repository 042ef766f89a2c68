//! Binding to the external x86 instruction decoder.
//!
//! The backend is `iced-x86`. Callers hand in a byte window (at most
//! [`MAX_INSTRUCTION_LEN`] bytes are consulted) together with the operating mode and get back
//! either the decoded instruction plus a summary of its legacy/REX prefixes, or a
//! [`DecodeError`]. No state is kept between calls.

use iced_x86::{Decoder, DecoderError, DecoderOptions};

pub use iced_x86::{Code, Instruction, MemorySize, Mnemonic, OpKind, Register};

/// Architectural upper bound on the encoded length of one instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeMode {
    Bits32,
    Bits64,
}

impl DecodeMode {
    #[inline]
    pub const fn bitness(self) -> u32 {
        match self {
            DecodeMode::Bits32 => 32,
            DecodeMode::Bits64 => 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no instruction bytes available")]
    EmptyInput,
    /// The instruction continues past the end of the supplied bytes.
    #[error("instruction truncated after {available} bytes")]
    Truncated { available: usize },
    #[error("invalid instruction encoding")]
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rex(pub u8);

impl Rex {
    #[inline]
    pub fn w(self) -> bool {
        self.0 & 0x08 != 0
    }
    #[inline]
    pub fn r(self) -> bool {
        self.0 & 0x04 != 0
    }
    #[inline]
    pub fn x(self) -> bool {
        self.0 & 0x02 != 0
    }
    #[inline]
    pub fn b(self) -> bool {
        self.0 & 0x01 != 0
    }
}

/// Prefix bytes observed in front of the opcode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: bool,
    pub repne: bool,
    /// Last segment override wins, matching hardware.
    pub segment: Option<Segment>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub rex: Option<Rex>,
}

#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    pub prefixes: Prefixes,
}

impl DecodedInstruction {
    #[inline]
    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instruction.len() == 0
    }
}

/// Decode exactly one instruction located at guest address `ip`.
pub fn decode_one(mode: DecodeMode, ip: u64, bytes: &[u8]) -> Result<DecodedInstruction, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyInput);
    }
    let window = &bytes[..bytes.len().min(MAX_INSTRUCTION_LEN)];

    let mut decoder = Decoder::with_ip(mode.bitness(), window, ip, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);

    match decoder.last_error() {
        DecoderError::None => {}
        DecoderError::NoMoreBytes => {
            return Err(DecodeError::Truncated {
                available: window.len(),
            })
        }
        _ => return Err(DecodeError::Invalid),
    }
    if instruction.is_invalid() {
        return Err(DecodeError::Invalid);
    }

    let prefixes = scan_prefixes(mode, &window[..instruction.len()]);
    Ok(DecodedInstruction {
        instruction,
        prefixes,
    })
}

fn scan_prefixes(mode: DecodeMode, bytes: &[u8]) -> Prefixes {
    let mut p = Prefixes::default();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            0xF0 => p.lock = true,
            0xF3 => {
                p.rep = true;
                p.repne = false;
            }
            0xF2 => {
                p.repne = true;
                p.rep = false;
            }
            0x26 => p.segment = Some(Segment::Es),
            0x2E => p.segment = Some(Segment::Cs),
            0x36 => p.segment = Some(Segment::Ss),
            0x3E => p.segment = Some(Segment::Ds),
            0x64 => p.segment = Some(Segment::Fs),
            0x65 => p.segment = Some(Segment::Gs),
            0x66 => p.operand_size_override = true,
            0x67 => p.address_size_override = true,
            _ => break,
        }
        i += 1;
    }

    // A REX byte only counts when it immediately precedes the opcode.
    if mode == DecodeMode::Bits64 {
        if let Some(&b) = bytes.get(i) {
            if (0x40..=0x4F).contains(&b) && i + 1 < bytes.len() {
                p.rex = Some(Rex(b));
            }
        }
    }
    p
}
