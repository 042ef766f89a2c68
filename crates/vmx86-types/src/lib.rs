//! Architectural vocabulary shared by the decoder, the translator and the CPU core.

use core::fmt;
use serde::{Deserialize, Serialize};

pub const RFLAGS_CF: u64 = 1 << 0;
pub const RFLAGS_RESERVED1: u64 = 1 << 1;
pub const RFLAGS_PF: u64 = 1 << 2;
pub const RFLAGS_AF: u64 = 1 << 4;
pub const RFLAGS_ZF: u64 = 1 << 6;
pub const RFLAGS_SF: u64 = 1 << 7;
pub const RFLAGS_TF: u64 = 1 << 8;
pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;
pub const RFLAGS_OF: u64 = 1 << 11;

/// The status flags arithmetic instructions can write.
pub const RFLAGS_STATUS_MASK: u64 =
    RFLAGS_CF | RFLAGS_PF | RFLAGS_AF | RFLAGS_ZF | RFLAGS_SF | RFLAGS_OF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_u4(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[inline]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub const fn from_bytes(bytes: usize) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            8 => Some(Width::W64),
            _ => None,
        }
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    #[inline]
    pub const fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    #[inline]
    pub const fn truncate(self, v: u64) -> u64 {
        v & self.mask()
    }

    #[inline]
    pub const fn sign_extend(self, v: u64) -> u64 {
        let shift = 64 - self.bits();
        (((v << shift) as i64) >> shift) as u64
    }

    /// Mask applied to shift and rotate counts.
    #[inline]
    pub const fn shift_count_mask(self) -> u64 {
        match self {
            Width::W64 => 0x3f,
            _ => 0x1f,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// x86 condition codes, numbered as in the `Jcc`/`SETcc`/`CMOVcc` opcode low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn from_cc(cc: u8) -> Option<Self> {
        Some(match cc & 0x0f {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Ae,
            0x4 => Cond::E,
            0x5 => Cond::Ne,
            0x6 => Cond::Be,
            0x7 => Cond::A,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Ge,
            0xE => Cond::Le,
            0xF => Cond::G,
            _ => return None,
        })
    }

    pub fn invert(self) -> Self {
        // Conditions come in (cc, cc ^ 1) pairs.
        match Cond::from_cc(self as u8 ^ 1) {
            Some(c) => c,
            None => self,
        }
    }

    /// Flags read when evaluating this condition.
    pub fn reads(self) -> FlagSet {
        match self {
            Cond::O | Cond::No => FlagSet::OF,
            Cond::B | Cond::Ae => FlagSet::CF,
            Cond::E | Cond::Ne => FlagSet::ZF,
            Cond::Be | Cond::A => FlagSet::CF | FlagSet::ZF,
            Cond::S | Cond::Ns => FlagSet::SF,
            Cond::P | Cond::Np => FlagSet::PF,
            Cond::L | Cond::Ge => FlagSet::SF | FlagSet::OF,
            Cond::Le | Cond::G => FlagSet::ZF | FlagSet::SF | FlagSet::OF,
        }
    }

    /// Evaluate against an `RFLAGS` image.
    pub fn eval(self, rflags: u64) -> bool {
        let cf = rflags & RFLAGS_CF != 0;
        let pf = rflags & RFLAGS_PF != 0;
        let zf = rflags & RFLAGS_ZF != 0;
        let sf = rflags & RFLAGS_SF != 0;
        let of = rflags & RFLAGS_OF != 0;
        match self {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Ae => !cf,
            Cond::E => zf,
            Cond::Ne => !zf,
            Cond::Be => cf || zf,
            Cond::A => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Ge => sf == of,
            Cond::Le => zf || (sf != of),
            Cond::G => !zf && (sf == of),
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Ae => "ae",
            Cond::E => "e",
            Cond::Ne => "ne",
            Cond::Be => "be",
            Cond::A => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Ge => "ge",
            Cond::Le => "le",
            Cond::G => "g",
        }
    }
}

/// A single architectural flag the translator models individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Df,
    Of,
}

impl Flag {
    #[inline]
    pub const fn rflags_bit(self) -> u64 {
        match self {
            Flag::Cf => RFLAGS_CF,
            Flag::Pf => RFLAGS_PF,
            Flag::Af => RFLAGS_AF,
            Flag::Zf => RFLAGS_ZF,
            Flag::Sf => RFLAGS_SF,
            Flag::Df => RFLAGS_DF,
            Flag::Of => RFLAGS_OF,
        }
    }

    pub fn as_set(self) -> FlagSet {
        FlagSet::from_bits_truncate(self.rflags_bit())
    }
}

bitflags::bitflags! {
    /// A set of flags, laid out with the same bit positions as `RFLAGS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlagSet: u64 {
        const CF = RFLAGS_CF;
        const PF = RFLAGS_PF;
        const AF = RFLAGS_AF;
        const ZF = RFLAGS_ZF;
        const SF = RFLAGS_SF;
        const DF = RFLAGS_DF;
        const OF = RFLAGS_OF;

        const STATUS = RFLAGS_STATUS_MASK;
        /// Everything arithmetic writes except `CF` (`inc`/`dec`).
        const STATUS_NO_CF = RFLAGS_STATUS_MASK & !RFLAGS_CF;
    }
}

/// Even parity of the low byte, as reported by `PF`.
#[inline]
pub fn parity_even(v: u64) -> bool {
    (v as u8).count_ones() % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_sign_extend_and_mask() {
        assert_eq!(Width::W8.sign_extend(0x80), 0xffff_ffff_ffff_ff80);
        assert_eq!(Width::W16.sign_extend(0x7fff), 0x7fff);
        assert_eq!(Width::W32.mask(), 0xffff_ffff);
        assert_eq!(Width::W64.sign_extend(0x8000_0000_0000_0000), 0x8000_0000_0000_0000);
        assert_eq!(Width::from_bytes(4), Some(Width::W32));
        assert_eq!(Width::from_bytes(3), None);
    }

    #[test]
    fn cond_pairs_invert() {
        for cc in 0..16u8 {
            let c = Cond::from_cc(cc).unwrap();
            assert_eq!(c.invert().invert(), c);
            for flags in [0, RFLAGS_CF, RFLAGS_ZF | RFLAGS_SF, RFLAGS_OF, RFLAGS_STATUS_MASK] {
                assert_ne!(c.eval(flags), c.invert().eval(flags));
            }
        }
    }

    #[test]
    fn signed_conditions() {
        // SF != OF means "less".
        assert!(Cond::L.eval(RFLAGS_SF));
        assert!(!Cond::L.eval(RFLAGS_SF | RFLAGS_OF));
        assert!(Cond::Le.eval(RFLAGS_ZF));
        assert!(Cond::G.eval(0));
    }

    #[test]
    fn flagset_matches_rflags_layout() {
        assert_eq!(FlagSet::CF.bits(), RFLAGS_CF);
        assert_eq!(FlagSet::STATUS.bits(), RFLAGS_STATUS_MASK);
        assert!(!FlagSet::STATUS_NO_CF.contains(FlagSet::CF));
        assert_eq!(Flag::Df.as_set(), FlagSet::DF);
    }

    #[test]
    fn parity() {
        assert!(parity_even(0));
        assert!(!parity_even(1));
        assert!(parity_even(0x103));
    }
}
