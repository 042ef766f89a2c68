use core::fmt;
use vmx86_types::{Gpr, Width};

/// A general-purpose register viewed at some width.
///
/// `high8` selects the legacy `AH`/`CH`/`DH`/`BH` byte; it is only ever set for
/// `Width::W8` on the first four registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub gpr: Gpr,
    pub width: Width,
    pub high8: bool,
}

impl Reg {
    pub const fn new(gpr: Gpr, width: Width) -> Self {
        Self {
            gpr,
            width,
            high8: false,
        }
    }

    pub const fn high8(gpr: Gpr) -> Self {
        Self {
            gpr,
            width: Width::W8,
            high8: true,
        }
    }
}

const NAMES_8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
const NAMES_8H: [&str; 4] = ["ah", "ch", "dh", "bh"];
const NAMES_16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
const NAMES_32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idx = self.gpr.index();
        match self.width {
            Width::W8 if self.high8 => f.write_str(NAMES_8H.get(idx).copied().unwrap_or("??")),
            Width::W8 => f.write_str(NAMES_8[idx]),
            Width::W16 => f.write_str(NAMES_16[idx]),
            Width::W32 => f.write_str(NAMES_32[idx]),
            Width::W64 => write!(f, "{}", self.gpr),
        }
    }
}

/// Segment whose base participates in address generation. Every other segment is flat in
/// 64-bit user mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegBase {
    Fs,
    Gs,
}

/// A memory reference: `seg:[base + index*scale + disp]`, wrapped to `addr_width`.
///
/// For RIP-relative operands the decoder already folded the instruction's end address into
/// `disp`, so `disp` is the absolute target and `base`/`index` are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub seg: Option<SegBase>,
    pub base: Option<Gpr>,
    pub index: Option<Gpr>,
    pub scale: u8,
    pub disp: u64,
    pub rip_relative: bool,
    pub addr_width: Width,
}

impl Address {
    /// Absolute address without any register or segment components.
    pub const fn absolute(addr: u64) -> Self {
        Self {
            seg: None,
            base: None,
            index: None,
            scale: 1,
            disp: addr,
            rip_relative: false,
            addr_width: Width::W64,
        }
    }

    pub const fn base_disp(base: Gpr, disp: i64) -> Self {
        Self {
            seg: None,
            base: Some(base),
            index: None,
            scale: 1,
            disp: disp as u64,
            rip_relative: false,
            addr_width: Width::W64,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.seg {
            Some(SegBase::Fs) => f.write_str("fs:")?,
            Some(SegBase::Gs) => f.write_str("gs:")?,
            None => {}
        }
        f.write_str("[")?;
        if self.rip_relative {
            write!(f, "rip->0x{:x}", self.disp)?;
            return f.write_str("]");
        }
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", Reg::new(base, self.addr_width))?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}", Reg::new(index, self.addr_width))?;
            if self.scale != 1 {
                write!(f, "*{}", self.scale)?;
            }
            first = false;
        }
        let disp = self.addr_width.sign_extend(self.disp) as i64;
        if disp != 0 || first {
            if first {
                write!(f, "0x{:x}", self.addr_width.truncate(self.disp))?;
            } else if disp < 0 {
                write!(f, "-0x{:x}", disp.unsigned_abs())?;
            } else {
                write!(f, "+0x{disp:x}")?;
            }
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg),
    /// Immediate as the decoder reports it: already sign-extended to 64 bits where the
    /// encoding calls for it. Consumers truncate to the operation width.
    Imm(u64),
    Mem(Address),
}

impl Operand {
    pub fn as_mem(&self) -> Option<&Address> {
        match self {
            Operand::Mem(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{r}"),
            Operand::Imm(v) => write!(f, "0x{v:x}"),
            Operand::Mem(addr) => write!(f, "{addr}"),
        }
    }
}
