//! `cpuid` responses.
//!
//! Only features the interpreter actually implements are advertised; a guest that probes for
//! anything else falls back to its generic code paths.

/// A CPUID result tuple (EAX, EBX, ECX, EDX).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub mod bits {
    pub const LEAF1_EDX_TSC: u32 = 1 << 4;
    pub const LEAF1_EDX_CX8: u32 = 1 << 8;
    pub const LEAF1_EDX_CMOV: u32 = 1 << 15;

    pub const EXT1_EDX_SYSCALL: u32 = 1 << 11;
    pub const EXT1_EDX_LM: u32 = 1 << 29;
}

pub const MAX_BASIC_LEAF: u32 = 7;
pub const MAX_EXTENDED_LEAF: u32 = 0x8000_0004;

/// Family 6, model 0x3A, stepping 9.
const LEAF1_SIGNATURE: u32 = 0x0003_06A9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuidTable {
    vendor: [u8; 12],
    brand: [u8; 48],
}

impl CpuidTable {
    /// `vendor` is truncated or zero-padded to 12 bytes, `brand` to 48.
    pub fn new(vendor: &str, brand: &str) -> Self {
        let mut v = [0u8; 12];
        let n = vendor.len().min(12);
        v[..n].copy_from_slice(&vendor.as_bytes()[..n]);
        let mut b = [0u8; 48];
        // Leave room for the terminating NUL.
        let n = brand.len().min(47);
        b[..n].copy_from_slice(&brand.as_bytes()[..n]);
        Self {
            vendor: v,
            brand: b,
        }
    }

    pub fn query(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        match leaf {
            0 => CpuidResult {
                eax: MAX_BASIC_LEAF,
                ebx: word(&self.vendor, 0),
                edx: word(&self.vendor, 4),
                ecx: word(&self.vendor, 8),
            },
            1 => CpuidResult {
                eax: LEAF1_SIGNATURE,
                ebx: 0,
                ecx: 0,
                edx: bits::LEAF1_EDX_TSC | bits::LEAF1_EDX_CX8 | bits::LEAF1_EDX_CMOV,
            },
            0x8000_0000 => CpuidResult {
                eax: MAX_EXTENDED_LEAF,
                ..CpuidResult::default()
            },
            0x8000_0001 => CpuidResult {
                edx: bits::EXT1_EDX_SYSCALL | bits::EXT1_EDX_LM,
                ..CpuidResult::default()
            },
            0x8000_0002..=0x8000_0004 => {
                let base = ((leaf - 0x8000_0002) * 16) as usize;
                CpuidResult {
                    eax: word(&self.brand, base),
                    ebx: word(&self.brand, base + 4),
                    ecx: word(&self.brand, base + 8),
                    edx: word(&self.brand, base + 12),
                }
            }
            _ => CpuidResult::default(),
        }
    }
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
