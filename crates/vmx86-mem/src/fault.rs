use crate::region::Prot;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    pub fn required(self) -> Prot {
        match self {
            Access::Read => Prot::READ,
            Access::Write => Prot::WRITE,
            Access::Execute => Prot::EXEC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No region covers the faulting byte.
    Unmapped,
    /// A region covers the byte but does not grant `required`.
    Protection { required: Prot, actual: Prot },
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Unmapped => f.write_str("unmapped"),
            FaultKind::Protection { required, actual } => {
                write!(
                    f,
                    "protection (need {}, have {})",
                    required.letters(),
                    actual.letters()
                )
            }
        }
    }
}

/// A guest access that could not be performed.
///
/// `addr` is the first byte of the access that is unmapped or lacks permission, which is not
/// necessarily the start of the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{kind} fault on {access:?} of {width} bytes at {addr:#x}")]
pub struct MemoryFault {
    pub addr: u64,
    pub width: usize,
    pub access: Access,
    pub kind: FaultKind,
}

impl MemoryFault {
    pub fn is_unmapped(&self) -> bool {
        self.kind == FaultKind::Unmapped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("mapping length must be non-zero")]
    ZeroLength,
    #[error("address {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("range {start:#x}..{end:#x} lies outside the user address space")]
    OutOfRange { start: u64, end: u64 },
    #[error("range {start:#x}..{end:#x} overlaps an existing mapping")]
    Overlap { start: u64, end: u64 },
    #[error("no free range of {len:#x} bytes")]
    NoSpace { len: u64 },
    #[error("range {start:#x}..{end:#x} is not fully mapped")]
    NotMapped { start: u64, end: u64 },
}
