use crate::TranslateError;
use vmx86_mem::{AddressSpace, MemoryFault};
use vmx86_x86::{DecodeMode, DecodedInst, InstKind, MAX_INSTRUCTION_LEN};

/// Ceilings for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub max_insts: usize,
    pub max_bytes: usize,
}

impl Default for BlockLimits {
    fn default() -> Self {
        Self {
            max_insts: 64,
            max_bytes: 1024,
        }
    }
}

/// Where instruction bytes come from.
pub trait CodeSource {
    /// Copy up to `buf.len()` executable bytes starting at `rip` and return how many were
    /// copied. Fails only if not even the byte at `rip` can be fetched.
    fn fetch(&mut self, rip: u64, buf: &mut [u8]) -> Result<usize, MemoryFault>;
}

impl CodeSource for &AddressSpace {
    fn fetch(&mut self, rip: u64, buf: &mut [u8]) -> Result<usize, MemoryFault> {
        (**self).fetch(rip, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEndKind {
    /// The last instruction transfers control.
    Terminator,
    InstLimit,
    ByteLimit,
    /// The next instruction could not be fetched, decoded or lowered. It will start its own
    /// block, where the failure is reported.
    Stop { rip: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub entry: u64,
    pub insts: Vec<DecodedInst>,
    pub end_kind: BlockEndKind,
}

impl BasicBlock {
    /// One past the last byte of the last instruction.
    pub fn end(&self) -> u64 {
        self.insts
            .last()
            .map(DecodedInst::next_rip)
            .unwrap_or(self.entry)
    }
}

/// Decode straight-line instructions from `entry` until a control transfer or a ceiling.
///
/// A failure at `entry` itself is an error; a failure later just ends the block in front of
/// the offending instruction.
pub fn discover_block<S: CodeSource + ?Sized>(
    src: &mut S,
    entry: u64,
    mode: DecodeMode,
    limits: BlockLimits,
) -> Result<BasicBlock, TranslateError> {
    let mut insts = Vec::new();
    let mut rip = entry;
    let mut buf = [0u8; MAX_INSTRUCTION_LEN];

    let end_kind = loop {
        if insts.len() >= limits.max_insts.max(1) {
            break BlockEndKind::InstLimit;
        }
        if !insts.is_empty() && rip.wrapping_sub(entry) as usize >= limits.max_bytes {
            break BlockEndKind::ByteLimit;
        }

        let step = fetch_and_decode(src, rip, mode, &mut buf);
        let inst = match step {
            Ok(inst) => inst,
            Err(err) if insts.is_empty() => return Err(err),
            Err(_) => break BlockEndKind::Stop { rip },
        };

        let terminates = inst.is_block_terminator();
        rip = inst.next_rip();
        insts.push(inst);
        if terminates {
            break BlockEndKind::Terminator;
        }
    };

    Ok(BasicBlock {
        entry,
        insts,
        end_kind,
    })
}

fn fetch_and_decode<S: CodeSource + ?Sized>(
    src: &mut S,
    rip: u64,
    mode: DecodeMode,
    buf: &mut [u8; MAX_INSTRUCTION_LEN],
) -> Result<DecodedInst, TranslateError> {
    let n = src.fetch(rip, buf)?;
    let inst = vmx86_x86::decode(mode, rip, &buf[..n])?;
    if let InstKind::Unsupported(mnemonic) = inst.kind {
        return Err(TranslateError::Unsupported { rip, mnemonic });
    }
    Ok(inst)
}
