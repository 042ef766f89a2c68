use crate::ir::{Block, IrInst};
use vmx86_types::FlagSet;

/// Narrow flag updates to the flags some later reader can observe, and drop updates nobody
/// observes. Returns true if anything changed.
///
/// Every block exit observes all flags, and so does every operation that can fault, since a
/// signal handler sees the flags as of the faulting instruction. Shift and rotate updates are
/// conditional on a non-zero count, so they never end a flag's live range.
pub fn run(block: &mut Block) -> bool {
    let mut changed = false;
    let mut live = FlagSet::all();

    for inst in block.insts.iter_mut().rev() {
        if inst.is_fallible() {
            live = FlagSet::all();
        }

        let killed = inst.flags_killed();
        if let IrInst::Flags { mask, .. } = inst {
            let needed = *mask & live;
            if needed != *mask {
                *mask = needed;
                changed = true;
            }
        }
        live.remove(killed);
        live |= inst.flags_read();
    }

    if changed {
        block
            .insts
            .retain(|inst| !matches!(inst, IrInst::Flags { mask, .. } if mask.is_empty()));
    }
    changed
}
