//! Peephole Cleanup
//!
//! Local, single-pass rewrites on the laid-out, register-allocated IR before
//! byte emission: self-moves disappear, branches to the next block disappear,
//! branches through a block that only branches again are retargeted, and
//! blocks that end up unreachable are dropped. Every rewrite deletes or
//! retargets; committed register assignments are never touched.

use crate::ir::{IrFunction, IrOp, Label, Operand};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// Apply all peephole rewrites; returns the number of changes for the stage
/// event.
pub fn peephole(ir: &mut IrFunction) -> u32 {
    let mut changes = 0;
    changes += retarget_branch_chains(ir);
    changes += remove_branches_to_next(ir);
    changes += remove_redundant_moves(ir);
    changes += remove_unreachable_blocks(ir);
    changes
}

/// `mov xN, xN` does nothing
fn remove_redundant_moves(ir: &mut IrFunction) -> u32 {
    let mut removed = 0;
    for block in &mut ir.blocks {
        block.instrs.retain(|instr| {
            let redundant = instr.op == IrOp::Mov
                && matches!(
                    (&instr.operands[0], &instr.operands[1]),
                    (Operand::Phys(dst), Operand::Phys(src)) if dst == src
                );
            if redundant {
                removed += 1;
            }
            !redundant
        });
    }
    removed
}

/// A branch whose target is the very next block falls through anyway
fn remove_branches_to_next(ir: &mut IrFunction) -> u32 {
    let mut removed = 0;
    for index in 0..ir.blocks.len() {
        let Some(next_label) = ir.blocks.get(index + 1).map(|block| block.label) else {
            continue;
        };
        let block = &mut ir.blocks[index];
        while let Some(last) = block.instrs.last() {
            if last.op.is_branch() && last.branch_target() == Some(next_label) {
                block.instrs.pop();
                removed += 1;
            } else {
                break;
            }
        }
    }
    removed
}

/// Branches into a block that immediately branches again jump straight to
/// the final destination
fn retarget_branch_chains(ir: &mut IrFunction) -> u32 {
    // Blocks consisting of a single unconditional branch forward their target
    let mut forward: HashMap<Label, Label> = HashMap::default();
    for block in &ir.blocks {
        if block.instrs.len() == 1 && block.instrs[0].op == IrOp::B {
            if let Some(target) = block.instrs[0].branch_target() {
                if target != block.label {
                    forward.insert(block.label, target);
                }
            }
        }
    }
    if forward.is_empty() {
        return 0;
    }

    let resolve = |label: Label| -> Label {
        let mut seen: HashSet<Label> = HashSet::default();
        let mut current = label;
        while let Some(next) = forward.get(&current) {
            if !seen.insert(current) {
                break; // branch cycle, leave as-is
            }
            current = *next;
        }
        current
    };

    let mut retargeted = 0;
    for block in &mut ir.blocks {
        for instr in &mut block.instrs {
            if let Some(target) = instr.branch_target() {
                let resolved = resolve(target);
                if resolved != target {
                    instr.set_branch_target(resolved);
                    retargeted += 1;
                }
            }
        }
    }
    retargeted
}

/// Drop blocks that nothing branches to and nothing falls into
fn remove_unreachable_blocks(ir: &mut IrFunction) -> u32 {
    let mut removed = 0;
    loop {
        let referenced: HashSet<Label> = ir
            .instrs()
            .filter_map(|instr| instr.branch_target())
            .collect();
        let mut dead: Option<usize> = None;
        for index in 1..ir.blocks.len() {
            let reachable = referenced.contains(&ir.blocks[index].label)
                || ir.blocks[index - 1].has_fall_through();
            if !reachable {
                dead = Some(index);
                break;
            }
        }
        match dead {
            Some(index) => {
                ir.blocks.remove(index);
                removed += 1;
            }
            None => break,
        }
    }
    removed
}
