//! Block Layout
//!
//! Linearizes the block list for encoding: helper blocks (bailout and other
//! infrequently executed paths) are pushed behind the main body so the fast
//! path runs straight through, trivial fall-through chains are merged, and
//! every block that no longer falls into its original successor gets an
//! explicit jump. Each relocated block keeps the statement index it was
//! created from, so diagnostics still map back to source.
//!
//! Branch offsets are not computed here; the encoder resolves them after the
//! final order is known.

use crate::ir::{IrFunction, IrInstr, IrOp, Label, Operand};
use rustc_hash::FxHashMap as HashMap;

pub fn layout(ir: &mut IrFunction) {
    // Remember where control went before reordering
    let fall_through: HashMap<Label, Option<Label>> = ir
        .blocks
        .iter()
        .enumerate()
        .map(|(index, block)| {
            let successor = if block.has_fall_through() {
                ir.blocks.get(index + 1).map(|next| next.label)
            } else {
                None
            };
            (block.label, successor)
        })
        .collect();

    // Helper blocks move to the end, in encounter order
    let blocks = std::mem::take(&mut ir.blocks);
    let (helpers, mut main): (Vec<_>, Vec<_>) =
        blocks.into_iter().partition(|block| block.is_helper);
    main.extend(helpers);
    ir.blocks = main;

    // Compensate broken fall-through edges with explicit jumps
    for index in 0..ir.blocks.len() {
        let label = ir.blocks[index].label;
        let Some(Some(successor)) = fall_through.get(&label).copied() else {
            continue;
        };
        let next_label = ir.blocks.get(index + 1).map(|next| next.label);
        if next_label != Some(successor) {
            let statement = ir.blocks[index].statement;
            ir.blocks[index].instrs.push(
                IrInstr::new(IrOp::B, vec![Operand::Label(successor)]).with_statement(statement),
            );
        }
    }

    merge_fall_through_chains(ir);
}

/// Merge a block into its predecessor when the predecessor falls straight
/// into it and nothing else branches to it.
fn merge_fall_through_chains(ir: &mut IrFunction) {
    let mut referenced: HashMap<Label, u32> = HashMap::default();
    for instr in ir.instrs() {
        if let Some(target) = instr.branch_target() {
            *referenced.entry(target).or_insert(0) += 1;
        }
    }

    let mut merged: Vec<crate::ir::IrBlock> = Vec::with_capacity(ir.blocks.len());
    for block in ir.blocks.drain(..) {
        let unreferenced = referenced.get(&block.label).copied().unwrap_or(0) == 0;
        let mergeable = !merged.is_empty()
            && unreferenced
            && !block.is_helper
            && merged
                .last()
                .map(|prev: &crate::ir::IrBlock| prev.has_fall_through() && !prev.is_helper)
                .unwrap_or(false);
        if mergeable {
            let prev = merged.last_mut().unwrap();
            prev.instrs.extend(block.instrs);
        } else {
            merged.push(block);
        }
    }
    ir.blocks = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build_ir;
    use crate::snapshot::{capture, BodyData, BodyOp, FixedFieldInfo, FunctionId, FunctionProfile};

    fn guarded_ir() -> IrFunction {
        let mut body = BodyData::new(
            vec![
                BodyOp::GuardFixedField { local: 0, field_index: 0 },
                BodyOp::Add { dst: 0, lhs: 0, rhs: 0 },
                BodyOp::Return { src: 0 },
            ],
            1,
        );
        body.statement_map = vec![(0, 1), (1, 2)];
        let profile = FunctionProfile::new(FunctionId(1), body);
        profile.record_fixed_field(FixedFieldInfo::constant(42));
        build_ir(&capture(&profile).unwrap(), false).unwrap()
    }

    #[test]
    fn test_helper_blocks_move_to_the_end() {
        let mut ir = guarded_ir();
        layout(&mut ir);
        let last = ir.blocks.last().unwrap();
        assert!(last.is_helper);
        // Everything before the helpers is main-path code
        let first_helper = ir.blocks.iter().position(|block| block.is_helper).unwrap();
        assert!(ir.blocks[..first_helper].iter().all(|block| !block.is_helper));
    }

    #[test]
    fn test_relocated_helper_keeps_statement_index() {
        let mut ir = guarded_ir();
        let helper_statement = ir
            .blocks
            .iter()
            .find(|block| block.is_helper)
            .unwrap()
            .statement;
        layout(&mut ir);
        let moved = ir.blocks.iter().find(|block| block.is_helper).unwrap();
        assert_eq!(moved.statement, helper_statement);
        assert_eq!(moved.statement, Some(1));
    }

    #[test]
    fn test_broken_fall_through_gets_a_jump() {
        use crate::ir::{Cond, IrBlock};
        // Block 0 falls into helper block 1; block 2 holds the return.
        // Relocating the helper must insert an explicit jump to it.
        let mut entry = IrBlock::new(0);
        entry.instrs.push(
            IrInstr::new(IrOp::CmpImm, vec![Operand::Reg(0), Operand::Imm(0)]),
        );
        entry
            .instrs
            .push(IrInstr::new(IrOp::BCond, vec![Operand::Label(2)]).with_cond(Cond::Eq));
        let mut slow = IrBlock::new(1);
        slow.is_helper = true;
        slow.instrs
            .push(IrInstr::new(IrOp::Bailout, vec![Operand::Imm(0)]));
        let mut exit = IrBlock::new(2);
        exit.instrs
            .push(IrInstr::new(IrOp::Ret, vec![Operand::Reg(0)]));
        let mut ir = IrFunction {
            function: FunctionId(1),
            blocks: vec![entry, slow, exit],
            vreg_count: 1,
            spill_slot_count: 0,
        };

        layout(&mut ir);
        assert!(ir.blocks.last().unwrap().is_helper);
        // The entry block no longer falls into the helper, so it must end
        // with a jump to the helper's label.
        let entry = &ir.blocks[0];
        let last = entry.instrs.last().unwrap();
        assert_eq!(last.op, IrOp::B);
        assert_eq!(last.branch_target(), Some(1));
    }

    #[test]
    fn test_unreferenced_fall_through_blocks_merge() {
        let profile = FunctionProfile::new(
            FunctionId(1),
            BodyData::new(
                vec![
                    BodyOp::LoadConst { dst: 0, value: 1 },
                    BodyOp::Jump { target: 2 },
                    BodyOp::Add { dst: 0, lhs: 0, rhs: 0 },
                    BodyOp::Return { src: 0 },
                ],
                1,
            ),
        );
        let mut ir = build_ir(&capture(&profile).unwrap(), false).unwrap();
        let before = ir.blocks.len();
        layout(&mut ir);
        // The jump target is referenced so it stays; nothing spurious appears
        assert!(ir.blocks.len() <= before);
        assert!(ir.instrs().any(|instr| instr.op == IrOp::Ret));
    }
}
