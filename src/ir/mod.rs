//! Compiler Intermediate Representation
//!
//! The working representation owned by one compilation from IR build until
//! the artifact is finalized: an ordered list of basic blocks, each holding
//! instructions with an opcode, operand list, and source-statement metadata.
//!
//! [`build_ir`] lowers the portable body ops of a snapshot into this form,
//! turning fixed-field guard ops into compare-and-bail sequences whose
//! bailout blocks are marked as helper blocks for the layout stage.

use crate::error::{Error, Result};
use crate::snapshot::{CompareKind, FunctionId, FunctionSnapshot};
use rustc_hash::FxHashMap as HashMap;

/// Virtual register id
pub type VReg = u32;

/// Basic-block label
pub type Label = u32;

// ==================== Operands & Conditions ====================

/// Branch / set condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Le => Cond::Gt,
            Cond::Gt => Cond::Le,
            Cond::Ge => Cond::Lt,
        }
    }
}

impl From<CompareKind> for Cond {
    fn from(kind: CompareKind) -> Cond {
        match kind {
            CompareKind::Eq => Cond::Eq,
            CompareKind::Ne => Cond::Ne,
            CompareKind::Lt => Cond::Lt,
            CompareKind::Le => Cond::Le,
            CompareKind::Gt => Cond::Gt,
            CompareKind::Ge => Cond::Ge,
        }
    }
}

/// Instruction operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Virtual register, before allocation
    Reg(VReg),
    /// Physical register, after allocation
    Phys(u8),
    /// Stack spill slot, after allocation
    Spill(u16),
    Imm(i64),
    Label(Label),
}

impl Operand {
    pub fn is_def_position(op: IrOp, index: usize) -> bool {
        // By convention the destination is operand 0 for defining opcodes
        index == 0 && op.defines_dst()
    }
}

// ==================== Instructions ====================

/// IR opcode. Operand conventions, destination first:
///
/// `MovImm dst, imm` / `MovAddr dst, imm` (embedded heap value, relocated) /
/// `Mov dst, src` / `Add|Sub|Mul dst, lhs, rhs` /
/// `Cmp lhs, rhs` / `CmpImm lhs, imm` / `Cset dst` (uses `cond`) /
/// `B label` / `BCond label` (uses `cond`) / `Bailout imm` / `Ret src` /
/// `LdrSpill dst, slot` / `StrSpill src, slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrOp {
    MovImm,
    MovAddr,
    Mov,
    Add,
    Sub,
    Mul,
    Cmp,
    CmpImm,
    Cset,
    B,
    BCond,
    Bailout,
    Ret,
    LdrSpill,
    StrSpill,
}

impl IrOp {
    /// Whether operand 0 is written rather than read
    pub fn defines_dst(self) -> bool {
        matches!(
            self,
            IrOp::MovImm
                | IrOp::MovAddr
                | IrOp::Mov
                | IrOp::Add
                | IrOp::Sub
                | IrOp::Mul
                | IrOp::Cset
                | IrOp::LdrSpill
        )
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminal(self) -> bool {
        matches!(self, IrOp::B | IrOp::Ret | IrOp::Bailout)
    }

    pub fn is_branch(self) -> bool {
        matches!(self, IrOp::B | IrOp::BCond)
    }
}

/// One IR instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrInstr {
    pub op: IrOp,
    pub operands: Vec<Operand>,
    pub cond: Option<Cond>,
    /// Source statement index, for diagnostics
    pub statement: Option<u32>,
}

impl IrInstr {
    pub fn new(op: IrOp, operands: Vec<Operand>) -> Self {
        Self {
            op,
            operands,
            cond: None,
            statement: None,
        }
    }

    pub fn with_cond(mut self, cond: Cond) -> Self {
        self.cond = Some(cond);
        self
    }

    pub fn with_statement(mut self, statement: Option<u32>) -> Self {
        self.statement = statement;
        self
    }

    /// Branch target label, when this is a branch
    pub fn branch_target(&self) -> Option<Label> {
        if !self.op.is_branch() {
            return None;
        }
        self.operands.iter().find_map(|operand| match operand {
            Operand::Label(label) => Some(*label),
            _ => None,
        })
    }

    pub fn set_branch_target(&mut self, target: Label) {
        for operand in &mut self.operands {
            if let Operand::Label(_) = operand {
                *operand = Operand::Label(target);
            }
        }
    }
}

// ==================== Blocks & Function ====================

/// A basic block: straight-line instructions ending at a branch or terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrBlock {
    pub label: Label,
    /// Helper blocks hold infrequently executed bailout/slow paths and are
    /// relocated after the main body by the layout stage
    pub is_helper: bool,
    /// Statement index of the source position that created this block
    pub statement: Option<u32>,
    pub instrs: Vec<IrInstr>,
}

impl IrBlock {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            is_helper: false,
            statement: None,
            instrs: Vec::new(),
        }
    }

    /// Whether execution can run off the end of this block
    pub fn has_fall_through(&self) -> bool {
        self.instrs
            .last()
            .map_or(true, |instr| !instr.op.is_terminal())
    }
}

/// The IR for one function under compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunction {
    pub function: FunctionId,
    pub blocks: Vec<IrBlock>,
    pub vreg_count: u32,
    /// Filled in by the register allocator
    pub spill_slot_count: u16,
}

impl IrFunction {
    /// Iterate all instructions in block order
    pub fn instrs(&self) -> impl Iterator<Item = &IrInstr> {
        self.blocks.iter().flat_map(|block| block.instrs.iter())
    }

    pub fn block_by_label(&self, label: Label) -> Option<&IrBlock> {
        self.blocks.iter().find(|block| block.label == label)
    }
}

// ==================== IR Builder ====================

/// Largest value a compare-immediate can carry directly; anything wider goes
/// through a register
const CMP_IMM_MAX: u64 = 0xFFF;

/// Lower a snapshot's portable body into IR.
///
/// With `conservative_guards` set, the `next_has_same_field` forward links on
/// fixed-field records are ignored and every guard is emitted.
pub fn build_ir(snapshot: &FunctionSnapshot, conservative_guards: bool) -> Result<IrFunction> {
    let body = &snapshot.body;
    let fixed_fields = &snapshot.info.fixed_fields;

    // Pass 1: find block leaders (entry, branch targets, fall-through after
    // branches)
    let mut leaders = vec![0u32];
    for (index, op) in body.ops.iter().enumerate() {
        match op {
            crate::snapshot::BodyOp::BranchIfFalse { target, .. } => {
                leaders.push(*target);
                leaders.push(index as u32 + 1);
            }
            crate::snapshot::BodyOp::Jump { target } => {
                leaders.push(*target);
                leaders.push(index as u32 + 1);
            }
            _ => {}
        }
    }
    leaders.sort_unstable();
    leaders.dedup();
    leaders.retain(|leader| (*leader as usize) < body.ops.len());

    let mut label_of_op: HashMap<u32, Label> = HashMap::default();
    for (label, leader) in leaders.iter().enumerate() {
        label_of_op.insert(*leader, label as Label);
    }
    let mut next_label = leaders.len() as Label;

    let mut blocks: Vec<IrBlock> = Vec::new();
    let mut helper_blocks: Vec<IrBlock> = Vec::new();
    let mut current = IrBlock::new(0);
    current.statement = body.statement_for_op(0);

    let mut next_vreg = body.local_count as u32;
    let mut fresh_vreg = || {
        let vreg = next_vreg;
        next_vreg += 1;
        vreg
    };

    // Tracks the most recent guard so chained equivalent observations are
    // emitted once
    let mut last_guard: Option<(u16, u16)> = None;

    for (index, op) in body.ops.iter().enumerate() {
        let index = index as u32;
        if index != 0 {
            if let Some(label) = label_of_op.get(&index) {
                // Leader reached: close the current block
                blocks.push(std::mem::replace(&mut current, IrBlock::new(*label)));
                current.statement = body.statement_for_op(index);
                last_guard = None;
            }
        }
        let statement = body.statement_for_op(index);
        // Dedup only applies to uninterrupted guard runs; any other op may
        // clobber the guarded local.
        if !matches!(op, crate::snapshot::BodyOp::GuardFixedField { .. }) {
            last_guard = None;
        }
        match *op {
            crate::snapshot::BodyOp::LoadConst { dst, value } => {
                current.instrs.push(
                    IrInstr::new(
                        IrOp::MovImm,
                        vec![Operand::Reg(dst as VReg), Operand::Imm(value)],
                    )
                    .with_statement(statement),
                );
            }
            crate::snapshot::BodyOp::Move { dst, src } => {
                current.instrs.push(
                    IrInstr::new(
                        IrOp::Mov,
                        vec![Operand::Reg(dst as VReg), Operand::Reg(src as VReg)],
                    )
                    .with_statement(statement),
                );
            }
            crate::snapshot::BodyOp::Add { dst, lhs, rhs } => {
                current.instrs.push(arith(IrOp::Add, dst, lhs, rhs, statement));
            }
            crate::snapshot::BodyOp::Sub { dst, lhs, rhs } => {
                current.instrs.push(arith(IrOp::Sub, dst, lhs, rhs, statement));
            }
            crate::snapshot::BodyOp::Mul { dst, lhs, rhs } => {
                current.instrs.push(arith(IrOp::Mul, dst, lhs, rhs, statement));
            }
            crate::snapshot::BodyOp::Compare { dst, lhs, rhs, kind } => {
                current.instrs.push(
                    IrInstr::new(
                        IrOp::Cmp,
                        vec![Operand::Reg(lhs as VReg), Operand::Reg(rhs as VReg)],
                    )
                    .with_statement(statement),
                );
                current.instrs.push(
                    IrInstr::new(IrOp::Cset, vec![Operand::Reg(dst as VReg)])
                        .with_cond(kind.into())
                        .with_statement(statement),
                );
            }
            crate::snapshot::BodyOp::GuardFixedField { local, field_index } => {
                let record = fixed_fields.get(field_index as usize).ok_or_else(|| {
                    Error::MalformedSnapshot(format!(
                        "guard references fixed-field record {} of {}",
                        field_index,
                        fixed_fields.len()
                    ))
                })?;

                // A record whose predecessor links forward to it observes the
                // same field; the earlier guard already covers it.
                let redundant = !conservative_guards
                    && matches!(last_guard, Some((guarded_local, guarded_index))
                        if guarded_local == local
                            && guarded_index + 1 == field_index
                            && fixed_fields[guarded_index as usize].next_has_same_field);
                if redundant {
                    continue;
                }
                last_guard = Some((local, field_index));

                let helper_label = next_label;
                next_label += 1;

                if record.value <= CMP_IMM_MAX && !record.is_function_value() {
                    current.instrs.push(
                        IrInstr::new(
                            IrOp::CmpImm,
                            vec![Operand::Reg(local as VReg), Operand::Imm(record.value as i64)],
                        )
                        .with_statement(statement),
                    );
                } else {
                    // Wide or heap-valued constants go through a register; an
                    // embedded heap value gets a relocation at encode time.
                    let scratch = fresh_vreg();
                    let mov_op = if record.is_function_value() {
                        IrOp::MovAddr
                    } else {
                        IrOp::MovImm
                    };
                    current.instrs.push(
                        IrInstr::new(
                            mov_op,
                            vec![Operand::Reg(scratch), Operand::Imm(record.value as i64)],
                        )
                        .with_statement(statement),
                    );
                    current.instrs.push(
                        IrInstr::new(
                            IrOp::Cmp,
                            vec![Operand::Reg(local as VReg), Operand::Reg(scratch)],
                        )
                        .with_statement(statement),
                    );
                }
                current.instrs.push(
                    IrInstr::new(IrOp::BCond, vec![Operand::Label(helper_label)])
                        .with_cond(Cond::Ne)
                        .with_statement(statement),
                );

                let mut helper = IrBlock::new(helper_label);
                helper.is_helper = true;
                helper.statement = statement;
                helper.instrs.push(
                    IrInstr::new(IrOp::Bailout, vec![Operand::Imm(field_index as i64)])
                        .with_statement(statement),
                );
                helper_blocks.push(helper);
            }
            crate::snapshot::BodyOp::BranchIfFalse { cond, target } => {
                let target_label = *label_of_op.get(&target).ok_or_else(|| {
                    Error::MalformedSnapshot(format!("branch to op {target} outside body"))
                })?;
                current.instrs.push(
                    IrInstr::new(
                        IrOp::CmpImm,
                        vec![Operand::Reg(cond as VReg), Operand::Imm(0)],
                    )
                    .with_statement(statement),
                );
                current.instrs.push(
                    IrInstr::new(IrOp::BCond, vec![Operand::Label(target_label)])
                        .with_cond(Cond::Eq)
                        .with_statement(statement),
                );
            }
            crate::snapshot::BodyOp::Jump { target } => {
                let target_label = *label_of_op.get(&target).ok_or_else(|| {
                    Error::MalformedSnapshot(format!("jump to op {target} outside body"))
                })?;
                current.instrs.push(
                    IrInstr::new(IrOp::B, vec![Operand::Label(target_label)])
                        .with_statement(statement),
                );
            }
            crate::snapshot::BodyOp::Return { src } => {
                current.instrs.push(
                    IrInstr::new(IrOp::Ret, vec![Operand::Reg(src as VReg)])
                        .with_statement(statement),
                );
            }
        }
    }
    blocks.push(current);
    blocks.extend(helper_blocks);

    Ok(IrFunction {
        function: snapshot.function,
        blocks,
        vreg_count: next_vreg,
        spill_slot_count: 0,
    })
}

fn arith(op: IrOp, dst: u16, lhs: u16, rhs: u16, statement: Option<u32>) -> IrInstr {
    IrInstr::new(
        op,
        vec![
            Operand::Reg(dst as VReg),
            Operand::Reg(lhs as VReg),
            Operand::Reg(rhs as VReg),
        ],
    )
    .with_statement(statement)
}
