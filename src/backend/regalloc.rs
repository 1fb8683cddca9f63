//! Linear-Scan Register Allocation
//!
//! One pass over the linearized instruction stream: live intervals are
//! conservative (first mention to last mention), physical registers are
//! handed out greedily by earliest available index, and when none is free
//! the interval with the furthest next use is spilled to a stack slot.
//!
//! After assignment a rewrite pass replaces virtual-register operands with
//! their locations and threads spill slots through two reserved scratch
//! registers, so later stages never see a virtual register.

use crate::error::{Error, Result};
use crate::ir::{IrFunction, IrInstr, IrOp, Operand, VReg};
use rustc_hash::FxHashMap as HashMap;

/// General-purpose registers the allocator may hand out (x0..x7)
pub const NUM_ALLOCATABLE_REGS: u8 = 8;

/// Intra-procedure scratch registers (x16/x17), reserved for spill traffic
pub const SCRATCH_REGS: [u8; 2] = [16, 17];

/// Where a virtual register lives after allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Phys(u8),
    Spill(u16),
}

/// Live interval of one virtual register over the linearized stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveInterval {
    pub vreg: VReg,
    pub start: u32,
    pub end: u32,
    pub location: Location,
}

/// Total assignment produced by one allocator run. Read-only afterwards.
#[derive(Debug, Clone)]
pub struct RegAssignment {
    pub locations: HashMap<VReg, Location>,
    pub intervals: Vec<LiveInterval>,
    pub spill_slot_count: u16,
}

impl RegAssignment {
    pub fn location_of(&self, vreg: VReg) -> Option<Location> {
        self.locations.get(&vreg).copied()
    }
}

/// Allocate with the default register file
pub fn allocate(ir: &mut IrFunction) -> Result<RegAssignment> {
    allocate_with_registers(ir, NUM_ALLOCATABLE_REGS)
}

/// Allocate with an explicit register-file size. Small sizes force spilling,
/// which the tests use.
pub fn allocate_with_registers(ir: &mut IrFunction, num_regs: u8) -> Result<RegAssignment> {
    let mut intervals = compute_intervals(ir);
    assign_locations(&mut intervals, num_regs);

    let mut locations: HashMap<VReg, Location> = HashMap::default();
    let mut spill_slot_count: u16 = 0;
    for interval in &intervals {
        locations.insert(interval.vreg, interval.location);
        if let Location::Spill(slot) = interval.location {
            spill_slot_count = spill_slot_count.max(slot + 1);
        }
    }

    // Totality check: every vreg mentioned anywhere must have a location.
    for instr in ir.instrs() {
        for operand in &instr.operands {
            if let Operand::Reg(vreg) = operand {
                if !locations.contains_key(vreg) {
                    return Err(Error::RegAllocIncomplete { vreg: *vreg });
                }
            }
        }
    }

    rewrite_operands(ir, &locations);
    resolve_spills(ir);
    ir.spill_slot_count = spill_slot_count;

    Ok(RegAssignment {
        locations,
        intervals,
        spill_slot_count,
    })
}

/// First-to-last mention of each vreg over the linearized stream
fn compute_intervals(ir: &IrFunction) -> Vec<LiveInterval> {
    let mut first: HashMap<VReg, u32> = HashMap::default();
    let mut last: HashMap<VReg, u32> = HashMap::default();
    let mut position = 0u32;
    for block in &ir.blocks {
        for instr in &block.instrs {
            for operand in &instr.operands {
                if let Operand::Reg(vreg) = operand {
                    first.entry(*vreg).or_insert(position);
                    last.insert(*vreg, position);
                }
            }
            position += 1;
        }
    }
    let mut intervals: Vec<LiveInterval> = first
        .into_iter()
        .map(|(vreg, start)| LiveInterval {
            vreg,
            start,
            end: last[&vreg],
            location: Location::Spill(u16::MAX), // placeholder, always overwritten
        })
        .collect();
    intervals.sort_unstable_by_key(|interval| (interval.start, interval.vreg));
    intervals
}

fn assign_locations(intervals: &mut [LiveInterval], num_regs: u8) {
    let mut active: Vec<usize> = Vec::new(); // indices into intervals, sorted by end
    let mut free: Vec<u8> = (0..num_regs).rev().collect(); // pop() yields lowest
    let mut next_spill_slot: u16 = 0;

    for current in 0..intervals.len() {
        let start = intervals[current].start;

        // Expire intervals that ended before this one starts
        active.retain(|&index| {
            if intervals[index].end < start {
                if let Location::Phys(reg) = intervals[index].location {
                    free.push(reg);
                    free.sort_unstable_by(|a, b| b.cmp(a));
                }
                false
            } else {
                true
            }
        });

        if let Some(reg) = free.pop() {
            intervals[current].location = Location::Phys(reg);
        } else {
            // No register free: spill whichever of the active intervals (or
            // this one) has the furthest next use, approximated by the
            // interval end.
            let victim = active
                .iter()
                .copied()
                .max_by_key(|&index| intervals[index].end)
                .filter(|&index| intervals[index].end > intervals[current].end);
            match victim {
                Some(index) => {
                    let stolen = match intervals[index].location {
                        Location::Phys(reg) => reg,
                        Location::Spill(_) => unreachable!("active interval without a register"),
                    };
                    intervals[index].location = Location::Spill(next_spill_slot);
                    next_spill_slot += 1;
                    active.retain(|&active_index| active_index != index);
                    intervals[current].location = Location::Phys(stolen);
                }
                None => {
                    intervals[current].location = Location::Spill(next_spill_slot);
                    next_spill_slot += 1;
                    continue; // spilled intervals do not join the active set
                }
            }
        }

        active.push(current);
        active.sort_unstable_by_key(|&index| intervals[index].end);
    }
}

fn rewrite_operands(ir: &mut IrFunction, locations: &HashMap<VReg, Location>) {
    for block in &mut ir.blocks {
        for instr in &mut block.instrs {
            for operand in &mut instr.operands {
                if let Operand::Reg(vreg) = operand {
                    *operand = match locations[vreg] {
                        Location::Phys(reg) => Operand::Phys(reg),
                        Location::Spill(slot) => Operand::Spill(slot),
                    };
                }
            }
        }
    }
}

/// Thread spill-slot operands through the reserved scratch registers:
/// reloads before each use, a store after each definition.
fn resolve_spills(ir: &mut IrFunction) {
    for block in &mut ir.blocks {
        let mut rewritten: Vec<IrInstr> = Vec::with_capacity(block.instrs.len());
        for mut instr in block.instrs.drain(..) {
            let mut next_scratch = 0usize;
            let mut store_after: Option<(u8, u16)> = None;
            for (index, operand) in instr.operands.iter_mut().enumerate() {
                if let Operand::Spill(slot) = *operand {
                    let scratch = SCRATCH_REGS[next_scratch % SCRATCH_REGS.len()];
                    next_scratch += 1;
                    if Operand::is_def_position(instr.op, index) {
                        store_after = Some((scratch, slot));
                    } else {
                        rewritten.push(IrInstr::new(
                            IrOp::LdrSpill,
                            vec![Operand::Phys(scratch), Operand::Spill(slot)],
                        ));
                    }
                    *operand = Operand::Phys(scratch);
                }
            }
            rewritten.push(instr);
            if let Some((scratch, slot)) = store_after {
                rewritten.push(IrInstr::new(
                    IrOp::StrSpill,
                    vec![Operand::Phys(scratch), Operand::Spill(slot)],
                ));
            }
        }
        block.instrs = rewritten;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::build_ir;
    use crate::snapshot::{capture, BodyData, BodyOp, FunctionId, FunctionProfile};

    fn ir_for(ops: Vec<BodyOp>, locals: u16) -> IrFunction {
        let profile = FunctionProfile::new(FunctionId(1), BodyData::new(ops, locals));
        let snapshot = capture(&profile).unwrap();
        build_ir(&snapshot, false).unwrap()
    }

    fn chain_body(locals: u16) -> Vec<BodyOp> {
        // Load every local, then combine them all so everything is live at once
        let mut ops: Vec<BodyOp> = (0..locals)
            .map(|slot| BodyOp::LoadConst {
                dst: slot,
                value: slot as i64,
            })
            .collect();
        for slot in 1..locals {
            ops.push(BodyOp::Add {
                dst: 0,
                lhs: 0,
                rhs: slot,
            });
        }
        ops.push(BodyOp::Return { src: 0 });
        ops
    }

    #[test]
    fn test_assignment_is_total() {
        let mut ir = ir_for(chain_body(6), 6);
        let assignment = allocate(&mut ir).unwrap();
        for vreg in 0..ir.vreg_count {
            assert!(
                assignment.location_of(vreg).is_some(),
                "v{vreg} has no location"
            );
        }
        // After rewriting, no virtual register survives
        assert!(ir
            .instrs()
            .all(|instr| instr.operands.iter().all(|op| !matches!(op, Operand::Reg(_)))));
    }

    #[test]
    fn test_no_overlapping_intervals_share_a_register() {
        let mut ir = ir_for(chain_body(10), 10);
        let assignment = allocate_with_registers(&mut ir, 4).unwrap();
        let intervals = &assignment.intervals;
        for a in intervals {
            for b in intervals {
                if a.vreg == b.vreg {
                    continue;
                }
                let overlap = a.start <= b.end && b.start <= a.end;
                if overlap {
                    if let (Location::Phys(ra), Location::Phys(rb)) = (a.location, b.location) {
                        assert_ne!(
                            ra, rb,
                            "v{} and v{} overlap but share x{}",
                            a.vreg, b.vreg, ra
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_spilling_kicks_in_when_registers_run_out() {
        let mut ir = ir_for(chain_body(10), 10);
        let assignment = allocate_with_registers(&mut ir, 2).unwrap();
        assert!(assignment.spill_slot_count > 0);
        // Spill traffic goes through the reserved scratch registers
        assert!(ir.instrs().any(|instr| instr.op == IrOp::LdrSpill));
        assert!(ir.instrs().any(|instr| {
            instr
                .operands
                .iter()
                .any(|op| matches!(op, Operand::Phys(reg) if SCRATCH_REGS.contains(reg)))
        }));
    }

    #[test]
    fn test_spill_victim_has_furthest_end() {
        // v0 lives across everything; with one register it must be the victim
        let mut ir = ir_for(chain_body(3), 3);
        let assignment = allocate_with_registers(&mut ir, 1).unwrap();
        let v0 = assignment
            .intervals
            .iter()
            .find(|interval| interval.vreg == 0)
            .unwrap();
        assert!(matches!(v0.location, Location::Spill(_)));
    }

    #[test]
    fn test_registers_are_reused_after_expiry() {
        // Two short non-overlapping temporaries can share one register
        let mut ir = ir_for(
            vec![
                BodyOp::LoadConst { dst: 0, value: 1 },
                BodyOp::Move { dst: 1, src: 0 },
                BodyOp::LoadConst { dst: 2, value: 2 },
                BodyOp::Return { src: 2 },
            ],
            3,
        );
        let assignment = allocate_with_registers(&mut ir, 2).unwrap();
        assert_eq!(assignment.spill_slot_count, 0);
    }
}
