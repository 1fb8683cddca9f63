//! Shared helpers for the integration tests

use quicksilver_jit::snapshot::{BodyData, BodyOp, CompareKind, FixedFieldInfo};
use quicksilver_jit::{FunctionId, FunctionProfile};
use std::sync::Arc;

/// The canonical small function: one constant-field guard, three
/// instructions, one conditional branch.
///
/// ```text
/// guard l0 == fixed(42)
/// l1 = 0
/// l2 = l0 > l1
/// if !l2 goto slow
/// return l0
/// slow: return l1
/// ```
pub fn guarded_branchy_profile(function: FunctionId, guard_value: u64) -> Arc<FunctionProfile> {
    let mut body = BodyData::new(
        vec![
            BodyOp::GuardFixedField {
                local: 0,
                field_index: 0,
            },
            BodyOp::LoadConst { dst: 1, value: 0 },
            BodyOp::Compare {
                dst: 2,
                lhs: 0,
                rhs: 1,
                kind: CompareKind::Gt,
            },
            BodyOp::BranchIfFalse { cond: 2, target: 5 },
            BodyOp::Return { src: 0 },
            BodyOp::Return { src: 1 },
        ],
        3,
    );
    body.statement_map = vec![(0, 1), (1, 2), (3, 3)];
    let profile = Arc::new(FunctionProfile::new(function, body));
    profile.record_fixed_field(FixedFieldInfo::constant(guard_value));
    profile
}

/// Straight-line arithmetic body with no guards
pub fn arithmetic_profile(function: FunctionId) -> Arc<FunctionProfile> {
    let body = BodyData::new(
        vec![
            BodyOp::LoadConst { dst: 0, value: 6 },
            BodyOp::LoadConst { dst: 1, value: 7 },
            BodyOp::Mul {
                dst: 2,
                lhs: 0,
                rhs: 1,
            },
            BodyOp::Return { src: 2 },
        ],
        3,
    );
    Arc::new(FunctionProfile::new(function, body))
}
