//! Code Generation Backend
//!
//! Drives one work item through the strictly sequential stage machine:
//! IR build, register allocation, block layout, (debug-only operand
//! validation), peephole cleanup, instruction encoding, finalize. No stage is
//! re-entrant and the IR is owned exclusively by the compilation in progress.
//!
//! Observability is a single cross-cutting hook: a structured `tracing`
//! event on every stage entry and exit, nothing sprinkled inside the stages.

pub mod encode;
pub mod layout;
pub mod peephole;
pub mod regalloc;

use crate::error::Result;
use crate::ir::build_ir;
use crate::scheduler::Tier;
use crate::snapshot::{FunctionId, FunctionSnapshot};
use encode::{encoder_for, Arch, RelocEntry};

// ==================== Unwind Metadata ====================

const UNWIND_VERSION: u8 = 1;

/// Prolog descriptor the runtime's unwinder consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindInfo {
    pub version: u8,
    /// Stack bytes reserved by the prologue
    pub frame_bytes: u32,
}

impl UnwindInfo {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut bytes = vec![self.version, 0, 0, 0];
        bytes.extend_from_slice(&self.frame_bytes.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<UnwindInfo> {
        if bytes.len() != 8 {
            return None;
        }
        Some(UnwindInfo {
            version: bytes[0],
            frame_bytes: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

// ==================== Artifact ====================

/// The finished compilation: machine code plus the metadata install needs.
/// Produced once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub function: FunctionId,
    pub tier: Tier,
    pub code: Vec<u8>,
    pub relocs: Vec<RelocEntry>,
    pub unwind: Vec<u8>,
    /// `(byte_offset, statement_index)` pairs for diagnostics
    pub native_map: Vec<(u32, u32)>,
}

// ==================== Stage Machine ====================

/// The backend for one target configuration. Stateless across compilations.
pub struct Backend {
    arch: Arch,
    /// Ignore `next_has_same_field` links and emit every guard
    conservative_guards: bool,
}

impl Backend {
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            conservative_guards: false,
        }
    }

    pub fn with_conservative_guards(mut self, conservative: bool) -> Self {
        self.conservative_guards = conservative;
        self
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Compile one snapshot to an artifact. Any error aborts the whole item;
    /// no partial machine code is ever returned.
    pub fn compile(&self, snapshot: &FunctionSnapshot, tier: Tier) -> Result<CompiledArtifact> {
        let function = snapshot.function;

        let mut ir = stage(function, "ir_build", || {
            build_ir(snapshot, self.conservative_guards)
        })?;

        stage(function, "register_allocate", || regalloc::allocate(&mut ir))?;

        stage(function, "layout", || layout::layout(&mut ir));

        #[cfg(debug_assertions)]
        stage(function, "validate", || validate_operands(&ir));

        // Simple-tier compiles favor latency; the cleanup pass is optional.
        if tier == Tier::Full {
            let rewrites = stage(function, "peephole", || peephole::peephole(&mut ir));
            tracing::debug!(function = %function, rewrites, "peephole finished");
        }

        let encoded = stage(function, "encode", || encoder_for(self.arch).encode(&ir))?;

        stage(function, "finalize", || {
            let unwind = UnwindInfo {
                version: UNWIND_VERSION,
                frame_bytes: encoded.frame_bytes,
            };
            Ok(CompiledArtifact {
                function,
                tier,
                code: encoded.code,
                relocs: encoded.relocs,
                unwind: unwind.to_bytes(),
                native_map: encoded.native_map,
            })
        })
    }
}

/// Run one stage with entry/exit events
fn stage<T>(function: FunctionId, name: &'static str, body: impl FnOnce() -> T) -> T {
    tracing::debug!(function = %function, stage = name, "stage enter");
    let result = body();
    tracing::debug!(function = %function, stage = name, "stage exit");
    result
}

/// Diagnostic-build check that every operand resolves to a register or a
/// spill slot in range for the current frame. A violation is an internal
/// invariant failure, never a user-facing error.
#[cfg(debug_assertions)]
fn validate_operands(ir: &crate::ir::IrFunction) {
    use crate::ir::Operand;
    for block in &ir.blocks {
        for instr in &block.instrs {
            for operand in &instr.operands {
                match operand {
                    Operand::Phys(reg) => {
                        assert!(*reg < 32, "physical register x{reg} out of range");
                    }
                    Operand::Spill(slot) => {
                        assert!(
                            *slot < ir.spill_slot_count,
                            "spill slot {slot} outside frame of {} slots",
                            ir.spill_slot_count
                        );
                    }
                    Operand::Reg(vreg) => {
                        panic!("virtual register v{vreg} survived register allocation");
                    }
                    Operand::Imm(_) | Operand::Label(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{capture, BodyData, BodyOp, FixedFieldInfo, FunctionProfile};

    fn snapshot() -> FunctionSnapshot {
        let mut body = BodyData::new(
            vec![
                BodyOp::GuardFixedField { local: 0, field_index: 0 },
                BodyOp::LoadConst { dst: 1, value: 2 },
                BodyOp::Mul { dst: 0, lhs: 0, rhs: 1 },
                BodyOp::Return { src: 0 },
            ],
            2,
        );
        body.statement_map = vec![(0, 0), (1, 1)];
        let profile = FunctionProfile::new(FunctionId(9), body);
        profile.record_fixed_field(FixedFieldInfo::constant(42));
        capture(&profile).unwrap()
    }

    #[test]
    fn test_compile_produces_artifact() {
        let backend = Backend::new(Arch::Arm64);
        let artifact = backend.compile(&snapshot(), Tier::Simple).unwrap();
        assert_eq!(artifact.function, FunctionId(9));
        assert_eq!(artifact.tier, Tier::Simple);
        assert!(!artifact.code.is_empty());
        assert!(artifact.code.len() % 4 == 0);
        // Intra-function control flow only: nothing to relocate
        assert!(artifact.relocs.is_empty());
        assert!(!artifact.native_map.is_empty());
    }

    #[test]
    fn test_artifact_unwind_roundtrip() {
        let backend = Backend::new(Arch::Arm64);
        let artifact = backend.compile(&snapshot(), Tier::Full).unwrap();
        let unwind = UnwindInfo::from_bytes(&artifact.unwind).unwrap();
        assert_eq!(unwind.version, UNWIND_VERSION);
        assert_eq!(unwind.frame_bytes, 0);
    }

    #[test]
    fn test_full_tier_is_no_larger_than_simple() {
        let backend = Backend::new(Arch::Arm64);
        let snapshot = snapshot();
        let simple = backend.compile(&snapshot, Tier::Simple).unwrap();
        let full = backend.compile(&snapshot, Tier::Full).unwrap();
        assert!(full.code.len() <= simple.code.len());
    }

    #[test]
    fn test_helper_path_lands_after_main_path() {
        let backend = Backend::new(Arch::Arm64);
        let artifact = backend.compile(&snapshot(), Tier::Simple).unwrap();
        let words = encode::words_of(&artifact.code);
        let brk_at = words
            .iter()
            .position(|word| matches!(encode::decode(*word), Some(encode::Decoded::Brk { .. })))
            .expect("bailout present");
        let ret_at = words
            .iter()
            .position(|word| matches!(encode::decode(*word), Some(encode::Decoded::Ret)))
            .expect("return present");
        assert!(brk_at > ret_at, "bailout must follow the fall-through path");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let backend = Backend::new(Arch::Arm64);
        let snapshot = snapshot();
        let first = backend.compile(&snapshot, Tier::Full).unwrap();
        let second = backend.compile(&snapshot, Tier::Full).unwrap();
        assert_eq!(first, second);
    }
}
