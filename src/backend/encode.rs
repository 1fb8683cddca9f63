//! Instruction Encoding
//!
//! Converts IR instructions into machine-code words for a concrete target.
//! The [`Encoder`] trait is implemented once per architecture and selected by
//! an [`Arch`] tag; one IR instruction may expand to several words (wide
//! immediate moves) or carry the prologue/epilogue around it.
//!
//! Branch offsets are resolved here, after layout has fixed the final block
//! order: a first pass measures instruction sizes to place every label, a
//! second pass emits with real offsets. Any immediate or offset outside its
//! encoding field fails the whole work item; partial code never escapes.

use crate::error::{Error, Result};
use crate::ir::{Cond, IrFunction, IrInstr, IrOp, Label, Operand};
use crate::snapshot::RemoteAddr;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ==================== Architecture Selection ====================

/// Target architecture tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm64,
}

impl Arch {
    /// Stable single-byte tag used in the wire header
    pub fn as_tag(self) -> u8 {
        match self {
            Arch::Arm64 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Arch> {
        match tag {
            1 => Some(Arch::Arm64),
            _ => None,
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::Arm64
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::Arm64 => write!(f, "arm64"),
        }
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            other => Err(format!("unknown architecture: {other}")),
        }
    }
}

/// Select the encoder for a target
pub fn encoder_for(arch: Arch) -> &'static dyn Encoder {
    match arch {
        Arch::Arm64 => &Arm64Encoder,
    }
}

// ==================== Encoder Interface ====================

/// A relocation the runtime needs when installing or moving the code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    pub kind: RelocKind,
    /// Byte offset of the first affected word
    pub code_offset: u32,
    /// The embedded opaque value
    pub addr: RemoteAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// A heap value materialized into a register by a wide move sequence
    EmbeddedValue,
}

impl RelocKind {
    pub fn as_tag(self) -> u8 {
        match self {
            RelocKind::EmbeddedValue => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<RelocKind> {
        match tag {
            1 => Some(RelocKind::EmbeddedValue),
            _ => None,
        }
    }
}

/// Encoder output: code bytes plus the metadata finalize packages up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCode {
    pub code: Vec<u8>,
    pub relocs: Vec<RelocEntry>,
    /// `(byte_offset, statement_index)` pairs in code order
    pub native_map: Vec<(u32, u32)>,
    /// Stack frame bytes reserved by the prologue
    pub frame_bytes: u32,
}

/// Architecture-specific instruction encoder
pub trait Encoder: Sync {
    fn arch(&self) -> Arch;

    /// Encode a laid-out function. The block order is final; branch offsets
    /// are computed here and nowhere else.
    fn encode(&self, ir: &IrFunction) -> Result<EncodedCode>;
}

// ==================== AArch64 ====================

/// Fixed-width 4-byte-word encoder for the 64-bit Arm target
pub struct Arm64Encoder;

const XZR: u32 = 31;
const SP: u32 = 31;
const RETURN_REG: u8 = 0;

fn cond_code(cond: Cond) -> u32 {
    match cond {
        Cond::Eq => 0b0000,
        Cond::Ne => 0b0001,
        Cond::Ge => 0b1010,
        Cond::Lt => 0b1011,
        Cond::Gt => 0b1100,
        Cond::Le => 0b1101,
    }
}

impl Encoder for Arm64Encoder {
    fn arch(&self) -> Arch {
        Arch::Arm64
    }

    fn encode(&self, ir: &IrFunction) -> Result<EncodedCode> {
        let frame_bytes = frame_size(ir.spill_slot_count);

        // Pass 1: place labels by measuring each instruction with
        // unresolved (zero) branch offsets.
        let mut labels: HashMap<Label, i64> = HashMap::default();
        let mut word = prologue_words(frame_bytes) as i64;
        for block in &ir.blocks {
            labels.insert(block.label, word);
            for instr in &block.instrs {
                let mut scratch = Vec::new();
                self.encode_instr(instr, word, None, frame_bytes, &mut scratch, &mut Vec::new())?;
                word += scratch.len() as i64;
            }
        }

        // Pass 2: emit with resolved offsets
        let mut words: Vec<u32> = Vec::new();
        let mut relocs: Vec<RelocEntry> = Vec::new();
        let mut native_map: Vec<(u32, u32)> = Vec::new();
        let mut last_statement: Option<u32> = None;
        emit_prologue(frame_bytes, &mut words)?;
        for block in &ir.blocks {
            for instr in &block.instrs {
                if let Some(statement) = instr.statement {
                    if last_statement != Some(statement) {
                        native_map.push((words.len() as u32 * 4, statement));
                        last_statement = Some(statement);
                    }
                }
                let at = words.len() as i64;
                self.encode_instr(instr, at, Some(&labels), frame_bytes, &mut words, &mut relocs)?;
            }
        }

        let code = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        Ok(EncodedCode {
            code,
            relocs,
            native_map,
            frame_bytes,
        })
    }
}

impl Arm64Encoder {
    fn encode_instr(
        &self,
        instr: &IrInstr,
        word_offset: i64,
        labels: Option<&HashMap<Label, i64>>,
        frame_bytes: u32,
        out: &mut Vec<u32>,
        relocs: &mut Vec<RelocEntry>,
    ) -> Result<()> {
        match instr.op {
            IrOp::MovImm => {
                let dst = phys(&instr.operands[0])?;
                let value = imm(&instr.operands[1])?;
                emit_mov_wide(dst, value as u64, out);
            }
            IrOp::MovAddr => {
                let dst = phys(&instr.operands[0])?;
                let value = imm(&instr.operands[1])? as u64;
                if labels.is_some() {
                    relocs.push(RelocEntry {
                        kind: RelocKind::EmbeddedValue,
                        code_offset: word_offset as u32 * 4,
                        addr: RemoteAddr::new(value),
                    });
                }
                emit_mov_wide(dst, value, out);
            }
            IrOp::Mov => {
                let dst = phys(&instr.operands[0])?;
                let src = phys(&instr.operands[1])?;
                out.push(0xAA00_03E0 | (src as u32) << 16 | dst as u32);
            }
            IrOp::Add | IrOp::Sub => {
                let dst = phys(&instr.operands[0])? as u32;
                let lhs = phys(&instr.operands[1])? as u32;
                let rhs = phys(&instr.operands[2])? as u32;
                let base = if instr.op == IrOp::Add {
                    0x8B00_0000
                } else {
                    0xCB00_0000
                };
                out.push(base | rhs << 16 | lhs << 5 | dst);
            }
            IrOp::Mul => {
                let dst = phys(&instr.operands[0])? as u32;
                let lhs = phys(&instr.operands[1])? as u32;
                let rhs = phys(&instr.operands[2])? as u32;
                // MADD dst, lhs, rhs, xzr
                out.push(0x9B00_0000 | rhs << 16 | XZR << 10 | lhs << 5 | dst);
            }
            IrOp::Cmp => {
                let lhs = phys(&instr.operands[0])? as u32;
                let rhs = phys(&instr.operands[1])? as u32;
                // SUBS xzr, lhs, rhs
                out.push(0xEB00_0000 | rhs << 16 | lhs << 5 | XZR);
            }
            IrOp::CmpImm => {
                let lhs = phys(&instr.operands[0])? as u32;
                let value = imm(&instr.operands[1])?;
                if !(0..=0xFFF).contains(&value) {
                    return Err(Error::EncodingRange {
                        what: "compare immediate",
                        value,
                        bits: 12,
                    });
                }
                out.push(0xF100_0000 | (value as u32) << 10 | lhs << 5 | XZR);
            }
            IrOp::Cset => {
                let dst = phys(&instr.operands[0])? as u32;
                let cond = instr.cond.unwrap_or(Cond::Eq);
                // CSINC dst, xzr, xzr, !cond
                out.push(0x9A9F_07E0 | (cond_code(cond) ^ 1) << 12 | dst);
            }
            IrOp::B => {
                let offset = self.branch_offset(instr, word_offset, labels)?;
                if !(-(1 << 25)..(1 << 25)).contains(&offset) {
                    return Err(Error::EncodingRange {
                        what: "branch offset",
                        value: offset,
                        bits: 26,
                    });
                }
                out.push(0x1400_0000 | (offset as u32 & 0x03FF_FFFF));
            }
            IrOp::BCond => {
                let offset = self.branch_offset(instr, word_offset, labels)?;
                if !(-(1 << 18)..(1 << 18)).contains(&offset) {
                    return Err(Error::EncodingRange {
                        what: "conditional branch offset",
                        value: offset,
                        bits: 19,
                    });
                }
                let cond = instr.cond.unwrap_or(Cond::Eq);
                out.push(0x5400_0000 | (offset as u32 & 0x7_FFFF) << 5 | cond_code(cond));
            }
            IrOp::Bailout => {
                let value = imm(&instr.operands[0])?;
                if !(0..=0xFFFF).contains(&value) {
                    return Err(Error::EncodingRange {
                        what: "bailout tag",
                        value,
                        bits: 16,
                    });
                }
                out.push(0xD420_0000 | (value as u32) << 5);
            }
            IrOp::Ret => {
                let src = phys(&instr.operands[0])?;
                if src != RETURN_REG {
                    out.push(0xAA00_03E0 | (src as u32) << 16 | RETURN_REG as u32);
                }
                emit_epilogue(frame_bytes, out)?;
                out.push(0xD65F_03C0);
            }
            IrOp::LdrSpill | IrOp::StrSpill => {
                let reg = phys(&instr.operands[0])? as u32;
                let slot = spill_slot(&instr.operands[1])?;
                if slot > 0xFFF {
                    return Err(Error::EncodingRange {
                        what: "spill slot offset",
                        value: slot as i64,
                        bits: 12,
                    });
                }
                let base = if instr.op == IrOp::LdrSpill {
                    0xF940_0000
                } else {
                    0xF900_0000
                };
                out.push(base | (slot as u32) << 10 | SP << 5 | reg);
            }
        }
        Ok(())
    }

    fn branch_offset(
        &self,
        instr: &IrInstr,
        word_offset: i64,
        labels: Option<&HashMap<Label, i64>>,
    ) -> Result<i64> {
        let Some(labels) = labels else {
            return Ok(0); // measuring pass
        };
        let target = instr
            .branch_target()
            .ok_or_else(|| Error::MalformedSnapshot("branch without target label".into()))?;
        let target_word = labels
            .get(&target)
            .ok_or_else(|| Error::MalformedSnapshot(format!("branch to unknown label {target}")))?;
        Ok(target_word - word_offset)
    }
}

/// Round the spill area up to the 16-byte stack alignment
fn frame_size(spill_slots: u16) -> u32 {
    let bytes = spill_slots as u32 * 8;
    (bytes + 15) & !15
}

fn prologue_words(frame_bytes: u32) -> usize {
    if frame_bytes == 0 {
        0
    } else {
        1
    }
}

fn emit_prologue(frame_bytes: u32, out: &mut Vec<u32>) -> Result<()> {
    if frame_bytes == 0 {
        return Ok(());
    }
    if frame_bytes > 0xFFF {
        return Err(Error::EncodingRange {
            what: "frame size",
            value: frame_bytes as i64,
            bits: 12,
        });
    }
    // SUB sp, sp, #frame
    out.push(0xD100_0000 | frame_bytes << 10 | SP << 5 | SP);
    Ok(())
}

fn emit_epilogue(frame_bytes: u32, out: &mut Vec<u32>) -> Result<()> {
    if frame_bytes == 0 {
        return Ok(());
    }
    if frame_bytes > 0xFFF {
        return Err(Error::EncodingRange {
            what: "frame size",
            value: frame_bytes as i64,
            bits: 12,
        });
    }
    // ADD sp, sp, #frame
    out.push(0x9100_0000 | frame_bytes << 10 | SP << 5 | SP);
    Ok(())
}

/// MOVZ/MOVK (or a single MOVN) sequence materializing an arbitrary 64-bit
/// value
fn emit_mov_wide(dst: u8, value: u64, out: &mut Vec<u32>) {
    let dst = dst as u32;
    // Small negative values fit a single MOVN
    let inverted = !value;
    if inverted <= 0xFFFF {
        out.push(0x9280_0000 | (inverted as u32) << 5 | dst);
        return;
    }
    let mut emitted = false;
    for half in 0..4u32 {
        let chunk = ((value >> (16 * half)) & 0xFFFF) as u32;
        if chunk == 0 && (emitted || half < 3) && !(value == 0 && half == 0) {
            continue;
        }
        let base = if emitted { 0xF280_0000 } else { 0xD280_0000 };
        out.push(base | half << 21 | chunk << 5 | dst);
        emitted = true;
    }
}

fn phys(operand: &Operand) -> Result<u8> {
    match operand {
        Operand::Phys(reg) => Ok(*reg),
        other => Err(Error::MalformedSnapshot(format!(
            "expected a physical register operand, found {other:?}"
        ))),
    }
}

fn imm(operand: &Operand) -> Result<i64> {
    match operand {
        Operand::Imm(value) => Ok(*value),
        other => Err(Error::MalformedSnapshot(format!(
            "expected an immediate operand, found {other:?}"
        ))),
    }
}

fn spill_slot(operand: &Operand) -> Result<u16> {
    match operand {
        Operand::Spill(slot) => Ok(*slot),
        other => Err(Error::MalformedSnapshot(format!(
            "expected a spill-slot operand, found {other:?}"
        ))),
    }
}

// ==================== Decoder (test support & tooling) ====================

/// A machine word decoded back into its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    MovZ { dst: u8, imm16: u16, shift: u8 },
    MovK { dst: u8, imm16: u16, shift: u8 },
    MovN { dst: u8, imm16: u16 },
    MovReg { dst: u8, src: u8 },
    Add { dst: u8, lhs: u8, rhs: u8 },
    Sub { dst: u8, lhs: u8, rhs: u8 },
    Mul { dst: u8, lhs: u8, rhs: u8 },
    CmpReg { lhs: u8, rhs: u8 },
    CmpImm { lhs: u8, imm12: u16 },
    Cset { dst: u8, cond: u8 },
    B { offset: i32 },
    BCond { offset: i32, cond: u8 },
    Brk { imm16: u16 },
    Ret,
    SubSp { imm12: u16 },
    AddSp { imm12: u16 },
    Ldr { reg: u8, slot: u16 },
    Str { reg: u8, slot: u16 },
}

/// Decode one word of the encoder's output subset
pub fn decode(word: u32) -> Option<Decoded> {
    let rd = (word & 0x1F) as u8;
    if word == 0xD65F_03C0 {
        return Some(Decoded::Ret);
    }
    if word & 0xFF80_0000 == 0xD280_0000 {
        return Some(Decoded::MovZ {
            dst: rd,
            imm16: ((word >> 5) & 0xFFFF) as u16,
            shift: (((word >> 21) & 0x3) * 16) as u8,
        });
    }
    if word & 0xFF80_0000 == 0xF280_0000 {
        return Some(Decoded::MovK {
            dst: rd,
            imm16: ((word >> 5) & 0xFFFF) as u16,
            shift: (((word >> 21) & 0x3) * 16) as u8,
        });
    }
    if word & 0xFF80_0000 == 0x9280_0000 {
        return Some(Decoded::MovN {
            dst: rd,
            imm16: ((word >> 5) & 0xFFFF) as u16,
        });
    }
    if word & 0xFFE0_FFE0 == 0xAA00_03E0 {
        return Some(Decoded::MovReg {
            dst: rd,
            src: ((word >> 16) & 0x1F) as u8,
        });
    }
    if word & 0xFFE0_FC00 == 0xEB00_0000 && rd == 31 {
        return Some(Decoded::CmpReg {
            lhs: ((word >> 5) & 0x1F) as u8,
            rhs: ((word >> 16) & 0x1F) as u8,
        });
    }
    if word & 0xFFE0_FC00 == 0x8B00_0000 {
        return Some(Decoded::Add {
            dst: rd,
            lhs: ((word >> 5) & 0x1F) as u8,
            rhs: ((word >> 16) & 0x1F) as u8,
        });
    }
    if word & 0xFFE0_FC00 == 0xCB00_0000 {
        return Some(Decoded::Sub {
            dst: rd,
            lhs: ((word >> 5) & 0x1F) as u8,
            rhs: ((word >> 16) & 0x1F) as u8,
        });
    }
    if word & 0xFFE0_FC00 == 0x9B00_7C00 {
        return Some(Decoded::Mul {
            dst: rd,
            lhs: ((word >> 5) & 0x1F) as u8,
            rhs: ((word >> 16) & 0x1F) as u8,
        });
    }
    if word & 0xFFC0_0000 == 0xF100_0000 && rd == 31 {
        return Some(Decoded::CmpImm {
            lhs: ((word >> 5) & 0x1F) as u8,
            imm12: ((word >> 10) & 0xFFF) as u16,
        });
    }
    if word & 0xFFFF_0FE0 == 0x9A9F_07E0 {
        return Some(Decoded::Cset {
            dst: rd,
            cond: (((word >> 12) & 0xF) ^ 1) as u8,
        });
    }
    if word & 0xFC00_0000 == 0x1400_0000 {
        let raw = word & 0x03FF_FFFF;
        let offset = ((raw << 6) as i32) >> 6; // sign-extend 26 bits
        return Some(Decoded::B { offset });
    }
    if word & 0xFF00_0010 == 0x5400_0000 {
        let raw = (word >> 5) & 0x7_FFFF;
        let offset = ((raw << 13) as i32) >> 13; // sign-extend 19 bits
        return Some(Decoded::BCond {
            offset,
            cond: (word & 0xF) as u8,
        });
    }
    if word & 0xFFE0_001F == 0xD420_0000 {
        return Some(Decoded::Brk {
            imm16: ((word >> 5) & 0xFFFF) as u16,
        });
    }
    if word & 0xFFC0_0000 == 0xD100_0000 && rd == 31 {
        return Some(Decoded::SubSp {
            imm12: ((word >> 10) & 0xFFF) as u16,
        });
    }
    if word & 0xFFC0_0000 == 0x9100_0000 && rd == 31 && (word >> 5) & 0x1F == 31 {
        return Some(Decoded::AddSp {
            imm12: ((word >> 10) & 0xFFF) as u16,
        });
    }
    if word & 0xFFC0_03E0 == 0xF940_03E0 {
        return Some(Decoded::Ldr {
            reg: rd,
            slot: ((word >> 10) & 0xFFF) as u16,
        });
    }
    if word & 0xFFC0_03E0 == 0xF900_03E0 {
        return Some(Decoded::Str {
            reg: rd,
            slot: ((word >> 10) & 0xFFF) as u16,
        });
    }
    None
}

/// Split encoded bytes back into words, little-endian
pub fn words_of(code: &[u8]) -> Vec<u32> {
    code.chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
