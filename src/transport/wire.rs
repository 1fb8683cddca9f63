//! Transport Wire Format
//!
//! Byte-exact, self-describing serialization of work items, snapshots, and
//! compilation replies: a versioned header followed by flat records written
//! as counts then fixed-size little-endian entries. No pointer fix-up exists
//! on either side; opaque address values cross the boundary as the integers
//! they are and stay un-dereferenced.

use crate::backend::encode::{Arch, RelocEntry, RelocKind};
use crate::backend::CompiledArtifact;
use crate::error::{Error, FailureReason, Result};
use crate::scheduler::{DispatchJob, Priority, Tier, WorkItemHandle};
use crate::snapshot::{
    BodyData, BodyFlags, BodyOp, CompareKind, FixedFieldInfo, FunctionId, FunctionRuntimeInfo,
    FunctionSnapshot, PolymorphicInlineCacheInfo, RemoteAddr, MAX_INLINE_DEPTH,
};
use std::io::{Read, Write};

/// Magic bytes of every wire message
pub const WIRE_MAGIC: &[u8; 4] = b"QJW\x01";

/// Wire format version; readers reject anything newer
pub const WIRE_VERSION: u32 = 1;

/// Upper bound on any single count field, to keep a corrupt or hostile
/// payload from driving allocation
const MAX_WIRE_COUNT: u32 = 1 << 20;

const STATUS_OK: u8 = 0;
const STATUS_FAILED: u8 = 1;

// ==================== Framing ====================

/// Write one length-prefixed frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame; `None` on clean end-of-stream
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let length = u32::from_le_bytes(length_bytes);
    if length > MAX_WIRE_COUNT * 16 {
        return Err(Error::wire(format!("frame of {length} bytes is too large")));
    }
    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

// ==================== Primitive Helpers ====================

fn write_u8<W: Write>(writer: &mut W, value: u8) -> Result<()> {
    writer.write_all(&[value])?;
    Ok(())
}

fn write_u16<W: Write>(writer: &mut W, value: u16) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_i64<W: Write>(writer: &mut W, value: i64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut bytes = [0u8; 1];
    reader.read_exact(&mut bytes)?;
    Ok(bytes[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    let mut bytes = [0u8; 2];
    reader.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

fn read_count<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    let count = read_u32(reader)?;
    if count > MAX_WIRE_COUNT {
        return Err(Error::wire(format!("{what} count {count} is implausible")));
    }
    Ok(count)
}

fn read_header<R: Read>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != WIRE_MAGIC {
        return Err(Error::wire("bad magic bytes"));
    }
    let version = read_u32(reader)?;
    if version > WIRE_VERSION {
        return Err(Error::wire(format!(
            "wire version {version} is newer than supported version {WIRE_VERSION}"
        )));
    }
    Ok(())
}

fn write_header<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(WIRE_MAGIC)?;
    write_u32(writer, WIRE_VERSION)
}

// ==================== Requests ====================

/// Serialize a work item plus its snapshot for the agent: versioned header,
/// then the flat snapshot records, then the work-item descriptor
pub fn write_request<W: Write>(writer: &mut W, arch: Arch, job: &DispatchJob) -> Result<()> {
    write_header(writer)?;
    write_u8(writer, arch.as_tag())?;
    write_snapshot(writer, &job.snapshot)?;
    write_u64(writer, job.handle.0)?;
    write_u32(writer, job.function.0)?;
    write_u8(writer, job.tier.as_tag())?;
    write_u8(writer, job.priority.as_tag())
}

/// Deserialize a work item on the agent side
pub fn read_request<R: Read>(reader: &mut R) -> Result<(Arch, DispatchJob)> {
    read_header(reader)?;
    let arch_tag = read_u8(reader)?;
    let arch = Arch::from_tag(arch_tag)
        .ok_or_else(|| Error::wire(format!("unknown architecture tag {arch_tag}")))?;
    let snapshot = read_snapshot(reader)?;
    let handle = WorkItemHandle(read_u64(reader)?);
    let function = FunctionId(read_u32(reader)?);
    let tier_tag = read_u8(reader)?;
    let tier =
        Tier::from_tag(tier_tag).ok_or_else(|| Error::wire(format!("unknown tier tag {tier_tag}")))?;
    let priority_tag = read_u8(reader)?;
    let priority = Priority::from_tag(priority_tag)
        .ok_or_else(|| Error::wire(format!("unknown priority tag {priority_tag}")))?;
    if snapshot.function != function {
        return Err(Error::wire("work item and snapshot disagree on function"));
    }
    Ok((
        arch,
        DispatchJob {
            handle,
            function,
            tier,
            priority,
            snapshot,
        },
    ))
}

// ==================== Snapshot Records ====================

/// Deterministic, byte-exact encoding of a snapshot. Re-encoding an
/// identical snapshot yields identical bytes.
pub fn encode_snapshot(snapshot: &FunctionSnapshot) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_snapshot(&mut bytes, snapshot).expect("writing to a Vec cannot fail");
    bytes
}

fn write_snapshot<W: Write>(writer: &mut W, snapshot: &FunctionSnapshot) -> Result<()> {
    write_u32(writer, snapshot.function.0)?;
    write_u64(writer, snapshot.epoch)?;
    write_body(writer, &snapshot.body)?;
    write_info(writer, &snapshot.info)
}

fn read_snapshot<R: Read>(reader: &mut R) -> Result<FunctionSnapshot> {
    let function = FunctionId(read_u32(reader)?);
    let epoch = read_u64(reader)?;
    let body = read_body(reader)?;
    let info = read_info(reader, 0)?;
    Ok(FunctionSnapshot {
        function,
        epoch,
        body,
        info,
    })
}

fn write_body<W: Write>(writer: &mut W, body: &BodyData) -> Result<()> {
    write_u8(writer, body.flags.bits())?;
    write_u16(writer, body.local_count)?;
    write_u32(writer, body.ops.len() as u32)?;
    for op in &body.ops {
        write_body_op(writer, op)?;
    }
    write_u32(writer, body.statement_map.len() as u32)?;
    for (op_index, statement) in &body.statement_map {
        write_u32(writer, *op_index)?;
        write_u32(writer, *statement)?;
    }
    Ok(())
}

fn read_body<R: Read>(reader: &mut R) -> Result<BodyData> {
    let flags = BodyFlags::from_bits_truncate(read_u8(reader)?);
    let local_count = read_u16(reader)?;
    let op_count = read_count(reader, "body op")?;
    let mut ops = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        ops.push(read_body_op(reader)?);
    }
    let statement_count = read_count(reader, "statement map")?;
    let mut statement_map = Vec::with_capacity(statement_count as usize);
    for _ in 0..statement_count {
        let op_index = read_u32(reader)?;
        let statement = read_u32(reader)?;
        statement_map.push((op_index, statement));
    }
    Ok(BodyData {
        ops,
        local_count,
        flags,
        statement_map,
    })
}

/// Fixed-size body op entry: tag, three u16 operands, one i64 immediate
fn write_body_op<W: Write>(writer: &mut W, op: &BodyOp) -> Result<()> {
    let (tag, a, b, c, imm): (u8, u16, u16, u16, i64) = match *op {
        BodyOp::LoadConst { dst, value } => (0, dst, 0, 0, value),
        BodyOp::Move { dst, src } => (1, dst, src, 0, 0),
        BodyOp::Add { dst, lhs, rhs } => (2, dst, lhs, rhs, 0),
        BodyOp::Sub { dst, lhs, rhs } => (3, dst, lhs, rhs, 0),
        BodyOp::Mul { dst, lhs, rhs } => (4, dst, lhs, rhs, 0),
        BodyOp::Compare { dst, lhs, rhs, kind } => (5, dst, lhs, rhs, compare_tag(kind) as i64),
        BodyOp::GuardFixedField { local, field_index } => (6, local, field_index, 0, 0),
        BodyOp::BranchIfFalse { cond, target } => (7, cond, 0, 0, target as i64),
        BodyOp::Jump { target } => (8, 0, 0, 0, target as i64),
        BodyOp::Return { src } => (9, src, 0, 0, 0),
    };
    write_u8(writer, tag)?;
    write_u16(writer, a)?;
    write_u16(writer, b)?;
    write_u16(writer, c)?;
    write_i64(writer, imm)
}

fn read_body_op<R: Read>(reader: &mut R) -> Result<BodyOp> {
    let tag = read_u8(reader)?;
    let a = read_u16(reader)?;
    let b = read_u16(reader)?;
    let c = read_u16(reader)?;
    let imm = read_i64(reader)?;
    Ok(match tag {
        0 => BodyOp::LoadConst { dst: a, value: imm },
        1 => BodyOp::Move { dst: a, src: b },
        2 => BodyOp::Add { dst: a, lhs: b, rhs: c },
        3 => BodyOp::Sub { dst: a, lhs: b, rhs: c },
        4 => BodyOp::Mul { dst: a, lhs: b, rhs: c },
        5 => BodyOp::Compare {
            dst: a,
            lhs: b,
            rhs: c,
            kind: compare_from_tag(imm as u8)?,
        },
        6 => BodyOp::GuardFixedField {
            local: a,
            field_index: b,
        },
        7 => BodyOp::BranchIfFalse {
            cond: a,
            target: imm as u32,
        },
        8 => BodyOp::Jump { target: imm as u32 },
        9 => BodyOp::Return { src: a },
        other => return Err(Error::wire(format!("unknown body op tag {other}"))),
    })
}

fn compare_tag(kind: CompareKind) -> u8 {
    match kind {
        CompareKind::Eq => 0,
        CompareKind::Ne => 1,
        CompareKind::Lt => 2,
        CompareKind::Le => 3,
        CompareKind::Gt => 4,
        CompareKind::Ge => 5,
    }
}

fn compare_from_tag(tag: u8) -> Result<CompareKind> {
    Ok(match tag {
        0 => CompareKind::Eq,
        1 => CompareKind::Ne,
        2 => CompareKind::Lt,
        3 => CompareKind::Le,
        4 => CompareKind::Gt,
        5 => CompareKind::Ge,
        other => return Err(Error::wire(format!("unknown compare tag {other}"))),
    })
}

fn write_info<W: Write>(writer: &mut W, info: &FunctionRuntimeInfo) -> Result<()> {
    write_u32(writer, info.function.0)?;
    write_u32(writer, info.cloned_caches.len() as u32)?;
    for cache in &info.cloned_caches {
        write_u64(writer, cache.raw())?;
    }
    write_u32(writer, info.fixed_fields.len() as u32)?;
    for field in &info.fixed_fields {
        write_u64(writer, field.value)?;
        write_u64(writer, field.func_info_addr.raw())?;
        write_u64(writer, field.environment_addr.raw())?;
        write_u32(writer, field.local_func_id)?;
        let flags =
            u8::from(field.next_has_same_field) | (u8::from(field.is_class_ctor) << 1);
        write_u8(writer, flags)?;
    }
    write_u32(writer, info.polymorphic_caches.len() as u32)?;
    for cache in &info.polymorphic_caches {
        write_u64(writer, cache.cache_addr.raw())?;
        write_u32(writer, cache.shape_count)?;
    }
    write_u32(writer, info.inlinees.len() as u32)?;
    for inlinee in &info.inlinees {
        write_info(writer, inlinee)?;
    }
    Ok(())
}

fn read_info<R: Read>(reader: &mut R, depth: u32) -> Result<FunctionRuntimeInfo> {
    if depth >= MAX_INLINE_DEPTH {
        return Err(Error::wire("inlinee records nested beyond the depth limit"));
    }
    let function = FunctionId(read_u32(reader)?);
    let cloned_count = read_count(reader, "cloned cache")?;
    let mut cloned_caches = Vec::with_capacity(cloned_count as usize);
    for _ in 0..cloned_count {
        cloned_caches.push(RemoteAddr::new(read_u64(reader)?));
    }
    let field_count = read_count(reader, "fixed field")?;
    let mut fixed_fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let value = read_u64(reader)?;
        let func_info_addr = RemoteAddr::new(read_u64(reader)?);
        let environment_addr = RemoteAddr::new(read_u64(reader)?);
        let local_func_id = read_u32(reader)?;
        let flags = read_u8(reader)?;
        fixed_fields.push(FixedFieldInfo {
            value,
            func_info_addr,
            environment_addr,
            local_func_id,
            next_has_same_field: flags & 0b01 != 0,
            is_class_ctor: flags & 0b10 != 0,
        });
    }
    let poly_count = read_count(reader, "polymorphic cache")?;
    let mut polymorphic_caches = Vec::with_capacity(poly_count as usize);
    for _ in 0..poly_count {
        let cache_addr = RemoteAddr::new(read_u64(reader)?);
        let shape_count = read_u32(reader)?;
        polymorphic_caches.push(PolymorphicInlineCacheInfo {
            cache_addr,
            shape_count,
        });
    }
    let inlinee_count = read_count(reader, "inlinee")?;
    let mut inlinees = Vec::with_capacity(inlinee_count as usize);
    for _ in 0..inlinee_count {
        inlinees.push(read_info(reader, depth + 1)?);
    }
    Ok(FunctionRuntimeInfo {
        function,
        cloned_caches,
        fixed_fields,
        polymorphic_caches,
        inlinees,
    })
}

// ==================== Replies ====================

/// A compilation reply routed back by work item handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReply {
    pub handle: WorkItemHandle,
    pub outcome: std::result::Result<CompiledArtifact, FailureReason>,
}

pub fn write_reply<W: Write>(writer: &mut W, reply: &JobReply) -> Result<()> {
    write_header(writer)?;
    write_u64(writer, reply.handle.0)?;
    match &reply.outcome {
        Ok(artifact) => {
            write_u8(writer, STATUS_OK)?;
            write_u8(writer, 0)?;
            write_u32(writer, artifact.function.0)?;
            write_u8(writer, artifact.tier.as_tag())?;
            write_u32(writer, artifact.code.len() as u32)?;
            writer.write_all(&artifact.code)?;
            write_u32(writer, artifact.relocs.len() as u32)?;
            for reloc in &artifact.relocs {
                write_u8(writer, reloc.kind.as_tag())?;
                write_u32(writer, reloc.code_offset)?;
                write_u64(writer, reloc.addr.raw())?;
            }
            write_u32(writer, artifact.unwind.len() as u32)?;
            writer.write_all(&artifact.unwind)?;
            write_u32(writer, artifact.native_map.len() as u32)?;
            for (offset, statement) in &artifact.native_map {
                write_u32(writer, *offset)?;
                write_u32(writer, *statement)?;
            }
        }
        Err(reason) => {
            write_u8(writer, STATUS_FAILED)?;
            write_u8(writer, reason.as_tag())?;
        }
    }
    Ok(())
}

pub fn read_reply<R: Read>(reader: &mut R) -> Result<JobReply> {
    read_header(reader)?;
    let handle = WorkItemHandle(read_u64(reader)?);
    let status = read_u8(reader)?;
    let reason = read_u8(reader)?;
    match status {
        STATUS_OK => {
            let function = FunctionId(read_u32(reader)?);
            let tier_tag = read_u8(reader)?;
            let tier = Tier::from_tag(tier_tag)
                .ok_or_else(|| Error::wire(format!("unknown tier tag {tier_tag}")))?;
            let code_len = read_count(reader, "code byte")?;
            let mut code = vec![0u8; code_len as usize];
            reader.read_exact(&mut code)?;
            let reloc_count = read_count(reader, "relocation")?;
            let mut relocs = Vec::with_capacity(reloc_count as usize);
            for _ in 0..reloc_count {
                let kind_tag = read_u8(reader)?;
                let kind = RelocKind::from_tag(kind_tag)
                    .ok_or_else(|| Error::wire(format!("unknown reloc kind {kind_tag}")))?;
                let code_offset = read_u32(reader)?;
                let addr = RemoteAddr::new(read_u64(reader)?);
                relocs.push(RelocEntry {
                    kind,
                    code_offset,
                    addr,
                });
            }
            let unwind_len = read_count(reader, "unwind byte")?;
            let mut unwind = vec![0u8; unwind_len as usize];
            reader.read_exact(&mut unwind)?;
            let map_count = read_count(reader, "native map")?;
            let mut native_map = Vec::with_capacity(map_count as usize);
            for _ in 0..map_count {
                let offset = read_u32(reader)?;
                let statement = read_u32(reader)?;
                native_map.push((offset, statement));
            }
            Ok(JobReply {
                handle,
                outcome: Ok(CompiledArtifact {
                    function,
                    tier,
                    code,
                    relocs,
                    unwind,
                    native_map,
                }),
            })
        }
        STATUS_FAILED => Ok(JobReply {
            handle,
            outcome: Err(FailureReason::from_tag(reason)),
        }),
        other => Err(Error::wire(format!("unknown reply status {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{capture, FunctionProfile};
    use std::io::Cursor;

    fn sample_snapshot() -> FunctionSnapshot {
        let mut body = BodyData::new(
            vec![
                BodyOp::LoadConst { dst: 0, value: 7 },
                BodyOp::GuardFixedField { local: 0, field_index: 0 },
                BodyOp::Return { src: 0 },
            ],
            1,
        );
        body.flags = BodyFlags::STRICT;
        body.statement_map = vec![(0, 4)];
        let profile = FunctionProfile::new(FunctionId(11), body);
        profile.record_fixed_field(FixedFieldInfo {
            value: 42,
            func_info_addr: RemoteAddr::new(0xAAAA),
            environment_addr: RemoteAddr::new(0xBBBB),
            local_func_id: 3,
            next_has_same_field: true,
            is_class_ctor: false,
        });
        profile.record_cloned_cache(RemoteAddr::new(0x1234));
        profile.record_polymorphic_cache(PolymorphicInlineCacheInfo {
            cache_addr: RemoteAddr::new(0x5678),
            shape_count: 3,
        });
        capture(&profile).unwrap()
    }

    fn sample_job() -> DispatchJob {
        DispatchJob {
            handle: WorkItemHandle(99),
            function: FunctionId(11),
            tier: Tier::Full,
            priority: Priority::High,
            snapshot: sample_snapshot(),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let job = sample_job();
        let mut bytes = Vec::new();
        write_request(&mut bytes, Arch::Arm64, &job).unwrap();
        let (arch, decoded) = read_request(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(arch, Arch::Arm64);
        assert_eq!(decoded, job);
    }

    #[test]
    fn test_snapshot_encoding_is_byte_identical() {
        let profile = FunctionProfile::new(
            FunctionId(2),
            BodyData::new(
                vec![
                    BodyOp::LoadConst { dst: 0, value: 1 },
                    BodyOp::Return { src: 0 },
                ],
                1,
            ),
        );
        profile.record_fixed_field(FixedFieldInfo::constant(42));
        let first = capture(&profile).unwrap();
        let second = capture(&profile).unwrap();
        assert_eq!(encode_snapshot(&first), encode_snapshot(&second));
    }

    #[test]
    fn test_reply_roundtrip_ok() {
        let reply = JobReply {
            handle: WorkItemHandle(7),
            outcome: Ok(CompiledArtifact {
                function: FunctionId(11),
                tier: Tier::Simple,
                code: vec![0xC0, 0x03, 0x5F, 0xD6],
                relocs: vec![RelocEntry {
                    kind: RelocKind::EmbeddedValue,
                    code_offset: 0,
                    addr: RemoteAddr::new(0xFEED),
                }],
                unwind: vec![1, 0, 0, 0, 16, 0, 0, 0],
                native_map: vec![(0, 2)],
            }),
        };
        let mut bytes = Vec::new();
        write_reply(&mut bytes, &reply).unwrap();
        let decoded = read_reply(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_reply_roundtrip_failed() {
        let reply = JobReply {
            handle: WorkItemHandle(8),
            outcome: Err(FailureReason::EncodingRange),
        };
        let mut bytes = Vec::new();
        write_reply(&mut bytes, &reply).unwrap();
        let decoded = read_reply(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let job = sample_job();
        let mut bytes = Vec::new();
        write_request(&mut bytes, Arch::Arm64, &job).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            read_request(&mut Cursor::new(&bytes)),
            Err(Error::WireFormat(_))
        ));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let job = sample_job();
        let mut bytes = Vec::new();
        write_request(&mut bytes, Arch::Arm64, &job).unwrap();
        bytes[4..8].copy_from_slice(&(WIRE_VERSION + 1).to_le_bytes());
        assert!(matches!(
            read_request(&mut Cursor::new(&bytes)),
            Err(Error::WireFormat(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_an_error() {
        let job = sample_job();
        let mut bytes = Vec::new();
        write_request(&mut bytes, Arch::Arm64, &job).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(read_request(&mut Cursor::new(&bytes)).is_err());
    }

    #[test]
    fn test_frame_roundtrip_and_eof() {
        let mut bytes = Vec::new();
        write_frame(&mut bytes, b"hello").unwrap();
        write_frame(&mut bytes, b"").unwrap();
        let mut cursor = Cursor::new(&bytes);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }
}
