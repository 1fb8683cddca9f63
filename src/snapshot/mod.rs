//! JIT-Time Snapshot Model
//!
//! Immutable, flat records describing exactly the function state the
//! compilation agent is allowed to see. A snapshot is captured synchronously
//! on the thread that decided to compile, before the work item reaches the
//! transport, and is never re-read from the live heap afterwards: every heap
//! reference is copied as an opaque [`RemoteAddr`] value that cannot be
//! dereferenced on the compiler side.
//!
//! Consistency is guarded by an epoch counter on the interpreter-owned
//! [`FunctionProfile`]: capture reads the epoch before and after the walk and
//! discards the snapshot if it moved.

use crate::error::{Error, Result};
use bitflags::bitflags;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Maximum depth of nested inlinee records captured into one snapshot.
/// Exceeding the limit truncates that branch; it is not an error.
pub const MAX_INLINE_DEPTH: u32 = 3;

// ==================== Identity & Opaque Addresses ====================

/// Identity of a function known to the engine (the function number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A heap address copied by value at capture time.
///
/// The compiler treats this as a raw integer: there is deliberately no way to
/// turn it back into a reference, which is what keeps a snapshot valid
/// forever regardless of concurrent heap mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddr(u64);

impl RemoteAddr {
    /// The absent address
    pub const NULL: RemoteAddr = RemoteAddr(0);

    pub fn new(raw: u64) -> Self {
        RemoteAddr(raw)
    }

    /// The raw integer value, for embedding into generated code or the wire
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ==================== Portable Function Body ====================

bitflags! {
    /// Attribute bits of a captured function body
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BodyFlags: u8 {
        /// Strict-mode function
        const STRICT = 0b0000_0001;
        /// Body contains a try region
        const HAS_TRY = 0b0000_0010;
        /// Body contains at least one loop
        const HAS_LOOPS = 0b0000_0100;
    }
}

/// Comparison performed by [`BodyOp::Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One portable operation of a captured function body.
///
/// Operands name interpreter local slots; the IR builder maps slots onto
/// virtual registers. Branch targets are op indices within the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyOp {
    /// Load a constant into a local slot
    LoadConst { dst: u16, value: i64 },
    /// Copy one local slot to another
    Move { dst: u16, src: u16 },
    Add { dst: u16, lhs: u16, rhs: u16 },
    Sub { dst: u16, lhs: u16, rhs: u16 },
    Mul { dst: u16, lhs: u16, rhs: u16 },
    /// Materialize a comparison result (0 or 1) into `dst`
    Compare {
        dst: u16,
        lhs: u16,
        rhs: u16,
        kind: CompareKind,
    },
    /// Check a local against the fixed-field record at `field_index`;
    /// mismatch bails out of the compiled code
    GuardFixedField { local: u16, field_index: u16 },
    /// Branch to `target` when the local holds zero
    BranchIfFalse { cond: u16, target: u32 },
    Jump { target: u32 },
    Return { src: u16 },
}

/// The portable body shipped inside a snapshot: what the backend compiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyData {
    pub ops: Vec<BodyOp>,
    /// Number of interpreter local slots the body uses
    pub local_count: u16,
    pub flags: BodyFlags,
    /// Sorted `(op_index, statement_index)` pairs for diagnostics
    pub statement_map: Vec<(u32, u32)>,
}

impl BodyData {
    pub fn new(ops: Vec<BodyOp>, local_count: u16) -> Self {
        Self {
            ops,
            local_count,
            flags: BodyFlags::empty(),
            statement_map: Vec::new(),
        }
    }

    /// Statement index covering the given op, from the last map entry at or
    /// before it
    pub fn statement_for_op(&self, op_index: u32) -> Option<u32> {
        self.statement_map
            .iter()
            .take_while(|(start, _)| *start <= op_index)
            .last()
            .map(|(_, statement)| *statement)
    }
}

// ==================== Flat Runtime Records ====================

/// A property observed to be constant at capture time, guarded at runtime.
///
/// `next_has_same_field` is a forward link: it marks that the following
/// record in the array refers to the same underlying field, which lets the
/// backend skip a redundant guard. Ignoring the link and always emitting the
/// guard is also correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFieldInfo {
    /// The observed value bits (a heap address when the value is an object)
    pub value: u64,
    /// Declaring function info address when the value is a function
    pub func_info_addr: RemoteAddr,
    /// Captured environment address when the value is a closure
    pub environment_addr: RemoteAddr,
    /// Engine-local id of the declaring function, when known
    pub local_func_id: u32,
    pub next_has_same_field: bool,
    /// Gates constructor-specific optimizations
    pub is_class_ctor: bool,
}

impl FixedFieldInfo {
    /// A plain constant observation with no declaring function
    pub fn constant(value: u64) -> Self {
        Self {
            value,
            func_info_addr: RemoteAddr::NULL,
            environment_addr: RemoteAddr::NULL,
            local_func_id: 0,
            next_has_same_field: false,
            is_class_ctor: false,
        }
    }

    /// Whether the observed value is a function object (and therefore a heap
    /// address that install-time bookkeeping must be able to find)
    pub fn is_function_value(&self) -> bool {
        !self.func_info_addr.is_null()
    }
}

/// An inline cache site that has observed more than one shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolymorphicInlineCacheInfo {
    pub cache_addr: RemoteAddr,
    pub shape_count: u32,
}

/// Per-function runtime record: cloned inline caches, fixed-field and
/// polymorphic-cache observations, and the same record recursively for every
/// nested callee considered for inlining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRuntimeInfo {
    pub function: FunctionId,
    pub cloned_caches: Vec<RemoteAddr>,
    pub fixed_fields: Vec<FixedFieldInfo>,
    pub polymorphic_caches: Vec<PolymorphicInlineCacheInfo>,
    pub inlinees: Vec<FunctionRuntimeInfo>,
}

/// The full immutable snapshot handed to the compilation agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSnapshot {
    pub function: FunctionId,
    /// Profile epoch the snapshot was captured at
    pub epoch: u64,
    pub body: BodyData,
    pub info: FunctionRuntimeInfo,
}

// ==================== Interpreter-Owned Profile ====================

/// The mutable, epoch-versioned source the interpreter maintains for each
/// function. Mutators bump the epoch; capture detects concurrent mutation by
/// re-reading it.
pub struct FunctionProfile {
    function: FunctionId,
    epoch: AtomicU64,
    inner: RwLock<ProfileData>,
}

struct ProfileData {
    body: BodyData,
    cloned_caches: Vec<RemoteAddr>,
    fixed_fields: Vec<FixedFieldInfo>,
    polymorphic_caches: Vec<PolymorphicInlineCacheInfo>,
    inlinees: Vec<Arc<FunctionProfile>>,
}

impl FunctionProfile {
    pub fn new(function: FunctionId, body: BodyData) -> Self {
        Self {
            function,
            epoch: AtomicU64::new(0),
            inner: RwLock::new(ProfileData {
                body,
                cloned_caches: Vec::new(),
                fixed_fields: Vec::new(),
                polymorphic_caches: Vec::new(),
                inlinees: Vec::new(),
            }),
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Current mutation epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Record the address of an inline cache cloned for background use
    pub fn record_cloned_cache(&self, addr: RemoteAddr) {
        self.inner.write().unwrap().cloned_caches.push(addr);
        self.bump();
    }

    /// Record a fixed-field observation. Appended in observation order; the
    /// interpreter sets `next_has_same_field` on the previous record when it
    /// knows the new observation targets the same field.
    pub fn record_fixed_field(&self, info: FixedFieldInfo) {
        self.inner.write().unwrap().fixed_fields.push(info);
        self.bump();
    }

    /// Mark the previous fixed-field record as aliasing the next one
    pub fn link_last_fixed_field(&self) {
        let mut data = self.inner.write().unwrap();
        if let Some(last) = data.fixed_fields.last_mut() {
            last.next_has_same_field = true;
        }
        drop(data);
        self.bump();
    }

    /// Record an inline cache site that went polymorphic
    pub fn record_polymorphic_cache(&self, info: PolymorphicInlineCacheInfo) {
        self.inner.write().unwrap().polymorphic_caches.push(info);
        self.bump();
    }

    /// Register a nested callee considered for inlining
    pub fn add_inlinee(&self, inlinee: Arc<FunctionProfile>) {
        self.inner.write().unwrap().inlinees.push(inlinee);
        self.bump();
    }

    /// Drop all cache observations, e.g. after a shape invalidation. Any
    /// capture in progress will notice the epoch change and discard itself.
    pub fn clear_inline_caches(&self) {
        let mut data = self.inner.write().unwrap();
        data.cloned_caches.clear();
        data.fixed_fields.clear();
        data.polymorphic_caches.clear();
        drop(data);
        self.bump();
    }
}

// ==================== Capture ====================

/// Capture an immutable snapshot of a function's JIT-relevant state.
///
/// Runs synchronously on the submitting thread. Fails with
/// [`Error::CaptureConflict`] when the profile mutated mid-walk; the caller
/// drops the snapshot and leaves the function at its current tier.
pub fn capture(profile: &FunctionProfile) -> Result<FunctionSnapshot> {
    let before = profile.epoch();
    let (body, info) = {
        let data = profile.inner.read().unwrap();
        (data.body.clone(), collect_info(profile.function, &data, 0))
    };
    let after = profile.epoch();
    if before != after {
        return Err(Error::CaptureConflict {
            function: profile.function,
            before,
            after,
        });
    }
    Ok(FunctionSnapshot {
        function: profile.function,
        epoch: after,
        body,
        info,
    })
}

fn collect_info(function: FunctionId, data: &ProfileData, depth: u32) -> FunctionRuntimeInfo {
    let inlinees = if depth + 1 >= MAX_INLINE_DEPTH {
        // Truncated branch: treated as "no further inlining data"
        Vec::new()
    } else {
        data.inlinees
            .iter()
            .map(|inlinee| {
                let inner = inlinee.inner.read().unwrap();
                collect_info(inlinee.function, &inner, depth + 1)
            })
            .collect()
    };
    FunctionRuntimeInfo {
        function,
        cloned_caches: data.cloned_caches.clone(),
        fixed_fields: data.fixed_fields.clone(),
        polymorphic_caches: data.polymorphic_caches.clone(),
        inlinees,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_body() -> BodyData {
        BodyData::new(
            vec![
                BodyOp::LoadConst { dst: 0, value: 1 },
                BodyOp::Return { src: 0 },
            ],
            1,
        )
    }

    #[test]
    fn test_remote_addr_is_opaque_value() {
        let addr = RemoteAddr::new(0xDEAD_BEEF);
        assert_eq!(addr.raw(), 0xDEAD_BEEF);
        assert!(!addr.is_null());
        assert!(RemoteAddr::NULL.is_null());
    }

    #[test]
    fn test_capture_basic() {
        let profile = FunctionProfile::new(FunctionId(7), tiny_body());
        profile.record_fixed_field(FixedFieldInfo::constant(42));
        let snapshot = capture(&profile).unwrap();
        assert_eq!(snapshot.function, FunctionId(7));
        assert_eq!(snapshot.info.fixed_fields.len(), 1);
        assert_eq!(snapshot.info.fixed_fields[0].value, 42);
    }

    #[test]
    fn test_recapture_is_identical_without_mutation() {
        let profile = FunctionProfile::new(FunctionId(1), tiny_body());
        profile.record_cloned_cache(RemoteAddr::new(0x1000));
        profile.record_fixed_field(FixedFieldInfo::constant(5));
        let first = capture(&profile).unwrap();
        let second = capture(&profile).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mutation_changes_epoch_and_snapshot() {
        let profile = FunctionProfile::new(FunctionId(1), tiny_body());
        let first = capture(&profile).unwrap();
        profile.record_fixed_field(FixedFieldInfo::constant(9));
        let second = capture(&profile).unwrap();
        assert_ne!(first.epoch, second.epoch);
        assert_ne!(first, second);
    }

    #[test]
    fn test_inlinee_depth_truncation() {
        let leaf = Arc::new(FunctionProfile::new(FunctionId(4), tiny_body()));
        let mid = Arc::new(FunctionProfile::new(FunctionId(3), tiny_body()));
        let inner = Arc::new(FunctionProfile::new(FunctionId(2), tiny_body()));
        mid.add_inlinee(leaf);
        inner.add_inlinee(mid);
        let root = FunctionProfile::new(FunctionId(1), tiny_body());
        root.add_inlinee(inner);

        let snapshot = capture(&root).unwrap();
        // Root -> inner -> mid captured, leaf truncated by MAX_INLINE_DEPTH
        assert_eq!(snapshot.info.inlinees.len(), 1);
        let inner_info = &snapshot.info.inlinees[0];
        assert_eq!(inner_info.inlinees.len(), 1);
        assert!(inner_info.inlinees[0].inlinees.is_empty());
    }

    #[test]
    fn test_capture_conflict_under_concurrent_mutation() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        let profile = Arc::new(FunctionProfile::new(FunctionId(1), tiny_body()));
        let stop = Arc::new(AtomicBool::new(false));

        let mutator = {
            let profile = Arc::clone(&profile);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    profile.record_cloned_cache(RemoteAddr::new(0x2000));
                    profile.clear_inline_caches();
                }
            })
        };

        let mut saw_conflict = false;
        for _ in 0..50_000 {
            match capture(&profile) {
                Err(Error::CaptureConflict { .. }) => {
                    saw_conflict = true;
                    break;
                }
                Ok(_) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        stop.store(true, Ordering::Relaxed);
        mutator.join().unwrap();
        assert!(saw_conflict, "expected at least one capture conflict");
    }

    #[test]
    fn test_statement_map_lookup() {
        let mut body = tiny_body();
        body.statement_map = vec![(0, 10), (1, 11)];
        assert_eq!(body.statement_for_op(0), Some(10));
        assert_eq!(body.statement_for_op(1), Some(11));
        assert_eq!(body.statement_for_op(5), Some(11));
    }
}
