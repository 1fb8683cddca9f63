//! Install / Activation Contract
//!
//! Publication of finished compilations is owned by the runtime, not by this
//! crate; what lives here is the contract the runtime implements plus a
//! reference [`EntryPointTable`] used by the tests and by embedders that
//! want the default behavior: an atomic per-function entry-point slot swapped
//! with release ordering, with every previously published artifact kept
//! alive so calls already running through older code stay valid.
//!
//! The mandatory cancellation check (a discarded result must never be
//! installed) happens before `publish` is ever called; see the scheduler.

use crate::backend::CompiledArtifact;
use crate::snapshot::FunctionId;
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Receives finished compilations for publication into the live function
pub trait EntryPointPublisher: Send + Sync {
    /// Atomically replace the function's active entry point. The artifact is
    /// self-contained and immutable; the publisher owns it from here on.
    fn publish(&self, function: FunctionId, artifact: CompiledArtifact);
}

struct SlotState {
    /// The lock-free cell the dispatcher reads on every call
    address: Arc<AtomicU64>,
    current: Option<Arc<CompiledArtifact>>,
    /// Older artifacts stay alive for calls still running through them
    retired: Vec<Arc<CompiledArtifact>>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            address: Arc::new(AtomicU64::new(0)),
            current: None,
            retired: Vec::new(),
        }
    }
}

/// Reference publisher: one atomic entry-point slot per function
#[derive(Default)]
pub struct EntryPointTable {
    slots: Mutex<HashMap<FunctionId, SlotState>>,
}

impl EntryPointTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::default()),
        }
    }

    /// The shared cell later invocations read to pick up new code. Zero
    /// means "still interpreted".
    pub fn entry_point_cell(&self, function: FunctionId) -> Arc<AtomicU64> {
        let mut slots = self.slots.lock().unwrap();
        Arc::clone(&slots.entry(function).or_insert_with(SlotState::new).address)
    }

    /// Currently published artifact, if any
    pub fn published(&self, function: FunctionId) -> Option<Arc<CompiledArtifact>> {
        let slots = self.slots.lock().unwrap();
        slots.get(&function).and_then(|slot| slot.current.clone())
    }

    /// Number of artifacts kept alive for a function, current one included
    pub fn live_artifacts(&self, function: FunctionId) -> usize {
        let slots = self.slots.lock().unwrap();
        slots
            .get(&function)
            .map(|slot| slot.retired.len() + usize::from(slot.current.is_some()))
            .unwrap_or(0)
    }
}

impl EntryPointPublisher for EntryPointTable {
    fn publish(&self, function: FunctionId, artifact: CompiledArtifact) {
        let artifact = Arc::new(artifact);
        let code_address = artifact.code.as_ptr() as u64;
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(function).or_insert_with(SlotState::new);
        if let Some(previous) = slot.current.take() {
            slot.retired.push(previous);
        }
        slot.current = Some(Arc::clone(&artifact));
        slot.address.store(code_address, Ordering::Release);
        tracing::debug!(%function, tier = %artifact.tier, code_len = artifact.code.len(), "entry point published");
    }
}

/// Publisher that drops everything; used where installation is disabled
#[derive(Default)]
pub struct NullPublisher;

impl EntryPointPublisher for NullPublisher {
    fn publish(&self, _function: FunctionId, _artifact: CompiledArtifact) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Tier;

    fn artifact(function: FunctionId, code: Vec<u8>) -> CompiledArtifact {
        CompiledArtifact {
            function,
            tier: Tier::Simple,
            code,
            relocs: Vec::new(),
            unwind: Vec::new(),
            native_map: Vec::new(),
        }
    }

    #[test]
    fn test_publish_swaps_entry_point() {
        let table = EntryPointTable::new();
        let function = FunctionId(1);
        let cell = table.entry_point_cell(function);
        assert_eq!(cell.load(Ordering::Acquire), 0);

        table.publish(function, artifact(function, vec![1, 2, 3, 4]));
        let address = cell.load(Ordering::Acquire);
        assert_ne!(address, 0);
        let published = table.published(function).unwrap();
        assert_eq!(published.code.as_ptr() as u64, address);
    }

    #[test]
    fn test_previous_artifact_stays_alive() {
        let table = EntryPointTable::new();
        let function = FunctionId(1);
        table.publish(function, artifact(function, vec![1, 2, 3, 4]));
        let first_address = table.entry_point_cell(function).load(Ordering::Acquire);
        table.publish(function, artifact(function, vec![5, 6, 7, 8]));
        let second_address = table.entry_point_cell(function).load(Ordering::Acquire);
        assert_ne!(first_address, second_address);
        assert_eq!(table.live_artifacts(function), 2);
    }

    #[test]
    fn test_functions_have_independent_slots() {
        let table = EntryPointTable::new();
        table.publish(FunctionId(1), artifact(FunctionId(1), vec![1, 2, 3, 4]));
        assert!(table.published(FunctionId(2)).is_none());
        assert_eq!(
            table
                .entry_point_cell(FunctionId(2))
                .load(Ordering::Acquire),
            0
        );
    }
}
