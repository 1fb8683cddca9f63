//! Work Queue & Tiering Scheduler
//!
//! Decides which function gets compiled, at which tier, and in what order.
//! One outstanding work item per (function, tier) is structural: a duplicate
//! submission returns the existing handle, a pending `Simple` item is
//! promoted in place when `Full` is requested, and a `Full` item is never
//! demoted. Dequeueing is FIFO within a tier with a bounded interleave so a
//! stream of `Simple` items cannot starve a pending `Full` compile.

use crate::backend::CompiledArtifact;
use crate::error::FailureReason;
use crate::snapshot::{FunctionId, FunctionSnapshot};
use rustc_hash::FxHashMap as HashMap;
use std::collections::VecDeque;
use std::fmt;

/// How many `Simple` items may be dequeued in a row while a `Full` item
/// waits
pub const DEFAULT_SIMPLE_PER_FULL: u32 = 3;

// ==================== Tier / Priority / Handles ====================

/// Optimization tier of a compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Quick baseline compile
    Simple,
    /// Heavily optimized compile
    Full,
}

impl Tier {
    pub fn as_tag(self) -> u8 {
        match self {
            Tier::Simple => 0,
            Tier::Full => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Tier> {
        match tag {
            0 => Some(Tier::Simple),
            1 => Some(Tier::Full),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Simple => write!(f, "simple"),
            Tier::Full => write!(f, "full"),
        }
    }
}

/// Scheduling hint carried on a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    /// Front-queues within the tier
    High,
}

impl Priority {
    pub fn as_tag(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Priority> {
        match tag {
            0 => Some(Priority::Normal),
            1 => Some(Priority::High),
            _ => None,
        }
    }
}

/// Stable identity of a queued work item, unchanged across tier promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItemHandle(pub u64);

impl fmt::Display for WorkItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ==================== Work Items ====================

/// Lifecycle state of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkItemState {
    Pending,
    InFlight,
    Completed,
    Failed(FailureReason),
    /// The function became unreachable before the compilation was installed
    Discarded,
}

impl WorkItemState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkItemState::Completed | WorkItemState::Failed(_) | WorkItemState::Discarded
        )
    }
}

/// One queued request to compile one function at one tier
#[derive(Debug)]
struct WorkItem {
    handle: WorkItemHandle,
    function: FunctionId,
    tier: Tier,
    priority: Priority,
    state: WorkItemState,
    /// Taken when the item is handed to the transport
    snapshot: Option<FunctionSnapshot>,
}

/// A dispatchable job: what crosses the transport boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchJob {
    pub handle: WorkItemHandle,
    pub function: FunctionId,
    pub tier: Tier,
    pub priority: Priority,
    pub snapshot: FunctionSnapshot,
}

/// Terminal record reported by [`Scheduler::drain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub handle: WorkItemHandle,
    pub function: FunctionId,
    pub tier: Tier,
    pub state: WorkItemState,
}

// ==================== Scheduler ====================

pub struct Scheduler {
    items: HashMap<WorkItemHandle, WorkItem>,
    /// Active (non-terminal) item per function and tier
    index: HashMap<(FunctionId, Tier), WorkItemHandle>,
    simple_queue: VecDeque<WorkItemHandle>,
    full_queue: VecDeque<WorkItemHandle>,
    /// Consecutive `Simple` dispatches since the last `Full` one
    simple_run: u32,
    simple_per_full: u32,
    completions: Vec<CompletionRecord>,
    next_handle: u64,
}

impl Scheduler {
    pub fn new(simple_per_full: u32) -> Self {
        Self {
            items: HashMap::default(),
            index: HashMap::default(),
            simple_queue: VecDeque::new(),
            full_queue: VecDeque::new(),
            simple_run: 0,
            simple_per_full: simple_per_full.max(1),
            completions: Vec::new(),
            next_handle: 1,
        }
    }

    /// Submit a compilation request. Duplicate submissions for a function
    /// already queued at the same or a higher tier return the existing
    /// handle; a pending `Simple` item re-submitted as `Full` is promoted in
    /// place.
    pub fn submit(
        &mut self,
        function: FunctionId,
        tier: Tier,
        priority: Priority,
        snapshot: FunctionSnapshot,
    ) -> WorkItemHandle {
        // Same or higher tier already outstanding
        if let Some(&handle) = self.index.get(&(function, Tier::Full)) {
            return handle;
        }
        if let Some(&handle) = self.index.get(&(function, Tier::Simple)) {
            match tier {
                Tier::Simple => return handle,
                Tier::Full => {
                    let item = self.items.get_mut(&handle).expect("indexed item exists");
                    if item.state == WorkItemState::Pending {
                        // Promote in place with the fresh snapshot
                        item.tier = Tier::Full;
                        item.snapshot = Some(snapshot);
                        let priority = item.priority;
                        self.index.remove(&(function, Tier::Simple));
                        self.index.insert((function, Tier::Full), handle);
                        self.simple_queue.retain(|queued| *queued != handle);
                        self.enqueue(handle, Tier::Full, priority);
                        tracing::debug!(%function, %handle, "promoted pending item to full tier");
                        return handle;
                    }
                    // Already in flight at Simple: a separate Full item is
                    // allowed, fall through to create it.
                }
            }
        }

        let handle = WorkItemHandle(self.next_handle);
        self.next_handle += 1;
        self.items.insert(
            handle,
            WorkItem {
                handle,
                function,
                tier,
                priority,
                state: WorkItemState::Pending,
                snapshot: Some(snapshot),
            },
        );
        self.index.insert((function, tier), handle);
        self.enqueue(handle, tier, priority);
        tracing::debug!(%function, %handle, ?tier, "work item submitted");
        handle
    }

    fn enqueue(&mut self, handle: WorkItemHandle, tier: Tier, priority: Priority) {
        let queue = match tier {
            Tier::Simple => &mut self.simple_queue,
            Tier::Full => &mut self.full_queue,
        };
        match priority {
            Priority::High => queue.push_front(handle),
            Priority::Normal => queue.push_back(handle),
        }
    }

    /// Cancel one work item. Advisory for in-flight compilation; mandatory at
    /// install (a discarded result is never handed back for publication).
    pub fn cancel(&mut self, handle: WorkItemHandle) {
        let Some(item) = self.items.get_mut(&handle) else {
            return;
        };
        if item.state.is_terminal() {
            return;
        }
        item.state = WorkItemState::Discarded;
        self.index.remove(&(item.function, item.tier));
        tracing::debug!(function = %item.function, %handle, "work item discarded");
    }

    /// The garbage collector reported the function unreachable: discard all
    /// of its outstanding items.
    pub fn on_function_unreachable(&mut self, function: FunctionId) {
        let handles: Vec<WorkItemHandle> = self
            .items
            .values()
            .filter(|item| item.function == function && !item.state.is_terminal())
            .map(|item| item.handle)
            .collect();
        for handle in handles {
            self.cancel(handle);
        }
    }

    /// Dequeue the next item to hand to the transport, honoring the bounded
    /// simple/full interleave. Discarded items are dropped here, at the
    /// transport boundary, without being sent.
    pub fn next_ready(&mut self) -> Option<DispatchJob> {
        loop {
            let take_full = !self.full_queue.is_empty()
                && (self.simple_run >= self.simple_per_full || self.simple_queue.is_empty());
            let handle = if take_full {
                self.full_queue.pop_front()
            } else {
                self.simple_queue.pop_front()
            }?;

            let item = self.items.get_mut(&handle).expect("queued item exists");
            if item.state == WorkItemState::Discarded {
                self.log_completion(handle);
                continue;
            }
            debug_assert_eq!(item.state, WorkItemState::Pending);
            item.state = WorkItemState::InFlight;
            let function = item.function;
            let tier = item.tier;
            let priority = item.priority;
            let snapshot = item
                .snapshot
                .take()
                .expect("pending item carries its snapshot");
            if take_full {
                self.simple_run = 0;
            } else {
                self.simple_run += 1;
            }
            return Some(DispatchJob {
                handle,
                function,
                tier,
                priority,
                snapshot,
            });
        }
    }

    /// Record the outcome of an in-flight item. Returns the artifact when it
    /// should be installed; a discarded item's result is silently ignored.
    pub fn complete(
        &mut self,
        handle: WorkItemHandle,
        outcome: std::result::Result<CompiledArtifact, FailureReason>,
    ) -> Option<CompiledArtifact> {
        let item = self.items.get_mut(&handle)?;
        if item.state == WorkItemState::Discarded {
            self.log_completion(handle);
            return None;
        }
        let (state, artifact) = match outcome {
            Ok(artifact) => (WorkItemState::Completed, Some(artifact)),
            Err(reason) => (WorkItemState::Failed(reason), None),
        };
        item.state = state;
        self.index.remove(&(item.function, item.tier));
        self.log_completion(handle);
        artifact
    }

    /// Agent death: every in-flight item resolves `Failed`; nothing is
    /// retried automatically.
    pub fn fail_in_flight(&mut self, reason: FailureReason) -> Vec<WorkItemHandle> {
        let handles: Vec<WorkItemHandle> = self
            .items
            .values()
            .filter(|item| item.state == WorkItemState::InFlight)
            .map(|item| item.handle)
            .collect();
        for handle in &handles {
            let item = self.items.get_mut(handle).expect("item exists");
            item.state = WorkItemState::Failed(reason);
            self.index.remove(&(item.function, item.tier));
            self.log_completion(*handle);
        }
        handles
    }

    fn log_completion(&mut self, handle: WorkItemHandle) {
        if let Some(item) = self.items.remove(&handle) {
            self.completions.push(CompletionRecord {
                handle,
                function: item.function,
                tier: item.tier,
                state: item.state,
            });
        }
    }

    /// Take all terminal records accumulated since the last drain
    pub fn drain(&mut self) -> Vec<CompletionRecord> {
        std::mem::take(&mut self.completions)
    }

    /// Items queued or in flight
    pub fn outstanding(&self) -> usize {
        self.items.len()
    }

    /// Whether a given handle is still live (queued or in flight)
    pub fn is_outstanding(&self, handle: WorkItemHandle) -> bool {
        self.items
            .get(&handle)
            .map(|item| !item.state.is_terminal())
            .unwrap_or(false)
    }
}
