//! Native Code Generation Orchestrator
//!
//! The engine-facing surface of the JIT offload subsystem: owns the
//! scheduler, the transport, and the registry of interpreter-maintained
//! function profiles. The interpreter notifies it about hot and unreachable
//! functions; it captures snapshots, moves work across the agent boundary on
//! its own cadence, and publishes finished artifacts through the configured
//! [`EntryPointPublisher`].
//!
//! Nothing here blocks interpreter progress: [`CodeGenerator::pump`] is
//! non-blocking and meant for the engine's idle points;
//! [`CodeGenerator::await_idle`] is the one blocking call, for shutdown and
//! tooling.

use crate::backend::encode::Arch;
use crate::error::{Error, FailureReason, Result};
use crate::install::EntryPointPublisher;
use crate::scheduler::{Priority, Scheduler, Tier, WorkItemHandle, DEFAULT_SIMPLE_PER_FULL};
use crate::snapshot::{capture, FunctionId, FunctionProfile};
use crate::transport::wire::JobReply;
use crate::transport::{AgentMode, Transport, TransportOptions};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ==================== Configuration ====================

/// Tunables of the offload subsystem. All fields have serviceable defaults,
/// so embedders typically override just a couple via JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Call count that makes a function a `Simple`-tier candidate
    pub simple_call_threshold: u32,
    /// Call count that makes a function a `Full`-tier candidate
    pub full_call_threshold: u32,
    /// Simple-tier items dequeued in a row while a full-tier item waits
    pub simple_per_full: u32,
    pub agent: AgentMode,
    pub allow_in_process_fallback: bool,
    pub agent_timeout_ms: u64,
    /// How often `pump` re-checks agent liveness
    pub liveness_interval_ms: u64,
    pub arch: Arch,
    /// Emit every fixed-field guard even when records are linked
    pub conservative_guards: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            simple_call_threshold: 1000,
            full_call_threshold: 10_000,
            simple_per_full: DEFAULT_SIMPLE_PER_FULL,
            agent: AgentMode::InProcess,
            allow_in_process_fallback: true,
            agent_timeout_ms: 10_000,
            liveness_interval_ms: 500,
            arch: Arch::Arm64,
            conservative_guards: false,
        }
    }
}

impl JitConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|error| Error::Config(error.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("config serialization cannot fail")
    }

    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            mode: self.agent.clone(),
            arch: self.arch,
            conservative_guards: self.conservative_guards,
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
            allow_in_process_fallback: self.allow_in_process_fallback,
        }
    }
}

// ==================== Statistics ====================

/// Counters for diagnostics, cheap to copy out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeGenStats {
    /// Hotness notifications that produced or refreshed a work item
    pub submissions: u64,
    /// Artifacts handed to the publisher
    pub installed: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub capture_conflicts: u64,
    pub agent_restarts: u64,
}

impl fmt::Display for CodeGenStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== JIT Offload Summary ===")?;
        writeln!(f, "Submissions: {}", self.submissions)?;
        writeln!(f, "Installed: {}", self.installed)?;
        writeln!(
            f,
            "Results: {} completed, {} failed, {} discarded",
            self.completed, self.failed, self.discarded
        )?;
        writeln!(f, "Capture conflicts: {}", self.capture_conflicts)?;
        writeln!(f, "Agent restarts: {}", self.agent_restarts)?;
        Ok(())
    }
}

// ==================== Code Generator ====================

/// The JIT offload subsystem, one per engine instance
pub struct CodeGenerator {
    config: JitConfig,
    scheduler: Scheduler,
    transport: Transport,
    profiles: HashMap<FunctionId, Arc<FunctionProfile>>,
    publisher: Arc<dyn EntryPointPublisher>,
    stats: CodeGenStats,
    last_liveness: Instant,
}

impl CodeGenerator {
    pub fn new(config: JitConfig, publisher: Arc<dyn EntryPointPublisher>) -> Result<Self> {
        let transport = Transport::start(config.transport_options())?;
        let scheduler = Scheduler::new(config.simple_per_full);
        Ok(Self {
            config,
            scheduler,
            transport,
            profiles: HashMap::default(),
            publisher,
            stats: CodeGenStats::default(),
            last_liveness: Instant::now(),
        })
    }

    /// Make a function's profile available for capture. Called when the
    /// interpreter starts tracking the function.
    pub fn register_function(&mut self, profile: Arc<FunctionProfile>) {
        self.profiles.insert(profile.function(), profile);
    }

    /// Interpreter callback: a call-count threshold fired. Chooses the tier,
    /// captures a snapshot, and queues the work item. Returns `None` when
    /// the function is not registered, still cold, or mid-mutation (capture
    /// conflict; the next hotness notification retries).
    pub fn on_function_hot(
        &mut self,
        function: FunctionId,
        call_count: u32,
    ) -> Option<WorkItemHandle> {
        let tier = if call_count >= self.config.full_call_threshold {
            Tier::Full
        } else if call_count >= self.config.simple_call_threshold {
            Tier::Simple
        } else {
            return None;
        };
        self.submit(function, tier, Priority::Normal)
    }

    /// Queue a compilation at an explicit tier
    pub fn submit(
        &mut self,
        function: FunctionId,
        tier: Tier,
        priority: Priority,
    ) -> Option<WorkItemHandle> {
        let profile = self.profiles.get(&function)?;
        let snapshot = match capture(profile) {
            Ok(snapshot) => snapshot,
            Err(Error::CaptureConflict { .. }) => {
                self.stats.capture_conflicts += 1;
                tracing::debug!(%function, "capture conflict, dropped");
                return None;
            }
            Err(error) => {
                tracing::warn!(%function, %error, "capture failed");
                return None;
            }
        };
        let handle = self.scheduler.submit(function, tier, priority, snapshot);
        self.stats.submissions += 1;
        Some(handle)
    }

    /// Garbage collector callback: discard all outstanding work for an
    /// unreachable function. Its results, in flight or not, will never be
    /// installed.
    pub fn on_function_unreachable(&mut self, function: FunctionId) {
        self.scheduler.on_function_unreachable(function);
        self.profiles.remove(&function);
    }

    /// Cancel a single work item
    pub fn cancel(&mut self, handle: WorkItemHandle) {
        self.scheduler.cancel(handle);
    }

    /// Non-blocking progress: run the periodic liveness check, forward ready
    /// work to the agent, collect finished results, and publish them. Meant
    /// to be called from the interpreter's idle points.
    pub fn pump(&mut self) {
        if self.last_liveness.elapsed()
            >= Duration::from_millis(self.config.liveness_interval_ms)
        {
            self.run_liveness_check();
        }

        while let Some(job) = self.scheduler.next_ready() {
            let handle = job.handle;
            if let Err(error) = self.transport.send(job) {
                // The item stays in flight; the next liveness check fails it
                tracing::warn!(%handle, %error, "send to agent failed");
            }
        }

        while let Some(reply) = self.transport.poll() {
            self.finish(reply);
        }
    }

    fn run_liveness_check(&mut self) {
        self.last_liveness = Instant::now();
        let report = self.transport.check_liveness();
        if report.restarted {
            self.stats.agent_restarts += 1;
            for handle in report.failed {
                self.scheduler
                    .complete(handle, Err(FailureReason::AgentDied));
            }
        }
    }

    fn finish(&mut self, reply: JobReply) {
        if let Some(artifact) = self.scheduler.complete(reply.handle, reply.outcome) {
            let function = artifact.function;
            self.publisher.publish(function, artifact);
            self.stats.installed += 1;
        }
    }

    /// Block until no work item is queued or in flight. Shutdown/tooling
    /// path only; normal operation uses [`pump`](Self::pump).
    pub fn await_idle(&mut self) {
        while self.scheduler.outstanding() > 0 {
            self.pump();
            if self.scheduler.outstanding() == 0 {
                break;
            }
            if let Some(reply) = self.transport.await_reply(Duration::from_millis(50)) {
                self.finish(reply);
            } else {
                // Timed out: force a liveness pass so a dead agent cannot
                // wedge shutdown
                self.run_liveness_check();
            }
        }
    }

    /// Take all terminal completion records accumulated so far
    pub fn drain(&mut self) -> Vec<crate::scheduler::CompletionRecord> {
        let records = self.scheduler.drain();
        for record in &records {
            match record.state {
                crate::scheduler::WorkItemState::Completed => self.stats.completed += 1,
                crate::scheduler::WorkItemState::Failed(_) => self.stats.failed += 1,
                crate::scheduler::WorkItemState::Discarded => self.stats.discarded += 1,
                _ => {}
            }
        }
        records
    }

    pub fn stats(&self) -> &CodeGenStats {
        &self.stats
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Work items queued or in flight
    pub fn outstanding(&self) -> usize {
        self.scheduler.outstanding()
    }

    /// Connection handle of the current agent
    pub fn agent_connection(&self) -> crate::transport::AgentConnection {
        self.transport.connection()
    }

    /// Fault-injection hook: crash the agent. See [`Transport::kill_agent`].
    pub fn kill_agent_for_test(&self) {
        self.transport.kill_agent();
    }

    /// Force an immediate liveness pass regardless of the interval
    pub fn force_liveness_check(&mut self) {
        self.run_liveness_check();
    }

    /// Orderly shutdown of the agent
    pub fn shutdown(&mut self) {
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::EntryPointTable;
    use crate::scheduler::WorkItemState;
    use crate::snapshot::{BodyData, BodyOp, FixedFieldInfo};

    fn profile(function: FunctionId) -> Arc<FunctionProfile> {
        let body = BodyData::new(
            vec![
                BodyOp::GuardFixedField { local: 0, field_index: 0 },
                BodyOp::LoadConst { dst: 1, value: 3 },
                BodyOp::Add { dst: 0, lhs: 0, rhs: 1 },
                BodyOp::Return { src: 0 },
            ],
            2,
        );
        let profile = Arc::new(FunctionProfile::new(function, body));
        profile.record_fixed_field(FixedFieldInfo::constant(42));
        profile
    }

    fn generator() -> (CodeGenerator, Arc<EntryPointTable>) {
        let table = Arc::new(EntryPointTable::new());
        let generator = CodeGenerator::new(JitConfig::default(), table.clone()).unwrap();
        (generator, table)
    }

    #[test]
    fn test_cold_function_is_not_submitted() {
        let (mut generator, _) = generator();
        generator.register_function(profile(FunctionId(1)));
        assert!(generator.on_function_hot(FunctionId(1), 10).is_none());
    }

    #[test]
    fn test_tier_selection_by_call_count() {
        let (mut generator, _) = generator();
        generator.register_function(profile(FunctionId(1)));
        generator.register_function(profile(FunctionId(2)));
        let simple = generator.on_function_hot(FunctionId(1), 1000).unwrap();
        let full = generator.on_function_hot(FunctionId(2), 20_000).unwrap();
        assert_ne!(simple, full);
        generator.await_idle();
        let records = generator.drain();
        assert_eq!(records.len(), 2);
        let tiers: Vec<Tier> = records.iter().map(|record| record.tier).collect();
        assert!(tiers.contains(&Tier::Simple));
        assert!(tiers.contains(&Tier::Full));
    }

    #[test]
    fn test_unregistered_function_is_ignored() {
        let (mut generator, _) = generator();
        assert!(generator.on_function_hot(FunctionId(99), 100_000).is_none());
    }

    #[test]
    fn test_hot_function_compiles_and_installs() {
        let (mut generator, table) = generator();
        let function = FunctionId(7);
        generator.register_function(profile(function));
        generator.on_function_hot(function, 5000).unwrap();
        generator.await_idle();

        let published = table.published(function).expect("artifact installed");
        assert!(!published.code.is_empty());
        assert_eq!(generator.stats().installed, 1);
        let records = generator.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, WorkItemState::Completed);
    }

    #[test]
    fn test_unreachable_function_is_never_installed() {
        let (mut generator, table) = generator();
        let function = FunctionId(7);
        generator.register_function(profile(function));
        generator.on_function_hot(function, 5000).unwrap();
        generator.on_function_unreachable(function);
        generator.await_idle();

        assert!(table.published(function).is_none());
        let records = generator.drain();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, WorkItemState::Discarded);
        assert_eq!(generator.stats().installed, 0);
    }

    #[test]
    fn test_duplicate_hotness_reuses_work_item() {
        let (mut generator, _) = generator();
        let function = FunctionId(1);
        generator.register_function(profile(function));
        let first = generator.on_function_hot(function, 1000).unwrap();
        let second = generator.on_function_hot(function, 1001).unwrap();
        assert_eq!(first, second);
        assert_eq!(generator.outstanding(), 1);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = JitConfig::default();
        let json = config.to_json();
        let parsed = JitConfig::from_json(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_partial_config_json_uses_defaults() {
        let parsed = JitConfig::from_json(r#"{"simple_call_threshold": 5}"#).unwrap();
        assert_eq!(parsed.simple_call_threshold, 5);
        assert_eq!(
            parsed.full_call_threshold,
            JitConfig::default().full_call_threshold
        );
    }

    #[test]
    fn test_invalid_config_json_is_rejected() {
        assert!(matches!(
            JitConfig::from_json("{nonsense"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_stats_display() {
        let (generator, _) = generator();
        let rendered = format!("{}", generator.stats());
        assert!(rendered.contains("JIT Offload Summary"));
    }
}
