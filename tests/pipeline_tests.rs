//! End-to-end tests for the JIT offload pipeline
//!
//! These drive the public surface the engine uses: register a profile,
//! report hotness, pump, and observe what the publisher receives. Unit
//! coverage for individual stages lives next to each module; this file
//! checks the cross-component properties.

mod common;

use common::{arithmetic_profile, guarded_branchy_profile};
use quicksilver_jit::backend::encode::{decode, words_of, Decoded};
use quicksilver_jit::scheduler::WorkItemState;
use quicksilver_jit::snapshot::FixedFieldInfo;
use quicksilver_jit::transport::wire;
use quicksilver_jit::{
    capture, AgentMode, CodeGenerator, EntryPointTable, FailureReason, FunctionId, JitConfig,
    Priority, Tier,
};
use std::path::PathBuf;
use std::sync::Arc;

fn in_process_generator() -> (CodeGenerator, Arc<EntryPointTable>) {
    let table = Arc::new(EntryPointTable::new());
    let generator = CodeGenerator::new(JitConfig::default(), table.clone()).unwrap();
    (generator, table)
}

fn agent_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_qjit-agent"))
}

fn out_of_process_generator() -> (CodeGenerator, Arc<EntryPointTable>) {
    let table = Arc::new(EntryPointTable::new());
    let config = JitConfig {
        agent: AgentMode::OutOfProcess {
            binary: agent_binary(),
        },
        allow_in_process_fallback: false,
        ..JitConfig::default()
    };
    let generator = CodeGenerator::new(config, table.clone()).unwrap();
    (generator, table)
}

// ==================== End-to-End Scenario ====================

#[test]
fn test_simple_tier_end_to_end() {
    let (mut jit, table) = in_process_generator();
    let function = FunctionId(1);
    let profile = guarded_branchy_profile(function, 42);

    // Capture produces exactly one fixed-field record with the observed value
    let snapshot = capture(&profile).unwrap();
    assert_eq!(snapshot.info.fixed_fields.len(), 1);
    assert_eq!(snapshot.info.fixed_fields[0], FixedFieldInfo::constant(42));

    jit.register_function(profile);
    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();
    jit.await_idle();

    let artifact = table.published(function).expect("artifact installed");
    assert!(!artifact.code.is_empty());
    assert_eq!(artifact.tier, Tier::Simple);
    // Intra-function branches only: nothing to relocate
    assert!(artifact.relocs.is_empty());

    // The guard's bailout helper is laid out after the fall-through path
    let words = words_of(&artifact.code);
    let brk_at = words
        .iter()
        .position(|word| matches!(decode(*word), Some(Decoded::Brk { .. })))
        .expect("bailout block present");
    let last_ret = words
        .iter()
        .rposition(|word| matches!(decode(*word), Some(Decoded::Ret)))
        .expect("return present");
    assert!(
        brk_at > last_ret,
        "helper block must follow the main body (brk at {brk_at}, last ret at {last_ret})"
    );

    let records = jit.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, WorkItemState::Completed);
}

#[test]
fn test_snapshot_recapture_is_byte_identical() {
    let profile = guarded_branchy_profile(FunctionId(3), 42);
    let first = capture(&profile).unwrap();
    let second = capture(&profile).unwrap();
    assert_eq!(wire::encode_snapshot(&first), wire::encode_snapshot(&second));
}

#[test]
fn test_function_valued_guard_produces_relocation() {
    // A guard against a function object embeds its address in the code, and
    // the installer gets a relocation entry pointing at it.
    let (mut jit, table) = in_process_generator();
    let function = FunctionId(4);
    jit.register_function(guarded_function_valued_profile(function));
    jit.submit(function, Tier::Full, Priority::Normal).unwrap();
    jit.await_idle();

    let artifact = table.published(function).expect("artifact installed");
    assert_eq!(artifact.relocs.len(), 1);
    assert_eq!(artifact.relocs[0].addr.raw(), 0x7F12_3456_7890);
}

fn guarded_function_valued_profile(
    function: FunctionId,
) -> Arc<quicksilver_jit::FunctionProfile> {
    use quicksilver_jit::snapshot::{BodyData, BodyOp};
    let body = BodyData::new(
        vec![
            BodyOp::GuardFixedField {
                local: 0,
                field_index: 0,
            },
            BodyOp::Return { src: 0 },
        ],
        1,
    );
    let profile = Arc::new(quicksilver_jit::FunctionProfile::new(function, body));
    profile.record_fixed_field(FixedFieldInfo {
        value: 0x7F12_3456_7890,
        func_info_addr: quicksilver_jit::RemoteAddr::new(0x6000),
        environment_addr: quicksilver_jit::RemoteAddr::new(0x6100),
        local_func_id: 1,
        next_has_same_field: false,
        is_class_ctor: false,
    });
    profile
}

// ==================== Cancellation ====================

#[test]
fn test_unreachable_before_install_is_never_installed() {
    let (mut jit, table) = in_process_generator();
    let function = FunctionId(5);
    jit.register_function(guarded_branchy_profile(function, 42));
    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();

    // The function dies while its item is still queued; the item is dropped
    // at the transport boundary and nothing is ever installed. (The
    // discarded-while-in-flight variant is covered deterministically in the
    // scheduler's unit tests.)
    jit.on_function_unreachable(function);
    jit.await_idle();

    assert!(table.published(function).is_none());
    let records = jit.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, WorkItemState::Discarded);
}

// ==================== Agent Restart ====================

/// Like [`in_process_generator`] but with periodic liveness checks
/// effectively disabled, so the crash tests control exactly when the check
/// runs.
fn crash_test_generator(agent: AgentMode) -> (CodeGenerator, Arc<EntryPointTable>) {
    let table = Arc::new(EntryPointTable::new());
    let config = JitConfig {
        agent,
        liveness_interval_ms: 3_600_000,
        allow_in_process_fallback: false,
        ..JitConfig::default()
    };
    let generator = CodeGenerator::new(config, table.clone()).unwrap();
    (generator, table)
}

#[test]
fn test_agent_crash_fails_in_flight_and_recovers() {
    let (mut jit, table) = crash_test_generator(AgentMode::InProcess);
    let function = FunctionId(6);
    jit.register_function(guarded_branchy_profile(function, 42));
    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();

    let first_connection = jit.agent_connection();

    // Crash the agent before the item can be delivered, then dispatch
    jit.kill_agent_for_test();
    jit.pump();
    jit.force_liveness_check();

    let records = jit.drain();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].state,
        WorkItemState::Failed(FailureReason::AgentDied)
    );
    assert_eq!(jit.stats().agent_restarts, 1);
    assert_ne!(jit.agent_connection().id, first_connection.id);

    // The replacement agent completes new submissions
    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();
    jit.await_idle();
    assert!(table.published(function).is_some());
}

// ==================== Out-of-Process Agent ====================

#[test]
fn test_out_of_process_agent_compiles() {
    let (mut jit, table) = out_of_process_generator();
    let function = FunctionId(7);
    jit.register_function(guarded_branchy_profile(function, 42));
    jit.submit(function, Tier::Full, Priority::Normal).unwrap();
    jit.await_idle();

    let artifact = table.published(function).expect("artifact installed");
    assert!(!artifact.code.is_empty());
    assert!(artifact.relocs.is_empty());
    let records = jit.drain();
    assert_eq!(records[0].state, WorkItemState::Completed);
}

#[test]
fn test_out_of_process_agent_crash_and_restart() {
    let (mut jit, table) = crash_test_generator(AgentMode::OutOfProcess {
        binary: agent_binary(),
    });
    let function = FunctionId(8);
    jit.register_function(guarded_branchy_profile(function, 42));
    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();

    jit.kill_agent_for_test();
    jit.pump();
    jit.force_liveness_check();

    let records = jit.drain();
    assert_eq!(records.len(), 1);
    assert!(matches!(records[0].state, WorkItemState::Failed(_)));

    jit.submit(function, Tier::Simple, Priority::Normal).unwrap();
    jit.await_idle();
    assert!(table.published(function).is_some());
    jit.shutdown();
}

// ==================== Interpreter-Facing Hotness Path ====================

#[test]
fn test_hotness_thresholds_drive_tiering() {
    let (mut jit, table) = in_process_generator();
    let function = FunctionId(9);
    jit.register_function(arithmetic_profile(function));

    assert!(jit.on_function_hot(function, 999).is_none());
    jit.on_function_hot(function, 1000).unwrap();
    jit.await_idle();
    assert_eq!(table.published(function).unwrap().tier, Tier::Simple);

    jit.on_function_hot(function, 10_000).unwrap();
    jit.await_idle();
    assert_eq!(table.published(function).unwrap().tier, Tier::Full);
    // The simple-tier artifact stays alive for calls still inside it
    assert_eq!(table.live_artifacts(function), 2);
}

#[test]
fn test_results_match_by_function_identity() {
    // Submissions complete in whatever order; each artifact lands on its own
    // function.
    let (mut jit, table) = in_process_generator();
    let functions: Vec<FunctionId> = (20..28).map(FunctionId).collect();
    for function in &functions {
        jit.register_function(guarded_branchy_profile(*function, 42));
        jit.submit(*function, Tier::Simple, Priority::Normal).unwrap();
    }
    jit.await_idle();
    for function in &functions {
        let artifact = table.published(*function).expect("every function installed");
        assert_eq!(artifact.function, *function);
    }
}
