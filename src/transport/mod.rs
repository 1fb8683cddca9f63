//! Transport & Agent Lifecycle
//!
//! Moves work items and their snapshots to the compilation agent and carries
//! artifacts back. The agent is either a worker thread in this process or a
//! separate `qjit-agent` process speaking the framed wire format over its
//! standard streams; both run the same backend, so out-of-process isolation
//! is a configuration choice.
//!
//! Liveness is checked periodically by the owner: a dead or unresponsive
//! agent fails every in-flight item, is restarted under a fresh connection
//! id, and nothing is retried automatically.

pub mod wire;

use crate::backend::encode::Arch;
use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::scheduler::{DispatchJob, WorkItemHandle};
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wire::JobReply;

// ==================== Configuration ====================

/// Where the compilation agent runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AgentMode {
    /// Worker thread inside the engine process
    InProcess,
    /// Separate agent process for isolation
    OutOfProcess { binary: PathBuf },
}

/// Transport construction options
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub mode: AgentMode,
    pub arch: Arch,
    pub conservative_guards: bool,
    /// Unresponsiveness beyond this is treated as agent death
    pub agent_timeout: Duration,
    /// Fall back to an in-process worker when the agent process cannot be
    /// started or restarted
    pub allow_in_process_fallback: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            mode: AgentMode::InProcess,
            arch: Arch::Arm64,
            conservative_guards: false,
            agent_timeout: Duration::from_secs(10),
            allow_in_process_fallback: true,
        }
    }
}

// ==================== Connection Handle ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    InProcess,
    ChildProcess,
}

/// Handle naming the currently live agent; replaced wholesale on restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentConnection {
    pub id: u64,
    pub kind: AgentKind,
}

/// Result of one liveness check
#[derive(Debug, Clone, Default)]
pub struct LivenessReport {
    /// The agent was found dead and a new one was started
    pub restarted: bool,
    /// In-flight items that resolve `Failed` because of the death
    pub failed: Vec<WorkItemHandle>,
}

// ==================== Queues ====================

/// Job inbox shared with the in-process worker thread
struct JobQueue {
    inner: Mutex<(VecDeque<DispatchJob>, bool)>,
    available: Condvar,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), false)),
            available: Condvar::new(),
        }
    }

    fn push(&self, job: DispatchJob) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.1 {
            return Err(Error::transport("agent inbox is closed"));
        }
        inner.0.push_back(job);
        self.available.notify_one();
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().unwrap().1 = true;
        self.available.notify_all();
    }

    /// Blocks until a job arrives or the queue closes
    fn pop(&self) -> Option<DispatchJob> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(job) = inner.0.pop_front() {
                return Some(job);
            }
            if inner.1 {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }
}

/// Reply outbox shared by every agent incarnation
struct ReplyQueue {
    inner: Mutex<VecDeque<JobReply>>,
    available: Condvar,
}

impl ReplyQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push(&self, reply: JobReply) {
        self.inner.lock().unwrap().push_back(reply);
        self.available.notify_all();
    }

    fn try_pop(&self) -> Option<JobReply> {
        self.inner.lock().unwrap().pop_front()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<JobReply> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(reply) = inner.pop_front() {
                return Some(reply);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.available.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }
}

// ==================== Agent Implementations ====================

struct InProcessAgent {
    inbox: Arc<JobQueue>,
    worker: Option<JoinHandle<()>>,
}

impl InProcessAgent {
    fn start(options: &TransportOptions, replies: Arc<ReplyQueue>) -> Self {
        let inbox = Arc::new(JobQueue::new());
        let worker_inbox = Arc::clone(&inbox);
        let backend =
            Backend::new(options.arch).with_conservative_guards(options.conservative_guards);
        let worker = std::thread::Builder::new()
            .name("qjit-worker".into())
            .spawn(move || {
                while let Some(job) = worker_inbox.pop() {
                    let outcome = backend
                        .compile(&job.snapshot, job.tier)
                        .map_err(|error| {
                            tracing::warn!(function = %job.function, %error, "compilation failed");
                            error.failure_reason()
                        });
                    replies.push(JobReply {
                        handle: job.handle,
                        outcome,
                    });
                }
            })
            .expect("worker thread spawn cannot fail");
        Self {
            inbox,
            worker: Some(worker),
        }
    }

    fn is_alive(&self) -> bool {
        self.worker
            .as_ref()
            .map(|worker| !worker.is_finished())
            .unwrap_or(false)
    }

    /// Close the inbox and wait for the worker to wind down
    fn kill(&mut self) {
        self.inbox.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn shutdown(mut self) {
        self.kill();
    }
}

struct ChildAgent {
    child: Child,
    stdin: ChildStdin,
    reader: Option<JoinHandle<()>>,
}

impl ChildAgent {
    fn start(binary: &PathBuf, connection_id: u64, options: &TransportOptions, replies: Arc<ReplyQueue>) -> Result<Self> {
        let mut command = Command::new(binary);
        command
            .arg("--connection-id")
            .arg(connection_id.to_string())
            .arg("--arch")
            .arg(options.arch.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if options.conservative_guards {
            command.arg("--conservative-guards");
        }
        let mut child = command
            .spawn()
            .map_err(|error| Error::transport(format!("failed to start agent process: {error}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("agent stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("agent stdout unavailable"))?;

        // Pump replies off the pipe until the agent exits
        let reader = std::thread::Builder::new()
            .name("qjit-agent-reader".into())
            .spawn(move || {
                let mut stdout = stdout;
                loop {
                    match wire::read_frame(&mut stdout) {
                        Ok(Some(frame)) => match wire::read_reply(&mut Cursor::new(&frame)) {
                            Ok(reply) => replies.push(reply),
                            Err(error) => {
                                tracing::warn!(%error, "discarding malformed agent reply");
                            }
                        },
                        Ok(None) => break,
                        Err(error) => {
                            tracing::warn!(%error, "agent stream error");
                            break;
                        }
                    }
                }
            })
            .expect("reader thread spawn cannot fail");

        Ok(Self {
            child,
            stdin,
            reader: Some(reader),
        })
    }

    fn send(&mut self, arch: Arch, job: &DispatchJob) -> Result<()> {
        let mut payload = Vec::new();
        wire::write_request(&mut payload, arch, job)?;
        wire::write_frame(&mut self.stdin, &payload)
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }

    fn shutdown(mut self) {
        // Closing stdin lets the agent drain and exit on its own
        drop(self.stdin);
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

enum AgentImpl {
    InProcess(InProcessAgent),
    Child(ChildAgent),
    /// All compilation capability exhausted; the engine runs interpreted
    Dead,
}

// ==================== Transport ====================

struct TransportState {
    connection: AgentConnection,
    agent: AgentImpl,
    /// Send time of every item currently at the agent
    in_flight: HashMap<WorkItemHandle, Instant>,
}

/// The engine-side endpoint owning the agent lifecycle
pub struct Transport {
    options: TransportOptions,
    state: Mutex<TransportState>,
    replies: Arc<ReplyQueue>,
    next_connection_id: AtomicU64,
}

impl Transport {
    /// Start the configured agent. When the agent process cannot be spawned
    /// and fallback is allowed, compilation continues on an in-process
    /// worker; the code path is identical either way.
    pub fn start(options: TransportOptions) -> Result<Self> {
        let replies = Arc::new(ReplyQueue::new());
        let next_connection_id = AtomicU64::new(1);
        let (connection, agent) = Self::start_agent(
            &options,
            &replies,
            next_connection_id.fetch_add(1, Ordering::SeqCst),
        )?;
        tracing::info!(connection_id = connection.id, kind = ?connection.kind, "compilation agent started");
        Ok(Self {
            options,
            state: Mutex::new(TransportState {
                connection,
                agent,
                in_flight: HashMap::default(),
            }),
            replies,
            next_connection_id,
        })
    }

    fn start_agent(
        options: &TransportOptions,
        replies: &Arc<ReplyQueue>,
        connection_id: u64,
    ) -> Result<(AgentConnection, AgentImpl)> {
        match &options.mode {
            AgentMode::InProcess => {
                let agent = InProcessAgent::start(options, Arc::clone(replies));
                Ok((
                    AgentConnection {
                        id: connection_id,
                        kind: AgentKind::InProcess,
                    },
                    AgentImpl::InProcess(agent),
                ))
            }
            AgentMode::OutOfProcess { binary } => {
                match ChildAgent::start(binary, connection_id, options, Arc::clone(replies)) {
                    Ok(agent) => Ok((
                        AgentConnection {
                            id: connection_id,
                            kind: AgentKind::ChildProcess,
                        },
                        AgentImpl::Child(agent),
                    )),
                    Err(error) if options.allow_in_process_fallback => {
                        tracing::warn!(%error, "agent process unavailable, compiling in process");
                        let agent = InProcessAgent::start(options, Arc::clone(replies));
                        Ok((
                            AgentConnection {
                                id: connection_id,
                                kind: AgentKind::InProcess,
                            },
                            AgentImpl::InProcess(agent),
                        ))
                    }
                    Err(error) => Err(error),
                }
            }
        }
    }

    /// The current connection handle
    pub fn connection(&self) -> AgentConnection {
        self.state.lock().unwrap().connection
    }

    /// Hand one work item to the agent. Non-blocking; the reply arrives via
    /// [`poll`](Self::poll) or [`await_reply`](Self::await_reply).
    ///
    /// A delivery error leaves the item in flight: the next liveness check
    /// notices the dead agent and fails it, so callers need not retry.
    pub fn send(&self, job: DispatchJob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let connection_id = state.connection.id;
        state.in_flight.insert(job.handle, Instant::now());
        let arch = self.options.arch;
        match &mut state.agent {
            AgentImpl::InProcess(agent) => agent.inbox.push(job),
            AgentImpl::Child(agent) => agent.send(arch, &job),
            AgentImpl::Dead => Err(Error::AgentDead { connection_id }),
        }
    }

    /// Non-blocking completion poll
    pub fn poll(&self) -> Option<JobReply> {
        let reply = self.replies.try_pop()?;
        self.state.lock().unwrap().in_flight.remove(&reply.handle);
        Some(reply)
    }

    /// Blocking completion wait, used by shutdown and tooling paths only
    pub fn await_reply(&self, timeout: Duration) -> Option<JobReply> {
        let reply = self.replies.pop_timeout(timeout)?;
        self.state.lock().unwrap().in_flight.remove(&reply.handle);
        Some(reply)
    }

    /// Number of items at the agent without a reply yet
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    /// Check the agent and restart it if it died or went unresponsive.
    /// Every item that was in flight is reported failed; none is resent.
    pub fn check_liveness(&self) -> LivenessReport {
        let mut state = self.state.lock().unwrap();

        let alive = match &mut state.agent {
            AgentImpl::InProcess(agent) => agent.is_alive(),
            AgentImpl::Child(agent) => agent.is_alive(),
            AgentImpl::Dead => false,
        };
        let stuck = state
            .in_flight
            .values()
            .any(|sent| sent.elapsed() > self.options.agent_timeout);

        if alive && !stuck {
            return LivenessReport::default();
        }

        let dead_connection = state.connection.id;
        tracing::warn!(
            connection_id = dead_connection,
            stuck,
            "compilation agent lost, restarting"
        );

        // Tear down whatever is left of the old agent
        match std::mem::replace(&mut state.agent, AgentImpl::Dead) {
            AgentImpl::InProcess(mut agent) => agent.kill(),
            AgentImpl::Child(mut agent) => agent.kill(),
            AgentImpl::Dead => {}
        }

        // Drop replies raced in from the dead agent; their items fail below
        while self.replies.try_pop().is_some() {}

        let failed: Vec<WorkItemHandle> = state.in_flight.drain().map(|(handle, _)| handle).collect();

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        match Self::start_agent(&self.options, &self.replies, connection_id) {
            Ok((connection, agent)) => {
                state.connection = connection;
                state.agent = agent;
                tracing::info!(connection_id, "compilation agent restarted");
            }
            Err(error) => {
                tracing::warn!(%error, "agent restart failed, running interpreted only");
                state.connection = AgentConnection {
                    id: connection_id,
                    kind: state.connection.kind,
                };
                state.agent = AgentImpl::Dead;
            }
        }

        LivenessReport {
            restarted: true,
            failed,
        }
    }

    /// Fault-injection hook for tests and tooling: terminate the agent
    /// without any cleanup, as a crash would.
    pub fn kill_agent(&self) {
        let mut state = self.state.lock().unwrap();
        match &mut state.agent {
            AgentImpl::InProcess(agent) => agent.kill(),
            AgentImpl::Child(agent) => {
                let _ = agent.child.kill();
                let _ = agent.child.wait();
            }
            AgentImpl::Dead => {}
        }
    }

    /// Orderly shutdown of the agent
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut state.agent, AgentImpl::Dead) {
            AgentImpl::InProcess(agent) => agent.shutdown(),
            AgentImpl::Child(agent) => agent.shutdown(),
            AgentImpl::Dead => {}
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ==================== Agent-Side Serving ====================

/// Request-reply loop run by the agent over its standard streams. Returns
/// when the engine closes the request stream.
pub fn serve_agent<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    conservative_guards: bool,
) -> Result<()> {
    while let Some(frame) = wire::read_frame(reader)? {
        let (arch, job) = match wire::read_request(&mut Cursor::new(&frame)) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!(%error, "rejecting malformed request");
                continue;
            }
        };
        let backend = Backend::new(arch).with_conservative_guards(conservative_guards);
        let outcome = backend.compile(&job.snapshot, job.tier).map_err(|error| {
            tracing::warn!(function = %job.function, %error, "compilation failed");
            error.failure_reason()
        });
        let reply = JobReply {
            handle: job.handle,
            outcome,
        };
        let mut payload = Vec::new();
        wire::write_reply(&mut payload, &reply)?;
        wire::write_frame(writer, &payload)?;
    }
    Ok(())
}
