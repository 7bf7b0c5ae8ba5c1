//! Debug sessions.
//!
//! A [`Session`] is one logical debugging conversation. It composes the protocol client of
//! its backend, the backend process (if this engine owns one), the leased port and the
//! breakpoint set. Child sessions (spawned by runtimes that debug subprocesses over the
//! same backend) share their parent's client and process and only add a routing entry.

pub mod breakpoint;
pub mod init;
pub mod registry;
pub mod status;

use crate::adapter::AdapterProfile;
use crate::dap::client::{ProtocolClient, SubscriptionId};
use crate::dap::protocol::{Event, Response};
use crate::error::{Error, Result};
use crate::hook::{HookBus, HookContext, HookPoint};
use crate::resource::port::PortLease;
use crate::resource::process::ProcessHandle;
use breakpoint::{Breakpoint, BreakpointSet, BreakpointSpec};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use status::{compute_status, Execution, Handshake, ProcessState, Status, StatusInputs};
use std::fmt::{Display, Formatter};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Weak};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Position of a session in the parent/child tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lineage {
    Root,
    Child { parent: SessionId, thread_id: i64 },
}

/// Mutable part of a session, updated by protocol events and explicit operations.
#[derive(Debug, Default)]
pub struct SessionState {
    pub handshake: Handshake,
    pub execution: Execution,
    /// Sticky, once set the session reports [`Status::Error`].
    pub error: Option<String>,
    pub breakpoints: BreakpointSet,
    /// Files whose breakpoints changed before the handshake finished, not sent yet.
    pub unsynced: BTreeSet<PathBuf>,
    pub children: Vec<SessionId>,
    pub capabilities: Value,
    pub stopped_thread: Option<i64>,
    pub stop_reason: Option<String>,
    pub exit_code: Option<i64>,
}

/// Snapshot returned to callers listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub language: String,
    pub status: Status,
    pub parent: Option<SessionId>,
    pub children: Vec<SessionId>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub breakpoints: usize,
    pub error: Option<String>,
}

pub struct Session {
    id: SessionId,
    language: String,
    lineage: Lineage,
    profile: Arc<AdapterProfile>,
    client: Arc<ProtocolClient>,
    process: Option<Arc<ProcessHandle>>,
    port: Mutex<Option<PortLease>>,
    state: Mutex<SessionState>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Session {
    /// Create a root session owning `client`, every event not claimed by a child route is
    /// delivered to it.
    pub fn new(
        id: SessionId,
        profile: Arc<AdapterProfile>,
        client: Arc<ProtocolClient>,
        process: Option<Arc<ProcessHandle>>,
        port: Option<PortLease>,
    ) -> Arc<Self> {
        client.set_owner(id);
        let session = Arc::new(Self {
            id,
            language: profile.language.clone(),
            lineage: Lineage::Root,
            profile,
            client,
            process,
            port: Mutex::new(port),
            state: Mutex::new(SessionState::default()),
            subscriptions: Mutex::new(vec![]),
        });
        session.install_event_handlers();
        session
    }

    /// Create a child session on the connection of `parent`.
    ///
    /// Events carrying `thread_id` are routed to the child from now on. The child is
    /// considered initialized, its handshake is the parent's.
    pub fn new_child(parent: &Session, id: SessionId, thread_id: i64) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            language: parent.language.clone(),
            lineage: Lineage::Child {
                parent: parent.id,
                thread_id,
            },
            profile: parent.profile.clone(),
            client: parent.client.clone(),
            process: parent.process.clone(),
            port: Mutex::new(None),
            state: Mutex::new(SessionState {
                handshake: Handshake::Done,
                execution: Execution::Running,
                capabilities: parent.state.lock().capabilities.clone(),
                ..Default::default()
            }),
            subscriptions: Mutex::new(vec![]),
        });
        session.install_event_handlers();
        parent.client.add_route(thread_id, id);
        parent.state.lock().children.push(id);
        session
    }

    fn install_event_handlers(self: &Arc<Self>) {
        type Apply = fn(&mut SessionState, &Event);
        let handlers: [(&str, Apply); 5] = [
            ("stopped", |state, event| {
                state.execution = Execution::Paused;
                state.stopped_thread = event.thread_id();
                state.stop_reason = event
                    .body
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
            }),
            ("continued", |state, _| {
                state.execution = Execution::Running;
                state.stopped_thread = None;
                state.stop_reason = None;
            }),
            ("terminated", |state, _| {
                state.execution = Execution::Terminated;
            }),
            ("exited", |state, event| {
                state.exit_code = event.body.get("exitCode").and_then(Value::as_i64);
            }),
            ("breakpoint", |state, event| {
                state.breakpoints.apply_event(&event.body);
            }),
        ];

        let mut subscriptions = self.subscriptions.lock();
        for (name, apply) in handlers {
            let weak: Weak<Session> = Arc::downgrade(self);
            let id = self.client.subscribe_session(self.id, name, move |event, _| {
                if let Some(session) = weak.upgrade() {
                    apply(&mut session.state.lock(), event);
                }
            });
            subscriptions.push(id);
        }
    }

    /// Stop receiving events: drop subscriptions and child routes of this session.
    pub fn detach_events(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.client.unsubscribe(id);
        }
        if let Lineage::Child { .. } = self.lineage {
            self.client.remove_routes(self.id);
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn profile(&self) -> &AdapterProfile {
        &self.profile
    }

    pub fn lineage(&self) -> Lineage {
        self.lineage
    }

    pub fn is_child(&self) -> bool {
        matches!(self.lineage, Lineage::Child { .. })
    }

    pub fn parent(&self) -> Option<SessionId> {
        match self.lineage {
            Lineage::Root => None,
            Lineage::Child { parent, .. } => Some(parent),
        }
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    pub fn process(&self) -> Option<&Arc<ProcessHandle>> {
        self.process.as_ref()
    }

    /// Port lease, children never own one.
    pub fn port(&self) -> Option<PortLease> {
        self.port.lock().clone()
    }

    pub fn take_port(&self) -> Option<PortLease> {
        self.port.lock().take()
    }

    pub fn children(&self) -> Vec<SessionId> {
        self.state.lock().children.clone()
    }

    pub fn remove_child(&self, child: SessionId) {
        self.state.lock().children.retain(|c| *c != child);
    }

    /// Set sticky error, the first error is kept.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(message.into());
        }
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub fn capabilities(&self) -> Value {
        self.state.lock().capabilities.clone()
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state.lock().breakpoints.iter().cloned().collect()
    }

    /// Run `f` with state locked.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Current status, computed from live connection, process and protocol state.
    pub fn status(&self) -> Status {
        let process = match &self.process {
            None => ProcessState::Unknown,
            Some(p) if p.has_exited() => ProcessState::Exited,
            Some(_) => ProcessState::Alive,
        };
        let connected = self.client.is_connected();
        let state = self.state.lock();
        compute_status(StatusInputs {
            error: state.error.is_some(),
            handshake: state.handshake,
            is_child: self.is_child(),
            connected,
            process,
            execution: state.execution,
        })
    }

    pub fn info(&self) -> SessionInfo {
        let status = self.status();
        let state = self.state.lock();
        SessionInfo {
            id: self.id,
            language: self.language.clone(),
            status,
            parent: self.parent(),
            children: state.children.clone(),
            port: self.port.lock().as_ref().map(PortLease::port),
            pid: self.process.as_ref().map(|p| p.pid()),
            breakpoints: state.breakpoints.len(),
            error: state.error.clone(),
        }
    }

    /// Send an arbitrary request over the session connection.
    pub fn send_request(&self, command: &str, arguments: Value) -> Result<Response> {
        self.client.send(command, arguments)
    }

    /// Replace breakpoints of `file`.
    ///
    /// Before the handshake completes breakpoints are only recorded and go out with the
    /// initialization sequence (or right after it, when they arrive once the sequence has
    /// already sent its breakpoints). Afterwards a `setBreakpoints` request is sent right away.
    pub fn set_breakpoints(
        &self,
        hooks: &HookBus,
        file: &Path,
        specs: &[BreakpointSpec],
    ) -> Result<Vec<Breakpoint>> {
        let breakpoints = specs
            .iter()
            .map(|spec| Breakpoint::from_spec(file, spec, self.profile.hit_conditions))
            .collect::<Result<Vec<_>>>()?;

        let handshake_done = {
            let mut state = self.state.lock();
            state.breakpoints.replace(file, breakpoints);
            let done = state.handshake == Handshake::Done;
            if !done {
                state.unsynced.insert(file.to_path_buf());
            }
            done
        };
        if handshake_done {
            self.sync_breakpoints(hooks, file)?;
        }
        Ok(self.state.lock().breakpoints.for_file(file).to_vec())
    }

    pub fn clear_breakpoints(&self, hooks: &HookBus, file: &Path) -> Result<()> {
        self.set_breakpoints(hooks, file, &[]).map(|_| ())
    }

    /// Send stored breakpoints of `file` to the backend, wrapped by the breakpoint hooks.
    pub(crate) fn sync_breakpoints(&self, hooks: &HookBus, file: &Path) -> Result<()> {
        let arguments = self.state.lock().breakpoints.request_arguments(file);
        let mut ctx = HookContext::for_session(HookPoint::PreSetBreakpoints, self.id, &self.language)
            .with("source", Value::String(file.to_string_lossy().into_owned()))
            .with("arguments", arguments);
        hooks.run_checked(HookPoint::PreSetBreakpoints, &mut ctx)?;
        let arguments = ctx.take("arguments").unwrap_or(Value::Null);

        let response = self
            .client
            .send("setBreakpoints", arguments)
            .and_then(Response::into_result);
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.state.lock().breakpoints.mark_error(file, &e.to_string());
                return Err(e);
            }
        };
        self.state
            .lock()
            .breakpoints
            .apply_response(file, &response.body);

        ctx.set("response", response.body);
        hooks.run_checked(HookPoint::PostSetBreakpoints, &mut ctx)
    }

    /// Fail with [`Error::Validation`] unless the session is in one of `allowed` states.
    pub fn ensure_status(&self, allowed: &[Status]) -> Result<Status> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(status)
        } else {
            Err(Error::Validation(format!(
                "session {} is {status}, expected one of {}",
                self.id,
                itertools::join(allowed.iter(), ", ")
            )))
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("lineage", &self.lineage)
            .finish()
    }
}
