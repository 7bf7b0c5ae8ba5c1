//! Debug engine, the entry point for tool layers.
//!
//! Starts sessions (backend process, port, connection, initialization), passes requests and
//! event subscriptions through, and tears sessions down with the three-tier cleanup.

use crate::adapter::{AdapterProfile, AdapterRegistry, DebugAdapter};
use crate::config::{Config, TransportKind};
use crate::dap::client::{ClientOptions, ProtocolClient, SubscriptionId};
use crate::dap::protocol::{merge_arguments, Event, Response};
use crate::dap::tracer::FileTracer;
use crate::dap::transport::Transport;
use crate::error::{Error, Result};
use crate::hook::{HookBus, HookContext, HookPoint};
use crate::resource::cleanup::CleanupReport;
use crate::resource::orphan::ReaperHandle;
use crate::resource::port::PortLease;
use crate::resource::process::{LaunchSpec, Pipes, ProcessHandle, ProcessKind};
use crate::resource::ResourceManager;
use crate::session::breakpoint::{Breakpoint, BreakpointSpec};
use crate::session::init::{initialize_session, InitPlan, StartMode};
use crate::session::registry::SessionRegistry;
use crate::session::status::Status;
use crate::session::{Session, SessionId, SessionInfo};
use crate::weak_error;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the debug backend comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backend {
    /// Launch it with the language adapter.
    #[default]
    Spawn,
    /// Connect to an already running debug server, nothing is launched or leased.
    Connect { host: String, port: u16 },
}

/// Session start request.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub language: String,
    pub target: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub backend: Backend,
    pub mode: StartMode,
    /// Port for the backend, overrides the adapter default.
    pub port: Option<u16>,
    /// Breakpoints sent during initialization.
    pub breakpoints: Vec<(PathBuf, Vec<BreakpointSpec>)>,
    /// Merged over the adapter's `launch`/`attach` arguments.
    pub arguments: Value,
}

impl SessionConfig {
    pub fn new(language: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            target: target.into(),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            backend: Backend::Spawn,
            mode: StartMode::Launch,
            port: None,
            breakpoints: vec![],
            arguments: json!({}),
        }
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn mode(mut self, mode: StartMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn breakpoints(mut self, file: impl Into<PathBuf>, specs: Vec<BreakpointSpec>) -> Self {
        self.breakpoints.push((file.into(), specs));
        self
    }

    pub fn arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Backend wiring produced while starting a session.
struct Wiring {
    transport: Transport,
    process: Option<Arc<ProcessHandle>>,
    lease: Option<PortLease>,
}

impl Wiring {
    /// Undo a partially started backend.
    fn abandon(process: Option<&ProcessHandle>, lease: Option<&PortLease>, timeout: std::time::Duration) {
        if let Some(process) = process {
            weak_error!(target: "engine", process.stop(timeout), "stop abandoned backend:");
        }
        if let Some(lease) = lease {
            lease.release();
        }
    }
}

pub struct DebugEngine {
    config: Config,
    adapters: AdapterRegistry,
    hooks: Arc<HookBus>,
    sessions: Arc<SessionRegistry>,
    resources: ResourceManager,
    tracer: Option<FileTracer>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl DebugEngine {
    /// Engine with adapters declared in `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let adapters = AdapterRegistry::from_config(&config)?;
        let resources = ResourceManager::new(&config)?;
        Ok(Self::from_parts(config, adapters, resources))
    }

    pub fn from_parts(config: Config, adapters: AdapterRegistry, resources: ResourceManager) -> Self {
        let tracer = match (config.trace.dap, config.trace.log_file.as_deref()) {
            (false, _) => None,
            (true, Some(path)) => weak_error!(target: "engine", FileTracer::new(path), "open DAP trace file:"),
            (true, None) => {
                log::warn!(target: "engine", "DAP tracing enabled without `trace.log_file`, ignored");
                None
            }
        };
        Self {
            config,
            adapters,
            hooks: Arc::new(HookBus::new()),
            sessions: Arc::new(SessionRegistry::new()),
            resources,
            tracer,
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn DebugAdapter>) {
        self.adapters.register(adapter);
    }

    /// Start the background orphan reaper if enabled in configuration.
    pub fn start_reaper(&self) -> Result<()> {
        let cfg = self.config.reaper;
        if !cfg.enabled {
            return Ok(());
        }
        let mut slot = self.reaper.lock();
        if slot.is_some() {
            return Ok(());
        }
        let sessions = self.sessions.clone();
        let reaper = Arc::new(
            self.resources
                .reaper(cfg.min_age(), Arc::new(move |id: SessionId| sessions.owns(id))),
        );
        *slot = Some(reaper.spawn(cfg.interval())?);
        log::info!(target: "engine", "orphan reaper started, interval {:?}", cfg.interval());
        Ok(())
    }

    /// Start a debug session and run its initialization sequence.
    ///
    /// On failure everything acquired so far is released and the session is not registered.
    pub fn start_session(&self, request: SessionConfig) -> Result<SessionId> {
        let adapter = self.adapters.get(&request.language)?;
        let profile = Arc::new(adapter.profile().clone());
        for (file, specs) in &request.breakpoints {
            for spec in specs {
                Breakpoint::from_spec(file, spec, profile.hit_conditions)?;
            }
        }

        let id = SessionId::new();
        log::info!(
            target: "engine",
            "starting {} session {id} for `{}`",
            request.language,
            request.target
        );

        let Wiring {
            transport,
            process,
            lease,
        } = self.wire_backend(id, adapter.as_ref(), &profile, &request)?;

        let options = ClientOptions {
            name: format!("{}-{}", request.language, &id.to_string()[..8]),
            request_timeout: profile.timeouts.request(),
        };
        let client = match ProtocolClient::start(transport, options) {
            Ok(client) => client,
            Err(e) => {
                Wiring::abandon(process.as_deref(), lease.as_ref(), profile.timeouts.process_stop());
                return Err(e);
            }
        };
        client.on_reverse_request("startDebugging", move |req| {
            log::info!(
                target: "engine",
                "session {id}: backend asks for a child session ({})",
                req.arguments.get("request").and_then(Value::as_str).unwrap_or("unknown")
            );
            Ok(Value::Null)
        });

        let session = Session::new(id, profile, client, process, lease);
        // registered before initialization so the reaper treats the backend as live
        self.sessions.insert(session.clone());
        for (file, specs) in &request.breakpoints {
            if let Err(e) = session.set_breakpoints(&self.hooks, file, specs) {
                self.teardown_tree(&session);
                return Err(e);
            }
        }

        let start_arguments = match request.mode {
            StartMode::Launch => merge_arguments(
                adapter.launch_arguments(&request.target, &request.args),
                &request.arguments,
            ),
            StartMode::Attach => request.arguments.clone(),
        };
        let plan = InitPlan::new(request.mode, start_arguments);
        if let Err(e) = initialize_session(&session, &self.hooks, plan) {
            self.teardown_tree(&session);
            return Err(e);
        }
        Ok(id)
    }

    fn wire_backend(
        &self,
        id: SessionId,
        adapter: &dyn DebugAdapter,
        profile: &AdapterProfile,
        request: &SessionConfig,
    ) -> Result<Wiring> {
        let timeouts = profile.timeouts;

        if let Backend::Connect { host, port } = &request.backend {
            let addr = (host.as_str(), *port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::Connection(format!("can not resolve `{host}`")))?;
            let transport =
                Transport::connect(addr, timeouts.connect(), self.tracer.clone(), || Ok(()))?;
            return Ok(Wiring {
                transport,
                process: None,
                lease: None,
            });
        }

        let lease = match profile.transport {
            TransportKind::Tcp => Some(self.resources.acquire_port(id, profile, request.port)?),
            TransportKind::Stdio => None,
        };
        let abandon = |process: Option<&ProcessHandle>| {
            Wiring::abandon(process, lease.as_ref(), timeouts.process_stop())
        };

        let argv = match adapter.build_launch_command(
            &request.target,
            &self.config.host,
            lease.as_ref().map(PortLease::port),
            &request.args,
        ) {
            Ok(argv) => argv,
            Err(e) => {
                abandon(None);
                return Err(Error::LaunchFailure(format!("{e:#}")));
            }
        };
        let mut env = adapter.extra_environment();
        env.extend(request.env.clone());
        let spec = LaunchSpec {
            argv,
            env,
            cwd: request.cwd.clone(),
            pipes: match profile.transport {
                TransportKind::Tcp => Pipes::Null,
                TransportKind::Stdio => Pipes::Dap,
            },
        };

        if let Some(lease) = &lease {
            lease.handoff();
        }
        let process = match self.resources.launch(id, ProcessKind::Adapter, &spec) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                abandon(None);
                return Err(e);
            }
        };

        let transport = match &lease {
            None => process
                .take_stdio()
                .map(|(stdin, stdout)| Transport::stdio(stdin, stdout, self.tracer.clone()))
                .ok_or_else(|| Error::LaunchFailure("backend stdio is not piped".to_string())),
            Some(lease) => {
                Transport::connect(lease.addr(), timeouts.connect(), self.tracer.clone(), || {
                    match process.exit_status() {
                        Some(status) => Err(Error::LaunchFailure(format!(
                            "backend `{}` exited before accepting connections ({status})",
                            process.command()
                        ))),
                        None => Ok(()),
                    }
                })
            }
        };
        match transport {
            Ok(transport) => Ok(Wiring {
                transport,
                process: Some(process),
                lease,
            }),
            Err(e) => {
                abandon(Some(&process));
                Err(match e {
                    Error::Connection(msg) => Error::LaunchFailure(msg),
                    other => other,
                })
            }
        }
    }

    /// Send an arbitrary request to a session (to its latest child if it has children).
    pub fn send_request(&self, id: SessionId, command: &str, arguments: Value) -> Result<Response> {
        self.sessions.resolve(id)?.send_request(command, arguments)
    }

    /// Subscribe to events routed to session `id`.
    pub fn subscribe(
        &self,
        id: SessionId,
        event: &str,
        handler: impl Fn(&Event, Option<SessionId>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let session = self.sessions.require(id)?;
        Ok(session.client().subscribe_session(id, event, handler))
    }

    pub fn unsubscribe(&self, id: SessionId, subscription: SubscriptionId) -> Result<()> {
        self.sessions.require(id)?.client().unsubscribe(subscription);
        Ok(())
    }

    pub fn set_breakpoints(
        &self,
        id: SessionId,
        file: &Path,
        specs: &[BreakpointSpec],
    ) -> Result<Vec<Breakpoint>> {
        self.sessions
            .require(id)?
            .set_breakpoints(&self.hooks, file, specs)
    }

    pub fn clear_breakpoints(&self, id: SessionId, file: &Path) -> Result<()> {
        self.sessions
            .require(id)?
            .clear_breakpoints(&self.hooks, file)
    }

    /// Attach a child session to `parent`'s connection, events of `thread_id` go to it.
    pub fn attach_child_session(&self, parent: SessionId, thread_id: i64) -> Result<SessionId> {
        let parent = self.sessions.require(parent)?;
        if parent.is_child() {
            return Err(Error::Validation(format!(
                "session {} is a child session, children attach to root sessions only",
                parent.id()
            )));
        }
        parent.ensure_status(&[Status::Connected, Status::Running, Status::Paused])?;
        let child = Session::new_child(&parent, SessionId::new(), thread_id);
        let id = child.id();
        self.sessions.insert(child);
        log::info!(
            target: "engine",
            "child session {id} attached to {} (thread {thread_id})",
            parent.id()
        );
        Ok(id)
    }

    pub fn session_status(&self, id: SessionId) -> Result<Status> {
        Ok(self.sessions.require(id)?.status())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.list().iter().map(|s| s.info()).collect();
        sessions.sort_by_key(|s| (s.parent.is_some(), s.id));
        sessions
    }

    /// Stop a session and its children.
    ///
    /// A PRE_STOP hook may veto the stop. Once teardown starts it always runs to the end,
    /// tier failures are returned in the report, not as an error.
    pub fn stop_session(&self, id: SessionId) -> Result<CleanupReport> {
        let session = self.sessions.require(id)?;
        let mut ctx = HookContext::for_session(HookPoint::PreStop, id, session.language());
        self.hooks.run_checked(HookPoint::PreStop, &mut ctx)?;

        let report = self.teardown_tree(&session);

        let mut ctx = HookContext::for_session(HookPoint::PostStop, id, session.language())
            .with("clean", Value::Bool(report.is_clean()));
        self.hooks.run(HookPoint::PostStop, &mut ctx);
        Ok(report)
    }

    /// Tear down `session` after all of its children.
    ///
    /// The registry lock is held only while the tree is detached. Protocol, process and
    /// hook work runs without it, other sessions stay usable meanwhile.
    fn teardown_tree(&self, session: &Arc<Session>) -> CleanupReport {
        let mut root_report = None;
        for detached in self.sessions.detach_tree(session.id()) {
            let report = self.cleanup(&detached);
            self.sessions.retired(detached.id());
            if detached.id() == session.id() {
                root_report = Some(report);
            } else if !report.is_clean() {
                log::warn!(
                    target: "engine",
                    "child session {} cleaned up with {} failures",
                    detached.id(),
                    report.failures.len()
                );
            }
        }
        root_report.unwrap_or_else(|| {
            log::debug!(target: "engine", "session {} is already being stopped", session.id());
            CleanupReport::default()
        })
    }

    /// Cleanup hooks around the three-tier teardown of one detached session.
    fn cleanup(&self, session: &Session) -> CleanupReport {
        let mut ctx =
            HookContext::for_session(HookPoint::PreCleanup, session.id(), session.language());
        self.hooks.run(HookPoint::PreCleanup, &mut ctx);
        if ctx.cancelled {
            log::warn!(
                target: "engine",
                "session {}: cleanup can not be cancelled, continuing",
                session.id()
            );
        }

        let report = self.resources.teardown(session);

        let failures: Vec<Value> = report
            .failures
            .iter()
            .map(|f| Value::String(f.to_string()))
            .collect();
        let tiers: Vec<Value> = report
            .tiers
            .iter()
            .map(|t| Value::String(t.to_string()))
            .collect();
        let mut ctx =
            HookContext::for_session(HookPoint::PostCleanup, session.id(), session.language())
                .with("tiers", Value::Array(tiers))
                .with("failures", Value::Array(failures));
        self.hooks.run(HookPoint::PostCleanup, &mut ctx);

        log::info!(target: "engine", "session {} stopped", session.id());
        report
    }

    /// Stop every session and the reaper.
    pub fn shutdown(&self) {
        let roots: Vec<_> = self
            .sessions
            .list()
            .into_iter()
            .filter(|s| !s.is_child())
            .collect();
        for session in roots {
            self.teardown_tree(&session);
        }
        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
    }
}

impl Drop for DebugEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DebugEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugEngine")
            .field("adapters", &self.adapters)
            .field("sessions", &self.sessions)
            .finish()
    }
}
