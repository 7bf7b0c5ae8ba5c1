//! DAP initialization sequence.
//!
//! `initialize → launch|attach (no wait) → "initialized" event → setBreakpoints →
//! configurationDone → launch|attach response`, every step wrapped by its PRE/POST hooks.
//! Backend differences come from [`AdapterProfile`](crate::adapter::AdapterProfile) values
//! only.

use crate::dap::protocol::Response;
use crate::error::{Error, Result};
use crate::hook::{HookBus, HookContext, HookPoint};
use crate::session::status::{Execution, Handshake};
use crate::session::Session;
use serde_json::{json, Value};

/// How the backend gets hold of the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StartMode {
    Launch,
    Attach,
}

impl StartMode {
    fn hook_points(self) -> (HookPoint, HookPoint) {
        match self {
            StartMode::Launch => (HookPoint::PreLaunch, HookPoint::PostLaunch),
            StartMode::Attach => (HookPoint::PreAttach, HookPoint::PostAttach),
        }
    }
}

/// Arguments for one run of the sequence.
#[derive(Debug, Clone)]
pub struct InitPlan {
    pub mode: StartMode,
    /// `initialize` arguments, built from the session's adapter profile when `None`.
    pub initialize_arguments: Option<Value>,
    /// Arguments of the `launch`/`attach` request.
    pub start_arguments: Value,
}

impl InitPlan {
    pub fn new(mode: StartMode, start_arguments: Value) -> Self {
        Self {
            mode,
            initialize_arguments: None,
            start_arguments,
        }
    }
}

/// `initialize` arguments sent when the caller has no opinion.
pub fn default_initialize_arguments(client_id: &str, adapter_id: &str) -> Value {
    json!({
        "clientID": client_id,
        "clientName": client_id,
        "adapterID": adapter_id,
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "pathFormat": "path",
        "supportsVariableType": true,
        "supportsRunInTerminalRequest": false,
        "supportsStartDebuggingRequest": true,
    })
}

/// Run the sequence against `session`.
///
/// Any failure is recorded as the session's sticky error before being returned. A hook
/// cancellation returns [`Error::HookCancelled`] and the guarded request is never sent.
pub fn initialize_session(session: &Session, hooks: &HookBus, plan: InitPlan) -> Result<()> {
    session.with_state(|s| s.handshake = Handshake::InProgress);
    let result = run_sequence(session, hooks, plan);
    match &result {
        Ok(()) => {
            let late = session.with_state(|s| {
                s.handshake = Handshake::Done;
                if s.execution == Execution::Idle {
                    s.execution = Execution::Running;
                }
                std::mem::take(&mut s.unsynced)
            });
            log::info!(target: "session", "session {} initialized", session.id());
            for file in late {
                if let Err(e) = session.sync_breakpoints(hooks, &file) {
                    log::warn!(
                        target: "session",
                        "session {}: breakpoints in {}: {e}",
                        session.id(),
                        file.display()
                    );
                }
            }
        }
        Err(e) => {
            log::warn!(target: "session", "session {} initialization failed: {e}", session.id());
            session.set_error(e.to_string());
        }
    }
    result
}

fn context(session: &Session, point: HookPoint, arguments: Value) -> HookContext {
    HookContext::for_session(point, session.id(), session.language()).with("arguments", arguments)
}

fn run_sequence(session: &Session, hooks: &HookBus, plan: InitPlan) -> Result<()> {
    let client = session.client().clone();
    let timeouts = session.profile().timeouts;

    // initialize
    let initialize_arguments = plan
        .initialize_arguments
        .unwrap_or_else(|| default_initialize_arguments("aidb", &session.profile().adapter_id));
    let mut ctx = context(session, HookPoint::PreInitialize, initialize_arguments);
    hooks.run_checked(HookPoint::PreInitialize, &mut ctx)?;
    let arguments = ctx.take("arguments").unwrap_or(Value::Null);
    let response = client
        .send_with_timeout("initialize", arguments, timeouts.request())?
        .into_result()?;
    let capabilities = response.body.clone();
    session.with_state(|s| s.capabilities = capabilities);
    ctx.set("response", response.body);
    hooks.run_checked(HookPoint::PostInitialize, &mut ctx)?;

    // launch | attach, the response only arrives after configurationDone
    let (pre, post) = plan.mode.hook_points();
    let command = plan.mode.to_string();
    let mut ctx = context(session, pre, plan.start_arguments);
    hooks.run_checked(pre, &mut ctx)?;
    let arguments = ctx.take("arguments").unwrap_or(Value::Null);
    let initialized = session
        .profile()
        .wait_for_initialized
        .then(|| client.expect_event("initialized"));
    let pending = client.send_no_wait(&command, arguments)?;

    if let Some(waiter) = initialized {
        waiter.wait(timeouts.initialized_event())?;
        log::debug!(target: "session", "session {}: backend initialized", session.id());
    }

    sync_breakpoints(session, hooks)?;

    // configurationDone
    let supported = session
        .capabilities()
        .get("supportsConfigurationDoneRequest")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if supported {
        let mut cfg_ctx = context(session, HookPoint::PreConfigurationDone, json!({}));
        hooks.run_checked(HookPoint::PreConfigurationDone, &mut cfg_ctx)?;
        let arguments = cfg_ctx.take("arguments").unwrap_or(Value::Null);
        let response = client
            .send_with_timeout("configurationDone", arguments, timeouts.request())?
            .into_result()?;
        cfg_ctx.set("response", response.body);
        hooks.run_checked(HookPoint::PostConfigurationDone, &mut cfg_ctx)?;
    } else {
        log::debug!(
            target: "session",
            "session {}: backend does not support configurationDone",
            session.id()
        );
    }

    let response = pending
        .wait(timeouts.launch_response())
        .and_then(Response::into_result)
        .map_err(|e| match e {
            Error::RequestFailed { message, .. } => {
                Error::LaunchFailure(format!("{command} rejected by backend: {message}"))
            }
            other => other,
        })?;
    ctx.set("response", response.body);
    hooks.run_checked(post, &mut ctx)
}

/// Breakpoints recorded before the handshake.
///
/// A cancelling hook or a dead connection aborts the sequence, a rejected request only
/// marks breakpoints of that file as errored. Files changed after this point are sent
/// once the handshake is done.
fn sync_breakpoints(session: &Session, hooks: &HookBus) -> Result<()> {
    for file in session.with_state(|s| std::mem::take(&mut s.unsynced)) {
        match session.sync_breakpoints(hooks, &file) {
            Ok(()) => {}
            Err(e @ (Error::HookCancelled(_) | Error::Connection(_) | Error::Protocol(_))) => {
                return Err(e)
            }
            Err(e) => {
                log::warn!(
                    target: "session",
                    "session {}: breakpoints in {}: {e}",
                    session.id(),
                    file.display()
                );
            }
        }
    }
    Ok(())
}
