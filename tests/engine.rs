mod common;

use aidb::adapter::{AdapterProfile, TemplateAdapter};
use aidb::config::{HitConditionSupport, PortRange, TransportKind};
use aidb::dap::protocol::Event;
use aidb::error::Tier;
use aidb::resource::orphan::{ProcessSource, SystemProcesses, Verdict};
use aidb::resource::process::{process_running, LaunchSpec, ProcessKind};
use aidb::session::breakpoint::BreakpointSpec;
use aidb::session::init::StartMode;
use aidb::{
    Backend, Config, DebugEngine, Error, HookContext, HookPoint, SessionConfig, SessionId, Status,
};
use common::{eventually, standard_script, FakeBackend, Flow};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::json;
use serial_test::serial;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FAKE_BACKEND: &str = env!("CARGO_BIN_EXE_fake_backend");

fn engine_with(profile: AdapterProfile, command: &[&str]) -> anyhow::Result<DebugEngine> {
    engine_with_config(Config::default(), profile, command)
}

fn engine_with_config(
    config: Config,
    profile: AdapterProfile,
    command: &[&str],
) -> anyhow::Result<DebugEngine> {
    let mut engine = DebugEngine::new(config)?;
    let command = command.iter().map(ToString::to_string).collect();
    engine.register_adapter(Arc::new(TemplateAdapter::new(profile, command)));
    Ok(engine)
}

fn remote_engine() -> anyhow::Result<DebugEngine> {
    engine_with(AdapterProfile::new("python"), &["debugpy", "--listen", "{host}:{port}"])
}

fn remote(backend: &FakeBackend) -> SessionConfig {
    SessionConfig::new("python", "app.py").backend(Backend::Connect {
        host: "127.0.0.1".to_string(),
        port: backend.port(),
    })
}

fn free_port() -> anyhow::Result<u16> {
    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

#[test]
fn test_remote_session_lifecycle() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;

    let id = engine.start_session(
        remote(&backend)
            .args(["--verbose"])
            .breakpoints("/src/app.py", vec![BreakpointSpec::at(4)]),
    )?;
    assert_eq!(
        backend.commands(),
        vec!["initialize", "launch", "setBreakpoints", "configurationDone"]
    );
    let initialize = backend.request("initialize").unwrap();
    assert_eq!(initialize["arguments"]["adapterID"], "python");
    let launch = backend.request("launch").unwrap();
    assert_eq!(launch["arguments"]["program"], "app.py");
    assert_eq!(launch["arguments"]["args"], json!(["--verbose"]));

    assert_eq!(engine.session_status(id)?, Status::Running);
    let sessions = engine.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, id);
    assert_eq!(sessions[0].language, "python");
    assert_eq!(sessions[0].breakpoints, 1);
    assert_eq!(sessions[0].pid, None);
    assert_eq!(sessions[0].port, None);

    let response = engine.send_request(id, "threads", json!({}))?;
    assert!(response.success);

    let report = engine.stop_session(id)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(
        report.tiers,
        vec![Tier::Disconnect, Tier::Terminate, Tier::ReleasePort]
    );
    assert_eq!(report.stop, None);
    let disconnect = backend.request("disconnect").unwrap();
    assert_eq!(disconnect["arguments"]["terminateDebuggee"], false);

    assert!(engine.list_sessions().is_empty());
    assert!(matches!(
        engine.session_status(id),
        Err(Error::SessionNotFound(_))
    ));
    backend.join();
    Ok(())
}

#[test]
fn test_launch_arguments_are_merged() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;

    engine.start_session(
        remote(&backend).arguments(json!({ "program": "/abs/app.py", "stopOnEntry": true })),
    )?;
    let launch = backend.request("launch").unwrap();
    assert_eq!(launch["arguments"]["program"], "/abs/app.py");
    assert_eq!(launch["arguments"]["stopOnEntry"], true);
    Ok(())
}

#[test]
fn test_attach_mode() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;

    let id = engine.start_session(
        remote(&backend)
            .mode(StartMode::Attach)
            .arguments(json!({ "processId": 4242 })),
    )?;
    let attach = backend.request("attach").unwrap();
    assert_eq!(attach["arguments"], json!({ "processId": 4242 }));
    assert!(backend.request("launch").is_none());
    assert_eq!(engine.session_status(id)?, Status::Running);
    Ok(())
}

#[test]
fn test_pre_launch_cancel_aborts_start() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;
    engine
        .hooks()
        .register(HookPoint::PreLaunch, 90, "target-check", |ctx| {
            ctx.cancel("target not found");
            Ok(())
        })?;

    let err = engine.start_session(remote(&backend)).unwrap_err();
    assert!(matches!(&err, Error::HookCancelled(m) if m == "target not found"), "{err}");
    assert!(backend.request("launch").is_none());
    // failed start is torn down and unregistered
    assert!(engine.list_sessions().is_empty());
    assert!(backend.wait_for("disconnect"));
    Ok(())
}

#[test]
fn test_invalid_breakpoint_fails_before_connecting() -> anyhow::Result<()> {
    let mut profile = AdapterProfile::new("javascript");
    profile.hit_conditions = HitConditionSupport::Exact;
    let engine = engine_with(profile, &["node", "{program}"])?;

    let request = SessionConfig::new("javascript", "app.js").backend(Backend::Connect {
        host: "127.0.0.1".to_string(),
        port: free_port()?,
    });
    let bp = BreakpointSpec {
        hit_condition: Some(">5".to_string()),
        ..BreakpointSpec::at(3)
    };
    let err = engine
        .start_session(request.breakpoints("/src/app.js", vec![bp]))
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");
    Ok(())
}

#[test]
fn test_unknown_language() -> anyhow::Result<()> {
    let engine = remote_engine()?;
    let err = engine
        .start_session(SessionConfig::new("cobol", "main.cbl"))
        .unwrap_err();
    assert!(matches!(&err, Error::UnknownAdapter(l) if l == "cobol"), "{err}");
    Ok(())
}

#[test]
fn test_child_sessions() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;
    let parent = engine.start_session(remote(&backend))?;

    let child = engine.attach_child_session(parent, 1)?;
    assert_eq!(engine.session_status(child)?, Status::Running);
    let err = engine.attach_child_session(child, 2).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err}");

    let sessions = engine.list_sessions();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, parent);
    assert_eq!(sessions[0].children, vec![child]);
    assert_eq!(sessions[1].parent, Some(parent));

    // `stopped` for thread 1 is routed to the child, the parent keeps running
    let stopped = Arc::new(Mutex::new(vec![]));
    engine.subscribe(child, "stopped", {
        let stopped = stopped.clone();
        move |event: &Event, target| stopped.lock().unwrap().push((event.thread_id(), target))
    })?;
    engine.send_request(parent, "pause", json!({ "threadId": 1 }))?;
    assert!(eventually(|| engine.session_status(child).ok() == Some(Status::Paused)));
    assert_eq!(engine.session_status(parent)?, Status::Running);
    assert_eq!(*stopped.lock().unwrap(), vec![(Some(1), Some(child))]);

    let cleaned = Arc::new(Mutex::new(vec![]));
    engine
        .hooks()
        .register(HookPoint::PostCleanup, 50, "recorder", {
            let cleaned = cleaned.clone();
            move |ctx: &mut HookContext| {
                cleaned.lock().unwrap().extend(ctx.session_id);
                Ok(())
            }
        })?;
    let report = engine.stop_session(parent)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(*cleaned.lock().unwrap(), vec![child, parent]);
    assert!(engine.list_sessions().is_empty());
    Ok(())
}

#[test]
fn test_pre_stop_cancel_keeps_session() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;
    let id = engine.start_session(remote(&backend))?;

    let hook = engine
        .hooks()
        .register(HookPoint::PreStop, 0, "keep-alive", |ctx| {
            ctx.cancel("session is pinned");
            Ok(())
        })?;
    let err = engine.stop_session(id).unwrap_err();
    assert!(matches!(err, Error::HookCancelled(_)), "{err}");
    assert_eq!(engine.session_status(id)?, Status::Running);
    assert!(backend.request("disconnect").is_none());

    assert!(engine.hooks().unregister(hook));
    engine.stop_session(id)?;
    assert!(backend.wait_for("disconnect"));
    Ok(())
}

#[test]
fn test_backend_death_is_observed() -> anyhow::Result<()> {
    let backend = FakeBackend::standard()?;
    let engine = remote_engine()?;
    let id = engine.start_session(remote(&backend))?;

    // a disconnect issued behind the engine's back closes the backend connection
    engine.send_request(id, "disconnect", json!({}))?;
    backend.join();
    assert!(eventually(|| engine.session_status(id).ok() == Some(Status::Terminated)));

    let report = engine.stop_session(id)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    Ok(())
}

#[test]
#[serial]
fn test_missing_backend_binary() -> anyhow::Result<()> {
    let engine = engine_with(
        AdapterProfile::new("python"),
        &["aidb-definitely-missing-backend", "--port", "{port}"],
    )?;
    let port = free_port()?;

    let err = engine
        .start_session(SessionConfig::new("python", "app.py").port(port))
        .unwrap_err();
    assert!(matches!(err, Error::LaunchFailure(_)), "{err}");
    assert!(!engine.resources().ports().is_leased(port));
    assert!(engine.list_sessions().is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_backend_exiting_before_connect() -> anyhow::Result<()> {
    let engine = engine_with(AdapterProfile::new("python"), &["sh", "-c", "exit 3"])?;
    let port = free_port()?;

    let err = engine
        .start_session(SessionConfig::new("python", "app.py").port(port))
        .unwrap_err();
    assert!(
        matches!(&err, Error::LaunchFailure(m) if m.contains("exited before accepting connections")),
        "{err}"
    );
    assert!(!engine.resources().ports().is_leased(port));
    Ok(())
}

#[test]
fn test_stdio_backend_without_command() -> anyhow::Result<()> {
    let mut profile = AdapterProfile::new("go");
    profile.transport = TransportKind::Stdio;
    let engine = engine_with(profile, &[])?;

    let err = engine
        .start_session(SessionConfig::new("go", "main.go"))
        .unwrap_err();
    assert!(matches!(err, Error::LaunchFailure(_)), "{err}");
    Ok(())
}

fn gone(pid: u32) -> bool {
    matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn tagged_with(session: SessionId) -> Vec<u32> {
    SystemProcesses
        .snapshot()
        .into_iter()
        .filter(|p| p.tags.session_id == session)
        .map(|p| p.pid)
        .collect()
}

fn unique_owner() -> Config {
    Config {
        owner: format!("aidb-test-{}", uuid::Uuid::new_v4()),
        ..Config::default()
    }
}

#[test]
fn test_stdio_backend_session() -> anyhow::Result<()> {
    let mut profile = AdapterProfile::new("go");
    profile.transport = TransportKind::Stdio;
    let engine = engine_with(profile, &[FAKE_BACKEND])?;

    let id = engine.start_session(
        SessionConfig::new("go", "main.go").breakpoints("/src/main.go", vec![BreakpointSpec::at(5)]),
    )?;
    assert_eq!(engine.session_status(id)?, Status::Running);
    let info = engine.list_sessions().remove(0);
    assert_eq!(info.port, None);
    let pid = info.pid.expect("stdio backend is spawned");

    let report = engine.stop_session(id)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert!(gone(pid));
    assert!(engine.list_sessions().is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_spawned_backend_releases_port() -> anyhow::Result<()> {
    let engine = engine_with(
        AdapterProfile::new("python"),
        &[FAKE_BACKEND, "--port", "{port}"],
    )?;
    let port = free_port()?;

    let id = engine.start_session(SessionConfig::new("python", "app.py").port(port))?;
    let info = engine.list_sessions().remove(0);
    assert_eq!(info.port, Some(port));
    let pid = info.pid.expect("backend is spawned");
    assert!(engine.resources().ports().is_leased(port));

    let report = engine.stop_session(id)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(
        report.tiers,
        vec![Tier::Disconnect, Tier::Terminate, Tier::ReleasePort]
    );
    assert!(gone(pid));
    assert!(!engine.resources().ports().is_leased(port));
    TcpListener::bind(("127.0.0.1", port))?;
    Ok(())
}

#[test]
#[serial]
fn test_stragglers_are_swept() -> anyhow::Result<()> {
    let engine = engine_with(
        AdapterProfile::new("python"),
        &[FAKE_BACKEND, "--port", "{port}", "--straggler"],
    )?;

    let id = engine.start_session(SessionConfig::new("python", "app.py"))?;
    let backend = engine.list_sessions()[0].pid.expect("backend is spawned");
    assert!(eventually(|| tagged_with(id).iter().any(|pid| *pid != backend)));
    let straggler = tagged_with(id)
        .into_iter()
        .find(|pid| *pid != backend)
        .expect("straggler is tagged");

    let report = engine.stop_session(id)?;
    assert!(report.is_clean(), "{:?}", report.failures);
    // the straggler is not our child, init reaps it
    assert!(eventually(|| !process_running(straggler)));
    assert!(eventually(|| tagged_with(id).is_empty()));
    Ok(())
}

#[test]
#[serial]
fn test_teardown_does_not_block_other_sessions() -> anyhow::Result<()> {
    let mut config = Config::default();
    config.timeouts.disconnect = 1500;
    let engine = engine_with_config(
        config,
        AdapterProfile::new("python"),
        &["debugpy", "--listen", "{host}:{port}"],
    )?;

    let mut standard = standard_script();
    let silent = FakeBackend::start(move |request, peer| {
        if request["command"] == "disconnect" {
            return Ok(Flow::Continue);
        }
        standard(request, peer)
    })?;
    let other = FakeBackend::standard()?;
    let stuck = engine.start_session(remote(&silent))?;
    let alive = engine.start_session(remote(&other))?;

    thread::scope(|s| -> anyhow::Result<()> {
        let stopping = s.spawn(|| engine.stop_session(stuck));
        assert!(silent.wait_for("disconnect"));

        let start = Instant::now();
        assert_eq!(engine.session_status(alive)?, Status::Running);
        assert_eq!(engine.list_sessions().len(), 1);
        assert!(start.elapsed() < Duration::from_millis(500));

        let report = stopping.join().expect("stop thread")?;
        assert!(report.failed(Tier::Disconnect));
        Ok(())
    })?;
    assert!(matches!(
        engine.session_status(stuck),
        Err(Error::SessionNotFound(_))
    ));
    Ok(())
}

#[test]
#[serial]
fn test_engines_do_not_reap_each_other() -> anyhow::Result<()> {
    let config = unique_owner();
    let first = DebugEngine::new(config.clone())?;
    let second = DebugEngine::new(config)?;
    let process = second.resources().launch(
        SessionId::new(),
        ProcessKind::Adapter,
        &LaunchSpec::new(vec!["sleep".to_string(), "30".to_string()]),
    )?;

    let reaper = first
        .resources()
        .reaper(Duration::ZERO, Arc::new(|_: SessionId| false));
    let report = reaper.reap_once();
    assert!(report
        .verdicts
        .iter()
        .any(|(info, v)| info.pid == process.pid() && *v == Verdict::OtherEngine));
    assert!(report.reaped.is_empty());
    assert!(!process.has_exited());

    drop(second);
    let report = reaper.reap_once();
    assert!(report.reaped.iter().any(|(pid, _)| *pid == process.pid()));
    assert!(process.has_exited());
    Ok(())
}

#[test]
#[serial]
fn test_engines_share_port_registry() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::default();
    config.ports.registry_dir = Some(dir.path().to_path_buf());
    let first = DebugEngine::new(config.clone())?;
    let second = DebugEngine::new(config)?;
    let port = free_port()?;

    let lease = first.resources().acquire_port(
        SessionId::new(),
        &AdapterProfile::new("python"),
        Some(port),
    )?;
    // the socket is closed for the backend, only the claim protects the port now
    lease.handoff();

    let mut profile = AdapterProfile::new("python");
    profile.fallback_ports = Some(PortRange::new(port, port + 1));
    let err = second
        .resources()
        .acquire_port(SessionId::new(), &profile, Some(port))
        .unwrap_err();
    assert!(matches!(err, Error::LaunchFailure(_)), "{err}");

    lease.release();
    let lease = second
        .resources()
        .acquire_port(SessionId::new(), &profile, Some(port))?;
    assert_eq!(lease.port(), port);
    Ok(())
}
