use aidb::resource::orphan::{
    EngineRegistration, OrphanReaper, ProcessSource, SystemProcesses, Verdict,
};
use aidb::resource::process::{
    launch, stop_pid, LaunchSpec, ProcessKind, ProcessTags, StopOutcome,
};
use aidb::SessionId;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const STOP_TIMEOUT: Duration = Duration::from_secs(3);

fn owner() -> String {
    format!("aidb-test-{}", uuid::Uuid::new_v4())
}

fn spec(argv: &[&str]) -> LaunchSpec {
    LaunchSpec::new(argv.iter().map(ToString::to_string).collect())
}

fn gone(pid: u32) -> bool {
    matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn environ(pid: u32) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/environ"))?;
    Ok(raw
        .split(|b| *b == 0)
        .filter(|v| !v.is_empty())
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect())
}

#[test]
#[serial]
fn test_launched_process_is_tagged() -> anyhow::Result<()> {
    let session = SessionId::new();
    let tags = ProcessTags::new(owner(), session, ProcessKind::Adapter);
    let process = launch(&spec(&["sleep", "30"]), tags.clone())?;

    let found = ProcessTags::from_environ(&environ(process.pid())?);
    assert_eq!(found, Some(tags));
    assert_eq!(process.command(), "sleep 30");
    assert!(!process.has_exited());

    assert_eq!(process.stop(STOP_TIMEOUT)?, StopOutcome::Graceful);
    assert!(process.has_exited());
    assert!(gone(process.pid()));
    Ok(())
}

#[test]
#[serial]
fn test_stop_escalates_to_sigkill() -> anyhow::Result<()> {
    let tags = ProcessTags::new(owner(), SessionId::new(), ProcessKind::Adapter);
    // ignored signals stay ignored across exec, so `sleep` ignores SIGTERM too
    let process = launch(&spec(&["sh", "-c", "trap '' TERM; sleep 30"]), tags)?;
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    assert_eq!(
        process.stop(Duration::from_millis(500))?,
        StopOutcome::Forced
    );
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(process.has_exited());
    assert!(gone(process.pid()));
    Ok(())
}

#[test]
#[serial]
fn test_stop_already_exited() -> anyhow::Result<()> {
    let tags = ProcessTags::new(owner(), SessionId::new(), ProcessKind::Adapter);
    let process = launch(&spec(&["true"]), tags)?;

    let deadline = Instant::now() + STOP_TIMEOUT;
    while !process.has_exited() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(process.stop(STOP_TIMEOUT)?, StopOutcome::AlreadyExited);
    assert!(process.exit_status().is_some_and(|s| s.success()));
    Ok(())
}

#[test]
#[serial]
fn test_reaper_spares_live_and_young_processes() -> anyhow::Result<()> {
    let owner = owner();
    let live = SessionId::new();
    let process = launch(
        &spec(&["sleep", "30"]),
        ProcessTags::new(owner.clone(), live, ProcessKind::Adapter),
    )?;
    let source: Arc<dyn ProcessSource> = Arc::new(SystemProcesses);

    let reaper = OrphanReaper::new(
        owner.clone(),
        Duration::ZERO,
        STOP_TIMEOUT,
        source.clone(),
        Arc::new(move |id: SessionId| id == live),
    );
    let report = reaper.reap_once();
    let verdicts: Vec<_> = report
        .verdicts
        .iter()
        .filter(|(info, _)| info.pid == process.pid())
        .map(|(_, v)| *v)
        .collect();
    assert_eq!(verdicts, vec![Verdict::Live]);
    assert!(report.reaped.is_empty());

    let reaper = OrphanReaper::new(
        owner.clone(),
        Duration::from_secs(3600),
        STOP_TIMEOUT,
        source.clone(),
        Arc::new(|_: SessionId| false),
    );
    let report = reaper.reap_once();
    assert!(report
        .verdicts
        .iter()
        .any(|(info, v)| info.pid == process.pid() && *v == Verdict::TooYoung));
    assert!(!process.has_exited());

    let reaper = OrphanReaper::new(
        "somebody-else",
        Duration::ZERO,
        STOP_TIMEOUT,
        source,
        Arc::new(|_: SessionId| false),
    );
    let report = reaper.reap_once();
    assert!(report
        .verdicts
        .iter()
        .any(|(info, v)| info.pid == process.pid() && *v == Verdict::NotOwned));
    assert!(!process.has_exited());

    process.stop(STOP_TIMEOUT)?;
    Ok(())
}

#[test]
#[serial]
fn test_reaper_terminates_orphans() -> anyhow::Result<()> {
    let owner = owner();
    let orphan = launch(
        &spec(&["sleep", "30"]),
        ProcessTags::new(owner.clone(), SessionId::new(), ProcessKind::Adapter),
    )?;
    let pooled = launch(
        &spec(&["sleep", "30"]),
        ProcessTags::new(owner.clone(), SessionId::new(), ProcessKind::PoolResource),
    )?;

    let reaper = OrphanReaper::new(
        owner,
        Duration::ZERO,
        STOP_TIMEOUT,
        Arc::new(SystemProcesses),
        Arc::new(|_: SessionId| false),
    );
    let report = reaper.reap_once();
    assert_eq!(report.reaped, vec![(orphan.pid(), StopOutcome::Graceful)]);
    assert!(report.failures.is_empty());
    // waiting reaps the zombie
    assert!(orphan.has_exited());
    assert!(gone(orphan.pid()));

    assert!(!pooled.has_exited());
    pooled.stop(STOP_TIMEOUT)?;
    Ok(())
}

#[test]
#[serial]
fn test_background_reaper() -> anyhow::Result<()> {
    let owner = owner();
    let orphan = launch(
        &spec(&["sleep", "30"]),
        ProcessTags::new(owner.clone(), SessionId::new(), ProcessKind::Adapter),
    )?;

    let reaper = Arc::new(OrphanReaper::new(
        owner,
        Duration::ZERO,
        STOP_TIMEOUT,
        Arc::new(SystemProcesses),
        Arc::new(|_: SessionId| false),
    ));
    let mut handle = reaper.spawn(Duration::from_millis(100))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !orphan.has_exited() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    handle.stop();
    assert!(orphan.has_exited());
    assert!(gone(orphan.pid()));
    Ok(())
}


#[test]
#[serial]
fn test_reaper_spares_processes_of_running_engines() -> anyhow::Result<()> {
    let owner = owner();
    let engine = EngineRegistration::new();
    let process = launch(
        &spec(&["sleep", "30"]),
        ProcessTags::new(owner.clone(), SessionId::new(), ProcessKind::Adapter)
            .with_engine(engine.id()),
    )?;

    // a standalone reaper knows no sessions at all
    let reaper = OrphanReaper::new(
        owner,
        Duration::ZERO,
        STOP_TIMEOUT,
        Arc::new(SystemProcesses),
        Arc::new(|_: SessionId| false),
    );
    let report = reaper.reap_once();
    assert!(report
        .verdicts
        .iter()
        .any(|(info, v)| info.pid == process.pid() && *v == Verdict::OtherEngine));
    assert!(report.reaped.is_empty());
    assert!(!process.has_exited());

    drop(engine);
    let report = reaper.reap_once();
    assert_eq!(report.reaped, vec![(process.pid(), StopOutcome::Graceful)]);
    assert!(process.has_exited());
    assert!(gone(process.pid()));
    Ok(())
}

#[test]
#[serial]
fn test_stop_pid_on_foreign_zombie() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pid_file = dir.path().join("zombie.pid");
    // `sleep 0` exits and is never waited for by the exec'd parent
    let parent = launch(
        &spec(&[
            "sh",
            "-c",
            &format!("sleep 0 & echo $! > {}; exec sleep 30", pid_file.display()),
        ]),
        ProcessTags::new(owner(), SessionId::new(), ProcessKind::Adapter),
    )?;

    let deadline = Instant::now() + STOP_TIMEOUT;
    let zombie = loop {
        let pid = std::fs::read_to_string(&pid_file)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        if let Some(pid) = pid {
            let state = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
            if state.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')) {
                break pid;
            }
        }
        assert!(Instant::now() < deadline, "zombie did not appear");
        thread::sleep(Duration::from_millis(20));
    };

    let start = Instant::now();
    assert_eq!(stop_pid(zombie, Duration::from_secs(2))?, StopOutcome::AlreadyExited);
    assert!(start.elapsed() < Duration::from_secs(1));

    parent.stop(STOP_TIMEOUT)?;
    Ok(())
}
