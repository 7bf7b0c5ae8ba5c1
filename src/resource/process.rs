//! Debug backend processes.
//!
//! Every process launched here runs in its own process group and carries ownership tags in
//! its environment. The tags survive the engine itself, the orphan reaper uses them to find
//! backends whose session is gone.

use crate::error::{Error, Result};
use crate::muted_error;
use crate::session::SessionId;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{getpgid, Pid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use sysinfo::{ProcessStatus, System};
use uuid::Uuid;

pub const OWNER_ENV: &str = "AIDB_OWNER";
pub const SESSION_ENV: &str = "AIDB_SESSION_ID";
pub const PROCESS_TYPE_ENV: &str = "AIDB_PROCESS_TYPE";
pub const ENGINE_ENV: &str = "AIDB_ENGINE";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ProcessKind {
    /// Backend owned by exactly one session.
    Adapter,
    /// Shared backend kept alive across sessions, never reaped.
    PoolResource,
}

/// Engine instance that launched a process: its OS process plus an id unique per
/// [`ResourceManager`](crate::resource::ResourceManager), written as `<pid>:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId {
    pub pid: u32,
    pub instance: Uuid,
}

impl EngineId {
    /// Fresh id for an engine living in the current process.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            instance: Uuid::new_v4(),
        }
    }
}

impl Display for EngineId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.pid, self.instance)
    }
}

impl FromStr for EngineId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("invalid engine id `{s}`"));
        let (pid, instance) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            pid: pid.parse().map_err(|_| invalid())?,
            instance: Uuid::parse_str(instance).map_err(|_| invalid())?,
        })
    }
}

/// Ownership tags written into a process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTags {
    pub owner: String,
    pub session_id: SessionId,
    pub kind: ProcessKind,
    /// Launching engine, absent on processes tagged by hand.
    pub engine: Option<EngineId>,
}

impl ProcessTags {
    pub fn new(owner: impl Into<String>, session_id: SessionId, kind: ProcessKind) -> Self {
        Self {
            owner: owner.into(),
            session_id,
            kind,
            engine: None,
        }
    }

    pub fn with_engine(mut self, engine: EngineId) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (OWNER_ENV, self.owner.clone()),
            (SESSION_ENV, self.session_id.to_string()),
            (PROCESS_TYPE_ENV, self.kind.to_string()),
        ];
        if let Some(engine) = &self.engine {
            env.push((ENGINE_ENV, engine.to_string()));
        }
        env
    }

    /// Parse tags from `KEY=VALUE` environment entries.
    ///
    /// Returns `None` unless owner, session and process type are present and well formed,
    /// a process with partial tags is not ours to touch. A malformed engine tag is ignored.
    pub fn from_environ<S: AsRef<str>>(environ: &[S]) -> Option<Self> {
        let mut owner = None;
        let mut session_id = None;
        let mut kind = None;
        let mut engine = None;
        for entry in environ {
            let Some((key, value)) = entry.as_ref().split_once('=') else {
                continue;
            };
            match key {
                OWNER_ENV => owner = Some(value.to_string()),
                SESSION_ENV => session_id = SessionId::from_str(value).ok(),
                PROCESS_TYPE_ENV => kind = ProcessKind::from_str(value).ok(),
                ENGINE_ENV => engine = EngineId::from_str(value).ok(),
                _ => {}
            }
        }
        Some(Self {
            owner: owner?,
            session_id: session_id?,
            kind: kind?,
            engine,
        })
    }
}

/// How the backend is wired to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pipes {
    /// Backend listens on a socket, stdio is discarded.
    #[default]
    Null,
    /// Backend speaks DAP on stdin/stdout.
    Dap,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub pipes: Pipes,
}

impl LaunchSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }
}

/// Result of [`ProcessHandle::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum StopOutcome {
    AlreadyExited,
    /// Process group exited after the terminate signal.
    Graceful,
    /// Process group had to be killed.
    Forced,
}

/// A launched backend process.
pub struct ProcessHandle {
    pid: Pid,
    pgid: Pid,
    tags: ProcessTags,
    started: SystemTime,
    command: String,
    child: Mutex<Child>,
    exit: Mutex<Option<ExitStatus>>,
    /// Leader was reaped outside of this handle.
    lost: AtomicBool,
}

/// Spawn `spec` tagged with `tags`, in a new process group.
pub fn launch(spec: &LaunchSpec, tags: ProcessTags) -> Result<ProcessHandle> {
    let Some(program) = spec.argv.first() else {
        return Err(Error::LaunchFailure("empty command line".to_string()));
    };
    let path = which::which(program)
        .map_err(|e| Error::LaunchFailure(format!("{program}: {e}")))?;

    let mut cmd = Command::new(&path);
    cmd.args(&spec.argv[1..])
        .envs(&spec.env)
        .envs(tags.env())
        .process_group(0)
        .stderr(Stdio::null());
    match spec.pipes {
        Pipes::Null => cmd.stdin(Stdio::null()).stdout(Stdio::null()),
        Pipes::Dap => cmd.stdin(Stdio::piped()).stdout(Stdio::piped()),
    };
    if let Some(cwd) = spec.cwd.as_deref() {
        cmd.current_dir(cwd);
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::LaunchFailure(format!("spawn {}: {e}", path.display())))?;
    let pid = Pid::from_raw(child.id() as i32);
    let command = spec.argv.join(" ");
    log::info!(
        target: "resource",
        "launched `{command}` (pid {pid}) for session {}",
        tags.session_id
    );

    Ok(ProcessHandle {
        pid,
        // process_group(0) makes the child a group leader
        pgid: pid,
        tags,
        started: SystemTime::now(),
        command,
        child: Mutex::new(child),
        exit: Mutex::new(None),
        lost: AtomicBool::new(false),
    })
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn pgid(&self) -> Pid {
        self.pgid
    }

    pub fn tags(&self) -> &ProcessTags {
        &self.tags
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Take DAP pipes of a [`Pipes::Dap`] process, only the first call gets them.
    pub fn take_stdio(&self) -> Option<(ChildStdin, ChildStdout)> {
        let mut child = self.child.lock();
        match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }

    /// Exit status of the group leader if it has exited (reaps it).
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            match self.child.lock().try_wait() {
                Ok(status) => *exit = status,
                Err(e) => {
                    log::debug!(target: "resource", "wait pid {}: {e}", self.pid);
                    self.lost.store(true, Ordering::Relaxed);
                }
            }
        }
        *exit
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some() || self.lost.load(Ordering::Relaxed)
    }

    fn group_alive(&self) -> bool {
        group_alive(self.pgid)
    }

    /// Terminate the process group.
    ///
    /// Sends SIGTERM to the group and waits up to `timeout` for the leader to exit and the
    /// group to empty. Whatever is left after that is killed with SIGKILL, nothing of the
    /// group is alive when this returns `Ok`.
    pub fn stop(&self, timeout: Duration) -> Result<StopOutcome> {
        if self.has_exited() && !self.group_alive() {
            return Ok(StopOutcome::AlreadyExited);
        }

        match killpg(self.pgid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(Error::Syscall("killpg", e)),
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_exited() && !self.group_alive() {
                log::debug!(target: "resource", "pid {} exited after SIGTERM", self.pid);
                return Ok(StopOutcome::Graceful);
            }
            thread::sleep(POLL_INTERVAL);
        }

        log::warn!(
            target: "resource",
            "pid {} survived SIGTERM for {timeout:?}, sending SIGKILL",
            self.pid
        );
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(Error::Syscall("killpg", e)),
        }
        let waited = self.child.lock().wait();
        if let Some(status) = muted_error!(target: "resource", waited, "wait killed backend:") {
            *self.exit.lock() = Some(status);
        }
        Ok(StopOutcome::Forced)
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("tags", &self.tags)
            .finish()
    }
}

fn group_alive(pgid: Pid) -> bool {
    // reap group members that happen to be our children, zombies still accept signals
    while let Ok(status) = waitpid(Pid::from_raw(-pgid.as_raw()), Some(WaitPidFlag::WNOHANG)) {
        if status.pid().is_none() {
            break;
        }
    }
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

fn pid_alive(pid: Pid) -> bool {
    _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

/// Zombies still accept signals, only the process table tells them apart.
fn is_zombie(pid: Pid) -> bool {
    let pid = sysinfo::Pid::from_u32(pid.as_raw() as u32);
    let mut sys = System::new();
    sys.refresh_process(pid)
        && sys
            .process(pid)
            .is_some_and(|p| p.status() == ProcessStatus::Zombie)
}

/// True while `pid` exists and has not exited yet.
pub fn process_running(pid: u32) -> bool {
    let pid = Pid::from_raw(pid as i32);
    pid_alive(pid) && !is_zombie(pid)
}

/// Terminate a process this engine did not spawn in the current run (a straggler or an
/// orphan found by the reaper), with the same escalation as [`ProcessHandle::stop`].
///
/// A process that leads its own group is stopped together with its group. A zombie counts
/// as exited, members that left a dead leader's group are found by their tags.
pub fn stop_pid(pid: u32, timeout: Duration) -> Result<StopOutcome> {
    let pid = Pid::from_raw(pid as i32);
    let group = matches!(getpgid(Some(pid)), Ok(pgid) if pgid == pid);
    let alive = || {
        let exists = if group {
            group_alive(pid)
        } else {
            pid_alive(pid)
        };
        exists && !is_zombie(pid)
    };
    let signal = |sig: Signal| {
        let res = if group { killpg(pid, sig) } else { kill(pid, sig) };
        match res {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Syscall("kill", e)),
        }
    };

    if !alive() {
        return Ok(StopOutcome::AlreadyExited);
    }
    signal(Signal::SIGTERM)?;
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !alive() {
            return Ok(StopOutcome::Graceful);
        }
        thread::sleep(POLL_INTERVAL);
    }
    log::warn!(target: "resource", "pid {pid} survived SIGTERM for {timeout:?}, sending SIGKILL");
    signal(Signal::SIGKILL)?;
    let deadline = Instant::now() + timeout;
    while alive() && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    Ok(StopOutcome::Forced)
}
