//! Orphan reaper.
//!
//! Periodically scans the process table for tagged backends whose session no longer exists
//! and terminates them. A backend launched by another engine instance is left alone while
//! that engine runs, its sessions are not visible from here.

use crate::error::Result;
use crate::resource::process::{
    process_running, stop_pid, EngineId, ProcessKind, ProcessTags, StopOutcome,
};
use crate::session::SessionId;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{const_mutex, Mutex};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use uuid::Uuid;

/// Engine instances alive in this process.
static RUNNING_ENGINES: Mutex<BTreeSet<Uuid>> = const_mutex(BTreeSet::new());

/// Marks an engine instance as running until dropped.
#[derive(Debug)]
pub struct EngineRegistration(EngineId);

impl EngineRegistration {
    pub fn new() -> Self {
        let id = EngineId::current();
        RUNNING_ENGINES.lock().insert(id.instance);
        Self(id)
    }

    pub fn id(&self) -> EngineId {
        self.0
    }
}

impl Default for EngineRegistration {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EngineRegistration {
    fn drop(&mut self) {
        RUNNING_ENGINES.lock().remove(&self.0.instance);
    }
}

/// Whether the engine instance `engine` still runs, in this process or another one.
pub fn engine_running(engine: &EngineId) -> bool {
    if engine.pid == std::process::id() {
        RUNNING_ENGINES.lock().contains(&engine.instance)
    } else {
        process_running(engine.pid)
    }
}

/// A tagged process as seen by one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub tags: ProcessTags,
    pub age: Duration,
}

/// Process table access, replaced by a fake in tests.
pub trait ProcessSource: Send + Sync {
    /// Snapshot of every process carrying a complete tag set.
    fn snapshot(&self) -> Vec<ProcessInfo>;

    fn terminate(&self, pid: u32, timeout: Duration) -> Result<StopOutcome> {
        stop_pid(pid, timeout)
    }

    fn engine_running(&self, engine: &EngineId) -> bool {
        engine_running(engine)
    }
}

/// Process table of the running system, read with `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

impl ProcessSource for SystemProcesses {
    fn snapshot(&self) -> Vec<ProcessInfo> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::everything().without_cpu()),
        );
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        // threads show up as processes too, they share the environment of their process
        let threads: HashSet<u32> = sys
            .processes()
            .iter()
            .filter_map(|(pid, p)| p.tasks().map(|tasks| (pid, tasks)))
            .flat_map(|(pid, tasks)| tasks.iter().filter(move |t| *t != pid))
            .map(|t| t.as_u32())
            .collect();

        sys.processes()
            .iter()
            .filter(|(pid, _)| !threads.contains(&pid.as_u32()))
            .filter_map(|(pid, p)| {
                let tags = ProcessTags::from_environ(p.environ())?;
                Some(ProcessInfo {
                    pid: pid.as_u32(),
                    name: p.name().to_string(),
                    tags,
                    age: Duration::from_secs(now.saturating_sub(p.start_time())),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Verdict {
    /// Tagged by another owner.
    NotOwned,
    /// Shared backend, outlives sessions.
    Pooled,
    /// Session still registered.
    Live,
    /// Launched by another engine instance that is still running.
    OtherEngine,
    /// Might still be starting up.
    TooYoung,
    Orphan,
}

/// Decide what to do with a tagged process. Only [`Verdict::Orphan`] may be terminated.
///
/// `engine` is the instance whose sessions `is_live` knows about, processes of any other
/// instance are protected while `engine_running` reports their engine alive.
pub fn classify(
    info: &ProcessInfo,
    owner: &str,
    engine: Option<&EngineId>,
    is_live: impl Fn(SessionId) -> bool,
    engine_running: impl Fn(&EngineId) -> bool,
    min_age: Duration,
) -> Verdict {
    if info.tags.owner != owner {
        return Verdict::NotOwned;
    }
    if info.tags.kind == ProcessKind::PoolResource {
        return Verdict::Pooled;
    }
    match &info.tags.engine {
        Some(launcher) if Some(launcher) != engine => {
            if engine_running(launcher) {
                return Verdict::OtherEngine;
            }
        }
        _ => {
            if is_live(info.tags.session_id) {
                return Verdict::Live;
            }
        }
    }
    if info.age < min_age {
        return Verdict::TooYoung;
    }
    Verdict::Orphan
}

/// Session liveness check, usually backed by the session registry.
pub type LivenessCheck = Arc<dyn Fn(SessionId) -> bool + Send + Sync>;

#[derive(Debug, Default)]
pub struct ScanReport {
    pub verdicts: Vec<(ProcessInfo, Verdict)>,
    pub reaped: Vec<(u32, StopOutcome)>,
    pub failures: Vec<(u32, String)>,
}

impl ScanReport {
    pub fn orphans(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.verdicts
            .iter()
            .filter(|(_, v)| *v == Verdict::Orphan)
            .map(|(info, _)| info)
    }
}

pub struct OrphanReaper {
    owner: String,
    engine: Option<EngineId>,
    min_age: Duration,
    stop_timeout: Duration,
    source: Arc<dyn ProcessSource>,
    is_live: LivenessCheck,
}

impl OrphanReaper {
    pub fn new(
        owner: impl Into<String>,
        min_age: Duration,
        stop_timeout: Duration,
        source: Arc<dyn ProcessSource>,
        is_live: LivenessCheck,
    ) -> Self {
        Self {
            owner: owner.into(),
            engine: None,
            min_age,
            stop_timeout,
            source,
            is_live,
        }
    }

    /// Sessions answered by `is_live` belong to engine instance `engine`.
    pub fn for_engine(mut self, engine: EngineId) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Classify every tagged process without touching anything.
    pub fn scan(&self) -> ScanReport {
        let verdicts = self
            .source
            .snapshot()
            .into_iter()
            .map(|info| {
                let verdict = classify(
                    &info,
                    &self.owner,
                    self.engine.as_ref(),
                    &*self.is_live,
                    |e: &EngineId| self.source.engine_running(e),
                    self.min_age,
                );
                (info, verdict)
            })
            .collect();
        ScanReport {
            verdicts,
            ..Default::default()
        }
    }

    /// Scan and terminate orphans.
    pub fn reap_once(&self) -> ScanReport {
        let mut report = self.scan();
        let orphans: Vec<ProcessInfo> = report.orphans().cloned().collect();
        for info in orphans {
            log::info!(
                target: "reaper",
                "terminating orphan `{}` (pid {}, session {}, age {:?})",
                info.name,
                info.pid,
                info.tags.session_id,
                info.age
            );
            match self.source.terminate(info.pid, self.stop_timeout) {
                Ok(outcome) => report.reaped.push((info.pid, outcome)),
                Err(e) => {
                    log::warn!(target: "reaper", "terminate orphan pid {}: {e}", info.pid);
                    report.failures.push((info.pid, e.to_string()));
                }
            }
        }
        report
    }

    /// Run [`OrphanReaper::reap_once`] every `interval` on a dedicated thread.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Result<ReaperHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("aidb-reaper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let report = self.reap_once();
                        if !report.reaped.is_empty() {
                            log::info!(target: "reaper", "reaped {} orphans", report.reaped.len());
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;
        Ok(ReaperHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl std::fmt::Debug for OrphanReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanReaper")
            .field("owner", &self.owner)
            .field("engine", &self.engine)
            .field("min_age", &self.min_age)
            .finish()
    }
}

/// Background reaper, stopped on drop.
#[derive(Debug)]
pub struct ReaperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper thread and wait for a running scan to finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!(target: "reaper", "reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex;

    const MIN_AGE: Duration = Duration::from_secs(60);

    fn info(owner: &str, session: SessionId, kind: ProcessKind, age_secs: u64) -> ProcessInfo {
        ProcessInfo {
            pid: 4242,
            name: "debugpy".to_string(),
            tags: ProcessTags::new(owner, session, kind),
            age: Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn test_classify() {
        let live = SessionId::new();
        let gone = SessionId::new();
        let is_live = |id: SessionId| id == live;
        let no_engines = |_: &EngineId| false;

        struct TestCase {
            info: ProcessInfo,
            expected: Verdict,
        }
        let cases = [
            TestCase {
                info: info("other-tool", gone, ProcessKind::Adapter, 3600),
                expected: Verdict::NotOwned,
            },
            TestCase {
                info: info("aidb", gone, ProcessKind::PoolResource, 3600),
                expected: Verdict::Pooled,
            },
            TestCase {
                // live session protects a process whatever its age
                info: info("aidb", live, ProcessKind::Adapter, 100_000),
                expected: Verdict::Live,
            },
            TestCase {
                info: info("aidb", gone, ProcessKind::Adapter, 59),
                expected: Verdict::TooYoung,
            },
            TestCase {
                info: info("aidb", gone, ProcessKind::Adapter, 0),
                expected: Verdict::TooYoung,
            },
            TestCase {
                info: info("aidb", gone, ProcessKind::Adapter, 60),
                expected: Verdict::Orphan,
            },
        ];

        for tc in cases {
            assert_eq!(
                classify(&tc.info, "aidb", None, is_live, no_engines, MIN_AGE),
                tc.expected,
                "{:?}",
                tc.info
            );
        }
    }

    #[test]
    fn test_classify_by_engine() {
        let me = EngineId::current();
        let running = EngineId::current();
        let dead = EngineId::current();
        let session = SessionId::new();
        let tagged = |engine: EngineId| {
            let mut info = info("aidb", session, ProcessKind::Adapter, 600);
            info.tags.engine = Some(engine);
            info
        };
        let engine_running = |e: &EngineId| *e == running;

        // another engine's session is unknown to our registry
        let verdict = classify(&tagged(running), "aidb", Some(&me), |_| false, engine_running, MIN_AGE);
        assert_eq!(verdict, Verdict::OtherEngine);
        let verdict = classify(&tagged(dead), "aidb", Some(&me), |_| false, engine_running, MIN_AGE);
        assert_eq!(verdict, Verdict::Orphan);

        // own processes follow the registry, not the engine liveness
        let verdict = classify(&tagged(me), "aidb", Some(&me), |_| true, engine_running, MIN_AGE);
        assert_eq!(verdict, Verdict::Live);
        let verdict = classify(&tagged(me), "aidb", Some(&me), |_| false, engine_running, MIN_AGE);
        assert_eq!(verdict, Verdict::Orphan);

        // without an engine of its own everything tagged by a running engine is spared
        let verdict = classify(&tagged(running), "aidb", None, |_| false, engine_running, MIN_AGE);
        assert_eq!(verdict, Verdict::OtherEngine);
    }

    #[test]
    fn test_engine_registration() {
        let registration = EngineRegistration::new();
        let id = registration.id();
        assert_eq!(id.pid, std::process::id());
        assert!(engine_running(&id));
        drop(registration);
        assert!(!engine_running(&id));

        let foreign = EngineId {
            pid: i32::MAX as u32,
            instance: Uuid::new_v4(),
        };
        assert!(!engine_running(&foreign));
    }

    struct FakeTable {
        processes: Vec<ProcessInfo>,
        terminated: Mutex<Vec<u32>>,
    }

    impl ProcessSource for FakeTable {
        fn snapshot(&self) -> Vec<ProcessInfo> {
            self.processes.clone()
        }

        fn terminate(&self, pid: u32, _: Duration) -> Result<StopOutcome> {
            self.terminated.lock().push(pid);
            Ok(StopOutcome::Graceful)
        }

        fn engine_running(&self, _: &EngineId) -> bool {
            false
        }
    }

    #[test]
    fn test_reap_once_only_terminates_orphans() {
        let live = SessionId::new();
        let mut young = info("aidb", SessionId::new(), ProcessKind::Adapter, 1);
        young.pid = 1;
        let mut protected = info("aidb", live, ProcessKind::Adapter, 600);
        protected.pid = 2;
        let mut orphan = info("aidb", SessionId::new(), ProcessKind::Adapter, 600);
        orphan.pid = 3;
        let mut pooled = info("aidb", SessionId::new(), ProcessKind::PoolResource, 600);
        pooled.pid = 4;

        let table = Arc::new(FakeTable {
            processes: vec![young, protected, orphan, pooled],
            terminated: Mutex::new(vec![]),
        });
        let reaper = OrphanReaper::new(
            "aidb",
            MIN_AGE,
            Duration::from_secs(1),
            table.clone(),
            Arc::new(move |id: SessionId| id == live),
        );

        let report = reaper.reap_once();
        assert_eq!(*table.terminated.lock(), vec![3]);
        assert_eq!(report.reaped, vec![(3, StopOutcome::Graceful)]);
        assert_eq!(report.verdicts.len(), 4);

        let scan = reaper.scan();
        assert_eq!(scan.orphans().map(|i| i.pid).collect::<Vec<_>>(), vec![3]);
        assert!(scan.reaped.is_empty());
    }

    #[test]
    fn test_background_reaper_stops() {
        let table = Arc::new(FakeTable {
            processes: vec![info("aidb", SessionId::new(), ProcessKind::Adapter, 600)],
            terminated: Mutex::new(vec![]),
        });
        let reaper = Arc::new(OrphanReaper::new(
            "aidb",
            MIN_AGE,
            Duration::from_secs(1),
            table.clone(),
            Arc::new(|_: SessionId| false),
        ));

        let mut handle = reaper.spawn(Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while table.terminated.lock().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.stop();
        assert!(!table.terminated.lock().is_empty());

        let seen = table.terminated.lock().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(table.terminated.lock().len(), seen);
    }
}
