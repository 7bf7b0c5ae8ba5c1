//! OS resources owned by sessions: ports, backend processes, and their cleanup.

pub mod cleanup;
pub mod orphan;
pub mod port;
pub mod process;
pub mod shared;

use crate::adapter::AdapterProfile;
use crate::config::{Config, Timeouts};
use crate::error::{Error, Result};
use crate::session::{Session, SessionId};
use cleanup::{run_teardown, CleanupReport, SessionTeardown};
use orphan::{EngineRegistration, LivenessCheck, OrphanReaper, ProcessSource, SystemProcesses};
use port::{PortLease, PortRegistry};
use process::{EngineId, LaunchSpec, ProcessHandle, ProcessKind, ProcessTags};
use shared::SharedPortFile;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

pub struct ResourceManager {
    owner: String,
    /// Identity written into launched processes, running while the manager lives.
    engine: EngineRegistration,
    ports: PortRegistry,
    processes: Arc<dyn ProcessSource>,
    timeouts: Timeouts,
}

/// Parse the listen host of backends.
pub fn parse_host(host: &str) -> Result<IpAddr> {
    if host == "localhost" {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse()
        .map_err(|e| Error::Config(format!("invalid host `{host}`: {e}")))
}

impl ResourceManager {
    pub fn new(config: &Config) -> Result<Self> {
        let engine = EngineRegistration::new();
        let shared = config
            .ports
            .registry_dir()
            .map(|dir| SharedPortFile::open(&dir, engine.id()))
            .transpose()?;
        if let Some(shared) = &shared {
            log::debug!(target: "resource", "shared port registry in {}", shared.dir().display());
        }
        Ok(Self {
            owner: config.owner.clone(),
            engine,
            ports: PortRegistry::new(parse_host(&config.host)?, shared),
            processes: Arc::new(SystemProcesses),
            timeouts: config.timeouts,
        })
    }

    /// Replace the process table used by straggler sweeps and the reaper.
    pub fn with_process_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.processes = source;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn engine(&self) -> EngineId {
        self.engine.id()
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Lease a port for a backend described by `profile`.
    ///
    /// An explicit `preferred` port wins over the profile default.
    pub fn acquire_port(
        &self,
        session: SessionId,
        profile: &AdapterProfile,
        preferred: Option<u16>,
    ) -> Result<PortLease> {
        self.ports
            .acquire(session, preferred.or(profile.default_port), profile.fallback_ports)
    }

    /// Launch a backend process tagged as owned by `session`.
    pub fn launch(
        &self,
        session: SessionId,
        kind: ProcessKind,
        spec: &LaunchSpec,
    ) -> Result<ProcessHandle> {
        let tags = ProcessTags::new(&self.owner, session, kind).with_engine(self.engine.id());
        process::launch(spec, tags)
    }

    /// Three-tier teardown of `session`.
    pub fn teardown(&self, session: &Session) -> CleanupReport {
        let mut steps = SessionTeardown::new(session, self.timeouts, &*self.processes);
        let report = run_teardown(&format!("session {}", session.id()), &mut steps);
        if report.is_clean() {
            log::debug!(target: "resource", "session {} cleaned up", session.id());
        }
        report
    }

    /// Orphan reaper over the same process table.
    pub fn reaper(&self, min_age: Duration, is_live: LivenessCheck) -> OrphanReaper {
        OrphanReaper::new(
            self.owner.clone(),
            min_age,
            self.timeouts.process_stop(),
            self.processes.clone(),
            is_live,
        )
        .for_engine(self.engine.id())
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("owner", &self.owner)
            .field("engine", &self.engine)
            .field("ports", &self.ports)
            .finish()
    }
}
