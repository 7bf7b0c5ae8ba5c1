//! Port registry shared between engine instances.
//!
//! A JSON file listing claimed ports, guarded by an exclusive `flock` on a sibling lock
//! file. Claims belong to engine instances, several may live in one process. Entries whose
//! claiming process is gone are dropped on the next lock.

use crate::error::{Error, Result};
use crate::resource::process::EngineId;
use crate::session::SessionId;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const REGISTRY_FILE: &str = "ports.json";
const LOCK_FILE: &str = "ports.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortClaim {
    pub port: u16,
    pub pid: u32,
    /// Claiming engine instance.
    #[serde(default)]
    pub engine: Option<Uuid>,
    pub session: SessionId,
    /// Seconds since unix epoch.
    pub claimed_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryData {
    ports: Vec<PortClaim>,
}

/// Handle of one engine instance on the shared registry.
#[derive(Debug, Clone)]
pub struct SharedPortFile {
    dir: PathBuf,
    engine: EngineId,
}

impl SharedPortFile {
    pub fn open(dir: &Path, engine: EngineId) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            engine,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the exclusive lock and load the registry, stale claims are already pruned.
    pub fn lock(&self) -> Result<SharedPortGuard> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        flock(lock.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| Error::Syscall("flock", e))?;

        let path = self.dir.join(REGISTRY_FILE);
        let mut data: RegistryData = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => RegistryData::default(),
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!(target: "resource", "corrupted port registry {}, resetting: {e}", path.display());
                RegistryData::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => RegistryData::default(),
            Err(e) => return Err(e.into()),
        };

        let before = data.ports.len();
        data.ports.retain(|claim| process_exists(claim.pid));
        let pruned = before - data.ports.len();
        if pruned > 0 {
            log::debug!(target: "resource", "dropped {pruned} stale port claims");
        }

        Ok(SharedPortGuard {
            _lock: lock,
            engine: self.engine,
            path,
            data,
            dirty: pruned > 0,
        })
    }
}

fn process_exists(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Locked registry. Changes are written by [`SharedPortGuard::commit`], the lock is released
/// on drop.
pub struct SharedPortGuard {
    _lock: File,
    engine: EngineId,
    path: PathBuf,
    data: RegistryData,
    dirty: bool,
}

impl SharedPortGuard {
    fn is_mine(&self, claim: &PortClaim) -> bool {
        claim.pid == self.engine.pid && claim.engine == Some(self.engine.instance)
    }

    /// Claim on `port` by another engine instance, if any.
    pub fn claimed_elsewhere(&self, port: u16) -> Option<&PortClaim> {
        self.data
            .ports
            .iter()
            .find(|c| c.port == port && !self.is_mine(c))
    }

    pub fn claims(&self) -> &[PortClaim] {
        &self.data.ports
    }

    pub fn claim(&mut self, port: u16, session: SessionId) {
        self.data.ports.retain(|c| c.port != port);
        self.data.ports.push(PortClaim {
            port,
            pid: self.engine.pid,
            engine: Some(self.engine.instance),
            session,
            claimed_at: now_secs(),
        });
        self.dirty = true;
    }

    /// Drop this engine's claim on `port`.
    pub fn release(&mut self, port: u16) {
        let before = self.data.ports.len();
        let engine = self.engine;
        self.data
            .ports
            .retain(|c| !(c.port == port && c.pid == engine.pid && c.engine == Some(engine.instance)));
        self.dirty |= before != self.data.ports.len();
    }

    /// Write changes back, atomically replacing the registry file.
    pub fn commit(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.data)?)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}
