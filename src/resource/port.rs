//! Port leasing.
//!
//! A port is reserved by binding a real listener on it and keeping that listener open until
//! the backend is about to bind the same port ([`PortLease::handoff`]). Nobody else can
//! grab the port between "looks free" and "backend listens".

use crate::config::PortRange;
use crate::error::{Error, Result};
use crate::resource::shared::SharedPortFile;
use crate::session::SessionId;
use crate::weak_error;
use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;

/// Attempts at getting an ephemeral port nobody else holds.
const EPHEMERAL_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    /// Held by our own listener.
    Reserved,
    /// Listener dropped, the backend owns the port now.
    Bound,
    Released,
}

struct Table {
    host: IpAddr,
    leased: Mutex<HashMap<u16, SessionId>>,
    shared: Option<SharedPortFile>,
}

impl Table {
    fn forget(&self, port: u16) {
        self.leased.lock().remove(&port);
        if let Some(shared) = &self.shared {
            weak_error!(
                target: "resource",
                shared.lock().and_then(|mut guard| {
                    guard.release(port);
                    guard.commit()
                }),
                "release shared port claim:"
            );
        }
    }
}

struct LeaseInner {
    port: u16,
    session: SessionId,
    state: Mutex<LeaseState>,
    listener: Mutex<Option<TcpListener>>,
    table: Arc<Table>,
}

/// A leased port, clones refer to the same lease.
#[derive(Clone)]
pub struct PortLease(Arc<LeaseInner>);

impl Drop for LeaseInner {
    fn drop(&mut self) {
        // last clone gone without an explicit release
        if *self.state.get_mut() != LeaseState::Released {
            self.table.forget(self.port);
        }
    }
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.0.port
    }

    pub fn session(&self) -> SessionId {
        self.0.session
    }

    pub fn state(&self) -> LeaseState {
        *self.0.state.lock()
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.0.table.host, self.0.port)
    }

    /// Drop the reservation socket right before the backend binds the port.
    ///
    /// The port stays leased, it is not offered to anyone else until released.
    pub fn handoff(&self) {
        let mut state = self.0.state.lock();
        if *state == LeaseState::Reserved {
            self.0.listener.lock().take();
            *state = LeaseState::Bound;
            log::debug!(target: "resource", "port {} handed off to backend", self.0.port);
        }
    }

    /// Return the port to the pool. Idempotent.
    pub fn release(&self) {
        let mut state = self.0.state.lock();
        if *state == LeaseState::Released {
            return;
        }
        self.0.listener.lock().take();
        *state = LeaseState::Released;
        self.0.table.forget(self.0.port);
        log::debug!(target: "resource", "port {} released", self.0.port);
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.0.port)
            .field("session", &self.0.session)
            .field("state", &self.state())
            .finish()
    }
}

/// Allocates ports to sessions.
#[derive(Clone)]
pub struct PortRegistry {
    table: Arc<Table>,
}

impl PortRegistry {
    /// Registry handing out ports on `host`, coordinated with other engine instances through
    /// `shared` when given.
    pub fn new(host: IpAddr, shared: Option<SharedPortFile>) -> Self {
        Self {
            table: Arc::new(Table {
                host,
                leased: Mutex::new(HashMap::new()),
                shared,
            }),
        }
    }

    /// Lease a port for `session`.
    ///
    /// Tries `preferred` first, then every port of `fallback`. With neither given the OS
    /// picks a free port. Fails with [`Error::LaunchFailure`] when every candidate is taken.
    pub fn acquire(
        &self,
        session: SessionId,
        preferred: Option<u16>,
        fallback: Option<PortRange>,
    ) -> Result<PortLease> {
        if preferred.is_none() && fallback.is_none() {
            return self.acquire_ephemeral(session);
        }

        let candidates = preferred
            .into_iter()
            .chain(fallback.iter().flat_map(PortRange::iter))
            .unique();

        let mut shared = self.table.shared.as_ref().map(|s| s.lock()).transpose()?;
        let mut leased = self.table.leased.lock();
        for port in candidates {
            if leased.contains_key(&port) {
                continue;
            }
            if let Some(claim) = shared.as_ref().and_then(|g| g.claimed_elsewhere(port)) {
                log::trace!(target: "resource", "port {port} claimed by pid {}", claim.pid);
                continue;
            }
            let listener = match TcpListener::bind((self.table.host, port)) {
                Ok(listener) => listener,
                Err(e) => {
                    log::trace!(target: "resource", "port {port} unavailable: {e}");
                    continue;
                }
            };
            if let Some(guard) = shared.as_mut() {
                guard.claim(port, session);
                guard.commit()?;
            }
            leased.insert(port, session);
            if Some(port) != preferred && preferred.is_some() {
                log::info!(
                    target: "resource",
                    "preferred port {} busy, using fallback port {port}",
                    preferred.unwrap_or_default()
                );
            }
            return Ok(self.lease(port, session, listener));
        }

        Err(Error::LaunchFailure(format!(
            "no free port (preferred {}, fallback {})",
            preferred.map_or("none".to_string(), |p| p.to_string()),
            fallback.map_or("none".to_string(), |r| format!("[{}, {})", r.start, r.end)),
        )))
    }

    fn acquire_ephemeral(&self, session: SessionId) -> Result<PortLease> {
        let host = self.table.host;
        self.acquire_from(session, || TcpListener::bind((host, 0)))
    }

    /// Take listeners from `bind` until one holds a port that is neither leased here nor
    /// claimed by another engine. Rejected listeners stay open until the end so the OS does
    /// not hand out the same port again.
    fn acquire_from(
        &self,
        session: SessionId,
        mut bind: impl FnMut() -> std::io::Result<TcpListener>,
    ) -> Result<PortLease> {
        let mut shared = self.table.shared.as_ref().map(|s| s.lock()).transpose()?;
        let mut rejected = vec![];
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let listener =
                bind().map_err(|e| Error::LaunchFailure(format!("bind ephemeral port: {e}")))?;
            let port = listener.local_addr()?.port();

            let mut leased = self.table.leased.lock();
            let taken = leased.contains_key(&port)
                || shared
                    .as_ref()
                    .is_some_and(|g| g.claimed_elsewhere(port).is_some());
            if taken {
                log::trace!(target: "resource", "ephemeral port {port} is taken, retrying");
                rejected.push(listener);
                continue;
            }
            if let Some(guard) = shared.as_mut() {
                guard.claim(port, session);
                guard.commit()?;
            }
            leased.insert(port, session);
            drop(leased);
            return Ok(self.lease(port, session, listener));
        }
        Err(Error::LaunchFailure(format!(
            "no free ephemeral port after {EPHEMERAL_ATTEMPTS} attempts"
        )))
    }

    fn lease(&self, port: u16, session: SessionId, listener: TcpListener) -> PortLease {
        log::debug!(target: "resource", "port {port} reserved for session {session}");
        PortLease(Arc::new(LeaseInner {
            port,
            session,
            state: Mutex::new(LeaseState::Reserved),
            listener: Mutex::new(Some(listener)),
            table: self.table.clone(),
        }))
    }

    /// Same as [`PortLease::release`].
    pub fn release(&self, lease: &PortLease) {
        lease.release();
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.table.leased.lock().contains_key(&port)
    }

    /// Ports currently leased to `session`.
    pub fn leased_by(&self, session: SessionId) -> Vec<u16> {
        self.table
            .leased
            .lock()
            .iter()
            .filter(|(_, s)| **s == session)
            .map(|(port, _)| *port)
            .sorted()
            .collect()
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("host", &self.table.host)
            .field("leased", &self.table.leased.lock().len())
            .finish()
    }
}
