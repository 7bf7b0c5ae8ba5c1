//! Registry of live sessions.
//!
//! Guarded by a reentrant lock so registry methods can be composed inside
//! [`SessionRegistry::exclusive`]. The lock is only held for bookkeeping: sessions are
//! detached under it and torn down after it is released. A detached session is
//! "retiring" until its teardown finishes, its processes still count as owned.

use crate::error::{Error, Result};
use crate::session::{Session, SessionId};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    retiring: HashSet<SessionId>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: ReentrantMutex<RefCell<Inner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner)
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.with(|inner| inner.sessions.insert(session.id(), session));
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.with(|inner| inner.sessions.remove(&id))
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.with(|inner| inner.sessions.get(&id).cloned())
    }

    /// Like [`SessionRegistry::get`] but a missing session is an error.
    pub fn require(&self, id: SessionId) -> Result<Arc<Session>> {
        self.get(id).ok_or(Error::SessionNotFound(id))
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.with(|inner| inner.sessions.contains_key(&id))
    }

    /// Registered or still being torn down.
    pub fn owns(&self, id: SessionId) -> bool {
        self.with(|inner| inner.sessions.contains_key(&id) || inner.retiring.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.with(|inner| inner.sessions.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.with(|inner| inner.sessions.keys().copied().collect())
    }

    /// Snapshot of every registered session.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.with(|inner| inner.sessions.values().cloned().collect())
    }

    pub fn children_of(&self, parent: SessionId) -> Vec<Arc<Session>> {
        self.with(|inner| {
            inner
                .sessions
                .values()
                .filter(|s| s.parent() == Some(parent))
                .cloned()
                .collect()
        })
    }

    /// Session that should receive requests addressed to `id`.
    ///
    /// Requests for a parent with live children go to the most recently attached child,
    /// the child is where the debuggee code actually runs.
    pub fn resolve(&self, id: SessionId) -> Result<Arc<Session>> {
        self.with(|inner| {
            let session = inner.sessions.get(&id).ok_or(Error::SessionNotFound(id))?;
            let latest_child = session
                .children()
                .iter()
                .rev()
                .find_map(|child| inner.sessions.get(child).cloned());
            Ok(latest_child.unwrap_or_else(|| session.clone()))
        })
    }

    /// Unregister `id` and its children in one step.
    ///
    /// Returns the detached sessions children first, empty if `id` is not registered
    /// (someone else is already tearing it down). Every returned session stays retiring
    /// until [`SessionRegistry::retired`] is called for it.
    pub fn detach_tree(&self, id: SessionId) -> Vec<Arc<Session>> {
        self.with(|inner| {
            let Some(root) = inner.sessions.remove(&id) else {
                return vec![];
            };
            let mut detached = vec![];
            for child in root.children() {
                if let Some(child) = inner.sessions.remove(&child) {
                    detached.push(child);
                }
            }
            if let Some(parent) = root.parent().and_then(|p| inner.sessions.get(&p)) {
                parent.remove_child(id);
            }
            detached.push(root);
            inner.retiring.extend(detached.iter().map(|s| s.id()));
            detached
        })
    }

    /// Teardown of a detached session finished.
    pub fn retired(&self, id: SessionId) {
        self.with(|inner| inner.retiring.remove(&id));
    }

    /// Run `f` holding the registry lock, other threads can not observe intermediate
    /// states. `f` may call any registry method.
    pub fn exclusive<T>(&self, f: impl FnOnce(&Self) -> T) -> T {
        let _guard = self.inner.lock();
        f(self)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.ids())
            .finish()
    }
}
