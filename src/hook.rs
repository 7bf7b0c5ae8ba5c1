//! Lifecycle hook bus.
//!
//! Language adapters customize launch, attach, breakpoint and teardown behavior by
//! registering callbacks at [`HookPoint`]s instead of changing the engine. Callbacks for a
//! point run in ascending priority order (0 runs first, 100 last), callbacks with equal
//! priority run in registration order.

use crate::error::{Error, Result};
use crate::session::SessionId;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MAX_PRIORITY: u8 = 100;
pub const DEFAULT_PRIORITY: u8 = 50;

/// Extension points around the session lifecycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum HookPoint {
    PreInitialize,
    PostInitialize,
    PreLaunch,
    PostLaunch,
    PreAttach,
    PostAttach,
    PreSetBreakpoints,
    PostSetBreakpoints,
    PreConfigurationDone,
    PostConfigurationDone,
    PreStop,
    PostStop,
    PreCleanup,
    PostCleanup,
}

/// Mutable state passed through all callbacks of one [`HookBus::run`].
#[derive(Debug, Clone)]
pub struct HookContext {
    pub point: HookPoint,
    pub session_id: Option<SessionId>,
    pub language: Option<String>,
    /// Free-form data. Pre-request hooks find the outgoing DAP arguments under `arguments`
    /// and may rewrite them, post-request hooks find the response body under `response`.
    pub data: Map<String, Value>,
    pub cancelled: bool,
    /// Message returned to the caller when the operation is cancelled.
    pub result: Option<String>,
}

impl HookContext {
    pub fn new(point: HookPoint) -> Self {
        Self {
            point,
            session_id: None,
            language: None,
            data: Map::new(),
            cancelled: false,
            result: None,
        }
    }

    pub fn for_session(point: HookPoint, session_id: SessionId, language: &str) -> Self {
        Self {
            session_id: Some(session_id),
            language: Some(language.to_string()),
            ..Self::new(point)
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Veto the operation, remaining callbacks at this point are skipped.
    pub fn cancel(&mut self, message: impl Into<String>) {
        self.cancelled = true;
        self.result = Some(message.into());
    }

    /// Cancellation as an error for the caller of [`HookBus::run`].
    pub fn outcome(&self) -> Result<()> {
        if !self.cancelled {
            return Ok(());
        }
        Err(Error::HookCancelled(self.result.clone().unwrap_or_else(|| {
            format!("operation cancelled by {} hook", self.point)
        })))
    }
}

pub type HookCallback = Arc<dyn Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Clone)]
struct Registration {
    id: HookId,
    priority: u8,
    name: String,
    callback: HookCallback,
}

#[derive(Default)]
pub struct HookBus {
    hooks: RwLock<HashMap<HookPoint, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    ///
    /// # Arguments
    ///
    /// * `point`: where callback runs
    /// * `priority`: 0..=100, lower runs first
    /// * `name`: used in logs
    /// * `callback`: may mutate context and cancel the operation
    pub fn register(
        &self,
        point: HookPoint,
        priority: u8,
        name: impl Into<String>,
        callback: impl Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<HookId> {
        if priority > MAX_PRIORITY {
            return Err(Error::Validation(format!(
                "hook priority {priority} is out of range 0..={MAX_PRIORITY}"
            )));
        }
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut hooks = self.hooks.write();
        let list = hooks.entry(point).or_default();
        // after every registration with the same priority, keeps ties in registration order
        let pos = list.partition_point(|r| r.priority <= priority);
        list.insert(
            pos,
            Registration {
                id,
                priority,
                name: name.into(),
                callback: Arc::new(callback),
            },
        );
        Ok(id)
    }

    /// Remove a callback, return false if it was not registered.
    pub fn unregister(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.write();
        for list in hooks.values_mut() {
            if let Some(pos) = list.iter().position(|r| r.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Names of callbacks registered at `point` in execution order.
    pub fn registered(&self, point: HookPoint) -> Vec<String> {
        self.hooks
            .read()
            .get(&point)
            .map(|list| list.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Run all callbacks registered at `point`.
    ///
    /// Stops at the first callback that cancels. A callback that returns an error is
    /// logged and skipped, only an explicit cancel vetoes the operation.
    pub fn run(&self, point: HookPoint, ctx: &mut HookContext) {
        ctx.point = point;
        // snapshot so callbacks can (un)register hooks without deadlocking
        let callbacks = self.hooks.read().get(&point).cloned().unwrap_or_default();

        for reg in callbacks {
            if let Err(e) = (reg.callback)(ctx) {
                log::warn!(target: "hook", "{point} hook `{}` failed: {e:#}", reg.name);
            }
            if ctx.cancelled {
                log::info!(
                    target: "hook",
                    "{point} cancelled by hook `{}`: {}",
                    reg.name,
                    ctx.result.as_deref().unwrap_or_default()
                );
                return;
            }
        }
    }

    /// Run callbacks and turn cancellation into [`Error::HookCancelled`].
    pub fn run_checked(&self, point: HookPoint, ctx: &mut HookContext) -> Result<()> {
        self.run(point, ctx);
        ctx.outcome()
    }
}
