//! Session, DAP client and resource-lifecycle engine for driving language debug backends.
//!
//! A [`DebugEngine`] starts debug backends through language [`adapter`]s, speaks the Debug
//! Adapter Protocol with them, exposes lifecycle [`hook`]s and guarantees that ports and
//! processes are released when sessions end, or reaped when the engine that owned them is
//! gone.

pub mod adapter;
pub mod config;
pub mod dap;
pub mod engine;
pub mod error;
pub mod hook;
pub mod log;
pub mod resource;
pub mod session;

pub use config::Config;
pub use engine::{Backend, DebugEngine, SessionConfig};
pub use error::{Error, Result};
pub use hook::{HookBus, HookContext, HookPoint};
pub use session::status::Status;
pub use session::{SessionId, SessionInfo};
