use crate::session::SessionId;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Teardown tier that failed, see [`crate::resource::cleanup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Tier {
    Disconnect,
    Terminate,
    ReleasePort,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- protocol errors -------------------------------------------
    #[error("connection error: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("`{command}` request failed: {message}")]
    RequestFailed { command: String, message: String },

    // --------------------------------- lifecycle errors ------------------------------------------
    #[error("launch failure: {0}")]
    LaunchFailure(String),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error("{0}")]
    HookCancelled(String),
    #[error("cleanup tier `{tier}` failed: {message}")]
    CleanupFailure { tier: Tier, message: String },

    // --------------------------------- caller errors ---------------------------------------------
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("no adapter registered for language `{0}`")]
    UnknownAdapter(String),
    #[error("configuration error: {0}")]
    Config(String),

    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
}

impl Error {
    /// Build a timeout error for a named wait.
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// True if error means that the transport is gone and no more messages will flow.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_))
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $target: expr, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $target: expr, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $target, concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error under `target` if it occurs.
#[macro_export]
macro_rules! weak_error {
    (target: $target: expr, $res: expr) => {
        $crate::_error!(log::warn, $target, $res)
    };
    (target: $target: expr, $res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $target, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs under `target` if it occurs.
#[macro_export]
macro_rules! muted_error {
    (target: $target: expr, $res: expr) => {
        $crate::_error!(log::debug, $target, $res)
    };
    (target: $target: expr, $res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $target, $res, $msg)
    };
}
