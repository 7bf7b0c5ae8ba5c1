//! Session status is derived, never stored.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    NotStarted,
    Initializing,
    Connected,
    Running,
    Paused,
    Stopped,
    Terminated,
    Error,
}

/// Progress of the DAP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    NotStarted,
    InProgress,
    Done,
}

/// Execution state as reported by protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    /// Configured, no `continued`/`stopped` seen yet.
    #[default]
    Idle,
    Running,
    Paused,
    /// `terminated` event received.
    Terminated,
}

/// Liveness of the debug backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    Exited,
    /// Session does not own a process (remote or pooled backend).
    Unknown,
}

/// Everything status depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInputs {
    pub error: bool,
    pub handshake: Handshake,
    pub is_child: bool,
    pub connected: bool,
    pub process: ProcessState,
    pub execution: Execution,
}

/// Compute session status.
///
/// Precedence: a sticky error always wins, then handshake progress, then a child whose
/// process has exited is stopped, otherwise protocol-level truth decides and the process
/// is only consulted when the connection is gone.
pub fn compute_status(inputs: StatusInputs) -> Status {
    if inputs.error {
        return Status::Error;
    }
    match inputs.handshake {
        Handshake::NotStarted => return Status::NotStarted,
        Handshake::InProgress => return Status::Initializing,
        Handshake::Done => {}
    }
    if inputs.is_child
        && (inputs.process == ProcessState::Exited || inputs.execution == Execution::Terminated)
    {
        return Status::Stopped;
    }
    if !inputs.connected {
        return match inputs.process {
            ProcessState::Alive => Status::Stopped,
            ProcessState::Exited | ProcessState::Unknown => Status::Terminated,
        };
    }
    match inputs.execution {
        Execution::Idle => Status::Connected,
        Execution::Running => Status::Running,
        Execution::Paused => Status::Paused,
        Execution::Terminated => Status::Terminated,
    }
}
