//! Control messages exchanged between the gateway and remote clients.
//!
//! Every WebSocket binary frame carries exactly one CBOR-encoded
//! `ClientMessage` or `ServerMessage`. Terminal output is relayed as text
//! (bytes are decoded permissively on the server side); terminal input is
//! written to the PTY verbatim, with line discipline left to the terminal
//! itself.

use serde::{Deserialize, Serialize};

/// Resource parameters for the compute allocation backing a session.
///
/// Absent parameters are omitted from the allocator command line, never
/// defaulted to zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRequest {
    /// Node count (`--nodes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    /// Memory per node in GiB (`--mem`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<u32>,
    /// Wall-clock limit in hours (`--time`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_hours: Option<u32>,
}

/// Session lifecycle state.
///
/// `Reaped` is terminal and never observable through the registry: removal
/// and resource release happen together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Running,
    Exited,
    Reaped,
}

impl SessionState {
    /// Whether the child process may still be alive.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Running)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Exited => "exited",
            SessionState::Reaped => "reaped",
        };
        f.write_str(s)
    }
}

/// Diagnostic summary of a live session, as returned by `ListSessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    /// Native process id of the child, if the platform exposes one.
    pub pid: Option<u32>,
    pub state: SessionState,
    /// Whether a remote channel is currently attached.
    pub attached: bool,
    pub request: AllocRequest,
    /// Scheduler allocation id, once discovered from the salloc banner.
    pub job_id: Option<u32>,
    pub exit_code: Option<u32>,
    pub uptime_secs: u64,
}

/// Machine-readable error categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    NotAttached,
    ResourceExhausted,
    LaunchFailed,
    InvalidMessage,
    Internal,
}

/// Messages sent by a remote client to the gateway.
///
/// A connection must `Attach` to a session before `Input` or `Resize` for
/// that session is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Launch a new allocation-backed shell session.
    CreateSession { request: AllocRequest },
    /// Bind this connection to a session's output stream, replacing any
    /// previously attached channel.
    Attach { session_id: String },
    /// Terminal input, written verbatim to the session's PTY.
    Input { session_id: String, data: String },
    /// Update the PTY geometry.
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    /// Reap a session. Idempotent.
    Terminate { session_id: String },
    /// Enumerate live sessions for diagnostics.
    ListSessions,
}

/// Messages sent by the gateway to a remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionCreated { session_id: String },
    Attached { session_id: String },
    /// A chunk of terminal output, decoded permissively (invalid byte
    /// sequences replaced, never dropped).
    Output { session_id: String, data: String },
    /// The child process terminated. Emitted exactly once per session.
    Exited {
        session_id: String,
        exit_code: Option<u32>,
    },
    /// An unrecoverable terminal-side failure, named without internal
    /// detail.
    TerminalError { session_id: String, message: String },
    Terminated { session_id: String },
    Sessions { sessions: Vec<SessionInfo> },
    Error { code: ErrorCode, message: String },
}
