use super::state::SessionState;
use crate::domain::NameError;
use thiserror::Error;

/// Failures of a single server client.
///
/// `Clone` so one connection loss can be delivered to every outstanding call
/// and also kept as the client's last-known failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("failed to launch tool server '{server}': {reason}")]
    Launch { server: String, reason: String },
    #[error("tool server '{server}' handshake failed: {reason}")]
    Handshake { server: String, reason: String },
    #[error("tool server '{server}' tool discovery failed: {reason}")]
    Discovery { server: String, reason: String },
    #[error("tool server '{server}' protocol error: {reason}")]
    Protocol { server: String, reason: String },
    #[error("tool server '{server}' did not answer '{method}' within {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },
    #[error("tool server '{server}' connection closed: {reason}")]
    ConnectionClosed { server: String, reason: String },
    #[error("tool server '{server}' is not ready (state: {state})")]
    NotReady { server: String, state: SessionState },
    #[error("tool server '{server}' cannot {action} while {state}")]
    InvalidState {
        server: String,
        action: &'static str,
        state: SessionState,
    },
    #[error("failed to stop tool server '{server}': {reason}")]
    Shutdown { server: String, reason: String },
}

impl ClientError {
    pub fn server(&self) -> &str {
        match self {
            ClientError::Launch { server, .. }
            | ClientError::Handshake { server, .. }
            | ClientError::Discovery { server, .. }
            | ClientError::Protocol { server, .. }
            | ClientError::Timeout { server, .. }
            | ClientError::ConnectionClosed { server, .. }
            | ClientError::NotReady { server, .. }
            | ClientError::InvalidState { server, .. }
            | ClientError::Shutdown { server, .. } => server,
        }
    }

    /// Whether this error ends the session, as opposed to affecting one call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Launch { .. }
                | ClientError::Handshake { .. }
                | ClientError::Protocol { .. }
                | ClientError::ConnectionClosed { .. }
        )
    }
}

/// Routing and lifecycle failures of the [`ServerManager`](super::ServerManager).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("tool server '{server}' is not configured")]
    UnknownServer { server: String },
    #[error("tool server '{server}' is unavailable: {reason}")]
    ServerUnavailable { server: String, reason: String },
    #[error("tool '{tool}' is not offered by server '{server}'")]
    UnknownTool { server: String, tool: String },
    #[error(transparent)]
    InvalidToolName(#[from] NameError),
    #[error("tool server '{server}' is declared more than once")]
    DuplicateServer { server: String },
    #[error(transparent)]
    Client(#[from] ClientError),
}
