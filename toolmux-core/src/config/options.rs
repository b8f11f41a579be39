use crate::constants::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_PROTOCOL_ERRORS,
    DEFAULT_SHUTDOWN_GRACE, DEFAULT_STDERR_LINES,
};
use serde::Deserialize;
use std::time::Duration;

/// Runtime limits applied to every server client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Upper bound for `initialize` plus tool discovery.
    pub handshake_timeout: Duration,
    /// Per `tools/call` deadline.
    pub call_timeout: Duration,
    /// Time a subprocess gets to exit after EOF and SIGTERM before it is killed.
    pub shutdown_grace: Duration,
    /// Consecutive undecodable frames after which the session is failed.
    pub max_protocol_errors: u32,
    pub stderr_lines: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_protocol_errors: DEFAULT_MAX_PROTOCOL_ERRORS,
            stderr_lines: DEFAULT_STDERR_LINES,
        }
    }
}

impl ClientOptions {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_protocol_errors(mut self, limit: u32) -> Self {
        self.max_protocol_errors = limit.max(1);
        self
    }
}

/// `[client]` table as written in the TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawClientOptions {
    handshake_timeout_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    max_protocol_errors: Option<u32>,
    stderr_lines: Option<usize>,
}

impl From<RawClientOptions> for ClientOptions {
    fn from(raw: RawClientOptions) -> Self {
        let defaults = ClientOptions::default();
        Self {
            handshake_timeout: raw
                .handshake_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.handshake_timeout),
            call_timeout: raw
                .call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_timeout),
            shutdown_grace: raw
                .shutdown_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            max_protocol_errors: raw
                .max_protocol_errors
                .map(|limit| limit.max(1))
                .unwrap_or(defaults.max_protocol_errors),
            stderr_lines: raw.stderr_lines.unwrap_or(defaults.stderr_lines),
        }
    }
}
