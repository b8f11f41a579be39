//! One tool-server session.
//!
//! A [`ServerClient`] owns a subprocess (or any [`Transport`]), a single read
//! loop task that drains its output, and the table of pending calls. Any
//! number of tasks may call into a ready client concurrently; each request
//! waits on its own slot and responses are matched by id, so they may arrive
//! in any order.

use super::error::ClientError;
use super::interface::{NotificationHandler, ToolResponse};
use super::pending::PendingCalls;
use super::state::SessionState;
use crate::config::{ClientOptions, ServerConfig};
use crate::constants::{PROTOCOL_VERSION, methods};
use crate::domain::ToolDescriptor;
use crate::infrastructure::rpc::{
    Incoming, RequestId, RpcError, RpcResponse, ServerNotification, decode, encode_notification,
    encode_request, encode_response,
};
use crate::infrastructure::transport::{
    ChildProcess, FrameReader, FrameWriter, StderrLog, Transport, with_stderr,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long startup failure classification waits for an exit status.
const EXIT_PROBE: Duration = Duration::from_millis(250);

/// Details the server reported in its `initialize` answer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone)]
pub struct ServerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ServerConfig,
    options: ClientOptions,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<ClientError>>,
    last_protocol_error: Mutex<Option<ClientError>>,
    pending: PendingCalls,
    writer: OnceLock<FrameWriter>,
    process: AsyncMutex<Option<ChildProcess>>,
    exit_status: Mutex<Option<ExitStatus>>,
    stderr: OnceLock<StderrLog>,
    tools: RwLock<Arc<Vec<ToolDescriptor>>>,
    initialize: Mutex<Option<InitializeResult>>,
    handler: RwLock<Option<Arc<dyn NotificationHandler>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    frames_seen: AtomicBool,
    consecutive_protocol_errors: AtomicU32,
    total_protocol_errors: AtomicU64,
}

enum ReadEnd {
    Eof,
    ReadFailed(std::io::Error),
    Desynchronized(ClientError),
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerClient {
    pub fn new(config: ServerConfig, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                options,
                state: Mutex::new(SessionState::Created),
                last_error: Mutex::new(None),
                last_protocol_error: Mutex::new(None),
                pending: PendingCalls::new(),
                writer: OnceLock::new(),
                process: AsyncMutex::new(None),
                exit_status: Mutex::new(None),
                stderr: OnceLock::new(),
                tools: RwLock::new(Arc::new(Vec::new())),
                initialize: Mutex::new(None),
                handler: RwLock::new(None),
                reader_task: Mutex::new(None),
                frames_seen: AtomicBool::new(false),
                consecutive_protocol_errors: AtomicU32::new(0),
                total_protocol_errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// The failure that moved this client to `Failed`, if any.
    pub fn last_error(&self) -> Option<ClientError> {
        lock(&self.inner.last_error).clone()
    }

    /// Most recent dropped frame, even if the session survived it.
    pub fn last_protocol_error(&self) -> Option<ClientError> {
        lock(&self.inner.last_protocol_error).clone()
    }

    pub fn protocol_error_count(&self) -> u64 {
        self.inner.total_protocol_errors.load(Ordering::Relaxed)
    }

    /// Snapshot of the current tool catalog. Replaced wholesale on discovery.
    pub fn tools(&self) -> Arc<Vec<ToolDescriptor>> {
        Arc::clone(&self.inner.tools.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools().iter().find(|tool| tool.name == name).cloned()
    }

    pub fn initialize_result(&self) -> Option<InitializeResult> {
        lock(&self.inner.initialize).clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.initialize_result().and_then(|init| init.instructions)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn stderr_tail(&self) -> String {
        self.inner.stderr_snapshot()
    }

    /// Spawns the subprocess, performs the handshake and discovers tools.
    ///
    /// On success the client is `Ready`. On failure it is `Failed`, its
    /// subprocess has been terminated and the error is also kept as
    /// [`last_error`](Self::last_error).
    pub async fn start(&self) -> Result<(), ClientError> {
        self.inner.begin_start()?;
        let transport = match Transport::spawn(&self.inner.config, self.inner.options.stderr_lines)
        {
            Ok(transport) => transport,
            Err(err) => {
                let error = ClientError::Launch {
                    server: self.name().to_string(),
                    reason: format!("{}: {err}", self.inner.config.command.display()),
                };
                error!(server = %self.name(), %error, "Failed to spawn tool server");
                self.inner.fail(error.clone()).await;
                return Err(error);
            }
        };
        Arc::clone(&self.inner).run_startup(transport).await
    }

    /// Like [`start`](Self::start), over an already established transport.
    pub async fn connect(&self, transport: Transport) -> Result<(), ClientError> {
        self.inner.begin_start()?;
        Arc::clone(&self.inner).run_startup(transport).await
    }

    /// Invokes a server-local tool with the configured call timeout.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolResponse, ClientError> {
        self.call_tool_with_timeout(tool, arguments, self.inner.options.call_timeout)
            .await
    }

    /// Invokes a tool, giving up after `timeout`.
    ///
    /// Arguments are passed through as-is (`null` becomes `{}`). A timeout only
    /// abandons the call on this side; the server may still finish the work.
    pub async fn call_tool_with_timeout(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolResponse, ClientError> {
        self.inner.ensure_ready()?;
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        debug!(server = %self.name(), tool, "Calling tool");
        let outcome = self
            .inner
            .request(methods::TOOLS_CALL, params, Some(timeout))
            .await?;
        Ok(match outcome {
            Ok(result) => ToolResponse::Success(result),
            Err(error) => {
                debug!(server = %self.name(), tool, %error, "Tool call answered with an error");
                ToolResponse::RemoteError(error)
            }
        })
    }

    /// Re-runs `tools/list` and replaces the catalog.
    pub async fn refresh_tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, ClientError> {
        self.inner.ensure_ready()?;
        self.inner
            .discover_tools(Some(self.inner.options.call_timeout))
            .await
    }

    /// Stops the session and its subprocess.
    ///
    /// Outstanding calls resolve with `ConnectionClosed`, stdin is closed, the
    /// process gets SIGTERM and, after the grace period, a kill. Safe to call
    /// in any state and more than once; a `Failed` client stays `Failed`.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.inner.shutdown().await
    }
}

impl ClientInner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Moves `from -> to`; `false` if the state was not `from`.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = lock(&self.state);
        if *state != from || !from.can_transition_to(to) {
            return false;
        }
        debug!(server = %self.name(), from = %from, to = %to, "Session state change");
        *state = to;
        true
    }

    fn begin_start(&self) -> Result<(), ClientError> {
        if self.transition(SessionState::Created, SessionState::Starting) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                server: self.name().to_string(),
                action: "start",
                state: self.state(),
            })
        }
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            state => Err(ClientError::NotReady {
                server: self.name().to_string(),
                state,
            }),
        }
    }

    fn stderr_snapshot(&self) -> String {
        self.stderr.get().map(StderrLog::snapshot).unwrap_or_default()
    }

    fn connection_closed(&self, reason: impl Into<String>) -> ClientError {
        ClientError::ConnectionClosed {
            server: self.name().to_string(),
            reason: reason.into(),
        }
    }

    async fn run_startup(self: Arc<Self>, transport: Transport) -> Result<(), ClientError> {
        let Transport {
            reader,
            writer,
            process,
            stderr,
        } = transport;
        // begin_start admits a single caller, so these are set exactly once
        let _ = self.writer.set(writer);
        let _ = self.stderr.set(stderr);
        *self.process.lock().await = process;

        if !self.transition(SessionState::Starting, SessionState::Handshaking) {
            // a shutdown ran before the child was stored and could not reach it
            if let Err(err) = self.release_process().await {
                warn!(server = %self.name(), error = %err, "Failed to stop tool server process");
            }
            return Err(self.interrupted_startup());
        }

        let task = tokio::spawn(read_loop(Arc::downgrade(&self), reader));
        *lock(&self.reader_task) = Some(task);

        let limit = self.options.handshake_timeout;
        let outcome = match tokio::time::timeout(limit, self.handshake()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(self.classify_startup_failure(err).await),
            Err(_) => Err(ClientError::Handshake {
                server: self.name().to_string(),
                reason: with_stderr(
                    format!("no complete handshake within {}ms", limit.as_millis()),
                    &self.stderr_snapshot(),
                ),
            }),
        };

        match outcome {
            Ok(()) if self.transition(SessionState::Handshaking, SessionState::Ready) => {
                info!(
                    server = %self.name(),
                    tools = self.tools.read().unwrap_or_else(PoisonError::into_inner).len(),
                    "Tool server ready"
                );
                Ok(())
            }
            Ok(()) => Err(self.interrupted_startup()),
            Err(err) => {
                error!(server = %self.name(), error = %err, "Tool server failed to start");
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    fn interrupted_startup(&self) -> ClientError {
        lock(&self.last_error)
            .clone()
            .unwrap_or_else(|| self.connection_closed("session closed during startup"))
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let handshake_error = |reason: String| ClientError::Handshake {
            server: self.name().to_string(),
            reason,
        };

        let init = match self.request(methods::INITIALIZE, params, None).await? {
            Ok(value @ Value::Object(_)) => serde_json::from_value::<InitializeResult>(value)
                .map_err(|err| handshake_error(format!("malformed initialize result: {err}")))?,
            Ok(other) => {
                return Err(handshake_error(format!(
                    "initialize result is not an object: {other}"
                )));
            }
            Err(rpc) => return Err(handshake_error(format!("initialize rejected: {rpc}"))),
        };
        debug!(
            server = %self.name(),
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            remote = init.server_info.as_ref().and_then(|info| info.name.as_deref()).unwrap_or("unknown"),
            "Initialize acknowledged"
        );
        *lock(&self.initialize) = Some(init);

        self.notify(methods::INITIALIZED, json!({})).await?;
        self.discover_tools(None)
            .await
            .map_err(|err| match err {
                ClientError::Discovery { reason, .. } => handshake_error(reason),
                other => other,
            })?;
        Ok(())
    }

    /// Turns a low-level handshake failure into the error reported to callers.
    async fn classify_startup_failure(&self, err: ClientError) -> ClientError {
        match err {
            ClientError::ConnectionClosed { reason, .. } => {
                let status = self.probe_exit_status().await;
                let stderr = self.stderr_snapshot();
                match status {
                    Some(status) if !status.success() && !self.frames_seen.load(Ordering::SeqCst) => {
                        ClientError::Launch {
                            server: self.name().to_string(),
                            reason: with_stderr(
                                format!("exited with {status} before producing output"),
                                &stderr,
                            ),
                        }
                    }
                    _ => ClientError::Handshake {
                        server: self.name().to_string(),
                        reason: with_stderr(format!("connection lost: {reason}"), &stderr),
                    },
                }
            }
            ClientError::Protocol { reason, .. } => ClientError::Handshake {
                server: self.name().to_string(),
                reason,
            },
            other => other,
        }
    }

    async fn probe_exit_status(&self) -> Option<ExitStatus> {
        if let Some(status) = *lock(&self.exit_status) {
            return Some(status);
        }
        let mut process = self.process.lock().await;
        let status = match process.as_mut() {
            Some(child) => child.wait_exit(EXIT_PROBE).await,
            None => *lock(&self.exit_status),
        };
        if let Some(status) = status {
            *lock(&self.exit_status) = Some(status);
        }
        status
    }

    /// Runs `tools/list` to exhaustion (following `nextCursor`) and swaps the
    /// catalog in one step.
    async fn discover_tools(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Arc<Vec<ToolDescriptor>>, ClientError> {
        let discovery_error = |reason: String| ClientError::Discovery {
            server: self.name().to_string(),
            reason,
        };

        let mut tools: Vec<ToolDescriptor> = Vec::new();
        let mut names = HashSet::new();
        let mut cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page = self
                .request(methods::TOOLS_LIST, params, timeout)
                .await?
                .map_err(|rpc| discovery_error(format!("tools/list rejected: {rpc}")))?;
            let entries = page
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| discovery_error("tools/list result has no 'tools' array".into()))?;

            for entry in entries {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    warn!(server = %self.name(), %entry, "Skipping tool without a name");
                    continue;
                };
                if !names.insert(name.to_string()) {
                    warn!(server = %self.name(), tool = name, "Skipping duplicate tool name");
                    continue;
                }
                tools.push(ToolDescriptor {
                    name: name.to_string(),
                    server: self.name().to_string(),
                    description: entry
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: entry
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object" })),
                });
            }

            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if cursors.insert(next.to_string()) => cursor = Some(next.to_string()),
                Some(next) => {
                    warn!(server = %self.name(), cursor = next, "tools/list cursor repeated, stopping");
                    break;
                }
                None => break,
            }
        }

        let catalog = Arc::new(tools);
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&catalog);
        debug!(server = %self.name(), tools = catalog.len(), "Tool catalog updated");
        Ok(catalog)
    }

    /// Sends one request and waits for its slot.
    ///
    /// The inner `Result` is the server's answer; the outer one is a failure
    /// on this side. Returning early (timeout, cancellation) drops the slot,
    /// which removes the pending entry.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Result<Value, RpcError>, ClientError> {
        let mut slot = self.pending.register(method)?;
        let frame = encode_request(slot.id(), method, params).map_err(|err| ClientError::Protocol {
            server: self.name().to_string(),
            reason: err.to_string(),
        })?;
        self.write(&frame).await?;

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, slot.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        server = %self.name(),
                        method,
                        id = slot.id(),
                        timeout_ms = limit.as_millis() as u64,
                        "Request timed out, abandoning"
                    );
                    return Err(ClientError::Timeout {
                        server: self.name().to_string(),
                        method: method.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => slot.wait().await,
        };
        outcome.unwrap_or_else(|| Err(self.connection_closed("request abandoned")))
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ClientError> {
        let frame = encode_notification(method, params).map_err(|err| ClientError::Protocol {
            server: self.name().to_string(),
            reason: err.to_string(),
        })?;
        self.write(&frame).await
    }

    async fn write(&self, frame: &[u8]) -> Result<(), ClientError> {
        let writer = self.writer.get().ok_or_else(|| ClientError::NotReady {
            server: self.name().to_string(),
            state: self.state(),
        })?;
        writer
            .write_frame(frame)
            .await
            .map_err(|err| self.connection_closed(format!("write failed: {err}")))
    }

    /// Handles one raw frame from the read loop. `Err` means the stream is
    /// considered desynchronized and the session must fail.
    fn handle_frame(self: &Arc<Self>, frame: &[u8]) -> Result<(), ClientError> {
        self.frames_seen.store(true, Ordering::SeqCst);
        match decode(frame) {
            Ok(incoming) => {
                self.consecutive_protocol_errors.store(0, Ordering::SeqCst);
                self.dispatch(incoming);
                Ok(())
            }
            Err(err) => {
                let consecutive = self.consecutive_protocol_errors.fetch_add(1, Ordering::SeqCst) + 1;
                self.total_protocol_errors.fetch_add(1, Ordering::Relaxed);
                let error = ClientError::Protocol {
                    server: self.name().to_string(),
                    reason: err.to_string(),
                };
                warn!(
                    server = %self.name(),
                    error = %err,
                    consecutive,
                    frame = %String::from_utf8_lossy(frame).chars().take(200).collect::<String>(),
                    "Dropped malformed frame"
                );
                *lock(&self.last_protocol_error) = Some(error.clone());
                if let Some(handler) = self.handler() {
                    let reported = error.clone();
                    tokio::spawn(async move { handler.on_protocol_error(reported).await });
                }

                if consecutive >= self.options.max_protocol_errors {
                    Err(ClientError::Protocol {
                        server: self.name().to_string(),
                        reason: format!(
                            "{consecutive} consecutive malformed frames, stream is desynchronized (last: {err})"
                        ),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn NotificationHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(self: &Arc<Self>, incoming: Incoming) {
        match incoming {
            Incoming::Response { id, outcome } => {
                let resolved = id
                    .as_number()
                    .is_some_and(|key| self.pending.resolve(key, Ok(outcome)));
                if !resolved {
                    debug!(server = %self.name(), response_id = %id, "Response for unknown or abandoned request");
                }
            }
            Incoming::Request { id, method, params: _ } => self.answer_server_request(id, method),
            Incoming::Notification { method, params } => self.handle_notification(method, params),
            Incoming::Uncorrelated(error) => {
                warn!(server = %self.name(), %error, "Server reported an error without a request id");
            }
        }
    }

    fn answer_server_request(self: &Arc<Self>, id: RequestId, method: String) {
        let response = if method == methods::PING {
            RpcResponse::success(id, json!({}))
        } else {
            warn!(server = %self.name(), method = %method, "Server sent unsupported request");
            RpcResponse::failure(id, RpcError::method_not_found(&method))
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let written = match encode_response(&response) {
                Ok(frame) => inner.write(&frame).await,
                Err(err) => Err(ClientError::Protocol {
                    server: inner.name().to_string(),
                    reason: err.to_string(),
                }),
            };
            if let Err(err) = written {
                debug!(server = %inner.name(), %err, "Failed to answer server request");
            }
        });
    }

    fn handle_notification(self: &Arc<Self>, method: String, params: Value) {
        debug!(server = %self.name(), method = %method, "Received notification");
        match method.as_str() {
            methods::TOOLS_LIST_CHANGED if self.state() == SessionState::Ready => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.discover_tools(Some(inner.options.call_timeout)).await {
                        warn!(server = %inner.name(), %err, "Failed to refresh tool catalog");
                    }
                });
            }
            methods::LOG_MESSAGE => {
                info!(
                    server = %self.name(),
                    level = params.get("level").and_then(serde_json::Value::as_str).unwrap_or("info"),
                    data = %params.get("data").unwrap_or(&serde_json::Value::Null),
                    "Server log message"
                );
            }
            _ => {}
        }

        if let Some(handler) = self.handler() {
            let notification = ServerNotification {
                server: self.name().to_string(),
                method,
                params,
            };
            tokio::spawn(async move { handler.on_notification(notification).await });
        }
    }

    /// Called by the read loop once the stream has ended.
    async fn on_read_end(&self, end: ReadEnd) {
        let state = self.state();
        if matches!(
            state,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        ) {
            debug!(server = %self.name(), state = %state, "Read loop finished");
            return;
        }

        let error = match end {
            ReadEnd::Desynchronized(error) => error,
            ReadEnd::ReadFailed(err) => self.connection_closed(with_stderr(
                format!("read failed: {err}"),
                &self.stderr_snapshot(),
            )),
            ReadEnd::Eof => {
                let mut reason = "server closed its output".to_string();
                if let Some(status) = self.probe_exit_status().await {
                    reason = format!("{reason} (exit: {status})");
                }
                self.connection_closed(with_stderr(reason, &self.stderr_snapshot()))
            }
        };
        error!(server = %self.name(), state = %state, error = %error, "Tool server session lost");
        self.fail(error).await;
    }

    /// Moves to `Failed`, resolves every pending call and releases the
    /// subprocess. A shutdown already in progress keeps its own state.
    async fn fail(&self, error: ClientError) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                debug!(server = %self.name(), error = %error, "Failure during shutdown ignored");
            } else {
                *state = SessionState::Failed;
                let mut last = lock(&self.last_error);
                // the first specific failure wins over a later generic close
                let keep_existing =
                    last.is_some() && matches!(error, ClientError::ConnectionClosed { .. });
                if !keep_existing {
                    *last = Some(error.clone());
                }
            }
        }

        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Vec::new());
        let closed = match error {
            ClientError::ConnectionClosed { .. } => error,
            other => self.connection_closed(other.to_string()),
        };
        let failed = self.pending.close(closed);
        if failed > 0 {
            debug!(server = %self.name(), failed, "Resolved outstanding calls with failure");
        }

        if let Err(err) = self.release_process().await {
            warn!(server = %self.name(), error = %err, "Failed to stop tool server process");
        }
    }

    /// Closes stdin and terminates the subprocess, recording its exit status.
    ///
    /// Without a subprocess, closing the stream is the whole termination and
    /// its failure is reported.
    async fn release_process(&self) -> Result<(), ClientError> {
        let closed = match self.writer.get() {
            Some(writer) => writer.close().await,
            None => Ok(()),
        };
        let Some(mut process) = self.process.lock().await.take() else {
            return closed.map_err(|err| ClientError::Shutdown {
                server: self.name().to_string(),
                reason: format!("closing the stream failed: {err}"),
            });
        };
        if let Err(err) = closed {
            debug!(server = %self.name(), %err, "Closing server stdin failed");
        }
        debug!(server = %self.name(), pid = process.id(), "Terminating tool server process");
        match process.terminate(self.options.shutdown_grace).await {
            Ok(status) => {
                debug!(server = %self.name(), %status, "Tool server process exited");
                *lock(&self.exit_status) = Some(status);
                Ok(())
            }
            Err(err) => Err(ClientError::Shutdown {
                server: self.name().to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            match previous {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                SessionState::Failed => {}
                _ => *state = SessionState::Closing,
            }
            previous
        };
        info!(server = %self.name(), state = %previous, "Stopping tool server");

        let failed = self
            .pending
            .close(self.connection_closed("client shut down"));
        if failed > 0 {
            debug!(server = %self.name(), failed, "Resolved outstanding calls on shutdown");
        }

        let released = self.release_process().await;
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
        if previous != SessionState::Failed {
            *lock(&self.state) = SessionState::Closed;
        }
        released
    }
}

async fn read_loop(client: Weak<ClientInner>, mut reader: FrameReader) {
    let end = loop {
        let frame = reader.read_frame().await;
        let Some(inner) = client.upgrade() else {
            return;
        };
        match frame {
            Ok(Some(frame)) => {
                if let Err(error) = inner.handle_frame(&frame) {
                    break ReadEnd::Desynchronized(error);
                }
            }
            Ok(None) => break ReadEnd::Eof,
            Err(err) => break ReadEnd::ReadFailed(err),
        }
    };
    if let Some(inner) = client.upgrade() {
        inner.on_read_end(end).await;
    }
}
