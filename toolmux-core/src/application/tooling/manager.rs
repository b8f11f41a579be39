use super::error::{ClientError, ManagerError};
use super::interface::{NotificationHandler, ToolResponse, ToolServerInterface};
use super::process::ServerClient;
use super::state::SessionState;
use crate::config::{ClientOptions, ServerConfig};
use crate::domain::{QualifiedName, QualifiedTool, ToolDescriptor, validate_server_name};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Outcome of [`ServerManager::start_all`].
#[derive(Debug, Default)]
pub struct StartReport {
    pub ready: Vec<String>,
    pub failed: Vec<(String, ManagerError)>,
}

impl StartReport {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`ServerManager::shutdown`]. Every client was attempted.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub errors: Vec<ClientError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns a named set of server clients and routes calls between them.
///
/// Clients that fail to start stay registered so that [`shutdown`](Self::shutdown)
/// still reaches them and [`failures`](Self::failures) can report why.
pub struct ServerManager {
    options: ClientOptions,
    handler: Option<Arc<dyn NotificationHandler>>,
    configs: RwLock<HashMap<String, ServerConfig>>,
    instances: RwLock<HashMap<String, ServerClient>>,
    rejected: RwLock<BTreeMap<String, ManagerError>>,
}

impl ServerManager {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            handler: None,
            configs: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            rejected: RwLock::new(BTreeMap::new()),
        }
    }

    /// Handler installed on every client started afterwards.
    pub fn with_notification_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Starts one client per config, concurrently and independently.
    ///
    /// A bad name, a duplicate or a failed start only affects that entry; the
    /// report partitions the batch into ready and failed servers.
    pub async fn start_all(&self, configs: Vec<ServerConfig>) -> StartReport {
        let mut report = StartReport::default();
        let mut batch = Vec::new();
        {
            let mut seen = HashSet::new();
            let mut stored = self.configs.write().unwrap_or_else(PoisonError::into_inner);
            let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
            for config in configs {
                let name = config.name.clone();
                if let Err(err) = validate_server_name(&name) {
                    warn!(server = %name, %err, "Rejected tool server name");
                    report.failed.push((name, err.into()));
                    continue;
                }
                if !seen.insert(name.clone()) || instances.contains_key(&name) {
                    warn!(server = %name, "Rejected duplicate tool server");
                    report
                        .failed
                        .push((name.clone(), ManagerError::DuplicateServer { server: name }));
                    continue;
                }
                let client = self.build_client(config.clone());
                stored.insert(name.clone(), config);
                instances.insert(name.clone(), client.clone());
                batch.push(client);
            }
        }
        {
            let mut rejected = self.rejected.write().unwrap_or_else(PoisonError::into_inner);
            for (name, err) in &report.failed {
                rejected.insert(name.clone(), err.clone());
            }
        }

        let names: Vec<String> = batch.iter().map(|c| c.name().to_string()).collect();
        let handles = batch
            .into_iter()
            .map(|client| tokio::spawn(async move { client.start().await }));
        let outcomes = join_all(handles).await;

        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(())) => report.ready.push(name),
                Ok(Err(err)) => report.failed.push((name, err.into())),
                Err(join) => {
                    let err = ManagerError::ServerUnavailable {
                        server: name.clone(),
                        reason: format!("startup task aborted: {join}"),
                    };
                    report.failed.push((name, err));
                }
            }
        }
        report.ready.sort();

        info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Tool servers started"
        );
        for (server, err) in &report.failed {
            warn!(%server, %err, "Tool server unavailable");
        }
        report
    }

    /// Registers a client that was started outside the manager, for example
    /// one connected over an in-memory transport.
    ///
    /// It is routed, reported and shut down like any other, but it has no
    /// config to [`restart`](Self::restart) from.
    pub fn attach(&self, client: ServerClient) -> Result<(), ManagerError> {
        let name = client.name().to_string();
        validate_server_name(&name)?;
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        if instances.contains_key(&name) {
            return Err(ManagerError::DuplicateServer { server: name });
        }
        info!(server = %name, state = %client.state(), "Attached tool server");
        instances.insert(name, client);
        Ok(())
    }

    fn build_client(&self, config: ServerConfig) -> ServerClient {
        let client = ServerClient::new(config, self.options.clone());
        if let Some(handler) = &self.handler {
            client.set_notification_handler(Arc::clone(handler));
        }
        client
    }

    pub fn client(&self, server: &str) -> Option<ServerClient> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
    }

    fn clients(&self) -> Vec<ServerClient> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Every tool of every `Ready` server, keyed by qualified name.
    ///
    /// Computed from the live catalogs on each call, so a reload or a
    /// `list_changed` refresh is visible immediately.
    pub fn aggregated_tools(&self) -> Vec<QualifiedTool> {
        let mut tools: Vec<QualifiedTool> = self
            .clients()
            .into_iter()
            .filter(ServerClient::is_ready)
            .flat_map(|client| {
                client
                    .tools()
                    .iter()
                    .cloned()
                    .map(QualifiedTool::from)
                    .collect::<Vec<_>>()
            })
            .collect();
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    /// Routes `server__tool` to its server.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: Value,
    ) -> Result<ToolResponse, ManagerError> {
        let name = QualifiedName::parse(qualified)?;
        self.call_server_tool(name.server(), name.tool(), arguments)
            .await
    }

    pub async fn call_server_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolResponse, ManagerError> {
        let client = self.ready_client(server)?;
        if client.tool(tool).is_none() {
            return Err(ManagerError::UnknownTool {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        client
            .call_tool(tool, arguments)
            .await
            .map_err(|err| unavailable_or(err, &client))
    }

    fn ready_client(&self, server: &str) -> Result<ServerClient, ManagerError> {
        let client = self
            .client(server)
            .ok_or_else(|| ManagerError::UnknownServer {
                server: server.to_string(),
            })?;
        if !client.is_ready() {
            return Err(unavailable(&client));
        }
        Ok(client)
    }

    /// Re-runs tool discovery on one server.
    pub async fn reload_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>, ManagerError> {
        let client = self.ready_client(server)?;
        let tools = client
            .refresh_tools()
            .await
            .map_err(|err| unavailable_or(err, &client))?;
        info!(server, tools = tools.len(), "Reloaded tool catalog");
        Ok(tools.as_ref().clone())
    }

    /// Replaces a server's client with a fresh one built from its config.
    pub async fn restart(&self, server: &str) -> Result<(), ManagerError> {
        let config = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownServer {
                server: server.to_string(),
            })?;

        let client = self.build_client(config);
        let previous = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server.to_string(), client.clone());
        if let Some(previous) = previous {
            if let Err(err) = previous.shutdown().await {
                warn!(server, %err, "Previous instance did not stop cleanly");
            }
        }

        info!(server, "Restarting tool server");
        client.start().await.map_err(ManagerError::from)
    }

    pub fn status(&self) -> BTreeMap<String, SessionState> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, client)| (name.clone(), client.state()))
            .collect()
    }

    pub fn ready_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clients()
            .into_iter()
            .filter(ServerClient::is_ready)
            .map(|client| client.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Last known failure of every server that is not `Ready`, including
    /// configs rejected before they were started.
    pub fn failures(&self) -> BTreeMap<String, ManagerError> {
        let mut failures = self
            .rejected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for client in self.clients() {
            if client.is_ready() {
                failures.remove(client.name());
                continue;
            }
            let failure = match client.last_error() {
                Some(err) => ManagerError::Client(err),
                None => unavailable(&client),
            };
            failures.insert(client.name().to_string(), failure);
        }
        failures
    }

    /// Stops every client, whatever its state.
    ///
    /// Each client is stopped on its own task, so one that errors or panics
    /// does not keep the rest from being terminated.
    pub async fn shutdown(&self) -> ShutdownReport {
        let clients = self.clients();
        let names: Vec<String> = clients.iter().map(|c| c.name().to_string()).collect();
        let handles = clients
            .into_iter()
            .map(|client| tokio::spawn(async move { client.shutdown().await }));
        let outcomes = join_all(handles).await;

        let mut report = ShutdownReport::default();
        for (name, outcome) in names.into_iter().zip(outcomes) {
            match outcome {
                Ok(Ok(())) => report.stopped.push(name),
                Ok(Err(err)) => report.errors.push(err),
                Err(join) => report.errors.push(ClientError::Shutdown {
                    server: name,
                    reason: format!("shutdown task aborted: {join}"),
                }),
            }
        }
        report.stopped.sort();
        for err in &report.errors {
            warn!(server = %err.server(), %err, "Tool server shutdown error");
        }
        info!(
            stopped = report.stopped.len(),
            errors = report.errors.len(),
            "Tool servers stopped"
        );
        report
    }
}

fn unavailable(client: &ServerClient) -> ManagerError {
    let reason = match client.last_error() {
        Some(err) => err.to_string(),
        None => format!("server is {}", client.state()),
    };
    ManagerError::ServerUnavailable {
        server: client.name().to_string(),
        reason,
    }
}

/// A client that stopped being ready mid-call is reported as unavailable.
fn unavailable_or(err: ClientError, client: &ServerClient) -> ManagerError {
    match err {
        ClientError::NotReady { .. } => unavailable(client),
        other => {
            if other.is_fatal() {
                warn!(server = %client.name(), err = %other, "Tool server lost during call");
            }
            ManagerError::Client(other)
        }
    }
}

#[async_trait]
impl ToolServerInterface for ServerManager {
    async fn invoke_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolResponse, ManagerError> {
        self.call_server_tool(server, tool, arguments).await
    }

    async fn server_instructions(&self, server: &str) -> Option<String> {
        match self.ready_client(server) {
            Ok(client) => client.instructions(),
            Err(err) => {
                warn!(server, %err, "Failed to fetch server instructions");
                None
            }
        }
    }

    async fn tool_metadata(&self, server: &str, tool: &str) -> Option<ToolDescriptor> {
        match self.ready_client(server) {
            Ok(client) => client.tool(tool),
            Err(err) => {
                warn!(server, tool, %err, "Failed to fetch tool metadata");
                None
            }
        }
    }
}
