use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::error::{ClientError, ManagerError};
use crate::domain::ToolDescriptor;
use crate::infrastructure::rpc::{RpcError, ServerNotification};

/// Answer to a `tools/call` exchange that completed at the RPC level.
///
/// A tool that failed on the server side is still a completed exchange:
/// either the server answered with an RPC error object (`RemoteError`), or it
/// returned a result whose payload flags the failure (`isError: true`). Both
/// reach the caller as data, untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Success(Value),
    RemoteError(RpcError),
}

impl ToolResponse {
    pub fn is_error(&self) -> bool {
        match self {
            ToolResponse::Success(value) => value
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ToolResponse::RemoteError(_) => true,
        }
    }

    /// Plain-text rendering: the `text` items of a non-empty `content` list
    /// joined by newlines, otherwise the raw payload.
    pub fn text(&self) -> String {
        match self {
            ToolResponse::Success(value) => match value.get("content").and_then(Value::as_array) {
                Some(items) if !items.is_empty() => items
                    .iter()
                    .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                    .map(|item| item.get("text").and_then(Value::as_str).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => value.to_string(),
            },
            ToolResponse::RemoteError(error) => error.to_string(),
        }
    }

    /// Payload as JSON, error descriptors included.
    pub fn into_value(self) -> Value {
        match self {
            ToolResponse::Success(value) => value,
            ToolResponse::RemoteError(error) => serde_json::to_value(&error).unwrap_or_else(
                |_| serde_json::json!({ "code": error.code, "message": error.message }),
            ),
        }
    }
}

/// Receives unsolicited server traffic. Every call runs on its own task, so
/// a slow handler never stalls the read loop.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn on_notification(&self, notification: ServerNotification);

    /// A frame was dropped because it could not be decoded.
    async fn on_protocol_error(&self, _error: ClientError) {}
}

/// Uniform way to reach tools on named servers.
#[async_trait]
pub trait ToolServerInterface: Send + Sync {
    async fn invoke_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolResponse, ManagerError>;

    async fn server_instructions(&self, server: &str) -> Option<String>;

    async fn tool_metadata(&self, server: &str, tool: &str) -> Option<ToolDescriptor>;
}
