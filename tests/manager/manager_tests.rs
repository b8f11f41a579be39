// Manager tests - several mock servers behind one ServerManager
//
// Covers partial startup, aggregation under qualified names, routing and
// coordinated shutdown.

use serde_json::{Value, json};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use toolmux_core::rpc::ServerNotification;
use toolmux_core::tooling::NotificationHandler;
use toolmux_core::transport::Transport;
use toolmux_core::{
    ClientError, ClientOptions, ManagerError, ServerClient, ServerConfig, ServerManager,
    SessionState, ToolResponse, ToolServerInterface,
};

const MOCK: &str = env!("CARGO_BIN_EXE_mock-tool-server");

// ============================================================================
// Helpers
// ============================================================================

fn mock(name: &str, args: &[&str]) -> ServerConfig {
    ServerConfig::new(name, MOCK).with_args(args.iter().copied())
}

fn manager() -> ServerManager {
    ServerManager::new(
        ClientOptions::default()
            .with_handshake_timeout(Duration::from_secs(10))
            .with_call_timeout(Duration::from_secs(10))
            .with_shutdown_grace(Duration::from_secs(2)),
    )
}

// ============================================================================
// Startup and aggregation
// ============================================================================

#[tokio::test]
async fn same_tool_name_on_two_servers_stays_distinct() {
    let manager = manager();
    let report = manager
        .start_all(vec![
            mock("alpha", &["--tools", "a"]),
            mock("beta", &["--tools", "a,b"]),
        ])
        .await;
    assert!(report.all_ready(), "{:?}", report.failed);
    assert_eq!(report.ready, vec!["alpha", "beta"]);

    let names: Vec<String> = manager
        .aggregated_tools()
        .into_iter()
        .map(|tool| tool.qualified_name)
        .collect();
    assert_eq!(names, vec!["alpha__a", "beta__a", "beta__b"]);

    let response = manager
        .call_tool("beta__a", json!({"from": "beta"}))
        .await
        .expect("routed");
    assert!(matches!(response, ToolResponse::Success(ref v) if v["structuredContent"]["from"] == "beta"));

    assert!(manager.shutdown().await.is_clean());
}

#[tokio::test]
async fn one_failed_launch_leaves_the_rest_usable() {
    let manager = manager();
    let report = manager
        .start_all(vec![
            mock("repos", &["--tools", "echo"]),
            mock("broken", &["--exit-immediately"]),
            mock("jira", &["--tools", "echo"]),
        ])
        .await;

    assert_eq!(report.ready, vec!["jira", "repos"]);
    assert_eq!(report.failed.len(), 1);
    let (name, err) = &report.failed[0];
    assert_eq!(name, "broken");
    assert!(matches!(err, ManagerError::Client(ClientError::Launch { .. })), "{err:?}");

    assert_eq!(manager.ready_servers(), vec!["jira", "repos"]);
    assert_eq!(manager.status().get("broken"), Some(&SessionState::Failed));
    assert!(manager.failures().contains_key("broken"));
    assert!(!manager.failures().contains_key("repos"));

    let routed = tokio::time::timeout(
        Duration::from_secs(2),
        manager.call_tool("broken__echo", json!({})),
    )
    .await
    .expect("no hang");
    assert!(matches!(routed, Err(ManagerError::ServerUnavailable { .. })), "{routed:?}");
    assert!(matches!(
        manager.call_tool("nobody__echo", json!({})).await,
        Err(ManagerError::UnknownServer { .. })
    ));
    assert!(matches!(
        manager.call_tool("repos__missing", json!({})).await,
        Err(ManagerError::UnknownTool { .. })
    ));
    manager
        .call_tool("repos__echo", json!({}))
        .await
        .expect("healthy server still answers");

    let shutdown = manager.shutdown().await;
    assert!(shutdown.is_clean(), "{:?}", shutdown.errors);
    assert_eq!(shutdown.stopped, vec!["broken", "jira", "repos"]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn shutdown_terminates_every_server_including_failed_ones() {
    let manager = manager();
    manager
        .start_all(vec![
            mock("stubborn", &["--linger", "--tools", "echo"]),
            mock("doomed", &["--tools", "exit,echo"]),
        ])
        .await;

    let died = manager.call_tool("doomed__exit", json!({})).await;
    assert!(matches!(died, Err(ManagerError::Client(ClientError::ConnectionClosed { .. }))), "{died:?}");
    assert_eq!(manager.status().get("doomed"), Some(&SessionState::Failed));
    assert!(manager.aggregated_tools().iter().all(|t| t.descriptor.server == "stubborn"));

    let report = tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
        .await
        .expect("shutdown returns");
    assert!(report.is_clean(), "{:?}", report.errors);
    let status = manager.status();
    assert_eq!(status.get("stubborn"), Some(&SessionState::Closed));
    assert_eq!(status.get("doomed"), Some(&SessionState::Failed));
}

/// Client stdin that accepts frames but fails to close.
struct StuckStdin(WriteHalf<DuplexStream>);

impl AsyncWrite for StuckStdin {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("stdin refused to close")))
    }
}

/// A ready client over in-memory pipes whose termination always errors.
async fn stuck_client(name: &str) -> ServerClient {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (server_read, mut server_write) = tokio::io::split(server_side);
    let transport = Transport::from_streams(Box::new(client_read), Box::new(StuckStdin(client_write)));

    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request: Value = serde_json::from_str(&line).expect("client sent JSON");
            let result = match request["method"].as_str() {
                Some("initialize") => json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
                Some("tools/list") => json!({"tools": [{"name": "echo"}]}),
                _ => continue,
            };
            let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": result});
            server_write
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .expect("write");
        }
    });

    let client = ServerClient::new(ServerConfig::new(name, "in-memory"), ClientOptions::default());
    client.connect(transport).await.expect("in-memory server ready");
    client
}

#[tokio::test]
async fn one_failed_termination_does_not_stop_the_others() {
    let manager = manager();
    manager
        .start_all(vec![mock("steady", &["--linger", "--tools", "echo"])])
        .await;
    manager.attach(stuck_client("stuck").await).expect("attached");
    assert_eq!(manager.ready_servers(), vec!["steady", "stuck"]);

    let report = tokio::time::timeout(Duration::from_secs(10), manager.shutdown())
        .await
        .expect("shutdown returns");
    assert_eq!(report.errors.len(), 1, "{:?}", report.errors);
    assert!(matches!(&report.errors[0], ClientError::Shutdown { server, .. } if server == "stuck"));
    assert_eq!(report.stopped, vec!["steady"]);
    assert_eq!(manager.status().get("steady"), Some(&SessionState::Closed));
}

#[tokio::test]
async fn restart_brings_a_failed_server_back() {
    let manager = manager();
    manager
        .start_all(vec![mock("flaky", &["--tools", "exit,echo"])])
        .await;
    let _ = manager.call_tool("flaky__exit", json!({})).await;
    assert!(manager.ready_servers().is_empty());

    manager.restart("flaky").await.expect("restarted");
    assert_eq!(manager.ready_servers(), vec!["flaky"]);
    manager
        .call_tool("flaky__echo", json!({"again": true}))
        .await
        .expect("fresh client answers");

    let tools = manager.reload_tools("flaky").await.expect("reloaded");
    assert_eq!(tools.len(), 2);
    assert!(manager.shutdown().await.is_clean());
}

#[tokio::test]
async fn interface_exposes_metadata_and_instructions() {
    let manager = manager();
    manager.start_all(vec![mock("repos", &["--tools", "echo"])]).await;

    let service: &dyn ToolServerInterface = &manager;
    let metadata = service.tool_metadata("repos", "echo").await.expect("known tool");
    assert_eq!(metadata.description, "Returns its arguments");
    assert_eq!(metadata.input_schema, json!({"type": "object"}));
    assert_eq!(
        service.server_instructions("repos").await.as_deref(),
        Some("Use echo to test connectivity.")
    );
    let response = service
        .invoke_tool("repos", "echo", json!({"x": 1}))
        .await
        .expect("invoked");
    assert!(!response.is_error());

    manager.shutdown().await;
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Default)]
struct Recorder {
    protocol_errors: Mutex<Vec<ClientError>>,
}

#[async_trait::async_trait]
impl NotificationHandler for Recorder {
    async fn on_notification(&self, _notification: ServerNotification) {}

    async fn on_protocol_error(&self, error: ClientError) {
        self.protocol_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error);
    }
}

#[tokio::test]
async fn dropped_frames_are_reported_to_the_handler() {
    let recorder = Arc::new(Recorder::default());
    let manager = manager().with_notification_handler(recorder.clone());
    manager.start_all(vec![mock("noisy", &["--tools", "garbage"])]).await;

    manager
        .call_tool("noisy__garbage", json!({}))
        .await
        .expect("answer follows the garbage line");
    for _ in 0..50 {
        if !recorder.protocol_errors.lock().unwrap_or_else(|p| p.into_inner()).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let errors = recorder.protocol_errors.lock().unwrap_or_else(|p| p.into_inner()).clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], ClientError::Protocol { server, .. } if server == "noisy"));
    assert_eq!(manager.ready_servers(), vec!["noisy"]);

    manager.shutdown().await;
}
