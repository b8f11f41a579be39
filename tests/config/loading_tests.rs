// Config loading tests - ToolmuxConfig::load error handling and startup
//
// Tests that go from a TOML file on disk to a running manager.

use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::tempdir;
use toolmux_core::{ConfigError, ServerManager, ToolResponse, ToolmuxConfig};

const MOCK: &str = env!("CARGO_BIN_EXE_mock-tool-server");

#[test]
fn returns_error_when_file_not_found() {
    let result = ToolmuxConfig::load(Some(Path::new("/nonexistent/path/toolmux.toml")));
    assert!(matches!(result, Err(ConfigError::NotFound { .. })));
}

#[test]
fn returns_parse_error_for_invalid_toml() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("toolmux.toml");
    fs::write(&path, "[[servers]\nname = ").expect("write");

    let result = ToolmuxConfig::load(Some(&path));
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
}

#[test]
fn rejects_reserved_separator_in_server_name() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("toolmux.toml");
    fs::write(
        &path,
        "[[servers]]\nname = \"jira__cloud\"\ncommand = \"jira-tools\"\n",
    )
    .expect("write");

    let result = ToolmuxConfig::load(Some(&path));
    assert!(matches!(result, Err(ConfigError::InvalidServer { index: 0, .. })));
}

#[tokio::test]
async fn loaded_config_starts_servers() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("toolmux.toml");
    let document = format!(
        r#"
[client]
call_timeout_ms = 5000
shutdown_grace_ms = 1000

[[servers]]
name = "repos"
command = "{MOCK}"
args = ["--tools", "echo"]
workdir = "{workdir}"
env = {{ MOCK_LABEL = "repos" }}
"#,
        workdir = dir.path().display()
    );
    fs::write(&path, document).expect("write");

    let config = ToolmuxConfig::load(Some(&path)).expect("valid config");
    assert_eq!(config.client.call_timeout.as_millis(), 5000);

    let manager = ServerManager::new(config.client.clone());
    let report = manager.start_all(config.servers).await;
    assert_eq!(report.ready, vec!["repos"]);

    let response = manager
        .call_tool("repos__echo", json!({"ping": 1}))
        .await
        .expect("routed");
    assert!(matches!(response, ToolResponse::Success(ref value) if value["structuredContent"] == json!({"ping": 1})));

    assert!(manager.shutdown().await.is_clean());
}
