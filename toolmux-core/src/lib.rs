//! Client runtime for stdio tool servers.
//!
//! A [`ServerClient`] launches one tool-server subprocess, performs the
//! `initialize` handshake, discovers its tools and multiplexes concurrent
//! `tools/call` requests over the process's stdin/stdout. A [`ServerManager`]
//! owns several clients, exposes their tools under `server__tool` names and
//! shuts them all down together.
//!
//! ```no_run
//! use serde_json::json;
//! use toolmux_core::{ClientOptions, ServerConfig, ServerManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ServerManager::new(ClientOptions::default());
//! let report = manager
//!     .start_all(vec![ServerConfig::new("repos", "repo-tools").with_args(["--stdio"])])
//!     .await;
//! for (server, err) in &report.failed {
//!     eprintln!("{server}: {err}");
//! }
//! let response = manager.call_tool("repos__search", json!({"query": "toolmux"})).await?;
//! println!("{}", response.into_value());
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod constants;
pub mod domain;
pub mod infrastructure;

pub use application::tooling;
pub use config::{ClientOptions, ConfigError, ServerConfig, ToolmuxConfig};
pub use domain::{NameError, QualifiedName, QualifiedTool, ToolDescriptor};
pub use infrastructure::{rpc, transport};
pub use tooling::{
    ClientError, ManagerError, NotificationHandler, ServerClient, ServerManager, SessionState,
    ShutdownReport, StartReport, ToolResponse, ToolServerInterface,
};
