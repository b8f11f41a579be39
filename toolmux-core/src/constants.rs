//! Application constants
//!
//! Single source of truth for protocol strings, paths and default limits.

use std::time::Duration;

/// Default configuration file path
pub const CONFIG_PATH: &str = "config/toolmux.toml";

/// Default environment file path
pub const ENV_PATH: &str = "config/.env";

/// Protocol revision announced in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC version tag carried by every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIED_SEPARATOR: &str = "__";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Consecutive malformed frames tolerated before a session is failed.
pub const DEFAULT_MAX_PROTOCOL_ERRORS: u32 = 3;

/// Number of trailing stderr lines kept per subprocess.
pub const DEFAULT_STDERR_LINES: usize = 64;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const LOG_MESSAGE: &str = "notifications/message";
    pub const PING: &str = "ping";
}
