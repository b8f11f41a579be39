use super::error::ConfigError;
use super::options::{ClientOptions, RawClientOptions};
use super::server::{RawServer, ServerConfig};
use crate::constants::CONFIG_PATH;
use crate::domain::validate_server_name;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Raw configuration structure for deserialization from TOML
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default)]
    client: RawClientOptions,
}

/// Server set plus client limits, as read from `toolmux.toml`.
#[derive(Debug, Clone, Default)]
pub struct ToolmuxConfig {
    pub servers: Vec<ServerConfig>,
    pub client: ClientOptions,
}

impl ToolmuxConfig {
    /// Load and validate configuration from a file path, falling back to
    /// [`CONFIG_PATH`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = path.unwrap_or_else(|| Path::new(CONFIG_PATH));
        debug!(path = %config_path.display(), "Reading toolmux configuration file");

        let content = fs::read_to_string(config_path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: config_path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: config_path.to_path_buf(),
                    source,
                }
            }
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })?;
        Self::from_raw(raw)
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: Path::new("<inline>").to_path_buf(),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut servers = Vec::with_capacity(raw.servers.len());
        for (index, raw_server) in raw.servers.into_iter().enumerate() {
            let server = ServerConfig::from(raw_server);
            validate_server_name(&server.name).map_err(|err| ConfigError::InvalidServer {
                index,
                reason: err.to_string(),
            })?;
            if server.command.as_os_str().is_empty() {
                return Err(ConfigError::InvalidServer {
                    index,
                    reason: format!("server '{}' has an empty command", server.name),
                });
            }
            if !seen.insert(server.name.clone()) {
                return Err(ConfigError::DuplicateServer { name: server.name });
            }
            servers.push(server);
        }

        Ok(Self {
            servers,
            client: ClientOptions::from(raw.client),
        })
    }
}
