//! Configuration for tool servers and client limits.
//!
//! A `toolmux.toml` holds `[[servers]]` launch entries and an optional
//! `[client]` table of timeouts. Loading is a convenience for front ends; the
//! runtime itself only consumes [`ServerConfig`] and [`ClientOptions`] values.

mod error;
mod loader;
mod options;
mod server;

pub use crate::constants::CONFIG_PATH;
pub use error::ConfigError;
pub use loader::ToolmuxConfig;
pub use options::ClientOptions;
pub use server::ServerConfig;
