//! Qualified tool names.
//!
//! Tools from different servers may share a bare name, so the manager keys its
//! catalog by `"<server>__<tool>"`. Server names are forbidden from containing
//! the separator, which makes splitting at the first occurrence unambiguous even
//! when the tool name itself contains `__`.

use crate::constants::QUALIFIED_SEPARATOR;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("server name must not be empty")]
    EmptyServer,
    #[error("server name '{0}' must not contain '__'")]
    ReservedSeparator(String),
    #[error("'{0}' is not a qualified tool name (expected server__tool)")]
    NotQualified(String),
}

/// Checks that a server name can be used as a qualified-name prefix.
pub fn validate_server_name(name: &str) -> Result<(), NameError> {
    if name.trim().is_empty() {
        return Err(NameError::EmptyServer);
    }
    if name.contains(QUALIFIED_SEPARATOR) {
        return Err(NameError::ReservedSeparator(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    server: String,
    tool: String,
}

impl QualifiedName {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    /// Splits `server__tool` at the first separator.
    pub fn parse(qualified: &str) -> Result<Self, NameError> {
        let (server, tool) = qualified
            .split_once(QUALIFIED_SEPARATOR)
            .ok_or_else(|| NameError::NotQualified(qualified.to_string()))?;
        if server.is_empty() || tool.is_empty() {
            return Err(NameError::NotQualified(qualified.to_string()));
        }
        Ok(Self::new(server, tool))
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.server, QUALIFIED_SEPARATOR, self.tool)
    }
}
