use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::naming::QualifiedName;

/// One tool as advertised by a server's `tools/list` answer.
///
/// `input_schema` is kept as an opaque JSON document; arguments are validated
/// by the subprocess, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub server: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn qualified_name(&self) -> QualifiedName {
        QualifiedName::new(&self.server, &self.name)
    }
}

/// A tool entry in the manager's aggregated catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualifiedTool {
    pub qualified_name: String,
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
}

impl From<ToolDescriptor> for QualifiedTool {
    fn from(descriptor: ToolDescriptor) -> Self {
        Self {
            qualified_name: descriptor.qualified_name().to_string(),
            descriptor,
        }
    }
}
