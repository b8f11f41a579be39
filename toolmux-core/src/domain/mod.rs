pub mod naming;
pub mod types;

pub use naming::{NameError, QualifiedName, validate_server_name};
pub use types::{QualifiedTool, ToolDescriptor};
