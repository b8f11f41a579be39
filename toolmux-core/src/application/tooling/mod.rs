mod error;
mod interface;
mod manager;
mod pending;
mod process;
mod state;

pub use error::{ClientError, ManagerError};
pub use interface::{NotificationHandler, ToolResponse, ToolServerInterface};
pub use manager::{ServerManager, ShutdownReport, StartReport};
pub use pending::{CallOutcome, PendingCalls, PendingSlot};
pub use process::{InitializeResult, ServerClient, ServerInfo};
pub use state::SessionState;
