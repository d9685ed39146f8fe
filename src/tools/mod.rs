//! Client-side tools the agent can call during a conversation

mod system;

use serde_json::Value;

pub use system::{AudioActivity, SystemTools};

/// Result relayed back to the agent as a tool-result message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub result: String,
    pub is_error: bool,
}

impl ToolOutcome {
    #[must_use]
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: message.into(),
            is_error: true,
        }
    }
}

/// Executes named tool calls on behalf of the agent
///
/// Failures are reported through [`ToolOutcome::is_error`] rather than a
/// `Result`; the agent always gets an answer.
pub trait ToolBridge: Send + Sync {
    fn call(&self, name: &str, arguments: &Value) -> ToolOutcome;
}
