//! Conversation session with the remote agent service
//!
//! [`SessionEngine`] owns the socket; everything above it talks to the service
//! through [`SessionEngine::send`] and the [`EventHandlers`] table.

mod engine;
mod handlers;
pub mod messages;
mod state;

pub use engine::SessionEngine;
pub use handlers::EventHandlers;
pub use messages::{ConversationInit, InboundMessage, InitMetadata, OutboundMessage, ToolCall};
pub use state::{ConnectionState, ReconnectDecision, ReconnectPolicy, Session};
