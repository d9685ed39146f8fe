//! Voxlink - live voice conversations with a remote conversational agent
//!
//! This library provides the real-time session core:
//! - Sample conversion from the capture device to the wire format
//! - Energy-based voice activity gating
//! - A capture/playback pipeline that never records its own output
//! - The websocket session engine (handshake, dispatch, keep-alive, reconnect)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Local audio devices                    │
//! │        Microphone (cpal)  │  Speaker (cpal)          │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Daemon                          │
//! │  Pipeline  │  Converter  │  Voice Gate  │  Tools     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Session Engine                       │
//! │  Handshake  │  Dispatch  │  Keep-alive  │  Reconnect │
//! └────────────────────┬────────────────────────────────┘
//!                      │ websocket
//! ┌────────────────────▼────────────────────────────────┐
//! │           Conversational agent service               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod session;
pub mod tools;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, DaemonEvent, Orchestrator, SessionLink};
pub use error::{Error, Result};
pub use session::{ConnectionState, EventHandlers, InboundMessage, OutboundMessage, SessionEngine};
pub use tools::{SystemTools, ToolBridge, ToolOutcome};
