//! Conversation protocol frames
//!
//! Every frame is a JSON text message. Inbound frames carry a `type` tag and a
//! payload object named after the event; outbound frames are tagged the same
//! way except user audio, which is a bare `user_audio_chunk` object.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Client data sent right after the socket opens
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationInit {
    /// Values substituted into the agent's prompt templates
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub dynamic_variables: BTreeMap<String, String>,

    /// Per-conversation agent overrides, passed through as-is
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_config_override: Option<Value>,
}

/// A frame the client sends
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    ConversationInit(ConversationInit),
    /// Wire-format PCM, base64-encoded on serialization
    AudioChunk(Vec<u8>),
    Text(String),
    ToolResult {
        tool_call_id: String,
        result: String,
        is_error: bool,
    },
    ContextualUpdate(String),
    /// Tells the agent the user is active (e.g. started speaking)
    UserActivity,
    /// Keep-alive acknowledgment echoing the ping's id
    Pong { event_id: u64 },
}

#[derive(Serialize)]
#[serde(untagged)]
enum OutboundFrame<'a> {
    Audio { user_audio_chunk: String },
    Tagged(TaggedFrame<'a>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedFrame<'a> {
    ConversationInitiationClientData {
        #[serde(flatten)]
        init: &'a ConversationInit,
    },
    UserMessage {
        text: &'a str,
    },
    ClientToolResult {
        tool_call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    ContextualUpdate {
        text: &'a str,
    },
    UserActivity,
    Pong {
        event_id: u64,
    },
}

impl OutboundMessage {
    /// Serialize to the JSON text sent on the socket
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String> {
        let frame = match self {
            Self::AudioChunk(pcm) => OutboundFrame::Audio {
                user_audio_chunk: BASE64.encode(pcm),
            },
            Self::ConversationInit(init) => {
                OutboundFrame::Tagged(TaggedFrame::ConversationInitiationClientData { init })
            }
            Self::Text(text) => OutboundFrame::Tagged(TaggedFrame::UserMessage { text }),
            Self::ToolResult {
                tool_call_id,
                result,
                is_error,
            } => OutboundFrame::Tagged(TaggedFrame::ClientToolResult {
                tool_call_id,
                result,
                is_error: *is_error,
            }),
            Self::ContextualUpdate(text) => {
                OutboundFrame::Tagged(TaggedFrame::ContextualUpdate { text })
            }
            Self::UserActivity => OutboundFrame::Tagged(TaggedFrame::UserActivity),
            Self::Pong { event_id } => OutboundFrame::Tagged(TaggedFrame::Pong {
                event_id: *event_id,
            }),
        };

        Ok(serde_json::to_string(&frame)?)
    }

    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConversationInit(_) => "conversation_init",
            Self::AudioChunk(_) => "audio_chunk",
            Self::Text(_) => "text",
            Self::ToolResult { .. } => "tool_result",
            Self::ContextualUpdate(_) => "contextual_update",
            Self::UserActivity => "user_activity",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Conversation details announced by the service once the socket opens
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InitMetadata {
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
    #[serde(default)]
    pub user_input_audio_format: Option<String>,
}

/// A tool the agent wants the client to run
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub tool_call_id: String,
    #[serde(default)]
    pub parameters: Value,
}

/// A frame the service sends
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    InitMetadata(InitMetadata),
    /// Decoded wire-format PCM plus its correlation id
    Audio { pcm: Vec<u8>, event_id: u64 },
    UserTranscript(String),
    AgentResponse(String),
    AgentResponseCorrection {
        original: Option<String>,
        corrected: String,
    },
    Ping { event_id: u64, ping_ms: Option<u64> },
    ToolCall(ToolCall),
    VadScore(f64),
    Interruption { event_id: u64 },
    TentativeResponse(String),
    /// A well-formed frame with a tag this client does not handle
    Unknown(String),
}

impl InboundMessage {
    /// Short name for logs
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::InitMetadata(_) => "conversation_initiation_metadata",
            Self::Audio { .. } => "audio",
            Self::UserTranscript(_) => "user_transcript",
            Self::AgentResponse(_) => "agent_response",
            Self::AgentResponseCorrection { .. } => "agent_response_correction",
            Self::Ping { .. } => "ping",
            Self::ToolCall(_) => "client_tool_call",
            Self::VadScore(_) => "vad_score",
            Self::Interruption { .. } => "interruption",
            Self::TentativeResponse(_) => "internal_tentative_agent_response",
            Self::Unknown(tag) => tag,
        }
    }
}

#[derive(Deserialize)]
struct AudioEvent {
    audio_base_64: String,
    event_id: u64,
}

#[derive(Deserialize)]
struct TranscriptEvent {
    user_transcript: String,
}

#[derive(Deserialize)]
struct AgentResponseEvent {
    agent_response: String,
}

#[derive(Deserialize)]
struct CorrectionEvent {
    #[serde(default)]
    original_agent_response: Option<String>,
    corrected_agent_response: String,
}

#[derive(Deserialize)]
struct PingEvent {
    event_id: u64,
    #[serde(default)]
    ping_ms: Option<u64>,
}

#[derive(Deserialize)]
struct VadScoreEvent {
    vad_score: f64,
}

#[derive(Deserialize)]
struct InterruptionEvent {
    event_id: u64,
}

#[derive(Deserialize)]
struct TentativeEvent {
    tentative_agent_response: String,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    ConversationInitiationMetadata {
        conversation_initiation_metadata_event: InitMetadata,
    },
    Audio {
        audio_event: AudioEvent,
    },
    UserTranscript {
        user_transcription_event: TranscriptEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    AgentResponseCorrection {
        agent_response_correction_event: CorrectionEvent,
    },
    Ping {
        ping_event: PingEvent,
    },
    ClientToolCall {
        client_tool_call: ToolCall,
    },
    VadScore {
        vad_score_event: VadScoreEvent,
    },
    Interruption {
        interruption_event: InterruptionEvent,
    },
    InternalTentativeAgentResponse {
        tentative_agent_response_internal_event: TentativeEvent,
    },
    #[serde(other)]
    Unknown,
}

/// Parse one inbound text frame
///
/// # Errors
///
/// Returns `Error::Protocol` if the frame is not JSON, has no `type` tag, or
/// has a known tag with a malformed payload
pub fn decode(text: &str) -> Result<InboundMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid json: {e}")))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("frame has no type tag".to_string()))?
        .to_string();

    let frame: InboundFrame = serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("malformed {tag} frame: {e}")))?;

    let message = match frame {
        InboundFrame::ConversationInitiationMetadata {
            conversation_initiation_metadata_event,
        } => InboundMessage::InitMetadata(conversation_initiation_metadata_event),
        InboundFrame::Audio { audio_event } => {
            let pcm = BASE64
                .decode(audio_event.audio_base_64.as_bytes())
                .map_err(|e| Error::Protocol(format!("bad audio payload: {e}")))?;
            InboundMessage::Audio {
                pcm,
                event_id: audio_event.event_id,
            }
        }
        InboundFrame::UserTranscript {
            user_transcription_event,
        } => InboundMessage::UserTranscript(user_transcription_event.user_transcript),
        InboundFrame::AgentResponse {
            agent_response_event,
        } => InboundMessage::AgentResponse(agent_response_event.agent_response),
        InboundFrame::AgentResponseCorrection {
            agent_response_correction_event: event,
        } => InboundMessage::AgentResponseCorrection {
            original: event.original_agent_response,
            corrected: event.corrected_agent_response,
        },
        InboundFrame::Ping { ping_event } => InboundMessage::Ping {
            event_id: ping_event.event_id,
            ping_ms: ping_event.ping_ms,
        },
        InboundFrame::ClientToolCall { client_tool_call } => {
            InboundMessage::ToolCall(client_tool_call)
        }
        InboundFrame::VadScore { vad_score_event } => {
            InboundMessage::VadScore(vad_score_event.vad_score)
        }
        InboundFrame::Interruption { interruption_event } => InboundMessage::Interruption {
            event_id: interruption_event.event_id,
        },
        InboundFrame::InternalTentativeAgentResponse {
            tentative_agent_response_internal_event,
        } => InboundMessage::TentativeResponse(
            tentative_agent_response_internal_event.tentative_agent_response,
        ),
        InboundFrame::Unknown => InboundMessage::Unknown(tag),
    };

    Ok(message)
}
