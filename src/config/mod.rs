//! Configuration for voxlink

pub mod file;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::session::ReconnectPolicy;
use crate::voice::GateConfig;
use crate::{Error, Result};

pub use file::{ConfigFile, config_file_path, load_config_file};

/// Default conversational agent endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://api.elevenlabs.io/v1/convai/conversation";

/// Sample rate the agent service expects on the wire
pub const DEFAULT_WIRE_RATE: u32 = 16_000;

/// Settings for one run, resolved once at startup
#[derive(Debug)]
pub struct Config {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub gate: GateConfig,

    /// Values substituted into the agent's prompt templates
    pub dynamic_variables: BTreeMap<String, String>,
}

/// Connection to the agent service
#[derive(Debug)]
pub struct SessionConfig {
    /// Websocket endpoint; `agent_id` is appended as a query parameter
    pub endpoint: String,
    pub agent_id: String,
    /// Presented as the `xi-api-key` handshake header
    pub api_key: SecretString,
    pub reconnect: ReconnectPolicy,
    /// A handshake slower than this counts as a failed attempt
    pub connect_timeout: Duration,
}

/// Capture and playback devices
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Input device name (default device when unset)
    pub input_device: Option<String>,
    /// Output device name (default device when unset)
    pub output_device: Option<String>,
    pub capture_sample_rate: u32,
    /// Preferred capture channel count; other counts are accepted if the device insists
    pub capture_channels: u16,
    pub wire_sample_rate: u32,
    /// Pause after playback drains before capture resumes
    pub settle_delay: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            capture_sample_rate: 48_000,
            capture_channels: 1,
            wire_sample_rate: DEFAULT_WIRE_RATE,
            settle_delay: Duration::from_millis(300),
        }
    }
}

impl Config {
    /// Load from the config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if the file is unusable, a value does not parse, or the
    /// credential or agent id is missing
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = load_config_file(path)?;
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Overlay `env` on top of `file` on top of defaults (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a value does not parse, a value is out of range, or
    /// the credential or agent id is missing
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let api_key = lookup("ELEVENLABS_API_KEY")
            .or(file.api_keys.elevenlabs)
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::Config("ELEVENLABS_API_KEY is not set".to_string()))?;
        let agent_id = lookup("ELEVENLABS_AGENT_ID")
            .or(file.session.agent_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::Config("ELEVENLABS_AGENT_ID is not set".to_string()))?;

        let endpoint = lookup("VOXLINK_ENDPOINT")
            .or(file.session.endpoint)
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "endpoint must be a ws:// or wss:// url: {endpoint}"
            )));
        }

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            max_attempts: parsed(&lookup, "VOXLINK_MAX_RECONNECT_ATTEMPTS")?
                .or(file.session.max_reconnect_attempts)
                .unwrap_or(defaults.max_attempts),
            base_delay: millis(&lookup, "VOXLINK_RECONNECT_DELAY_MS")?
                .or(file.session.reconnect_delay_ms.map(Duration::from_millis))
                .unwrap_or(defaults.base_delay),
        };

        let session = SessionConfig {
            endpoint,
            agent_id,
            api_key: SecretString::from(api_key),
            reconnect,
            connect_timeout: file
                .session
                .connect_timeout_ms
                .map_or(Duration::from_secs(10), Duration::from_millis),
        };

        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            input_device: lookup("VOXLINK_INPUT_DEVICE").or(file.audio.input_device),
            output_device: lookup("VOXLINK_OUTPUT_DEVICE").or(file.audio.output_device),
            capture_sample_rate: parsed(&lookup, "VOXLINK_CAPTURE_RATE")?
                .or(file.audio.capture_sample_rate)
                .unwrap_or(audio_defaults.capture_sample_rate),
            capture_channels: parsed(&lookup, "VOXLINK_CAPTURE_CHANNELS")?
                .or(file.audio.capture_channels)
                .unwrap_or(audio_defaults.capture_channels),
            wire_sample_rate: parsed(&lookup, "VOXLINK_WIRE_RATE")?
                .or(file.audio.wire_sample_rate)
                .unwrap_or(audio_defaults.wire_sample_rate),
            settle_delay: millis(&lookup, "VOXLINK_SETTLE_MS")?
                .or(file.audio.settle_ms.map(Duration::from_millis))
                .unwrap_or(audio_defaults.settle_delay),
        };

        if audio.capture_sample_rate == 0 || audio.wire_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if audio.capture_channels == 0 {
            return Err(Error::Config("capture channel count must be non-zero".to_string()));
        }

        let gate_defaults = GateConfig::default();
        let gate = GateConfig {
            speech_confirm: millis(&lookup, "VOXLINK_SPEECH_CONFIRM_MS")?
                .or(file.gate.speech_confirm_ms.map(Duration::from_millis))
                .unwrap_or(gate_defaults.speech_confirm),
            silence_confirm: millis(&lookup, "VOXLINK_SILENCE_CONFIRM_MS")?
                .or(file.gate.silence_confirm_ms.map(Duration::from_millis))
                .unwrap_or(gate_defaults.silence_confirm),
            inactivity: millis(&lookup, "VOXLINK_INACTIVITY_MS")?
                .or(file.gate.inactivity_ms.map(Duration::from_millis))
                .unwrap_or(gate_defaults.inactivity),
            energy_threshold: parsed(&lookup, "VOXLINK_ENERGY_THRESHOLD")?
                .or(file.gate.energy_threshold)
                .unwrap_or(gate_defaults.energy_threshold),
        };

        if !gate.energy_threshold.is_finite() || gate.energy_threshold < 0.0 {
            return Err(Error::Config(format!(
                "energy threshold must be a non-negative number, got {}",
                gate.energy_threshold
            )));
        }

        Ok(Self {
            session,
            audio,
            gate,
            dynamic_variables: file.conversation.dynamic_variables,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}: invalid value {raw:?}: {e}")))
        })
        .transpose()
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parsed::<u64>(lookup, key)?.map(Duration::from_millis))
}
