//! TOML configuration file loading
//!
//! Supports `~/.config/voxlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Credentials for the agent service
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Connection to the agent service
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Capture and playback devices
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Voice activity gate tuning
    #[serde(default)]
    pub gate: GateFileConfig,

    /// Per-conversation client data
    #[serde(default)]
    pub conversation: ConversationFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub elevenlabs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Websocket endpoint (`ws://` or `wss://`)
    pub endpoint: Option<String>,

    /// Conversational agent to talk to
    pub agent_id: Option<String>,

    pub max_reconnect_attempts: Option<u32>,

    /// Base reconnect delay; attempt k waits k times this
    pub reconnect_delay_ms: Option<u64>,

    pub connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub capture_sample_rate: Option<u32>,
    pub capture_channels: Option<u16>,
    pub wire_sample_rate: Option<u32>,

    /// Pause between the end of playback and resumed capture
    pub settle_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GateFileConfig {
    pub speech_confirm_ms: Option<u64>,
    pub silence_confirm_ms: Option<u64>,
    pub inactivity_ms: Option<u64>,
    pub energy_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    /// Substituted into the agent's prompt templates
    #[serde(default)]
    pub dynamic_variables: BTreeMap<String, String>,
}

/// Load the config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and any problem with it falls back to defaults with a warning.
///
/// # Errors
///
/// Returns error if an explicitly given file cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(ConfigFile::default());
    };

    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let config = match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    };

    Ok(config)
}

/// Return the config file path: `~/.config/voxlink/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxlink").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_partial_file() {
        let config: ConfigFile = toml::from_str(
            r#"
            [session]
            agent_id = "agent_123"
            max_reconnect_attempts = 2

            [gate]
            energy_threshold = 750.0

            [conversation.dynamic_variables]
            user_name = "Ada"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.agent_id.as_deref(), Some("agent_123"));
        assert_eq!(config.session.max_reconnect_attempts, Some(2));
        assert_eq!(config.session.endpoint, None);
        assert_eq!(config.gate.energy_threshold, Some(750.0));
        assert_eq!(config.conversation.dynamic_variables["user_name"], "Ada");
        assert!(config.api_keys.elevenlabs.is_none());
    }

    #[test]
    fn rejects_unknown_sections() {
        let parsed: std::result::Result<ConfigFile, _> = toml::from_str("[llm]\nmodel = \"x\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn explicit_path_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audio]\ninput_device = \"USB Mic\"").unwrap();

        let config = load_config_file(Some(file.path())).unwrap();
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load_config_file(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_path_must_parse() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[audio\nbroken").unwrap();
        assert!(matches!(
            load_config_file(Some(file.path())),
            Err(crate::Error::Toml(_))
        ));
    }
}
