//! Negotiator configuration.

use crate::rendezvous::{announcement_path, signal_path};
use crate::transport::SessionConfig;
use crate::{ParticipantId, SharedKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Placeholder in `greeting` replaced by the local participant id.
pub const GREETING_ID_PLACEHOLDER: &str = "{id}";

/// Configuration shared by every negotiation a participant runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatorConfig {
    /// Reflection/relay helpers handed to each transport session
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    /// Label of the data channel opened on each session
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: String,

    /// Root under which each participant's signal path lives
    #[serde(default = "default_signal_root")]
    pub signal_root: String,

    /// Optional prefix for the announcement path (defaults to the bare key)
    #[serde(default)]
    pub announce_root: Option<String>,

    /// Sent on the data channel when it opens; `{id}` expands to our id
    #[serde(default = "default_greeting")]
    pub greeting: Option<String>,
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:23.21.150.121".to_string(),
        "stun:stun.l.google.com:19302".to_string(),
    ]
}

fn default_data_channel_label() -> String {
    "myDataChannel".to_string()
}

fn default_signal_root() -> String {
    "messages".to_string()
}

fn default_greeting() -> Option<String> {
    Some(format!("Hello! I am {GREETING_ID_PLACEHOLDER}"))
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            data_channel_label: default_data_channel_label(),
            signal_root: default_signal_root(),
            announce_root: None,
            greeting: default_greeting(),
        }
    }
}

impl NegotiatorConfig {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    pub fn announcement_path(&self, key: &SharedKey) -> String {
        announcement_path(self.announce_root.as_deref(), key)
    }

    pub fn signal_path(&self, id: &ParticipantId) -> String {
        signal_path(&self.signal_root, id)
    }

    /// Greeting to send once the channel opens, if any.
    pub fn greeting_for(&self, id: &ParticipantId) -> Option<String> {
        self.greeting
            .as_ref()
            .map(|g| g.replace(GREETING_ID_PLACEHOLDER, id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NegotiatorConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.data_channel_label, "myDataChannel");
        assert_eq!(config.signal_root, "messages");
    }

    #[test]
    fn test_greeting_expands_id() {
        let config = NegotiatorConfig::default();
        let id: ParticipantId = "A".parse().unwrap();
        assert_eq!(config.greeting_for(&id).as_deref(), Some("Hello! I am A"));

        let quiet = NegotiatorConfig {
            greeting: None,
            ..Default::default()
        };
        assert_eq!(quiet.greeting_for(&id), None);
    }

    #[test]
    fn test_paths() {
        let config = NegotiatorConfig {
            announce_root: Some("rooms".into()),
            ..Default::default()
        };
        let key = SharedKey::new("K").unwrap();
        let id: ParticipantId = "A".parse().unwrap();
        assert_eq!(config.announcement_path(&key), "rooms/K");
        assert_eq!(config.signal_path(&id), "messages/A");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NegotiatorConfig =
            serde_json::from_str(r#"{ "dataChannelLabel": "chat", "greeting": null }"#).unwrap();
        assert_eq!(config.data_channel_label, "chat");
        assert_eq!(config.greeting, None);
        assert_eq!(config.signal_root, "messages");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NegotiatorConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, NegotiatorConfig::default());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{ "iceServers": ["stun:example.org:3478"] }}"#).unwrap();

        let config = NegotiatorConfig::load(&path).unwrap();
        assert_eq!(config.ice_servers, vec!["stun:example.org:3478".to_string()]);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            NegotiatorConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
