//! Configuration loading
//!
//! Supports `~/.config/aria/config.toml` as a persistent config source.
//! All fields are optional — the file is a partial overlay on top of
//! defaults, and environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{Error, Result};

/// Default Gemini Live duplex endpoint
const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live-audio model
const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice for synthesized replies
const DEFAULT_VOICE: &str = "Zephyr";

/// Default system instruction for the voice agent
const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful AI assistant. Respond concisely and professionally.";

/// Default session-open timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    /// API key for the remote model (env `GEMINI_API_KEY` overrides)
    api_key: Option<String>,

    /// Duplex WebSocket endpoint
    endpoint: Option<String>,

    /// Model identifier
    model: Option<String>,

    /// Prebuilt voice name (e.g. "Zephyr")
    voice: Option<String>,

    /// Free-text system instruction for the agent
    system_instruction: Option<String>,

    /// Session-open timeout in seconds
    connect_timeout_secs: Option<u64>,
}

/// Resolved gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the remote model
    api_key: Option<SecretString>,

    /// Duplex WebSocket endpoint
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Free-text system instruction passed at session open
    pub system_instruction: String,

    /// Session-open timeout; no timeout applies once the session is active
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Load configuration from the default path plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if an existing config file cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = default_config_path();
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an explicit path plus environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str::<ConfigFile>(&raw)?
            }
            _ => ConfigFile::default(),
        };

        let mut config = Self {
            api_key: file.api_key.map(SecretString::from),
            ..Self::default()
        };

        if let Some(endpoint) = file.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(model) = file.model {
            config.model = model;
        }
        if let Some(voice) = file.voice {
            config.voice = voice;
        }
        if let Some(instruction) = file.system_instruction {
            config.system_instruction = instruction;
        }
        if let Some(secs) = file.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs.max(1));
        }

        // Environment overrides the file
        if let Ok(key) = std::env::var("GEMINI_API_KEY")
            && !key.is_empty()
        {
            config.api_key = Some(SecretString::from(key));
        }
        if let Ok(endpoint) = std::env::var("ARIA_ENDPOINT")
            && !endpoint.is_empty()
        {
            config.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("ARIA_MODEL")
            && !model.is_empty()
        {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("ARIA_VOICE")
            && !voice.is_empty()
        {
            config.voice = voice;
        }

        Ok(config)
    }

    /// The API key, if one was configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no key is present.
    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .ok_or_else(|| {
                Error::Config("no API key configured (set GEMINI_API_KEY)".to_string())
            })
    }

    /// Replace the API key (used by tests and programmatic callers).
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        self.api_key = Some(SecretString::from(key.into()));
    }
}

/// Default config file location (`~/.config/aria/config.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|dirs| dirs.config_dir().join("aria").join("config.toml"))
}
