//! Runtime configuration for the relay, the client and the LLM service.
//!
//! All structs deserialize from JSON with every field optional; missing
//! fields take the defaults below. The binary reads `--config <path>` or,
//! failing that, `<config dir>/hecrypt-relay/config.json` when it exists.
//!
//! ```json
//! {
//!   "relay":   { "listen_addr": "127.0.0.1:9999", "max_connections": 64 },
//!   "client":  { "relay_addr": "127.0.0.1:9999" },
//!   "service": { "model": "gpt-4", "max_retries": 2 }
//! }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::SchemeParams;
use crate::error::RelayError;
use crate::relay::DEFAULT_MAX_FRAME_LEN;

/// Environment variable holding the LLM provider credential.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_ADDR: &str = "127.0.0.1:9999";

const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert LLM prompt engineer with deep knowledge of \
passing encrypted prompt messages to the LLM, and the receiver will decrypt the response.";

const DEFAULT_USER_PREAMBLE: &str =
    "You are an AI model with expertise in handling user queries accurately and securely.";

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9999))
}

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheme: SchemeParams,
    pub relay: RelayConfig,
    pub client: ClientConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// Seconds to wait for the next frame on an idle connection.
    pub read_timeout_secs: u64,
    pub max_frame_len: u64,
    /// Concurrent sessions; further connections wait in the accept backlog.
    pub max_connections: usize,
    /// On shutdown, wait for in-flight sessions instead of aborting them.
    pub drain_on_shutdown: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_addr(),
            read_timeout_secs: 300,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_connections: 64,
            drain_on_shutdown: false,
        }
    }
}

impl RelayConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub relay_addr: SocketAddr,
    /// Seconds allowed for a whole exchange (all frames of one prompt).
    pub response_timeout_secs: u64,
    pub connect_attempts: u32,
    pub max_frame_len: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_addr: default_addr(),
            response_timeout_secs: 600,
            connect_attempts: 3,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ClientConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// LLM provider endpoint and fixed generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: String,
    /// Prepended to every chunk, separated by a blank line.
    pub user_preamble: String,
    pub request_timeout_secs: u64,
    /// Extra attempts after a failed call. Zero disables retry.
    pub max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            max_tokens: 2000,
            temperature: 0.3,
            top_p: 0.95,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_preamble: DEFAULT_USER_PREAMBLE.to_string(),
            request_timeout_secs: 120,
            max_retries: 0,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Full URL of the chat completions endpoint.
    pub fn endpoint(&self) -> Result<Url, RelayError> {
        let base = self.api_base.trim_end_matches('/');
        let url = Url::parse(&format!("{base}/chat/completions"))
            .map_err(|e| RelayError::Config(format!("invalid api_base {:?}: {e}", self.api_base)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(RelayError::Config(format!(
                "api_base must be http or https, got {other}"
            ))),
        }
    }
}

impl Config {
    /// Default location: `<config dir>/hecrypt-relay/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hecrypt-relay").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load `explicit` if given, else the default path if it exists, else
    /// defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, RelayError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Read the provider credential from the environment.
pub fn api_key_from_env() -> Result<String, RelayError> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(RelayError::Config(format!(
            "{API_KEY_ENV} is not set; the relay needs an LLM provider credential"
        ))),
    }
}
