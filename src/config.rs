//! Relay configuration.
//!
//! Loaded from a JSON file; a missing or malformed file falls back to
//! defaults so the relay can always come up.

use std::fs;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::chat::prompt::{builtin_profile, TemplateProfile, DEFAULT_SYSTEM_PROMPT};

/// Relay settings. Defaults: port 8080, 4096-byte single-read requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address for the listener.
    pub host: String,
    pub port: u16,
    /// Capacity of the single request read. Bytes beyond one read are never
    /// collected.
    pub read_buffer_size: usize,
    /// Socket read timeout in seconds. 0 disables.
    pub read_timeout_secs: u64,
    /// Socket write timeout in seconds. 0 disables.
    pub write_timeout_secs: u64,
    /// Deadline for one engine query in seconds. 0 disables.
    pub query_timeout_secs: u64,
    /// Optional speaker tag prefixed to every templated prompt as "name: ".
    pub bot_name: Option<String>,
    /// Built-in template profile id (llama3, llama2, chatml, generic).
    pub template_profile: String,
    /// Behavioral text substituted into the profile's system preamble.
    pub system_prompt: Option<String>,
    /// Inline custom profile; takes precedence over `template_profile`.
    pub template: Option<TemplateProfile>,
    pub engine: EngineConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_buffer_size: 4096,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            query_timeout_secs: 120,
            bot_name: None,
            template_profile: "llama3".to_string(),
            system_prompt: None,
            template: None,
            engine: EngineConfig::default(),
        }
    }
}

/// How to reach the external engine process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine executable. When absent the relay falls back to the built-in
    /// mock engine.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Opaque configuration blob passed through verbatim to the engine.
    pub config: serde_json::Value,
}

impl RelayConfig {
    /// Resolve the active template profile: an inline custom profile wins,
    /// otherwise the named built-in with the configured system prompt
    /// substituted in. `None` means `template_profile` names no built-in.
    pub fn resolve_template(&self) -> Option<TemplateProfile> {
        if let Some(template) = &self.template {
            return Some(template.clone());
        }
        let system = self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        builtin_profile(&self.template_profile, system)
    }
}

/// Load configuration from `path`, falling back to defaults when the file is
/// missing or malformed.
pub fn load_config(path: &str) -> RelayConfig {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<RelayConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse config file {path}: {e}, using defaults");
                RelayConfig::default()
            }
        },
        Err(_) => RelayConfig::default(),
    }
}
