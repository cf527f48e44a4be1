//! Configuration module for the HL7 engine
//!
//! This module handles:
//! - Engine settings (sandbox limits, debug mode, log directory)
//! - Channel definition documents, either inline in the engine file or in
//!   separate files
//!
//! Documents are TOML or JSON, chosen by file extension.
//!
//! # Config Location
//!
//! Without an explicit path the engine reads `engine.toml` from the
//! platform config directory:
//! - **Linux**: `~/.config/hl7-engine/`
//! - **macOS**: `~/Library/Application Support/hl7-engine/`
//! - **Windows**: `%APPDATA%\hl7-engine\`
//!
//! # Example
//!
//! ```toml
//! debug_mode = false
//! log_dir = "logs"
//! channel_files = ["channels/adt.toml"]
//!
//! [sandbox]
//! max_operations = 1000000
//! timeout_ms = 5000
//! ```

use crate::error::{EngineError, Result};
use crate::scripting::SandboxLimits;
use crate::types::Channel;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "hl7-engine";

/// Engine settings filename
pub const CONFIG_FILE: &str = "engine.toml";

/// Get the engine config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path of the default engine settings file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

/// Serialization format of a document on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Json,
}

impl DocumentFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "toml" => Ok(Self::Toml),
            Some(ext) if ext == "json" => Ok(Self::Json),
            _ => Err(EngineError::Config(format!(
                "Unsupported document format for {:?} (expected .toml or .json)",
                path
            ))),
        }
    }

    pub fn parse<T: DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            Self::Toml => toml::from_str(content).map_err(|e| EngineError::Serialization(e.to_string())),
            Self::Json => serde_json::from_str(content).map_err(|e| EngineError::Serialization(e.to_string())),
        }
    }

    pub fn render<T: Serialize>(self, value: &T) -> Result<String> {
        match self {
            Self::Toml => toml::to_string_pretty(value).map_err(|e| EngineError::Serialization(e.to_string())),
            Self::Json => serde_json::to_string_pretty(value).map_err(|e| EngineError::Serialization(e.to_string())),
        }
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = DocumentFormat::from_path(path)?;
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Config(format!("Failed to read {:?}: {}", path, e)))?;
    format
        .parse(&content)
        .map_err(|e| EngineError::Config(format!("Failed to parse {:?}: {}", path, e)))
}

fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = DocumentFormat::from_path(path)?.render(value)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Config(format!("Failed to create {:?}: {}", parent, e)))?;
    }
    std::fs::write(path, content).map_err(|e| EngineError::Config(format!("Failed to write {:?}: {}", path, e)))
}

// ==================== Channel Documents ====================

/// A channel file holds one channel or a `channels` list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelDocument {
    Many { channels: Vec<Channel> },
    One(Box<Channel>),
}

/// Load every channel defined in a channel document
pub fn load_channel_file(path: impl AsRef<Path>) -> Result<Vec<Channel>> {
    let path = path.as_ref();
    let channels = match read_document::<ChannelDocument>(path)? {
        ChannelDocument::Many { channels } => channels,
        ChannelDocument::One(channel) => vec![*channel],
    };
    tracing::debug!(path = ?path, count = channels.len(), "Loaded channel document");
    Ok(channels)
}

/// Save a single channel definition
pub fn save_channel_file(path: impl AsRef<Path>, channel: &Channel) -> Result<()> {
    write_document(path.as_ref(), channel)
}

// ==================== Engine Config ====================

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution limits applied to every script
    pub sandbox: SandboxLimits,

    /// Log received frames and replies
    pub debug_mode: bool,

    /// Directory for daily rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,

    /// Channel documents, relative paths resolve against the config file
    pub channel_files: Vec<PathBuf>,

    /// Channels defined inline
    pub channels: Vec<Channel>,
}

impl EngineConfig {
    /// Load engine settings from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Self = read_document(path)?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        tracing::info!(path = ?path, "Loaded engine config");
        Ok(config)
    }

    /// Load from `path`, or from the default location, or fall back to defaults
    ///
    /// An explicit path must exist; a missing default file is not an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => {
                tracing::info!("No engine config found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Save engine settings; format follows the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_document(path.as_ref(), self)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for file in &mut self.channel_files {
            if file.is_relative() {
                *file = base.join(&*file);
            }
        }
        if let Some(dir) = &mut self.log_dir {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
    }

    /// Inline channels followed by those from every channel file
    ///
    /// Channel ids must be unique across all sources.
    pub fn load_channels(&self) -> Result<Vec<Channel>> {
        let mut channels = self.channels.clone();
        for file in &self.channel_files {
            channels.extend(load_channel_file(file)?);
        }

        let mut seen = HashSet::new();
        for channel in &channels {
            if channel.id().is_empty() {
                return Err(EngineError::Config(format!("Channel {:?} has an empty id", channel.name)));
            }
            if !seen.insert(channel.id()) {
                return Err(EngineError::Config(format!("Duplicate channel id {}", channel.id())));
            }
        }
        Ok(channels)
    }
}
