//! Runtime configuration for colossus.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Fields missing from the file take their defaults.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::EngineConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "colossus", version, about = "Local model-serving runtime")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "colossus.json")]
    pub config: PathBuf,

    /// Models directory (overrides the config file).
    #[arg(long, global = true)]
    pub models: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server.
    Serve {
        /// HTTP listen address.
        #[arg(long)]
        listen: Option<String>,
    },

    /// List local models.
    List,

    /// Decode a model file and print its descriptor.
    Show { path: PathBuf },

    /// Generate a completion and stream it to stdout.
    Run {
        model: String,
        prompt: String,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Chat with a model interactively. `/bye` exits, `/clear` forgets
    /// the conversation so far.
    Chat {
        model: String,

        /// System message sent ahead of the conversation.
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Show detected accelerators.
    Gpu {
        /// Output JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model storage.
    pub models: ModelsConfig,

    /// Engine selection and load overrides.
    pub engine: EngineConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:11434").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory scanned for model files.
    pub models_path: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            models_path: default_models_path(),
        }
    }
}

/// `~/.colossus/models`, or `./models` without a home directory.
pub fn default_models_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".colossus").join("models"),
        None => PathBuf::from("models"),
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
