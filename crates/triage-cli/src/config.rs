//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Configuration for triage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL
    pub url: Option<String>,
    /// How long to wait on a sequence gap before force-applying, in ms
    pub gap_timeout_ms: Option<u64>,
    /// Maximum number of out-of-order events held back
    pub max_buffered: Option<usize>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("triage")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        // Check for TRIAGE_CONFIG_PATH env var first
        if let Ok(path) = std::env::var("TRIAGE_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            url: Some("http://localhost:8000".to_string()),
            gap_timeout_ms: Some(3000),
            max_buffered: Some(256),
        };

        default_config.save()?;
        Ok(path)
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# triage configuration file
# Place at ~/.config/triage/config.toml (Linux/Mac) or %APPDATA%\triage\config.toml (Windows)

# Backend base URL
url = "http://localhost:8000"

# How long to wait on a sequence gap before force-applying buffered events, in ms
gap_timeout_ms = 3000

# Maximum number of out-of-order events held back
max_buffered = 256
"#
}
