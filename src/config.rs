use crate::errors::{BindError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Engine configuration, loaded from a `gibind.toml` file or built in code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub marshal: MarshalConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub closures: ClosureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub spans: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarshalConfig {
    /// Upper bound of temporaries one call frame may hold
    #[serde(default = "default_max_temporaries")]
    pub max_temporaries: usize,

    /// Accept integral floats (e.g. `3.0`) where an integer is expected
    #[serde(default = "default_false")]
    pub allow_float_to_int: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Dead identity-cache entries are swept after this many insertions (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureConfig {
    /// Reclaim trampolines of spent closures whenever the engine is entered
    #[serde(default = "default_true")]
    pub reclaim_on_entry: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            max_temporaries: default_max_temporaries(),
            allow_float_to_int: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for ClosureConfig {
    fn default() -> Self {
        Self {
            reclaim_on_entry: true,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_level() -> String { "info".to_string() }
fn default_max_temporaries() -> usize { 256 }
fn default_sweep_interval() -> usize { 1024 }

impl BindConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| BindError::config(format!("failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BindError::config(format!("failed to parse: {}", e)))
    }

    /// Look for `gibind.toml` in the current directory and its parents
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let config_path = dir.join("gibind.toml");
            if config_path.exists() {
                if let Ok(config) = Self::load(&config_path) {
                    return config;
                }
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BindError::config(format!("failed to serialize: {}", e)))?;

        fs::write(path, content)
            .map_err(|e| BindError::config(format!("failed to write {}: {}", path.display(), e)))
    }
}
