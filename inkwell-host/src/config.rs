//! Host configuration loading and management.
//!
//! Configuration lives at `$XDG_CONFIG_HOME/inkwell/config.toml`. If the
//! file doesn't exist, a default configuration is created with documented
//! comments.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Host-wide settings.
    #[serde(default)]
    pub host: HostConfig,

    /// Extension runtime settings.
    #[serde(default)]
    pub extensions: ExtensionsConfig,
}

/// Host-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostConfig {
    /// Log level (trace, debug, info, warn, error).
    /// Default: "info"
    pub log_level: String,

    /// Workspace directory extensions may read and write through the
    /// filesystem capabilities. If None, uses the current directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,

    /// Whether extensions holding `network.http` may reach the network.
    /// Default: false
    pub allow_network: bool,
}

/// Extension runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtensionsConfig {
    /// Directory scanned for `.qpk` packages and extension directories.
    /// If None, uses XDG_DATA_HOME/inkwell/extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Staging directory for extracted packages.
    /// If None, uses a temp directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// Refuse to install unsigned packages.
    /// Default: false
    pub require_signatures: bool,

    /// Trusted signing keys: key id to base64-encoded Ed25519 key.
    #[serde(default)]
    pub trusted_keys: HashMap<String, String>,

    /// Per-call instruction budget.
    /// Default: 1000000
    pub instruction_budget: u64,

    /// Per-call wall-clock timeout in milliseconds.
    /// Default: 5000
    pub call_timeout_ms: u64,

    /// In-window fault count at which an extension is auto-disabled;
    /// the `max_faults`-th fault trips the breaker. Default: 5
    pub max_faults: usize,

    /// Fault window length in seconds.
    /// Default: 60
    pub fault_window_secs: u64,

    /// Ceiling on unpacked package size, in MiB.
    /// Default: 64
    pub max_unpacked_mib: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workspace_dir: None,
            allow_network: false,
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            staging_dir: None,
            require_signatures: false,
            trusted_keys: HashMap::new(),
            instruction_budget: 1_000_000,
            call_timeout_ms: 5_000,
            max_faults: 5,
            fault_window_secs: 60,
            max_unpacked_mib: 64,
        }
    }
}

impl Config {
    /// Load configuration from the specified path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location, creating
    /// a documented default file if none exists.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/inkwell/config.toml`.
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "inkwell-app", "inkwell")
            .context("Failed to determine project directories")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Extensions directory, falling back to the XDG data dir.
    pub fn extensions_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.extensions.directory {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("", "inkwell-app", "inkwell")
            .context("Failed to determine project directories")?;
        Ok(dirs.data_dir().join("extensions"))
    }

    /// Staging directory, falling back to the system temp dir.
    pub fn staging_dir(&self) -> PathBuf {
        self.extensions
            .staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("inkwell-staging"))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.extensions.call_timeout_ms)
    }

    pub fn fault_window(&self) -> Duration {
        Duration::from_secs(self.extensions.fault_window_secs)
    }

    pub fn max_unpacked_bytes(&self) -> u64 {
        self.extensions.max_unpacked_mib * 1024 * 1024
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Default configuration file content with comments.
    fn default_config_content() -> String {
        r#"# Inkwell Host Configuration

[host]
# Log level: trace, debug, info, warn, error
log_level = "info"

# Workspace directory extensions may access through the filesystem
# capabilities. Defaults to the current directory.
# workspace_dir = "/path/to/workspace"

# Allow extensions holding network.http to make outbound requests
allow_network = false

[extensions]
# Directory scanned for .qpk packages and extension directories.
# Defaults to $XDG_DATA_HOME/inkwell/extensions
# directory = "/path/to/extensions"

# Refuse to install unsigned packages
require_signatures = false

# Trusted signing keys (key id = base64 Ed25519 public key)
# [extensions.trusted_keys]
# "inkwell-release" = "..."

# Per-call instruction budget
instruction_budget = 1000000

# Per-call wall-clock timeout in milliseconds
call_timeout_ms = 5000

# In-window fault count that auto-disables an extension
max_faults = 5

# Fault window length in seconds
fault_window_secs = 60

# Ceiling on unpacked package size, in MiB
max_unpacked_mib = 64
"#
        .to_string()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', expected one of {:?}",
                self.host.log_level,
                valid_levels
            );
        }
        if self.extensions.call_timeout_ms == 0 {
            anyhow::bail!("call_timeout_ms must be greater than zero");
        }
        if self.extensions.instruction_budget == 0 {
            anyhow::bail!("instruction_budget must be greater than zero");
        }
        if self.extensions.max_faults == 0 {
            anyhow::bail!("max_faults must be greater than zero");
        }
        if self.extensions.max_unpacked_mib == 0 {
            anyhow::bail!("max_unpacked_mib must be greater than zero");
        }
        Ok(())
    }
}
