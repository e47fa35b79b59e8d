use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for Flowkeeper
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowkeeperConfig {
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Local/remote state reconciliation
    pub reconciliation: ReconciliationConfig,
    /// Form validation
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level or filter directive, used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Run a background sync on a fixed interval
    pub periodic_sync: bool,
    /// Seconds between background syncs
    pub sync_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Treat whitespace-only fields as empty
    pub trim_whitespace: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            periodic_sync: false,
            sync_interval_seconds: 30,
        }
    }
}

impl ReconciliationConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds.max(1))
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { trim_whitespace: true }
    }
}

impl FlowkeeperConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (flowkeeper.toml)
    /// 3. Environment variables (prefixed with FLOWKEEPER_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("flowkeeper.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("FLOWKEEPER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<FlowkeeperConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = FlowkeeperConfig::load_env_file();
        FlowkeeperConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static FlowkeeperConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<&'static FlowkeeperConfig> {
    let config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(config)
}
