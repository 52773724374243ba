//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "module"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Shared configuration and logging bootstrap."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_client_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_workers_count() -> usize {
    3
}

fn default_rate_limit_period_secs() -> u64 {
    1
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

/// Primary configuration object for the MCE daemon.
///
/// Keys on the wire are camelCase to stay compatible with the deployment
/// manifests the collector is provisioned with.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Fallback HTTP timeout applied to any stage without its own.
    #[serde(default = "default_client_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub default_client_timeout: Duration,
    /// Fallback worker pool size applied to any stage without its own.
    #[serde(default = "default_workers_count")]
    pub default_workers_count: usize,
    #[serde(default)]
    pub source_api: SourceApiConfig,
    #[serde(default)]
    pub processing_api: ProcessingApiConfig,
    #[serde(default)]
    pub storage_api: StorageApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MCE_CONFIG";

    /// Load configuration from disk, respecting the `MCE_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Effective HTTP timeout for the source stage.
    pub fn source_timeout(&self) -> Duration {
        self.source_api.timeout.unwrap_or(self.default_client_timeout)
    }

    /// Effective HTTP timeout for the processing stage.
    pub fn processing_timeout(&self) -> Duration {
        self.processing_api
            .timeout
            .unwrap_or(self.default_client_timeout)
    }

    /// Effective HTTP timeout for the storage stage.
    pub fn storage_timeout(&self) -> Duration {
        self.storage_api.timeout.unwrap_or(self.default_client_timeout)
    }

    /// Effective processing worker pool size.
    pub fn processing_workers(&self) -> usize {
        self.processing_api
            .workers_count
            .unwrap_or(self.default_workers_count)
    }

    /// Effective storage worker pool size.
    pub fn storage_workers(&self) -> usize {
        self.storage_api
            .workers_count
            .unwrap_or(self.default_workers_count)
    }

    /// Length of the fixed rate-limit window. An explicit or defaulted zero
    /// collapses to one second.
    pub fn rate_limit_period(&self) -> Duration {
        Duration::from_secs(self.source_api.rate_limit_period_secs.max(1))
    }

    /// Validate structural invariants. Failures here are the only fatal
    /// error class in the system and abort startup.
    pub fn validate(&self) -> Result<()> {
        if self.default_client_timeout.is_zero() {
            return Err(anyhow!("defaultClientTimeout must be positive"));
        }
        if self.default_workers_count == 0 {
            return Err(anyhow!("defaultWorkersCount must be positive"));
        }
        if self.source_api.base_url.trim().is_empty() {
            return Err(anyhow!("sourceApi.baseUrl must be set"));
        }
        if self.source_api.auth_token.trim().is_empty() {
            return Err(anyhow!("sourceApi.authToken must be set"));
        }
        if self.processing_api.base_url.trim().is_empty() {
            return Err(anyhow!("processingApi.baseUrl must be set"));
        }
        if self.storage_api.base_url.trim().is_empty() {
            return Err(anyhow!("storageApi.baseUrl must be set"));
        }
        if matches!(self.processing_api.workers_count, Some(0)) {
            return Err(anyhow!("processingApi.workersCount must be positive"));
        }
        if matches!(self.storage_api.workers_count, Some(0)) {
            return Err(anyhow!("storageApi.workersCount must be positive"));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_client_timeout: default_client_timeout(),
            default_workers_count: default_workers_count(),
            source_api: SourceApiConfig::default(),
            processing_api: ProcessingApiConfig::default(),
            storage_api: StorageApiConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Upstream producer API settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SourceApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    /// Maximum GETs per rate-limit window. Zero disables the cap.
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default = "default_rate_limit_period_secs")]
    pub rate_limit_period_secs: u64,
}

/// Enrichment API settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub workers_count: Option<usize>,
}

/// Storage API settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub workers_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
