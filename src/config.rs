//! Configuration management for the DICOM loader.
//!
//! Two layers feed the loader:
//! - [`LoaderConfig`]: serde-loadable options using the camelCase option
//!   names (`maxConcurrentLoads`, `cacheSize`, `wadoURI`, ...), typically read
//!   from a JSON file
//! - [`Cli`]: command-line arguments via clap, with environment variables
//!   under the `DICOM_LOADER_` prefix, overriding the file
//!
//! # Example
//!
//! ```
//! use dicom_loader::config::LoaderConfig;
//!
//! let config: LoaderConfig = serde_json::from_str(r#"{
//!     "maxConcurrentLoads": 4,
//!     "cacheSize": 256,
//!     "wadoRS": { "baseUrl": "http://localhost:8042/dicom-web" }
//! }"#).unwrap();
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.cache_capacity_bytes(), 256 * 1024 * 1024);
//! ```
//!
//! # Environment Variables
//!
//! - `DICOM_LOADER_CONFIG` - Path to a JSON config file
//! - `DICOM_LOADER_WADO_URI` - WADO-URI base URL
//! - `DICOM_LOADER_WADO_RS` - WADO-RS base URL
//! - `DICOM_LOADER_TOKEN` - Static bearer token
//! - `DICOM_LOADER_MAX_CONCURRENT` - Max concurrent single-image fetches
//! - `DICOM_LOADER_CACHE_MB` - Cache budget in MB

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};
use crate::progressive::ProgressiveConfig;
use crate::protocol::{AuthConfig, RetryConfig, WadoRsConfig, WadoUriConfig};

// =============================================================================
// Default Values
// =============================================================================

/// Default maximum number of concurrent single-image fetches.
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 6;

/// Default cache budget in MB.
pub const DEFAULT_CACHE_SIZE_MB: usize = 512;

/// Default prefetch batch size.
pub const DEFAULT_PREFETCH_SIZE: usize = 5;

/// Default number of attempts per request.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default base retry delay in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Default retry delay cap in milliseconds.
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 10_000;

/// Default backoff multiplier.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

const BYTES_PER_MB: usize = 1024 * 1024;

// =============================================================================
// LoaderConfig
// =============================================================================

/// Loader options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoaderConfig {
    pub max_concurrent_loads: usize,

    /// Cache budget in MB
    pub cache_size: usize,

    pub prefetch_size: usize,

    /// When disabled, progressive sessions load the whole set as one chunk
    pub progressive_loading: bool,

    pub retry_attempts: u32,

    /// Base retry delay in milliseconds
    pub retry_delay: u64,

    /// Retry delay cap in milliseconds
    pub max_retry_delay: u64,

    pub backoff_factor: f64,

    /// Per-request timeout in milliseconds
    pub request_timeout: u64,

    /// Accepted for compatibility; decoding threads belong to the decoder
    pub use_web_workers: bool,

    /// Accepted for compatibility; decoding threads belong to the decoder
    pub web_worker_count: usize,

    #[serde(rename = "wadoURI")]
    pub wado_uri: Option<WadoUriConfig>,

    #[serde(rename = "wadoRS")]
    pub wado_rs: Option<WadoRsConfig>,

    pub auth: AuthConfig,

    /// SOP classes the caller expects; empty accepts everything
    #[serde(rename = "supportedSOPClasses")]
    pub supported_sop_classes: Vec<String>,

    pub progressive: ProgressiveConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            cache_size: DEFAULT_CACHE_SIZE_MB,
            prefetch_size: DEFAULT_PREFETCH_SIZE,
            progressive_loading: true,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            request_timeout: DEFAULT_REQUEST_TIMEOUT_MS,
            use_web_workers: false,
            web_worker_count: 0,
            wado_uri: None,
            wado_rs: None,
            auth: AuthConfig::None,
            supported_sop_classes: Vec::new(),
            progressive: ProgressiveConfig::default(),
        }
    }
}

impl LoaderConfig {
    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoaderError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            LoaderError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(LoaderError::Configuration(message.to_string()));

        if self.max_concurrent_loads == 0 {
            return invalid("maxConcurrentLoads must be greater than 0");
        }
        if self.cache_size == 0 {
            return invalid("cacheSize must be greater than 0");
        }
        if self.prefetch_size == 0 {
            return invalid("prefetchSize must be greater than 0");
        }
        if self.retry_attempts == 0 {
            return invalid("retryAttempts must be at least 1");
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid("backoffFactor must be a finite number >= 1");
        }
        if self.max_retry_delay < self.retry_delay {
            return invalid("maxRetryDelay must not be smaller than retryDelay");
        }
        if self.request_timeout == 0 {
            return invalid("requestTimeout must be greater than 0");
        }

        if let Some(ref uri) = self.wado_uri {
            url::Url::parse(&uri.base_url).map_err(|e| {
                LoaderError::Configuration(format!("wadoURI.baseUrl is invalid: {}", e))
            })?;
            for (name, value) in [
                ("studyParam", &uri.study_param),
                ("seriesParam", &uri.series_param),
                ("objectParam", &uri.object_param),
                ("contentType", &uri.content_type),
            ] {
                if value.trim().is_empty() {
                    return Err(LoaderError::Configuration(format!(
                        "wadoURI.{} must not be empty",
                        name
                    )));
                }
            }
        }

        if let Some(ref rs) = self.wado_rs {
            url::Url::parse(&rs.base_url).map_err(|e| {
                LoaderError::Configuration(format!("wadoRS.baseUrl is invalid: {}", e))
            })?;
            if let Some(ref bulk) = rs.bulk_data_uri {
                url::Url::parse(bulk).map_err(|e| {
                    LoaderError::Configuration(format!("wadoRS.bulkDataURI is invalid: {}", e))
                })?;
            }
        }

        self.progressive.validate()
    }

    /// Cache budget in bytes.
    pub fn cache_capacity_bytes(&self) -> usize {
        self.cache_size.saturating_mul(BYTES_PER_MB)
    }

    /// Retry settings derived from the flat options.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay),
            max_delay: Duration::from_millis(self.max_retry_delay),
            backoff_factor: self.backoff_factor,
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }
}

// =============================================================================
// Runtime reconfiguration
// =============================================================================

/// Options that can change while the loader is running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub cache_size_mb: Option<usize>,
    pub max_concurrent_loads: Option<usize>,
    pub prefetch_size: Option<usize>,
}

impl ConfigUpdate {
    pub fn validate(&self) -> Result<()> {
        if self.cache_size_mb == Some(0) {
            return Err(LoaderError::Configuration(
                "cacheSize must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_loads == Some(0) {
            return Err(LoaderError::Configuration(
                "maxConcurrentLoads must be greater than 0".to_string(),
            ));
        }
        if self.prefetch_size == Some(0) {
            return Err(LoaderError::Configuration(
                "prefetchSize must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// dicom-loader - fetch DICOM instances and volumes over WADO-URI / WADO-RS.
#[derive(Parser, Debug, Clone)]
#[command(name = "dicom-loader")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file; flags below override it.
    #[arg(long, global = true, env = "DICOM_LOADER_CONFIG")]
    pub config: Option<PathBuf>,

    /// WADO-URI base URL.
    #[arg(long, global = true, env = "DICOM_LOADER_WADO_URI")]
    pub wado_uri: Option<String>,

    /// WADO-RS base URL.
    #[arg(long, global = true, env = "DICOM_LOADER_WADO_RS")]
    pub wado_rs: Option<String>,

    /// Static bearer token sent with every request.
    #[arg(long, global = true, env = "DICOM_LOADER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    /// Maximum concurrent single-image fetches.
    #[arg(long, global = true, env = "DICOM_LOADER_MAX_CONCURRENT")]
    pub max_concurrent_loads: Option<usize>,

    /// Cache budget in MB.
    #[arg(long, global = true, env = "DICOM_LOADER_CACHE_MB")]
    pub cache_size: Option<usize>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Fetch one instance and write its bytes to a file.
    Fetch {
        /// Identifier, e.g. wadors:<study>/<series>/<instance>
        identifier: String,

        /// Output file (defaults to printing a summary only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fetch a set of instances as one ordered volume.
    Volume {
        /// Volume identifier used in logs and events
        volume_id: String,

        /// Instance identifiers
        #[arg(required = true)]
        identifiers: Vec<String>,
    },

    /// Fetch and print instance metadata as JSON (WADO-RS only).
    Metadata {
        /// Identifier, e.g. wadors:<study>/<series>/<instance>
        identifier: String,
    },
}

impl Cli {
    /// Build the loader configuration: file (if any), then flag overrides.
    pub fn loader_config(&self) -> Result<LoaderConfig> {
        let mut config = match self.config {
            Some(ref path) => LoaderConfig::from_json_file(path)?,
            None => LoaderConfig::default(),
        };

        if let Some(ref base_url) = self.wado_uri {
            let mut uri = config.wado_uri.take().unwrap_or_default();
            uri.base_url = base_url.clone();
            config.wado_uri = Some(uri);
        }
        if let Some(ref base_url) = self.wado_rs {
            let mut rs = config.wado_rs.take().unwrap_or_default();
            rs.base_url = base_url.clone();
            config.wado_rs = Some(rs);
        }
        if let Some(ref token) = self.bearer_token {
            config.auth = AuthConfig::Bearer {
                token: token.clone(),
            };
        }
        if let Some(max) = self.max_concurrent_loads {
            config.max_concurrent_loads = max;
        }
        if let Some(size) = self.cache_size {
            config.cache_size = size;
        }

        config.validate()?;
        if config.wado_uri.is_none() && config.wado_rs.is_none() {
            return Err(LoaderError::Configuration(
                "No endpoint configured. Set --wado-rs / DICOM_LOADER_WADO_RS or --wado-uri / DICOM_LOADER_WADO_URI"
                    .to_string(),
            ));
        }
        Ok(config)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LoaderConfig {
        LoaderConfig {
            wado_rs: Some(WadoRsConfig::new("http://localhost:8042/dicom-web")),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
        assert!(LoaderConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let mut config = test_config();
        config.max_concurrent_loads = 0;
        assert!(matches!(config.validate(), Err(LoaderError::Configuration(_))));

        let mut config = test_config();
        config.cache_size = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.retry_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.retry_delay = 5000;
        config.max_retry_delay = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_urls() {
        let mut config = test_config();
        config.wado_rs = Some(WadoRsConfig::new("::not a url::"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("wadoRS.baseUrl"));

        let mut config = test_config();
        config.wado_uri = Some(WadoUriConfig {
            study_param: " ".into(),
            ..WadoUriConfig::new("http://localhost/wado")
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("studyParam"));
    }

    #[test]
    fn test_deserialize_option_names() {
        let config: LoaderConfig = serde_json::from_str(
            r#"{
                "maxConcurrentLoads": 8,
                "cacheSize": 64,
                "prefetchSize": 3,
                "progressiveLoading": false,
                "retryAttempts": 5,
                "retryDelay": 250,
                "useWebWorkers": true,
                "webWorkerCount": 4,
                "wadoURI": {
                    "baseUrl": "http://pacs/wado",
                    "studyParam": "study",
                    "transferSyntax": "1.2.840.10008.1.2.1"
                },
                "wadoRS": {
                    "baseUrl": "http://pacs/rs",
                    "multipartSupport": false,
                    "bulkDataURI": "http://bulk/rs"
                },
                "auth": { "type": "basic", "username": "u", "password": "p" },
                "supportedSOPClasses": ["1.2.840.10008.5.1.4.1.1.2"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_loads, 8);
        assert_eq!(config.cache_capacity_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.prefetch_size, 3);
        assert!(!config.progressive_loading);
        assert_eq!(config.retry_config().max_attempts, 5);
        assert_eq!(config.retry_config().base_delay, Duration::from_millis(250));

        let uri = config.wado_uri.as_ref().unwrap();
        assert_eq!(uri.study_param, "study");
        assert_eq!(uri.series_param, "seriesUID");
        assert_eq!(uri.transfer_syntax.as_deref(), Some("1.2.840.10008.1.2.1"));

        let rs = config.wado_rs.as_ref().unwrap();
        assert!(!rs.multipart_support);
        assert_eq!(rs.bulk_data_uri.as_deref(), Some("http://bulk/rs"));

        assert!(matches!(config.auth, AuthConfig::Basic { .. }));
        assert_eq!(config.supported_sop_classes.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update_validation() {
        assert!(ConfigUpdate::default().validate().is_ok());
        assert!(ConfigUpdate {
            cache_size_mb: Some(0),
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ConfigUpdate {
            max_concurrent_loads: Some(0),
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "dicom-loader",
            "--wado-rs",
            "http://pacs/rs",
            "--bearer-token",
            "secret",
            "--max-concurrent-loads",
            "2",
            "fetch",
            "wadors:1/2/3",
        ]);

        let config = cli.loader_config().unwrap();
        assert_eq!(config.wado_rs.unwrap().base_url, "http://pacs/rs");
        assert_eq!(config.max_concurrent_loads, 2);
        assert!(matches!(config.auth, AuthConfig::Bearer { ref token } if token == "secret"));
        assert!(matches!(cli.command, Command::Fetch { ref identifier, .. } if identifier == "wadors:1/2/3"));
    }

    #[test]
    fn test_cli_requires_endpoint() {
        let cli = Cli::parse_from(["dicom-loader", "metadata", "wadors:1/2/3"]);
        // Only fails if the environment does not provide an endpoint either
        if std::env::var("DICOM_LOADER_WADO_RS").is_err()
            && std::env::var("DICOM_LOADER_WADO_URI").is_err()
            && std::env::var("DICOM_LOADER_CONFIG").is_err()
        {
            assert!(matches!(
                cli.loader_config(),
                Err(LoaderError::Configuration(_))
            ));
        }
    }
}
