//! ---
//! cion_section: "01-core-functionality"
//! cion_subsection: "module"
//! cion_type: "source"
//! cion_scope: "code"
//! cion_description: "Shared primitives and utilities for the worker runtime."
//! cion_version: "v0.0.0-prealpha"
//! cion_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Glob used to split `user/repo:tag` image references when no policy overrides it.
pub const DEFAULT_GLOB: &str = "(.*)/(.*):(.*)";

fn default_feed_root() -> PathBuf {
    PathBuf::from("configs/store")
}

fn default_feed_debounce() -> Duration {
    Duration::from_millis(50)
}

fn default_glob() -> String {
    DEFAULT_GLOB.to_owned()
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the worker daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CION_CONFIG";

    /// Load configuration from disk, respecting the `CION_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// `CION_CONFIG` wins over `candidates`; the first existing candidate is
    /// used otherwise. With neither, the defaults apply.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        let config = Self::default();
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        self.feed.validate()?;
        Ok(())
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

/// Location and behaviour of the directory-backed document store.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_root")]
    pub root: PathBuf,
    /// Delay applied after a filesystem notification before the document is read,
    /// so editors that write in several steps are observed once.
    #[serde(default = "default_feed_debounce")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub debounce: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            root: default_feed_root(),
            debounce: default_feed_debounce(),
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(anyhow!("feed root may not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Process-wide glob used when no repository policy overrides it.
    #[serde(default = "default_glob")]
    pub default_glob: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_glob: default_glob(),
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<()> {
        let pattern = Regex::new(&self.default_glob)
            .with_context(|| format!("routing.default_glob '{}' is not a valid pattern", self.default_glob))?;
        if pattern.captures_len() < 3 {
            return Err(anyhow!(
                "routing.default_glob '{}' must capture at least a repository and a tag",
                self.default_glob
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Serialize, Deserialize)]
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().expect("empty config parses");
        assert_eq!(config.routing.default_glob, DEFAULT_GLOB);
        assert_eq!(config.feed.root, PathBuf::from("configs/store"));
        assert_eq!(config.feed.debounce, Duration::from_millis(50));
        assert!(config.api.enabled);
    }

    #[test]
    fn sections_are_parsed() {
        let config: AppConfig = r#"
            [feed]
            root = "/srv/cion/store"
            debounce = 250

            [routing]
            default_glob = "(.*):(.*)"

            [api]
            listen = "127.0.0.1:5001"

            [logging]
            format = "pretty"
        "#
        .parse()
        .expect("config parses");
        assert_eq!(config.feed.root, PathBuf::from("/srv/cion/store"));
        assert_eq!(config.feed.debounce, Duration::from_millis(250));
        assert_eq!(config.routing.default_glob, "(.*):(.*)");
        assert_eq!(config.api.listen.port(), 5001);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn invalid_default_glob_is_rejected() {
        let err = "[routing]\ndefault_glob = \"(unclosed\""
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(format!("{err:#}").contains("default_glob"));
    }

    #[test]
    fn default_glob_without_tag_group_is_rejected() {
        assert!("[routing]\ndefault_glob = \"(.*)\""
            .parse::<AppConfig>()
            .is_err());
    }

    #[test]
    fn explicit_candidate_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("worker.toml");
        fs::write(&path, "[api]\nenabled = false\n").expect("write config");
        let loaded = AppConfig::load_with_source(&[path.clone()]).expect("load");
        assert_eq!(loaded.source.as_deref(), Some(path.as_path()));
        assert!(!loaded.config.api.enabled);
    }
}
