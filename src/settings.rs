use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::{HeaderName, Uri};
use serde::Deserialize;

use crate::cache::CachePolicy;
use crate::cli::{Cli, LogFormat};

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_entry_size() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_private_headers() -> Vec<String> {
    vec!["authorization".to_string(), "cookie".to_string()]
}

fn default_client_timeout() -> u64 {
    30
}

fn default_origin_connect_timeout() -> u64 {
    5
}

fn default_origin_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_request_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_response_body_size() -> usize {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Base URL of the shielded application, e.g. `http://127.0.0.1:9292`.
    pub origin: String,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    /// Opens the per-request transition trace on stderr.
    #[serde(default)]
    pub verbose: bool,
    /// When set, metadata and bodies persist here; otherwise both stores are
    /// in-process.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_cache_max_entry_size")]
    pub cache_max_entry_size: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    /// Freshness lifetime in seconds for responses that carry none.
    #[serde(default)]
    pub default_ttl: u64,
    /// Request headers that force a verbatim pass to the origin.
    #[serde(default = "default_private_headers")]
    pub private_headers: Vec<String>,
    #[serde(default)]
    pub allow_reload: bool,
    #[serde(default)]
    pub allow_revalidate: bool,
    #[serde(default)]
    pub serve_stale_on_error: bool,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_origin_connect_timeout")]
    pub origin_connect_timeout: u64,
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_response_body_size")]
    pub max_response_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("RELAYCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn origin_uri(&self) -> Result<Uri> {
        let uri: Uri = self
            .origin
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid origin URL {:?}: {err}", self.origin))?;
        ensure!(
            uri.authority().is_some(),
            "origin URL {:?} has no host",
            self.origin
        );
        Ok(uri)
    }

    pub fn cache_policy(&self) -> Result<CachePolicy> {
        let mut private_headers = Vec::with_capacity(self.private_headers.len());
        for name in &self.private_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| anyhow::anyhow!("invalid private header name {name:?}"))?;
            private_headers.push(name);
        }
        Ok(CachePolicy {
            private_headers,
            default_ttl: Duration::from_secs(self.default_ttl),
            allow_reload: self.allow_reload,
            allow_revalidate: self.allow_revalidate,
            serve_stale_on_error: self.serve_stale_on_error,
            max_entry_size: self.cache_max_entry_size,
        })
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn origin_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_connect_timeout)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_secs(self.origin_timeout)
    }

    pub fn cache_max_entries_nonzero(&self) -> std::num::NonZeroUsize {
        std::num::NonZeroUsize::new(self.cache_max_entries)
            .expect("cache_max_entries must be at least 1")
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.origin_uri()?;
        self.cache_policy()?;
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.origin_connect_timeout > 0,
            "origin_connect_timeout must be greater than 0 seconds (got {})",
            self.origin_connect_timeout
        );
        ensure!(
            self.origin_timeout > 0,
            "origin_timeout must be greater than 0 seconds (got {})",
            self.origin_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        ensure!(
            self.max_response_body_size > 0,
            "max_response_body_size must be greater than 0 (got {})",
            self.max_response_body_size
        );
        ensure!(
            self.cache_max_entry_size > 0,
            "cache_max_entry_size must be greater than 0 (got {})",
            self.cache_max_entry_size
        );
        ensure!(
            self.cache_max_entries > 0,
            "cache_max_entries must be greater than 0 (got {})",
            self.cache_max_entries
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/relaycache/relaycache.toml"),
        PathBuf::from("relaycache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
