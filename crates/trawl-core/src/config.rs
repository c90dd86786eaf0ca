use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;
use crate::proxy::ProxySource;

pub const DEFAULT_STORAGE_DIR: &str = "./storage";
pub const DEFAULT_PROBE_URL: &str = "https://httpbin.org/ip";
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Process-level settings: where data lives and where proxies come from.
#[derive(Debug, Clone)]
pub struct TrawlConfig {
    pub storage_dir: PathBuf,
    pub proxy_source: Option<ProxySource>,
    /// URL fetched through each proxy when testing the pool.
    pub probe_url: String,
    pub probe_timeout: Duration,
}

impl Default for TrawlConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            proxy_source: None,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
        }
    }
}

impl TrawlConfig {
    /// Read configuration from environment variables.
    ///
    /// - `TRAWL_STORAGE_DIR` (optional, defaults to `./storage`)
    /// - `TRAWL_PROXY_FILE`, `TRAWL_PROXIES`, `TRAWL_PROXY` (optional, first set wins)
    /// - `TRAWL_PROBE_URL` (optional, defaults to `https://httpbin.org/ip`)
    /// - `TRAWL_PROBE_TIMEOUT_SECS` (optional, defaults to 10)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage_dir = var("TRAWL_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));

        let proxy_source = if let Some(path) = var("TRAWL_PROXY_FILE") {
            Some(ProxySource::File(PathBuf::from(path)))
        } else if let Some(list) = var("TRAWL_PROXIES") {
            Some(ProxySource::List(list))
        } else {
            var("TRAWL_PROXY").map(ProxySource::Single)
        };

        let probe_url = var("TRAWL_PROBE_URL").unwrap_or_else(|| DEFAULT_PROBE_URL.to_string());
        url::Url::parse(&probe_url).map_err(|e| {
            AppError::ConfigError(format!("Invalid TRAWL_PROBE_URL '{probe_url}': {e}"))
        })?;

        let probe_timeout = match var("TRAWL_PROBE_TIMEOUT_SECS") {
            None => DEFAULT_PROBE_TIMEOUT_SECS,
            Some(raw) => {
                let parsed: u64 = raw.trim().parse().map_err(|_| {
                    AppError::ConfigError(format!(
                        "Invalid TRAWL_PROBE_TIMEOUT_SECS '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(AppError::ConfigError(
                        "TRAWL_PROBE_TIMEOUT_SECS must be at least 1".into(),
                    ));
                }
                parsed
            }
        };

        Ok(Self {
            storage_dir,
            proxy_source,
            probe_url,
            probe_timeout: Duration::from_secs(probe_timeout),
        })
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_proxy_source(mut self, source: ProxySource) -> Self {
        self.proxy_source = Some(source);
        self
    }

    pub fn with_probe_url(mut self, url: impl Into<String>) -> Self {
        self.probe_url = url.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}
