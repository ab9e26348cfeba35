//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults. Refresh
//! credentials are never stored in the TOML: they come from the
//! `COPILOT_REFRESH_TOKENS` env var (comma-separated), the legacy
//! `COPILOT_REFRESH_TOKEN` single-credential var, or a `credentials_file`
//! path. Every section has workable defaults, so a missing config file is
//! not an error; an env-only deployment is the common case.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use copilot_auth::{API_BASE_URL, CHAT_COMPLETIONS_PATH, MODELS_PATH, TOKEN_ENDPOINT};

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub record: RecordConfig,
}

/// Inbound listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Path to a file of refresh credentials (alternative to the env vars)
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

/// Upstream endpoint settings. The URL fields exist so tests and forks can
/// point the relay at a different host; production deployments leave them
/// at the defaults.
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Traffic-mirroring side channel: when enabled, upstream calls are routed
/// through a local recording proxy (mitmproxy or similar) at `proxy_url`.
#[derive(Debug, Deserialize)]
pub struct RecordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_record_proxy_url")]
    pub proxy_url: String,
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:9191".parse().expect("static addr")
}

fn default_max_connections() -> usize {
    1000
}

fn default_token_url() -> String {
    TOKEN_ENDPOINT.to_string()
}

fn default_api_base_url() -> String {
    API_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_record_proxy_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            credentials_file: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            api_base_url: default_api_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            proxy_url: default_record_proxy_url(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. A missing file yields the defaults.
    ///
    /// `RECORD_TRAFFIC=true|1|yes` switches traffic mirroring on regardless
    /// of the file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            Config::default()
        };

        for url in [&config.upstream.api_base_url, &config.upstream.token_url] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "upstream URL must start with http:// or https://, got: {url}"
                )));
            }
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if let Ok(flag) = std::env::var("RECORD_TRAFFIC") {
            config.record.enabled = matches!(flag.to_lowercase().as_str(), "true" | "1" | "yes");
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-relay.toml")
    }

    /// Resolve the refresh credentials.
    ///
    /// Order: `COPILOT_REFRESH_TOKENS` (comma-separated) →
    /// `COPILOT_REFRESH_TOKEN` (legacy single credential) →
    /// `credentials_file` (one credential per line, commas also accepted).
    /// Blank entries are dropped; deduplication happens in the pool.
    pub fn load_credentials(&self) -> common::Result<Vec<String>> {
        if let Ok(joined) = std::env::var("COPILOT_REFRESH_TOKENS") {
            let credentials = split_credentials(&joined);
            if !credentials.is_empty() {
                return Ok(credentials);
            }
        }

        if let Ok(single) = std::env::var("COPILOT_REFRESH_TOKEN") {
            let single = single.trim().to_owned();
            if !single.is_empty() {
                return Ok(vec![single]);
            }
        }

        if let Some(ref file) = self.server.credentials_file {
            let contents = std::fs::read_to_string(file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read credentials_file {}: {e}",
                    file.display()
                ))
            })?;
            let credentials = split_credentials(&contents);
            if !credentials.is_empty() {
                return Ok(credentials);
            }
        }

        Err(common::Error::Config(
            "No refresh credentials found. Set COPILOT_REFRESH_TOKENS with comma-separated credentials.".into(),
        ))
    }

    /// Full chat-completions URL under the configured API base.
    pub fn chat_completions_url(&self) -> String {
        format!(
            "{}{CHAT_COMPLETIONS_PATH}",
            self.upstream.api_base_url.trim_end_matches('/')
        )
    }

    /// Full model-listing URL under the configured API base.
    pub fn models_url(&self) -> String {
        format!(
            "{}{MODELS_PATH}",
            self.upstream.api_base_url.trim_end_matches('/')
        )
    }

    /// Build the upstream HTTP client.
    ///
    /// Applies the fixed total timeout. With recording enabled, all traffic
    /// is routed through the mirroring proxy and certificate verification is
    /// disabled so the recorder can terminate TLS.
    pub fn build_http_client(&self) -> common::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.upstream.timeout_secs));

        if self.record.enabled {
            let proxy = reqwest::Proxy::all(&self.record.proxy_url).map_err(|e| {
                common::Error::Config(format!(
                    "invalid record proxy_url {}: {e}",
                    self.record.proxy_url
                ))
            })?;
            builder = builder.proxy(proxy).danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| common::Error::Config(format!("failed to build HTTP client: {e}")))
    }
}

fn split_credentials(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
