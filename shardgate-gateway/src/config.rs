use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use shardgate_common::chunk::{DEFAULT_CHUNK_COUNT, MAX_CHUNK_COUNT};

use crate::chunker::ChunkerSettings;

const DEFAULT_METADATA_PATH: &str = "/var/lib/shardgate/metadata.db";
const DEFAULT_NODE_PORT: u16 = 8081;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    #[serde(default = "default_chunk_count")]
    pub chunk_count: u32,
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    #[serde(default = "default_download_window")]
    pub download_window: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_startup_probe_attempts")]
    pub startup_probe_attempts: u32,
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Http { url: String },
    Directory { path: PathBuf },
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from(DEFAULT_METADATA_PATH)
}

fn default_chunk_count() -> u32 {
    DEFAULT_CHUNK_COUNT
}

fn default_max_concurrent_uploads() -> usize {
    4
}

fn default_download_window() -> usize {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_startup_probe_attempts() -> u32 {
    10
}

impl GatewayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: GatewayConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `SHARDGATE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let backends = if let Some(addresses) = lookup("SHARDGATE_STORAGE_ADDRESSES") {
            addresses
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(|a| BackendConfig::Http { url: normalize_url(a) })
                .collect()
        } else if let Some(count) = lookup("SHARDGATE_STORAGE_INSTANCES") {
            let count: usize = count
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("SHARDGATE_STORAGE_INSTANCES is not a number: {}", e))?;
            (0..count)
                .map(|i| BackendConfig::Http {
                    url: format!("http://storage-{}:{}", i, DEFAULT_NODE_PORT),
                })
                .collect()
        } else {
            Vec::new()
        };

        let listen_addr = match lookup("SHARDGATE_PORT") {
            Some(port) => {
                let port: u16 = port
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("SHARDGATE_PORT is not a port number: {}", e))?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            None => default_listen_addr(),
        };

        let config = GatewayConfig {
            listen_addr,
            metadata_path: lookup("SHARDGATE_METADATA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_metadata_path),
            chunk_count: default_chunk_count(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            download_window: default_download_window(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            startup_probe_attempts: default_startup_probe_attempts(),
            backends,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("at least one storage backend must be configured");
        }
        for backend in &self.backends {
            match backend {
                BackendConfig::Http { url } => {
                    if !(url.starts_with("http://") || url.starts_with("https://")) {
                        anyhow::bail!("backend url must start with http:// or https://: {}", url);
                    }
                }
                BackendConfig::Directory { path } => {
                    if !path.is_absolute() {
                        anyhow::bail!("backend path must be absolute: {}", path.display());
                    }
                }
            }
        }
        if self.chunk_count == 0 || self.chunk_count > MAX_CHUNK_COUNT {
            anyhow::bail!("chunk_count must be between 1 and {}", MAX_CHUNK_COUNT);
        }
        if self.max_concurrent_uploads == 0 {
            anyhow::bail!("max_concurrent_uploads must be at least 1");
        }
        if self.download_window == 0 {
            anyhow::bail!("download_window must be at least 1");
        }
        if self.startup_probe_attempts == 0 {
            anyhow::bail!("startup_probe_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn chunker_settings(&self) -> ChunkerSettings {
        ChunkerSettings {
            default_chunk_count: self.chunk_count,
            max_concurrent_uploads: self.max_concurrent_uploads,
            download_window: self.download_window,
        }
    }

    /// HTTP client shared by all node backends.
    pub fn http_client(&self) -> anyhow::Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.read_timeout_secs))
            .build()?;
        Ok(client)
    }
}

fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
