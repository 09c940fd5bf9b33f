use crate::constants::{
    DEFAULT_CACHE_TIMEOUT_SECS, DEFAULT_CLIENT_NAME, DEFAULT_KEEPALIVE_INTERVAL_SECS,
    DEFAULT_SFTP_WORKER, DEFAULT_TIMEOUT_SECS,
};
use crate::core_error::EngineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// What to do with a PASV reply naming a non-routable address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassiveFallbackMode {
    /// Use the control connection's peer if the reply is private and the peer is not.
    #[default]
    Auto,
    /// Use the address from the reply as-is.
    Trust,
    /// Always connect to the control connection's peer.
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineOptions {
    pub use_passive: bool,
    pub allow_transfer_mode_fallback: bool,
    pub passive_fallback_mode: PassiveFallbackMode,
    pub view_hidden_files: bool,
    pub preserve_timestamps: bool,
    pub keepalive: bool,
    pub keepalive_interval_secs: u64,
    pub timeout_secs: u64,
    pub cache_timeout_secs: u64,
    pub client_name: String,
    pub ascii_extensions: Vec<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            use_passive: true,
            allow_transfer_mode_fallback: true,
            passive_fallback_mode: PassiveFallbackMode::Auto,
            view_hidden_files: false,
            preserve_timestamps: false,
            keepalive: true,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            cache_timeout_secs: DEFAULT_CACHE_TIMEOUT_SECS,
            client_name: String::from(DEFAULT_CLIENT_NAME),
            ascii_extensions: ["txt", "htm", "html", "php", "css", "js", "xml", "sh", "pl", "py"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl EngineOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_timeout_secs)
    }

    /// True if `filename` should be transferred with `TYPE A`.
    pub fn is_ascii(&self, filename: &str) -> bool {
        match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .ascii_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    /// `USER user@host`
    UserAtHost,
    /// `USER proxyuser`, `PASS proxypass`, `SITE host`
    Site,
    /// `USER proxyuser`, `PASS proxypass`, `OPEN host`
    Open,
    /// `USER user@proxyuser@host`, `PASS pass@proxypass`
    UserAtProxyAtHost,
    /// Token-substituted lines from `custom_sequence`
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// One command per line; `%u %p %a %h %s %w` expand to user, password,
    /// account, host, proxy user and proxy password.
    #[serde(default)]
    pub custom_sequence: String,
}

fn default_proxy_port() -> u16 {
    21
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SftpOptions {
    pub worker_path: PathBuf,
    pub keyfiles: Vec<PathBuf>,
}

impl Default for SftpOptions {
    fn default() -> Self {
        Self {
            worker_path: PathBuf::from(DEFAULT_SFTP_WORKER),
            keyfiles: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineOptions,
    pub proxy: Option<ProxyConfig>,
    pub sftp: SftpOptions,
}

impl EngineConfig {
    pub fn load_from_file(path: &str) -> Result<Self, EngineError> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| EngineError::ConfigRead(path.to_string(), e))?;
        let config: EngineConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.engine.timeout_secs == 0 {
            return Err(EngineError::InvalidConfig(
                "engine.timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(proxy) = &self.proxy {
            if proxy.host.is_empty() {
                return Err(EngineError::InvalidConfig("proxy.host is empty".to_string()));
            }
            if proxy.kind == ProxyKind::Custom && proxy.custom_sequence.trim().is_empty() {
                return Err(EngineError::InvalidConfig(
                    "proxy.custom_sequence is required for custom proxies".to_string(),
                ));
            }
        }
        Ok(())
    }
}
