use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use ws_proxy::{ProxyConfig, Transport, DEFAULT_BACKEND_URL, DEFAULT_LISTEN_ADDR};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend")]
    pub url: String,
    #[serde(default)]
    pub verify_certificate: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend(),
            verify_certificate: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Build the relay configuration, validating the listen address.
    /// The backend URL is validated when the proxy binds.
    pub fn proxy_config(&self) -> anyhow::Result<ProxyConfig> {
        let listen_addr: SocketAddr = self
            .network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.network.listen_addr))?;

        let transport = if self.tls.enabled {
            Transport::Tls {
                cert_path: self.tls.cert_path.clone(),
                key_path: self.tls.key_path.clone(),
            }
        } else {
            Transport::Plain
        };

        Ok(ProxyConfig {
            listen_addr,
            backend_url: self.backend.url.clone(),
            verify_backend_certificate: self.backend.verify_certificate,
            transport,
        })
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

fn default_backend() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("cert.pem")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("key.pem")
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Where a loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    /// The file was absent; built-in defaults are in effect.
    Defaults,
}

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration, which reproduces the
/// relay's fixed deployment: plain transport on port 8442 in front of the
/// mosquitto backend. This runs before logging is set up, so reporting the
/// fallback is left to the caller.
pub fn load(path: &Path) -> anyhow::Result<(Config, ConfigSource)> {
    if !path.exists() {
        return Ok((Config::default(), ConfigSource::Defaults));
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config = load_from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok((config, ConfigSource::File))
}

pub fn load_from_str(contents: &str) -> anyhow::Result<Config> {
    Ok(serde_yml::from_str(contents)?)
}
