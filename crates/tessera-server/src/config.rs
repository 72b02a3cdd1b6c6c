//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

use crate::middleware::SignatureLogConfig;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub mdm: MdmConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve HTTPS and request client certificates. Required by the
    /// `tls-peer` extractor.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Server certificate for the TLS listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the server certificate followed by its chain.
    pub cert_path: String,

    /// PEM file with the server private key (PKCS#8, SEC1 or PKCS#1).
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Where the device identity certificate is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractorKind {
    /// URL-escaped PEM in a header set by a TLS-terminating proxy.
    PemHeader,
    /// Client certificate of the TLS connection.
    TlsPeer,
    /// Signer of the `Mdm-Signature` header.
    MdmSignature,
}

/// Identity pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MdmConfig {
    /// Extractors in pipeline order. When several find a certificate, the
    /// last one listed wins.
    #[serde(default = "default_extractors")]
    pub extractors: Vec<ExtractorKind>,

    /// Header read by the `pem-header` extractor.
    #[serde(default = "default_cert_header")]
    pub cert_header: String,

    /// Reject requests that cannot be bound to an enrollment. Devices are
    /// associated during check-in, so enforcing deployments must provision
    /// associations before devices first connect.
    #[serde(default)]
    pub enforce_enrollment: bool,

    #[serde(default)]
    pub signature_log_always: bool,

    #[serde(default)]
    pub signature_log_errors: bool,

    #[serde(default)]
    pub verify: VerifyConfig,
}

impl MdmConfig {
    pub fn signature_log(&self) -> SignatureLogConfig {
        SignatureLogConfig {
            always: self.signature_log_always,
            errors: self.signature_log_errors,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    #[default]
    AllowAll,
    Pool,
}

/// Trust policy applied to identity certificates.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    #[serde(default)]
    pub mode: VerifyMode,

    /// PEM bundle of trusted CA certificates, required in `pool` mode.
    #[serde(default)]
    pub ca_path: Option<String>,

    #[serde(default = "default_true")]
    pub check_validity: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    9000
}

fn default_db_path() -> String {
    "tessera.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_extractors() -> Vec<ExtractorKind> {
    vec![ExtractorKind::PemHeader]
}

fn default_cert_header() -> String {
    "X-Ssl-Client-Cert".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            extractors: default_extractors(),
            cert_header: default_cert_header(),
            enforce_enrollment: false,
            signature_log_always: false,
            signature_log_errors: false,
            verify: VerifyConfig::default(),
        }
    }
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            mode: VerifyMode::AllowAll,
            ca_path: None,
            check_validity: true,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("the tls-peer extractor requires server.tls")]
    TlsPeerWithoutTls,
}

impl Config {
    /// Checks settings that are only invalid in combination.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TlsPeerWithoutTls`] when device certificates
    /// are read from the TLS handshake but the server does not serve TLS.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mdm.extractors.contains(&ExtractorKind::TlsPeer) && self.server.tls.is_none() {
            return Err(ConfigError::TlsPeerWithoutTls);
        }
        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Applies `TESSERA_*` overrides looked up through `var`.
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("TESSERA_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("TESSERA_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("TESSERA_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("TESSERA_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
    if let Some(header) = var("TESSERA_CERT_HEADER") {
        config.mdm.cert_header = header;
    }
    if let Some(enforce) = var("TESSERA_ENFORCE_ENROLLMENT") {
        config.mdm.enforce_enrollment = is_truthy(&enforce);
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TESSERA_HOST` overrides `server.host`
/// - `TESSERA_PORT` overrides `server.port`
/// - `TESSERA_DB_PATH` overrides `database.path`
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `TESSERA_CERT_HEADER` overrides `mdm.cert_header`
/// - `TESSERA_ENFORCE_ENROLLMENT` overrides `mdm.enforce_enrollment`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the result fails [`Config::validate`].
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;

    Ok(config)
}
