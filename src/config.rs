use crate::table::{AddressFamily, ProviderKind};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the built-in service discovery endpoint
pub const MACHINE_LIST_PATH: &str = "/machine-list";

/// Errors detected while loading or validating configuration.
///
/// All of these are fatal: the process refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("scan window end[{end}] < begin[{begin}]")]
    InvertedWindow { begin: u16, end: u16 },

    #[error("host[{0}] is not a valid IPv4 address")]
    InvalidBindAddress(String),

    #[error("target[{0}] must be an absolute path without a query string")]
    InvalidTarget(String),

    #[error("target[{0}] collides with the service discovery endpoint")]
    ReservedTarget(String),

    #[error("target[{0}] is registered more than once")]
    DuplicateTarget(String),

    #[error("Configuration errors:\n  - {}", join_errors(.0))]
    Multiple(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n  - ")
}

/// Inclusive port range watched by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    begin: u16,
    end: u16,
}

impl ScanWindow {
    pub fn new(begin: u16, end: u16) -> Result<Self, ConfigError> {
        if end < begin {
            return Err(ConfigError::InvertedWindow { begin, end });
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> u16 {
        self.begin
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }
}

/// Delay between two scans, never shorter than [`ScanInterval::FLOOR`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanInterval(Duration);

impl ScanInterval {
    pub const FLOOR: Duration = Duration::from_secs(5);

    /// Anything below the floor is raised to the floor
    pub fn new(interval: Duration) -> Self {
        Self(interval.max(Self::FLOOR))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ScanInterval {
    fn default() -> Self {
        Self(Self::FLOOR)
    }
}

/// Strict dotted-quad check: four decimal octets, each 0-255, no leading zeros
pub fn validate_ipv4_address(address: &str) -> bool {
    // "255.255.255.255" is the longest valid form
    if address.is_empty() || address.len() > 15 {
        return false;
    }

    let octets: Vec<&str> = address.split('.').collect();
    if octets.len() != 4 {
        return false;
    }

    octets.iter().all(|octet| {
        !octet.is_empty()
            && octet.bytes().all(|b| b.is_ascii_digit())
            && (*octet == "0" || !octet.starts_with('0'))
            && octet.parse::<u16>().map(|n| n <= 255).unwrap_or(false)
    })
}

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Gateway (HTTP side) settings
    pub gateway: GatewayConfig,

    /// Port scanner settings
    pub scanner: ScannerConfig,

    /// Log sink settings
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 11000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port of machine number 0
    pub base_port: u16,

    /// Paths forwarded to backends
    #[serde(default)]
    pub targets: Vec<String>,

    /// Max time to wait for a backend response, in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    /// Validated socket address to listen on
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        if !validate_ipv4_address(&self.bind) {
            return Err(ConfigError::InvalidBindAddress(self.bind.clone()));
        }
        let ip: Ipv4Addr = self
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind.clone()))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate_targets(&self, errors: &mut Vec<ConfigError>) {
        let mut seen = std::collections::HashSet::new();
        for target in &self.targets {
            if !target.starts_with('/') || target.contains('?') || target.contains('#') {
                errors.push(ConfigError::InvalidTarget(target.clone()));
            } else if target == MACHINE_LIST_PATH {
                errors.push(ConfigError::ReservedTarget(target.clone()));
            } else if !seen.insert(target.as_str()) {
                errors.push(ConfigError::DuplicateTarget(target.clone()));
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    /// First watched port
    pub begin: u16,

    /// Last watched port (inclusive)
    pub end: u16,

    /// Scan interval in seconds
    pub interval_secs: Option<u64>,

    /// Scan interval in milliseconds (wins over `interval_secs`)
    pub interval_ms: Option<u64>,

    /// Port table source (default: auto)
    #[serde(default)]
    pub provider: ProviderKind,

    /// Address families to scan (default: ipv4)
    #[serde(default = "default_families")]
    pub families: Vec<AddressFamily>,
}

impl ScannerConfig {
    pub fn window(&self) -> Result<ScanWindow, ConfigError> {
        ScanWindow::new(self.begin, self.end)
    }

    pub fn interval(&self) -> ScanInterval {
        match (self.interval_ms, self.interval_secs) {
            (Some(ms), _) => ScanInterval::from_millis(ms),
            (None, Some(secs)) => ScanInterval::from_secs(secs),
            (None, None) => ScanInterval::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    /// Also write logs to this file (appended)
    pub file: Option<String>,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    11000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_families() -> Vec<AddressFamily> {
    vec![AddressFamily::Ipv4]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Err(e) = self.scanner.window() {
            errors.push(e);
        }
        if let Err(e) = self.gateway.bind_addr() {
            errors.push(e);
        }
        self.gateway.validate_targets(&mut errors);

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }
}
