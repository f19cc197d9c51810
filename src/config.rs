//! Proxy configuration file format.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ca::CaStorage;
use crate::proxy::{HexDumpTap, NoopTap, Tap, UpstreamConfig, split_host_port};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid target {0:?}: expected host:port")]
    InvalidTarget(String),
    #[error("{set} is set but {missing} is not")]
    Incomplete {
        set: &'static str,
        missing: &'static str,
    },
    #[error("no target configured and mirror mode is off")]
    NoTarget,
    #[error("fallback hostname must not be empty")]
    EmptyFallback,
}

/// Which tap observes relayed bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum TapKind {
    /// Log every chunk as a hex dump.
    #[default]
    #[serde(rename = "hexdump")]
    #[value(name = "hexdump")]
    HexDump,
    /// Observe nothing.
    #[serde(rename = "none", alias = "off")]
    #[value(name = "none", alias = "off")]
    Off,
}

impl TapKind {
    pub fn build(self) -> Arc<dyn Tap> {
        match self {
            Self::HexDump => Arc::new(HexDumpTap),
            Self::Off => Arc::new(NoopTap),
        }
    }
}

/// Per-session injection listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectConfig {
    pub enabled: bool,
    /// Address the ephemeral injection listeners bind to.
    pub bind: IpAddr,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Deadlines, in seconds. `null` or `0` disables one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub handshake_secs: Option<u64>,
    pub connect_secs: Option<u64>,
    pub idle_secs: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_secs: Some(30),
            connect_secs: Some(30),
            idle_secs: None,
        }
    }
}

impl TimeoutConfig {
    pub fn handshake(&self) -> Option<Duration> {
        seconds(self.handshake_secs)
    }

    pub fn connect(&self) -> Option<Duration> {
        seconds(self.connect_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        seconds(self.idle_secs)
    }
}

fn seconds(value: Option<u64>) -> Option<Duration> {
    value.filter(|&secs| secs > 0).map(Duration::from_secs)
}

/// Proxy configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the interception listener binds to.
    pub listen: SocketAddr,
    /// Explicit upstream `host:port`. Takes precedence over mirror mode.
    pub target: Option<String>,
    /// Dial the negotiated server name on the listen port when no target
    /// is set.
    pub mirror: bool,
    /// Hostname used when the client sends no server name.
    pub fallback: String,
    /// Where the root certificate and key live.
    pub ca: CaStorage,
    /// Serve this fixed chain instead of forging certificates.
    pub server_cert: Option<PathBuf>,
    pub server_key: Option<PathBuf>,
    pub upstream: UpstreamConfig,
    pub inject: InjectConfig,
    pub tap: TapKind,
    pub timeouts: TimeoutConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            target: None,
            mirror: true,
            fallback: "*.example.org".to_string(),
            ca: CaStorage::default(),
            server_cert: None,
            server_key: None,
            upstream: UpstreamConfig::default(),
            inject: InjectConfig::default(),
            tap: TapKind::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints. Run again after applying overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(target) = &self.target
            && split_host_port(target).is_none()
        {
            return Err(ConfigError::InvalidTarget(target.clone()));
        }
        if self.target.is_none() && !self.mirror {
            return Err(ConfigError::NoTarget);
        }
        if self.fallback.is_empty() {
            return Err(ConfigError::EmptyFallback);
        }

        paired(
            &self.server_cert,
            &self.server_key,
            "server_cert",
            "server_key",
        )?;
        paired(
            &self.upstream.client_cert,
            &self.upstream.client_key,
            "upstream.client_cert",
            "upstream.client_key",
        )?;
        Ok(())
    }

    /// The static certificate and key, when both are configured.
    pub fn static_certificate(&self) -> Option<(&Path, &Path)> {
        match (&self.server_cert, &self.server_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

fn paired<T>(
    first: &Option<T>,
    second: &Option<T>,
    first_name: &'static str,
    second_name: &'static str,
) -> Result<(), ConfigError> {
    match (first, second) {
        (Some(_), None) => Err(ConfigError::Incomplete {
            set: first_name,
            missing: second_name,
        }),
        (None, Some(_)) => Err(ConfigError::Incomplete {
            set: second_name,
            missing: first_name,
        }),
        _ => Ok(()),
    }
}
