//! Server configuration: every knob spec.md §6 names, loaded from TOML
//! via the same raw-then-validated pattern `qio-core`'s `EngineConfig`
//! uses. Listener binding and TLS are this binary's own concern; the
//! engine-relevant subset is mapped into `qio_core::RawEngineConfig`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use qio_core::RawEngineConfig;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
    /// TLS listener address. Parsed and validated but never bound to a
    /// real socket — TLS/TCP plumbing is an external collaborator's
    /// responsibility (spec.md §1).
    pub bind_address_ssl: Option<SocketAddr>,
    pub bind_path: Option<PathBuf>,
    pub flash_policy_address: Option<SocketAddr>,
    pub client_timeout: std::time::Duration,
    pub engine: qio_core::EngineConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "could not read config file: {s}"),
            ConfigError::Parse(s) => write!(f, "could not parse config: {s}"),
            ConfigError::MissingField(s) => write!(f, "missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    pub bind_address_ssl: Option<String>,
    pub bind_port_ssl: Option<u16>,
    pub bind_path: Option<String>,
    pub public_address: Option<String>,
    pub clients_cb_max_age: Option<u64>,
    pub clients_subs_total: Option<u64>,
    pub clients_subs_pressure: Option<u8>,
    pub clients_subs_min: Option<u64>,
    pub max_clients: Option<u64>,
    pub periodic_interval: Option<u64>,
    pub periodic_threads: Option<usize>,
    pub broadcast_threads: Option<usize>,
    pub sub_min_size: Option<usize>,
    pub support_flash: Option<bool>,
    pub flash_policy_port: Option<u16>,
    /// Idle-recv timeout feeding the heartbeat sweep's `timeout`/`dead`
    /// thresholds (spec.md §4.8). Not one of spec §6's named knobs; kept
    /// as a server-level setting since `qio-core::heartbeat_tick` takes
    /// it as a per-call parameter rather than baking it into `EngineConfig`.
    pub client_timeout: Option<u64>,
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawServerConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&text)
    }

    pub fn from_raw(raw: RawServerConfig) -> Result<Self, ConfigError> {
        let host = raw.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = raw.bind_port.unwrap_or(4023);
        let bind_address = format!("{host}:{port}")
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("bind-address/bind-port {host}:{port}")))?;

        let bind_address_ssl = match (&raw.bind_address_ssl, raw.bind_port_ssl) {
            (Some(host), Some(port)) => Some(
                format!("{host}:{port}")
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(format!("bind-address-ssl/bind-port-ssl {host}:{port}")))?,
            ),
            (None, None) => None,
            _ => return Err(ConfigError::MissingField("bind-address-ssl and bind-port-ssl must be set together".to_owned())),
        };

        let flash_policy_address = if raw.support_flash.unwrap_or(false) {
            let port = raw.flash_policy_port.unwrap_or(843);
            Some(
                format!("{host}:{port}")
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue(format!("flash-policy-port {port}")))?,
            )
        } else {
            None
        };

        let engine_raw = RawEngineConfig {
            public_address: raw.public_address.clone(),
            clients_cb_max_age_secs: raw.clients_cb_max_age,
            clients_subs_total: raw.clients_subs_total,
            clients_subs_pressure_pct: raw.clients_subs_pressure,
            clients_subs_min: raw.clients_subs_min,
            max_clients: raw.max_clients,
            periodic_interval_secs: raw.periodic_interval,
            periodic_threads: raw.periodic_threads,
            broadcast_threads: raw.broadcast_threads,
            sub_min_size: raw.sub_min_size,
            support_flash: raw.support_flash,
        };
        let engine = qio_core::EngineConfig::from_raw(engine_raw).map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        Ok(ServerConfig {
            bind_address,
            bind_address_ssl,
            bind_path: raw.bind_path.map(PathBuf::from),
            flash_policy_address,
            client_timeout: std::time::Duration::from_secs(raw.client_timeout.unwrap_or(300)),
            engine,
        })
    }

    /// HTTP (long-poll/iframe/WS-upgrade) handling is only enabled when a
    /// public address is configured (spec.md §4.6 "HTTP disabled mode").
    pub fn http_enabled(&self) -> bool {
        self.engine.public_address.is_some()
    }
}
