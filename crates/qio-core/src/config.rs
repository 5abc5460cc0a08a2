//! Engine-relevant configuration: the subset of spec §6's knobs that
//! drive trie/subscription/callback/heartbeat behavior. Listener binding
//! and TLS options live in the server binary's own config, not here.

/// Validated engine configuration. Always fully populated; construct via
/// [`EngineConfig::from_raw`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub public_address: Option<String>,
    pub clients_cb_max_age_secs: u64,
    pub clients_subs_total: u64,
    pub clients_subs_pressure_pct: u8,
    pub clients_subs_min: u64,
    /// Implied `max-clients` bound used by the fairness formula (spec §4.3).
    /// Not named as a standalone knob in spec §6's table; threaded through
    /// from the server's connection-capacity config. See DESIGN.md.
    pub max_clients: u64,
    pub periodic_interval_secs: u64,
    pub periodic_threads: usize,
    pub broadcast_threads: usize,
    pub sub_min_size: usize,
    pub support_flash: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for EngineConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineConfigError::InvalidValue(s) => write!(f, "invalid engine config value: {s}"),
        }
    }
}

impl std::error::Error for EngineConfigError {}

/// Mirrors the server's `RawConfig` fields relevant to the engine; the
/// server binary owns the actual TOML deserialization struct and maps
/// it into this one so `qio-core` has no `serde`/`toml` coupling to the
/// file format itself, only to the validated values.
#[derive(Debug, Clone, Default)]
pub struct RawEngineConfig {
    pub public_address: Option<String>,
    pub clients_cb_max_age_secs: Option<u64>,
    pub clients_subs_total: Option<u64>,
    pub clients_subs_pressure_pct: Option<u8>,
    pub clients_subs_min: Option<u64>,
    pub max_clients: Option<u64>,
    pub periodic_interval_secs: Option<u64>,
    pub periodic_threads: Option<usize>,
    pub broadcast_threads: Option<usize>,
    pub sub_min_size: Option<usize>,
    pub support_flash: Option<bool>,
}

impl EngineConfig {
    pub fn from_raw(raw: RawEngineConfig) -> Result<Self, EngineConfigError> {
        let periodic_interval_secs = raw.periodic_interval_secs.unwrap_or(30);
        if !(5..=60).contains(&periodic_interval_secs) {
            return Err(EngineConfigError::InvalidValue(format!(
                "periodic-interval must be 5-60s, got {periodic_interval_secs}"
            )));
        }

        let clients_subs_pressure_pct = raw.clients_subs_pressure_pct.unwrap_or(80);
        if clients_subs_pressure_pct > 100 {
            return Err(EngineConfigError::InvalidValue(format!(
                "clients-subs-pressure must be 0-100, got {clients_subs_pressure_pct}"
            )));
        }

        let clients_cb_max_age_secs = raw.clients_cb_max_age_secs.unwrap_or(300);
        if clients_cb_max_age_secs == 0 {
            return Err(EngineConfigError::InvalidValue(
                "clients-cb-max-age must be > 0".to_owned(),
            ));
        }

        let max_clients = raw.max_clients.unwrap_or(1024);
        if max_clients == 0 {
            return Err(EngineConfigError::InvalidValue(
                "max-clients must be > 0".to_owned(),
            ));
        }

        let sub_min_size = raw.sub_min_size.unwrap_or(8);
        if sub_min_size == 0 || sub_min_size as u64 > max_clients {
            return Err(EngineConfigError::InvalidValue(format!(
                "sub-min-size must be > 0 and <= max-clients ({max_clients}), got {sub_min_size}"
            )));
        }

        let broadcast_threads = raw.broadcast_threads.unwrap_or(4);
        if broadcast_threads == 0 {
            return Err(EngineConfigError::InvalidValue(
                "broadcast-threads must be > 0".to_owned(),
            ));
        }

        let periodic_threads = raw.periodic_threads.unwrap_or(2);
        if periodic_threads == 0 {
            return Err(EngineConfigError::InvalidValue(
                "periodic-threads must be > 0".to_owned(),
            ));
        }

        Ok(EngineConfig {
            public_address: raw.public_address,
            clients_cb_max_age_secs,
            clients_subs_total: raw.clients_subs_total.unwrap_or(65536),
            clients_subs_pressure_pct,
            clients_subs_min: raw.clients_subs_min.unwrap_or(4),
            max_clients,
            periodic_interval_secs,
            periodic_threads,
            broadcast_threads,
            sub_min_size,
            support_flash: raw.support_flash.unwrap_or(false),
        })
    }
}
