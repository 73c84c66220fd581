//! Runtime settings of a [`Transport`](crate::Transport).
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ROUTED_HEADER_LENGTH;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_message_size {0} must be within {min}..=4294967295", min = ROUTED_HEADER_LENGTH + 1)]
    MessageSize(usize),
    #[error("min_connections {min} exceeds max_connections {max}")]
    ConnectionFloor { min: usize, max: usize },
}

/// How outbound connections are shared between sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Use one connection for every destination.
    pub single_connection: bool,
    /// Open a fresh connection for every send and close it once idle.
    pub connection_per_send: bool,
    /// Idle connections a destination keeps open.
    pub min_connections: usize,
    /// Connections opened per destination before busy ones are shared.
    pub max_connections: usize,
    /// Close connections as soon as nothing uses them.
    pub close_idle: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            single_connection: false,
            connection_per_send: false,
            min_connections: 0,
            max_connections: 1,
            close_idle: false,
        }
    }
}

/// Where receive handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// On the driver thread that read the frame.
    #[default]
    Direct,
    /// On `workers` spawned threads, plus any thread donated through
    /// [`Transport::serve_deliveries`](crate::Transport::serve_deliveries).
    Queued { capacity: usize, workers: usize },
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub resolve_timeout: Duration,
    /// Per-driver wait for I/O threads at shutdown.
    pub drain_timeout: Duration,
    /// Largest accepted frame, header included.
    pub max_message_size: usize,
    pub default_ttl: u8,
    pub max_routes: usize,
    /// Directory qualifier every lookup is made under.
    pub qualifier: String,
    /// Chirp period of services that do not pick their own.
    pub chirp_interval: Option<Duration>,
    /// Period of the expired-route sweep; `None` disables it.
    pub route_sweep: Option<Duration>,
    pub pool: PoolPolicy,
    pub delivery: DeliveryMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            max_message_size: 1 << 20,
            default_ttl: 16,
            max_routes: 65536,
            qualifier: String::new(),
            chirp_interval: Some(Duration::from_secs(30)),
            route_sweep: Some(Duration::from_secs(1)),
            pool: PoolPolicy::default(),
            delivery: DeliveryMode::Direct,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("reply_timeout", self.reply_timeout),
            ("resolve_timeout", self.resolve_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Zero(name));
        }
        if self.chirp_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Zero("chirp_interval"));
        }
        if self.route_sweep.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::Zero("route_sweep"));
        }
        if self.max_message_size <= ROUTED_HEADER_LENGTH
            || self.max_message_size > u32::MAX as usize
        {
            return Err(ConfigError::MessageSize(self.max_message_size));
        }
        if self.max_routes == 0 {
            return Err(ConfigError::Zero("max_routes"));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::ConnectionFloor {
                min: self.pool.min_connections,
                max: self.pool.max_connections,
            });
        }
        if let DeliveryMode::Queued { capacity, .. } = self.delivery {
            if capacity == 0 {
                return Err(ConfigError::Zero("delivery queue capacity"));
            }
        }
        Ok(())
    }
}
