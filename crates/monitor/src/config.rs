//! Monitor configuration loaded from environment variables.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `JOBWATCH_BASE_URL` | `http://127.0.0.1:5050` | Web application root |
//! | `JOBWATCH_SOCKET_PATH` | `/socket.io` | Socket.IO endpoint path |
//! | `JOBWATCH_SERVERS` | empty | Comma separated server ids to connect at start |
//! | `JOBWATCH_RECONNECT_ATTEMPTS` | `10` | Reconnect attempts before giving up |
//! | `JOBWATCH_RECONNECT_DELAY_MS` | `1000` | First reconnect delay |
//! | `JOBWATCH_RECONNECT_DELAY_MAX_MS` | `5000` | Reconnect delay cap |
//! | `JOBWATCH_HANDSHAKE_TIMEOUT_SECS` | `20` | Connect handshake budget |
//! | `JOBWATCH_HEARTBEAT_SECS` | `30` | Application ping interval |
//! | `JOBWATCH_REGISTRATION_RETRY_SECS` | `5` | Delay before re-registering after a rejection |

use std::str::FromStr;
use std::time::Duration;

use jobwatch_channel::channel::ChannelSettings;
use jobwatch_channel::client::SocketIoConfig;
use jobwatch_channel::reconnect::ReconnectConfig;
use jobwatch_core::types::ServerId;
use jobwatch_core::wire;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_url: String,
    pub socket_path: String,
    /// Servers to connect at startup.
    pub servers: Vec<ServerId>,
    pub reconnect: ReconnectConfig,
    pub heartbeat_interval: Duration,
    pub registration_retry: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let channel = ChannelSettings::default();
        Self {
            base_url: "http://127.0.0.1:5050".into(),
            socket_path: "/socket.io".into(),
            servers: Vec::new(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: channel.heartbeat_interval,
            registration_retry: channel.registration_retry,
        }
    }
}

impl MonitorConfig {
    /// Load from the process environment. Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let reconnect = ReconnectConfig {
            max_attempts: parse_or(&get, "JOBWATCH_RECONNECT_ATTEMPTS", defaults.reconnect.max_attempts)?,
            initial_delay: Duration::from_millis(parse_or(
                &get,
                "JOBWATCH_RECONNECT_DELAY_MS",
                defaults.reconnect.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &get,
                "JOBWATCH_RECONNECT_DELAY_MAX_MS",
                defaults.reconnect.max_delay.as_millis() as u64,
            )?),
            handshake_timeout: parse_secs(
                &get,
                "JOBWATCH_HANDSHAKE_TIMEOUT_SECS",
                defaults.reconnect.handshake_timeout,
            )?,
            ..defaults.reconnect
        };

        Ok(Self {
            base_url: get("JOBWATCH_BASE_URL").unwrap_or(defaults.base_url),
            socket_path: get("JOBWATCH_SOCKET_PATH").unwrap_or(defaults.socket_path),
            servers: match get("JOBWATCH_SERVERS") {
                Some(raw) => parse_servers(&raw)?,
                None => defaults.servers,
            },
            reconnect,
            heartbeat_interval: parse_secs(&get, "JOBWATCH_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            registration_retry: parse_secs(
                &get,
                "JOBWATCH_REGISTRATION_RETRY_SECS",
                defaults.registration_retry,
            )?,
        })
    }

    pub fn socket_config(&self) -> SocketIoConfig {
        SocketIoConfig {
            base_url: self.base_url.clone(),
            path: self.socket_path.clone(),
            namespace: wire::NAMESPACE.into(),
            reconnect: self.reconnect.clone(),
        }
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            heartbeat_interval: self.heartbeat_interval,
            registration_retry: self.registration_retry,
            ..ChannelSettings::default()
        }
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

/// Whole seconds, zero rejected.
fn parse_secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_or(get, var, default.as_secs())? {
        0 => Err(ConfigError::Invalid {
            var,
            value: get(var).unwrap_or_default(),
        }),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_servers(raw: &str) -> Result<Vec<ServerId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Invalid {
                var: "JOBWATCH_SERVERS",
                value: raw.to_string(),
            })
        })
        .collect()
}
