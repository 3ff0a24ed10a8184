//! Environment-driven runtime configuration.
//!
//! Both roles are configured from the same set of `TETHER_*` variables,
//! read once at init and injected into the client or server builder. Every
//! key has a default, so an empty environment yields a working local setup.
//!
//! | key | meaning | default |
//! |---|---|---|
//! | `TETHER_TRANSPORT` | `stream` or `websocket` | stream |
//! | `TETHER_HOST` | listener / dial host | 127.0.0.1 |
//! | `TETHER_PORT` | listener / dial port | 4411 |
//! | `TETHER_PULSE_INTERVAL_MS` | liveness tick period | 1000 |
//! | `TETHER_PULSE_LIMIT` | silent ticks before service-side kick | 3 |
//! | `TETHER_REQUEST_TIMEOUT_MS` | pending-request expiry | 10000 |
//! | `TETHER_SERVICE_NAME` | display/log name | tether |

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TetherError};

/// Wire transport selected at process start; never negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP byte stream.
    Stream,
    /// WebSocket; binary messages carry the same framing.
    WebSocket,
}

impl FromStr for TransportKind {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportKind::Stream),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(TetherError::Config(format!(
                "unknown transport '{other}' (expected stream or websocket)"
            ))),
        }
    }
}

/// Runtime configuration shared by client and server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Wire transport.
    pub transport: TransportKind,
    /// Listener / dial host.
    pub host: String,
    /// Listener / dial port.
    pub port: u16,
    /// Liveness tick period.
    pub pulse_interval: Duration,
    /// Silent ticks tolerated before the service kicks the peer.
    pub pulse_limit: u32,
    /// Expiry for pending outbound requests.
    pub request_timeout: Duration,
    /// Display name used in logs only.
    pub service_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            host: "127.0.0.1".to_string(),
            port: 4411,
            pulse_interval: Duration::from_millis(1000),
            pulse_limit: 3,
            request_timeout: Duration::from_millis(10_000),
            service_name: "tether".to_string(),
        }
    }
}

impl Config {
    /// Read configuration from `TETHER_*` environment variables, falling
    /// back to defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns `Config` errors for unparseable values.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            transport: match env_var("TETHER_TRANSPORT") {
                Some(raw) => raw.parse()?,
                None => defaults.transport,
            },
            host: env_var("TETHER_HOST").unwrap_or(defaults.host),
            port: env_parse("TETHER_PORT")?.unwrap_or(defaults.port),
            pulse_interval: env_parse("TETHER_PULSE_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.pulse_interval),
            pulse_limit: env_parse("TETHER_PULSE_LIMIT")?.unwrap_or(defaults.pulse_limit),
            request_timeout: env_parse("TETHER_REQUEST_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_timeout),
            service_name: env_var("TETHER_SERVICE_NAME").unwrap_or(defaults.service_name),
        })
    }

    /// Validate that the values are within acceptable bounds.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(TetherError::Config("host must not be empty".into()));
        }
        if self.pulse_interval.is_zero() {
            return Err(TetherError::Config(
                "pulse interval must be greater than 0".into(),
            ));
        }
        if self.pulse_interval > Duration::from_secs(3600) {
            return Err(TetherError::Config(
                "pulse interval exceeds reasonable limit (1 hour)".into(),
            ));
        }
        if self.pulse_limit > 1000 {
            return Err(TetherError::Config(
                "pulse limit exceeds reasonable limit (1000 ticks)".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(TetherError::Config(
                "request timeout must be greater than 0".into(),
            ));
        }
        if self.request_timeout > Duration::from_secs(3600) {
            return Err(TetherError::Config(
                "request timeout exceeds reasonable limit (1 hour)".into(),
            ));
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| TetherError::Config(format!("invalid {key}={raw}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.transport, TransportKind::Stream);
        assert_eq!(c.port, 4411);
        assert_eq!(c.pulse_interval, Duration::from_millis(1000));
        assert_eq!(c.pulse_limit, 3);
        assert_eq!(c.request_timeout, Duration::from_millis(10_000));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_transport_kind_parsing() {
        assert_eq!(
            "stream".parse::<TransportKind>().unwrap(),
            TransportKind::Stream
        );
        assert_eq!(
            "websocket".parse::<TransportKind>().unwrap(),
            TransportKind::WebSocket
        );
        assert_eq!("WS".parse::<TransportKind>().unwrap(), TransportKind::WebSocket);
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_port_zero_is_allowed_for_ephemeral_binds() {
        let mut c = Config::default();
        c.port = 0;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut c = Config::default();
        c.pulse_interval = Duration::ZERO;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.request_timeout = Duration::ZERO;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut c = Config::default();
        c.host = String::new();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_absurd_limits() {
        let mut c = Config::default();
        c.pulse_limit = 1001;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.request_timeout = Duration::from_secs(7200);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_boundary_values_valid() {
        let mut c = Config::default();
        c.pulse_limit = 1000;
        c.pulse_interval = Duration::from_secs(3600);
        c.request_timeout = Duration::from_secs(3600);
        assert!(c.validate().is_ok());
    }
}
