//! Message bus transport
//!
//! The daemon only needs a narrow slice of a pub/sub client:
//! - `Connector::connect` starts one connection attempt in the background
//! - `Link` subscribes, publishes and disconnects without blocking
//! - outcomes arrive as `TransportEvent`s on the connection's channel
//!
//! A connection is single-use. Once it reports a failure or a disconnect
//! it is dropped and the next attempt builds a fresh one.

pub mod memory;
pub mod mqtt;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::TransportError;

pub use memory::MemoryConnector;
pub use mqtt::MqttConnector;

/// Default MQTT broker port
pub const DEFAULT_PORT: u16 = 1883;

/// Notification from a connection's I/O context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outcome of the connect handshake
    Connected(Result<(), String>),
    /// Message received on a subscribed channel
    Message { channel: String, payload: Vec<u8> },
    /// Connection ended. `expected` is set when we asked for it.
    Disconnected { expected: bool, reason: String },
}

/// Handle for sending on an established (or establishing) connection
pub trait Link: Send + Sync {
    /// Subscribe to a channel
    fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Queue a message for delivery. `durable` asks the broker to retain it.
    fn publish(&self, channel: &str, payload: &[u8], durable: bool) -> Result<(), TransportError>;

    /// Close the connection. Delivers `Disconnected { expected: true, .. }`.
    fn disconnect(&self);
}

/// A connection attempt in progress
pub struct Connection {
    pub link: Arc<dyn Link>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Factory for connections. Must not block beyond starting the attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// Split an endpoint into host and port.
///
/// Accepts `host`, `host:port` and `[v6addr]:port`. A bare IPv6 address
/// (more than one colon, no brackets) is taken as a host.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), TransportError> {
    let invalid = || TransportError::InvalidEndpoint(endpoint.to_string());

    if endpoint.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match tail {
            "" => DEFAULT_PORT,
            _ => tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(invalid)?,
        };
        return Ok((host.to_string(), port));
    }

    match endpoint.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port.parse().map_err(|_| invalid())?;
            Ok((host.to_string(), port))
        }
        _ => Ok((endpoint.to_string(), DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        assert_eq!(parse_endpoint("miner-7").unwrap(), ("miner-7".to_string(), 1883));
        assert_eq!(parse_endpoint("10.0.0.3:1884").unwrap(), ("10.0.0.3".to_string(), 1884));
        assert_eq!(parse_endpoint("[fe80::1]:2000").unwrap(), ("fe80::1".to_string(), 2000));
        assert_eq!(parse_endpoint("[fe80::1]").unwrap(), ("fe80::1".to_string(), 1883));
        assert_eq!(parse_endpoint("fe80::1").unwrap(), ("fe80::1".to_string(), 1883));
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint(":1883").is_err());
        assert!(parse_endpoint("host:port").is_err());
        assert!(parse_endpoint("[fe80::1").is_err());
        assert!(parse_endpoint("[fe80::1]x").is_err());
    }
}
