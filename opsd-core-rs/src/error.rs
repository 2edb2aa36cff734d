//! Error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint \"{0}\"")]
    InvalidEndpoint(String),

    #[error("cannot create client for {endpoint}: {reason}")]
    Create { endpoint: String, reason: String },

    #[error("subscribe to {channel} failed: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    #[error("connection closed")]
    Closed,
}

/// Errors in the startup configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read host file {path}: {source}")]
    HostFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad bit mask \"{literal}\" in binding \"{item}\"")]
    BadMask { item: String, literal: String },

    #[error("binding \"{0}\" does not select any bit")]
    EmptyMask(String),

    #[error("empty channel name in binding \"{0}\"")]
    EmptyChannel(String),

    #[error("invalid refresh interval {0}")]
    BadRefresh(f64),
}

/// Rejected control input. Reported and discarded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("{channel}: bad bit value \"{payload}\"")]
    BadValue { channel: String, payload: String },

    #[error("unknown topic \"{0}\"")]
    UnknownChannel(String),
}

/// Conditions that end the daemon with failure status
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("could not connect to {broker}: {reason}")]
    ControlConnect { broker: String, reason: String },

    #[error("unexpected disconnect from {broker}: {reason}")]
    ControlDisconnected { broker: String, reason: String },

    #[error("control listener stopped: {0}")]
    ListenerTask(String),

    #[error("signal handler: {0}")]
    Signal(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
