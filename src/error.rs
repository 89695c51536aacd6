//! # Error Types Module
//!
//! Centralized error handling for Gravimetric.
//!
//! ## Error Types
//! - `CodecError`: payloads from the scale that cannot be decoded
//! - `TransportError`: Bluetooth adapter, scan, connect and discovery failures
//! - `PreconditionError`: commands issued while the session cannot honour them
//! - `ConfigError`: configuration file I/O and parsing errors
//! - `ExportError`: CSV serialization and file errors
//!
//! None of these are fatal. Codec errors are absorbed by the device session with a
//! lenient fallback, transport and precondition errors are reported to the user,
//! who can retry by scanning again.

use crate::scale::ConnectionState;
use thiserror::Error;

/// Wire payload could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer than the two bytes a fixed-point mass needs
    #[error("payload too short: expected 2 bytes, got {0}")]
    ShortPayload(usize),
    /// A flag payload with no bytes at all
    #[error("empty payload")]
    EmptyPayload,
}

/// Errors reported by the Bluetooth transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Bluetooth adapter not found or not available
    #[error("No Bluetooth adapter found. Please ensure Bluetooth is enabled.")]
    NoAdapter,
    #[error("scan failed: {0}")]
    ScanFailed(String),
    #[error("failed to connect to {device}: {reason}")]
    ConnectFailed { device: String, reason: String },
    #[error("service discovery failed: {0}")]
    ServiceDiscovery(String),
    /// The required service or one of its characteristics is absent
    #[error("required characteristic missing: {0}")]
    MissingCharacteristic(&'static str),
    #[error("could not subscribe to {characteristic} notifications: {reason}")]
    SubscribeFailed {
        characteristic: &'static str,
        reason: String,
    },
}

/// A command was issued in a state that cannot honour it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionError {
    #[error("device not connected")]
    NotConnected,
    /// Scan requested while a session is already underway
    #[error("session busy ({0:?})")]
    Busy(ConnectionState),
}

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("Failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

/// Errors that can occur while producing or saving a shot log export
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV output was not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
