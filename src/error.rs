//! Error types for every stage of the capture pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating the agent configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: expected 'key = value'")]
    Syntax { line: usize },

    #[error("'{0}' is missing in the configuration")]
    Missing(&'static str),

    #[error("Invalid value for '{key}': {value}")]
    Invalid { key: &'static str, value: String },
}

/// Errors raised while building or installing the exclusion filter.
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Failed to parse URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to resolve hostname: {0}")]
    Unresolved(String),

    #[error("Filter output truncated: {len} bytes exceeds limit of {limit}")]
    Truncated { len: usize, limit: usize },

    #[error("Failed to compile filter '{expression}': {reason}")]
    Compile { expression: String, reason: String },

    #[error("Failed to set filter: {0}")]
    Install(String),
}

/// Errors raised while enumerating or opening capture interfaces.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to find interface devices: {0}")]
    Enumerate(String),

    #[error("No interfaces match the supported criteria")]
    NoInterfaces,

    #[error("Failed to open {interface}: {reason}")]
    Open { interface: String, reason: String },

    #[error("Unsupported link type {linktype} on {interface}")]
    UnsupportedLinkType { interface: String, linktype: i32 },

    #[error("Exclusion filter unavailable on {interface}: {source}")]
    Filter {
        interface: String,
        #[source]
        source: FilterError,
    },
}

/// Errors raised by the collector transport.
#[derive(Error, Debug)]
pub enum TransmitError {
    #[error("Failed to create zmq socket: {0}")]
    Socket(#[source] zmq::Error),

    #[error("Invalid collector key: {0}")]
    Key(String),

    #[error("Failed to configure curve security: {0}")]
    Curve(#[source] zmq::Error),

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    #[error("Failed to send zmq message: {0}")]
    Send(#[source] zmq::Error),
}

/// Errors raised by the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Record of {size} bytes can never fit a {capacity} byte buffer")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("Interface name {0:?} contains a NUL byte")]
    InvalidInterfaceName(String),

    #[error("Failed to initialize data transmitter: {0}")]
    Transmitter(#[from] TransmitError),
}

/// Reasons a received batch fails to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Batch is shorter than the system id")]
    MissingSystemId,

    #[error("Interface name at {offset} is not terminated")]
    UnterminatedInterface { offset: usize },

    #[error("Interface name at {offset} is not valid UTF-8")]
    InvalidInterface { offset: usize },

    #[error("Timestamp at {offset} is truncated")]
    MissingTimestamp { offset: usize },

    #[error("Header window at {offset} cannot be parsed")]
    InvalidHeader { offset: usize },
}

/// Errors raised by the sniffer orchestrator.
#[derive(Error, Debug)]
pub enum SnifferError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("Failed to spawn listener thread for {interface}: {source}")]
    Spawn {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sniffer cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_missing_names_key() {
        let err = ConfigError::Missing("system_uuid");
        assert_eq!(err.to_string(), "'system_uuid' is missing in the configuration");
    }

    #[test]
    fn test_capture_error_wraps_filter_error() {
        let err = CaptureError::Filter {
            interface: "em0".to_string(),
            source: FilterError::Unresolved("collector.example".to_string()),
        };
        assert!(err.to_string().contains("em0"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_sniffer_error_is_transparent() {
        let err: SnifferError = CaptureError::NoInterfaces.into();
        assert_eq!(err.to_string(), CaptureError::NoInterfaces.to_string());
    }

    #[test]
    fn test_decode_error_reports_offset() {
        let err = DecodeError::MissingTimestamp { offset: 20 };
        assert_eq!(err.to_string(), "Timestamp at 20 is truncated");
        assert!(std::error::Error::source(&err).is_none());
    }
}
