//! Error types for the CIP / EtherNet/IP client
//!
//! Every fallible operation in the crate returns [`EipResult`]. The variants map
//! onto the failure classes a Logix controller conversation can produce:
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | `ProtocolViolation` | Wire data is malformed or internally inconsistent |
//! | `UnexpectedResponse` | A reply does not match the request just sent |
//! | `BadType` | The CIP data-type tag differs from the one the caller asked for |
//! | `ServiceException` | A connected service returned a non-zero general status |
//! | `Router` | An unconnected message-router request failed |
//! | `Encapsulation` | The encapsulation header carried a non-zero status |
//! | `NotConnected` | The connection never reached `Connected`, or it faulted |
//! | `TransportFault` | I/O failure, connection reset, or disposed channel |
//! | `Timeout` | A deadline expired |
//! | `Client` | The caller passed something the client cannot use |
//! | `Configuration` | Invalid [`ClientConfig`](crate::config::ClientConfig) |
//!
//! Errors are `Clone` so the first fault recorded by a channel or session can be
//! replayed to every later caller.

use std::io;

use thiserror::Error;

use crate::constants::{GENERAL_STATUS_VENDOR_SPECIFIC, EXT_STATUS_STALE_STRUCTURE_HANDLE};

/// Result type used throughout the crate
pub type EipResult<T> = Result<T, EipError>;

/// Errors produced by the EtherNet/IP client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EipError {
    /// Malformed or internally inconsistent wire data
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// The reply does not fit the semantics of the request
    #[error("Unexpected response: {message}")]
    UnexpectedResponse { message: String },

    /// Decoded data-type tag does not match the requested type
    #[error("Bad type: expected 0x{expected:04X}, got 0x{actual:04X}")]
    BadType { expected: u16, actual: u16 },

    /// Connected service returned a non-zero general status
    #[error("Service 0x{service:02X} failed with status 0x{status:02X} {ext_status:04X?}")]
    ServiceException {
        service: u8,
        status: u8,
        ext_status: Vec<u16>,
    },

    /// Unconnected message-router request returned a non-zero general status
    #[error("The message router responded with error code 0x{status:02X} {ext_status:04X?}")]
    Router { status: u8, ext_status: Vec<u16> },

    /// Non-zero status in an encapsulation header
    #[error("Encapsulation command 0x{command:04X} failed with status 0x{status:04X}")]
    Encapsulation { command: u16, status: u32 },

    /// The connection is not (or no longer) established
    #[error("{endpoint}.{port},{slot} Not Connected")]
    NotConnected {
        endpoint: String,
        port: u8,
        slot: u8,
    },

    /// Transport failure: timeout, reset, disposal or OS error
    #[error("Transport fault: {message}")]
    TransportFault { message: String },

    /// Deadline expired
    #[error("Timeout: {message} (after {timeout_ms}ms)")]
    Timeout { message: String, timeout_ms: u64 },

    /// General client-side error
    #[error("Client error: {message}")]
    Client { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl EipError {
    /// Create a protocol violation error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        EipError::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Create an unexpected response error
    pub fn unexpected<S: Into<String>>(message: S) -> Self {
        EipError::UnexpectedResponse {
            message: message.into(),
        }
    }

    /// Create a transport fault
    pub fn transport<S: Into<String>>(message: S) -> Self {
        EipError::TransportFault {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S, timeout_ms: u64) -> Self {
        EipError::Timeout {
            message: message.into(),
            timeout_ms,
        }
    }

    /// Create a client error
    pub fn client<S: Into<String>>(message: S) -> Self {
        EipError::Client {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        EipError::Configuration {
            message: message.into(),
        }
    }

    /// Create a not-connected error for the given target
    pub fn not_connected<S: Into<String>>(endpoint: S, port: u8, slot: u8) -> Self {
        EipError::NotConnected {
            endpoint: endpoint.into(),
            port,
            slot,
        }
    }

    /// True for errors raised by the I/O layer
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, EipError::TransportFault { .. } | EipError::Timeout { .. })
    }

    /// True if retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, EipError::Timeout { .. })
    }

    /// General status byte carried by service and router errors
    pub fn general_status(&self) -> Option<u8> {
        match self {
            EipError::ServiceException { status, .. } | EipError::Router { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// True if the device reported that a cached structure handle is stale
    pub fn is_stale_structure_handle(&self) -> bool {
        match self {
            EipError::ServiceException {
                status, ext_status, ..
            } => {
                *status == GENERAL_STATUS_VENDOR_SPECIFIC
                    && ext_status.first() == Some(&EXT_STATUS_STALE_STRUCTURE_HANDLE)
            }
            _ => false,
        }
    }
}

impl From<io::Error> for EipError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => EipError::transport("Connection Reset"),
            io::ErrorKind::TimedOut => EipError::timeout(err.to_string(), 0),
            _ => EipError::transport(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_display() {
        let err = EipError::not_connected("192.168.1.10:44818", 1, 0);
        assert_eq!(err.to_string(), "192.168.1.10:44818.1,0 Not Connected");
    }

    #[test]
    fn test_bad_type_display() {
        let err = EipError::BadType {
            expected: 0x00C4,
            actual: 0x00C3,
        };
        assert_eq!(err.to_string(), "Bad type: expected 0x00C4, got 0x00C3");
    }

    #[test]
    fn test_io_reset_maps_to_transport_fault() {
        let err: EipError = io::Error::new(io::ErrorKind::ConnectionReset, "peer").into();
        assert_eq!(err, EipError::transport("Connection Reset"));
        assert!(err.is_transport_fault());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_stale_handle_detection() {
        let stale = EipError::ServiceException {
            service: 0xCD,
            status: 0xFF,
            ext_status: vec![0x2107],
        };
        assert!(stale.is_stale_structure_handle());
        assert_eq!(stale.general_status(), Some(0xFF));

        let other = EipError::ServiceException {
            service: 0xCD,
            status: 0xFF,
            ext_status: vec![0x2105],
        };
        assert!(!other.is_stale_structure_handle());
    }
}
