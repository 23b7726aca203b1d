//! # Client Configuration
//!
//! Target addressing, timeouts and Forward-Open parameters for a
//! [`LogixTcpClient`](crate::client::LogixTcpClient).
//!
//! ## Defaults
//!
//! | Setting | Default | Notes |
//! |---------|---------|-------|
//! | `port` / `slot` | 1 / 0 | backplane route to the CPU, 0-255 each |
//! | `tcp_port` | 44818 | explicit messaging |
//! | `io_timeout` | 6000 ms | socket connect |
//! | `transaction_timeout` | 30000 ms | one logical transaction |
//! | `discovery_timeout` | 1000 ms | ListIdentity / ListServices |
//! | `connection_size` | 504 bytes | 9-bit field, max 511 |
//! | `rpi_us` | 2 s | O->T and T->O |

use std::time::Duration;

use crate::constants::{
    DEFAULT_CONNECTION_SIZE, DEFAULT_DISCOVERY_TIMEOUT_MS, DEFAULT_IO_TIMEOUT_MS,
    DEFAULT_TRANSACTION_TIMEOUT_MS, EXPLICIT_MESSAGING_PORT, MAX_CONNECTION_SIZE,
};
use crate::error::{EipError, EipResult};
use crate::segment::SEGMENT_PORT_MAX;

use tracing::debug;

/// Default backplane port.
pub const DEFAULT_PORT: u8 = 1;

/// Default CPU slot.
pub const DEFAULT_SLOT: u8 = 0;

/// Originator vendor ID sent in Forward-Open/Close.
pub const DEFAULT_VENDOR_ID: u16 = 0xBADD;

/// Requested packet interval in microseconds.
pub const DEFAULT_RPI_US: u32 = 2_000_000;

/// Priority/tick-time tick value.
pub const DEFAULT_TICK_TIME: u8 = 10;

/// Timeout ticks for the unconnected send.
pub const DEFAULT_TIMEOUT_TICKS: u8 = 5;

/// Connection timeout multiplier.
pub const DEFAULT_TIMEOUT_MULTIPLIER: u8 = 1;

/// Client configuration.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use logix_eip::ClientConfig;
///
/// let config = ClientConfig::new()
///     .with_slot(2)
///     .with_transaction_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.slot, 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Backplane port of the route to the CPU, sent as a raw byte.
    pub port: u8,
    /// CPU slot.
    pub slot: u8,
    /// EtherNet/IP TCP port.
    pub tcp_port: u16,
    /// Socket connect timeout.
    pub io_timeout: Duration,
    /// Deadline for one logical transaction (send and receive share it).
    pub transaction_timeout: Duration,
    /// Deadline for each discovery request.
    pub discovery_timeout: Duration,
    /// Maximum application data per packet, negotiated in Forward-Open.
    pub connection_size: u16,
    /// Originator vendor ID.
    pub vendor_id: u16,
    /// Requested packet interval in microseconds.
    pub rpi_us: u32,
    pub tick_time: u8,
    pub timeout_ticks: u8,
    pub timeout_multiplier: u8,
    /// Treat ListIdentity/ListServices failures as informational.
    pub tolerate_discovery_failure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            slot: DEFAULT_SLOT,
            tcp_port: EXPLICIT_MESSAGING_PORT,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            transaction_timeout: Duration::from_millis(DEFAULT_TRANSACTION_TIMEOUT_MS),
            discovery_timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
            connection_size: DEFAULT_CONNECTION_SIZE,
            vendor_id: DEFAULT_VENDOR_ID,
            rpi_us: DEFAULT_RPI_US,
            tick_time: DEFAULT_TICK_TIME,
            timeout_ticks: DEFAULT_TIMEOUT_TICKS,
            timeout_multiplier: DEFAULT_TIMEOUT_MULTIPLIER,
            tolerate_discovery_failure: true,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set backplane port and slot.
    pub fn with_route(mut self, port: u8, slot: u8) -> Self {
        self.port = port;
        self.slot = slot;
        self
    }

    pub fn with_port(mut self, port: u8) -> Self {
        self.port = port;
        self
    }

    pub fn with_slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_connection_size(mut self, size: u16) -> Self {
        self.connection_size = size;
        self
    }

    pub fn with_vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn with_rpi_us(mut self, rpi_us: u32) -> Self {
        self.rpi_us = rpi_us;
        self
    }

    /// Fail connection establishment when discovery fails.
    pub fn with_strict_discovery(mut self) -> Self {
        self.tolerate_discovery_failure = false;
        self
    }

    /// Check the configuration before use.
    pub fn validate(&self) -> EipResult<()> {
        if self.port == 0 || self.port > SEGMENT_PORT_MAX {
            debug!(
                port = self.port,
                slot = self.slot,
                "Backplane port outside 1-15, sending raw route bytes"
            );
        }
        if self.connection_size == 0 || self.connection_size > MAX_CONNECTION_SIZE {
            return Err(EipError::configuration(format!(
                "Connection size must be 1-{}, got {}",
                MAX_CONNECTION_SIZE, self.connection_size
            )));
        }
        if self.tick_time > 0x0F {
            return Err(EipError::configuration("Tick time must fit in 4 bits"));
        }
        for (name, timeout) in [
            ("io_timeout", self.io_timeout),
            ("transaction_timeout", self.transaction_timeout),
            ("discovery_timeout", self.discovery_timeout),
        ] {
            if timeout.is_zero() {
                return Err(EipError::configuration(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    /// Transaction timeout in milliseconds, for error reporting.
    pub fn transaction_timeout_ms(&self) -> u64 {
        self.transaction_timeout.as_millis() as u64
    }
}
