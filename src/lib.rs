//! # Logix EIP - Async EtherNet/IP Client for Logix Controllers
//!
//! A CIP over EtherNet/IP client for ControlLogix / CompactLogix family
//! controllers, talking Class 3 connected explicit messaging over TCP.
//!
//! ## Features
//!
//! - **Async**: Tokio transport, background connection establishment
//! - **Typed tags**: scalar, array, structure and STRING reads and writes
//! - **Large data**: fragmented reads and writes sized to the connection
//! - **Batching**: many tag reads packed into Multiple Service Packets
//! - **Discovery**: ListIdentity / ListServices, UDP broadcast discovery
//! - **Sticky faults**: the first failure is kept; no silent reconnects
//!
//! ## Layers
//!
//! | Layer | Modules |
//! |-------|---------|
//! | Wire codec | `wire`, `segment`, `cpf`, `encapsulation`, `router`, `connection`, `identity` |
//! | Transport | `transport` |
//! | Session | `session`, `state` |
//! | Tag engine | `client`, `codec`, `batcher`, `value` |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use logix_eip::{ClientConfig, EipResult, LogixTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> EipResult<()> {
//!     // Backplane port 1, CPU in slot 0
//!     let client = LogixTcpClient::from_address("192.168.1.10", ClientConfig::new().with_route(1, 0))?;
//!
//!     let count = client.read_i32("Program:Main.Count").await?;
//!     client.write_i32("Program:Main.Count", count + 1).await?;
//!
//!     client.close().await
//! }
//! ```

// ============================================================================
// Wire codec
// ============================================================================

/// Core error types and result handling
pub mod error;

/// EtherNet/IP and CIP protocol constants
pub mod constants;

/// Bounds-checked little-endian reader
pub mod wire;

/// CIP path segments and tag-name parsing
pub mod segment;

/// Common Packet Format items and frames
pub mod cpf;

/// Encapsulation header and packets
pub mod encapsulation;

/// Message router, connected service and Multiple Service Packet records
pub mod router;

/// Forward-Open / Forward-Close records
pub mod connection;

/// Device identity and service capability records
pub mod identity;

// ============================================================================
// Client
// ============================================================================

/// Tag value types
pub mod value;

/// Logix tag request builders and reply decoding
pub mod codec;

/// Deterministic packing of batched reads
pub mod batcher;

/// Client configuration
pub mod config;

/// Connection state machine
pub mod state;

/// Stream and datagram transports
pub mod transport;

/// Session registration and Class 3 connection management
pub mod session;

/// Tag transaction engine
pub mod client;

/// Packet logging hook
pub mod logging;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use logix_eip::tokio) ===
pub use tokio;

// === Core client API ===
pub use client::{GenericLogixClient, LogixTcpClient, SequenceGenerator};
pub use config::ClientConfig;
pub use state::ConnectionState;

// === Error handling ===
pub use error::{EipError, EipResult};

// === Core types ===
pub use codec::{LogixCodec, WriteFrames};
pub use identity::{Identity, Revision, ServiceInfo, SockAddr};
pub use segment::{parse_tag_path, PathSegment};
pub use value::{TagType, TagValue};

// === Protocol records (advanced usage) ===
pub use encapsulation::{Command, EncapsulationHeader, EncapsulationPacket, EncapsulationStatus};
pub use router::{MessageRouterRequest, MessageRouterResponse, MultipleServiceRequest, MultipleServiceResponse};

// === Transport ===
pub use session::SessionManager;
pub use transport::{EipTransport, StreamChannel, TcpChannel, TransportStats, UdpChannel};

// === Logging ===
pub use logging::{CallbackLogger, LogCallback, LogLevel, LoggingMode};

/// EtherNet/IP explicit messaging TCP port
pub const DEFAULT_TCP_PORT: u16 = constants::EXPLICIT_MESSAGING_PORT;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Logix EIP v{} - EtherNet/IP client for Logix controllers", VERSION)
}
