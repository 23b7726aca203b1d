//! CIP and EtherNet/IP protocol constants
//!
//! Raw values used on the wire. Typed views over some of these live next to the
//! code that consumes them (`Command`, `EncapsulationStatus`, `LogicalType`).

// ============================================================================
// Network
// ============================================================================

/// TCP/UDP port for explicit messaging
pub const EXPLICIT_MESSAGING_PORT: u16 = 44818;

/// UDP port for implicit (I/O) messaging
pub const IMPLICIT_MESSAGING_PORT: u16 = 2222;

/// Largest UDP payload that fits in one IPv4 datagram
pub const MAX_UDP_PACKET_SIZE: usize = 65507;

/// Default deadline for a single send or receive (milliseconds)
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 6000;

/// Default wait for the connection before an operation gives up (milliseconds)
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 30000;

/// Default window for collecting ListIdentity answers (milliseconds)
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// Encapsulation
// ============================================================================

/// Fixed encapsulation header length
/// Format: Command(2) + Length(2) + Session(4) + Status(4) + Context(8) + Options(4)
pub const ENCAPSULATION_HEADER_LEN: usize = 24;

/// Encapsulation protocol version sent in RegisterSession
pub const ENCAPSULATION_PROTOCOL_VERSION: u16 = 1;

/// Interface handle (4) + timeout (2) ahead of the CPF frame in SendRRData/SendUnitData
pub const SEND_DATA_PREFIX_LEN: usize = 6;

pub const CMD_NOP: u16 = 0x0000;
pub const CMD_LIST_SERVICES: u16 = 0x0004;
pub const CMD_LIST_IDENTITY: u16 = 0x0063;
pub const CMD_LIST_INTERFACES: u16 = 0x0064;
pub const CMD_REGISTER_SESSION: u16 = 0x0065;
pub const CMD_UNREGISTER_SESSION: u16 = 0x0066;
pub const CMD_SEND_RR_DATA: u16 = 0x006F;
pub const CMD_SEND_UNIT_DATA: u16 = 0x0070;
pub const CMD_INDICATE_STATUS: u16 = 0x0072;
pub const CMD_CANCEL: u16 = 0x0073;

pub const ENCAP_STATUS_SUCCESS: u32 = 0x0000;
pub const ENCAP_STATUS_UNSUPPORTED_COMMAND: u32 = 0x0001;
pub const ENCAP_STATUS_INSUFFICIENT_MEMORY: u32 = 0x0002;
pub const ENCAP_STATUS_INVALID_DATA: u32 = 0x0003;
pub const ENCAP_STATUS_INVALID_SESSION_HANDLE: u32 = 0x0064;
pub const ENCAP_STATUS_INVALID_LENGTH: u32 = 0x0065;
pub const ENCAP_STATUS_UNSUPPORTED_PROTOCOL_REVISION: u32 = 0x0069;

// ============================================================================
// Common Packet Format item type IDs
// ============================================================================

pub const ITEM_NULL_ADDRESS: u16 = 0x0000;
pub const ITEM_IDENTITY: u16 = 0x000C;
pub const ITEM_CONNECTED_ADDRESS: u16 = 0x00A1;
pub const ITEM_CONNECTED_DATA: u16 = 0x00B1;
pub const ITEM_UNCONNECTED_DATA: u16 = 0x00B2;
pub const ITEM_LIST_SERVICES: u16 = 0x0100;
pub const ITEM_SEQUENCED_ADDRESS: u16 = 0x8002;

// ============================================================================
// CIP general status
// ============================================================================

pub const GENERAL_STATUS_SUCCESS: u8 = 0x00;
/// Connection failure; on Forward-Close it means the connection did not exist
pub const GENERAL_STATUS_CONNECTION_FAILURE: u8 = 0x01;
pub const GENERAL_STATUS_PATH_DESTINATION_UNKNOWN: u8 = 0x05;
/// Reply data too large: another fragment follows
pub const GENERAL_STATUS_PARTIAL_TRANSFER: u8 = 0x06;
/// One or more embedded services of a multiple-service packet failed
pub const GENERAL_STATUS_EMBEDDED_SERVICE_ERROR: u8 = 0x1E;
pub const GENERAL_STATUS_VENDOR_SPECIFIC: u8 = 0xFF;

/// Extended status for a structure handle that no longer matches the tag
pub const EXT_STATUS_STALE_STRUCTURE_HANDLE: u16 = 0x2107;

// ============================================================================
// CIP services
// ============================================================================

/// Set on the service code of every reply
pub const SERVICE_REPLY_FLAG: u8 = 0x80;

pub const SERVICE_MULTIPLE_SERVICE_PACKET: u8 = 0x0A;
pub const SERVICE_READ_TAG: u8 = 0x4C;
pub const SERVICE_WRITE_TAG: u8 = 0x4D;
pub const SERVICE_READ_MODIFY_WRITE: u8 = 0x4E;
pub const SERVICE_READ_TAG_FRAGMENTED: u8 = 0x52;
pub const SERVICE_WRITE_TAG_FRAGMENTED: u8 = 0x53;

pub const SERVICE_FORWARD_CLOSE: u8 = 0x4E;
pub const SERVICE_UNCONNECTED_SEND: u8 = 0x52;
pub const SERVICE_FORWARD_OPEN: u8 = 0x54;
pub const SERVICE_LARGE_FORWARD_OPEN: u8 = 0x5B;

// ============================================================================
// CIP object classes
// ============================================================================

pub const CLASS_IDENTITY: u8 = 0x01;
pub const CLASS_MESSAGE_ROUTER: u8 = 0x02;
pub const CLASS_CONNECTION_MANAGER: u8 = 0x06;

// ============================================================================
// Logix data-type tags
// ============================================================================

/// BOOL tags carry the bit number in the high byte, so match with a mask
pub const DATA_TYPE_BOOL_MASK: u16 = 0x00C1;
pub const DATA_TYPE_BOOL: u16 = 0x00C1;
pub const DATA_TYPE_SINT: u16 = 0x00C2;
pub const DATA_TYPE_INT: u16 = 0x00C3;
pub const DATA_TYPE_DINT: u16 = 0x00C4;
pub const DATA_TYPE_LINT: u16 = 0x00C5;
pub const DATA_TYPE_REAL: u16 = 0x00CA;
pub const DATA_TYPE_DWORD: u16 = 0x00D3;
pub const DATA_TYPE_STRUCT: u16 = 0x02A0;

/// Encoded value of a true BOOL
pub const BOOL_TRUE: u8 = 0xFF;

// ============================================================================
// Connection sizing
// ============================================================================

/// Default maximum application data per connected packet
pub const DEFAULT_CONNECTION_SIZE: u16 = 504;

/// Largest value the 9-bit connection-size field can hold
pub const MAX_CONNECTION_SIZE: u16 = 0x01FF;

/// Connected-request overhead ahead of the payload of a WriteTagFragmented frame
///
/// Sequence(2) + Service(1) + PathSize(1) + Type(2) + Count(2) + Offset(4) + CPF framing(6)
pub const WRITE_FRAGMENT_OVERHEAD: usize = 18;

/// Encapsulated reply header (8) plus the service count (2) of a multiple-service packet
pub const MULTIPLE_SERVICE_OVERHEAD: usize = 10;
