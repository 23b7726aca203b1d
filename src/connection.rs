//! # Connection Manager Records
//!
//! Forward-Open establishes a Class 3 connection; Forward-Close tears it down.
//! Both are sent unconnected to the Connection Manager object (class 0x06,
//! instance 1).
//!
//! ## Bit-packed fields
//!
//! Network connection parameters (u16):
//!
//! | Bits | Mask | Field |
//! |------|------|-------|
//! | 15 | `0x8000` | Redundant owner |
//! | 13-14 | `0x6000` | Connection type (Null, Multicast, Point-to-point) |
//! | 10-11 | `0x0C00` | Priority (Low, High, Scheduled, Urgent) |
//! | 9 | `0x0200` | Variable size |
//! | 0-8 | `0x01FF` | Connection size in bytes |
//!
//! Transport class / trigger (u8):
//!
//! | Bits | Mask | Field |
//! |------|------|-------|
//! | 7 | `0x80` | Server direction |
//! | 4-6 | `0x70` | Production trigger |
//! | 0-3 | `0x0F` | Transport class |
//!
//! Priority / tick time (u8): bit 4 is the priority flag, bits 0-3 the tick time.

use bytes::BufMut;

use crate::constants::{
    CLASS_CONNECTION_MANAGER, CLASS_MESSAGE_ROUTER, MAX_CONNECTION_SIZE, SERVICE_FORWARD_CLOSE,
    SERVICE_FORWARD_OPEN,
};
use crate::error::{EipError, EipResult};
use crate::router::MessageRouterRequest;
use crate::segment::{encode_path, path_len, path_words, PathSegment};
use crate::wire::WireReader;

#[inline]
const fn get_field(value: u16, mask: u16, shift: u32) -> u16 {
    (value & mask) >> shift
}

#[inline]
const fn set_field(value: u16, mask: u16, shift: u32, field: u16) -> u16 {
    (value & !mask) | ((field << shift) & mask)
}

// ============================================================================
// Network connection parameters
// ============================================================================

const REDUNDANT_OWNER_MASK: u16 = 0x8000;
const REDUNDANT_OWNER_SHIFT: u32 = 15;
const CONNECTION_TYPE_MASK: u16 = 0x6000;
const CONNECTION_TYPE_SHIFT: u32 = 13;
const PRIORITY_MASK: u16 = 0x0C00;
const PRIORITY_SHIFT: u32 = 10;
const VARIABLE_SIZE_MASK: u16 = 0x0200;
const VARIABLE_SIZE_SHIFT: u32 = 9;
const CONNECTION_SIZE_MASK: u16 = 0x01FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Null,
    Multicast,
    PointToPoint,
    Reserved,
}

impl ConnectionType {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0 => ConnectionType::Null,
            1 => ConnectionType::Multicast,
            2 => ConnectionType::PointToPoint,
            _ => ConnectionType::Reserved,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            ConnectionType::Null => 0,
            ConnectionType::Multicast => 1,
            ConnectionType::PointToPoint => 2,
            ConnectionType::Reserved => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    Low,
    High,
    Scheduled,
    Urgent,
}

impl ConnectionPriority {
    fn from_bits(bits: u16) -> Self {
        match bits {
            0 => ConnectionPriority::Low,
            1 => ConnectionPriority::High,
            2 => ConnectionPriority::Scheduled,
            _ => ConnectionPriority::Urgent,
        }
    }

    fn to_bits(self) -> u16 {
        match self {
            ConnectionPriority::Low => 0,
            ConnectionPriority::High => 1,
            ConnectionPriority::Scheduled => 2,
            ConnectionPriority::Urgent => 3,
        }
    }
}

/// Network connection parameter word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkConnectionParams(pub u16);

impl NetworkConnectionParams {
    pub fn redundant_owner(self) -> bool {
        get_field(self.0, REDUNDANT_OWNER_MASK, REDUNDANT_OWNER_SHIFT) != 0
    }

    pub fn set_redundant_owner(&mut self, value: bool) {
        self.0 = set_field(self.0, REDUNDANT_OWNER_MASK, REDUNDANT_OWNER_SHIFT, value as u16);
    }

    pub fn connection_type(self) -> ConnectionType {
        ConnectionType::from_bits(get_field(self.0, CONNECTION_TYPE_MASK, CONNECTION_TYPE_SHIFT))
    }

    pub fn set_connection_type(&mut self, value: ConnectionType) {
        self.0 = set_field(self.0, CONNECTION_TYPE_MASK, CONNECTION_TYPE_SHIFT, value.to_bits());
    }

    pub fn priority(self) -> ConnectionPriority {
        ConnectionPriority::from_bits(get_field(self.0, PRIORITY_MASK, PRIORITY_SHIFT))
    }

    pub fn set_priority(&mut self, value: ConnectionPriority) {
        self.0 = set_field(self.0, PRIORITY_MASK, PRIORITY_SHIFT, value.to_bits());
    }

    pub fn variable_size(self) -> bool {
        get_field(self.0, VARIABLE_SIZE_MASK, VARIABLE_SIZE_SHIFT) != 0
    }

    pub fn set_variable_size(&mut self, value: bool) {
        self.0 = set_field(self.0, VARIABLE_SIZE_MASK, VARIABLE_SIZE_SHIFT, value as u16);
    }

    pub fn size(self) -> u16 {
        self.0 & CONNECTION_SIZE_MASK
    }

    /// Set the connection size (0-511 bytes)
    pub fn set_size(&mut self, size: u16) -> EipResult<()> {
        if size > MAX_CONNECTION_SIZE {
            return Err(EipError::protocol(format!(
                "Connection size {} exceeds {}",
                size, MAX_CONNECTION_SIZE
            )));
        }
        self.0 = set_field(self.0, CONNECTION_SIZE_MASK, 0, size);
        Ok(())
    }
}

// ============================================================================
// Priority / tick time
// ============================================================================

const PRIORITY_FLAG_MASK: u8 = 0x10;
const TICK_TIME_MASK: u8 = 0x0F;

/// Priority flag and tick time byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityTick(pub u8);

impl PriorityTick {
    pub fn new(high_priority: bool, tick_time: u8) -> EipResult<Self> {
        let mut value = Self::default();
        value.set_priority(high_priority);
        value.set_tick_time(tick_time)?;
        Ok(value)
    }

    pub fn priority(self) -> bool {
        self.0 & PRIORITY_FLAG_MASK != 0
    }

    pub fn set_priority(&mut self, high: bool) {
        self.0 = (self.0 & !PRIORITY_FLAG_MASK) | if high { PRIORITY_FLAG_MASK } else { 0 };
    }

    pub fn tick_time(self) -> u8 {
        self.0 & TICK_TIME_MASK
    }

    /// Set the tick time (0-15)
    pub fn set_tick_time(&mut self, tick: u8) -> EipResult<()> {
        if tick > TICK_TIME_MASK {
            return Err(EipError::protocol(format!("Tick time {} exceeds 15", tick)));
        }
        self.0 = (self.0 & !TICK_TIME_MASK) | tick;
        Ok(())
    }
}

// ============================================================================
// Transport class / trigger
// ============================================================================

const IS_SERVER_MASK: u8 = 0x80;
const PRODUCTION_TRIGGER_MASK: u8 = 0x70;
const PRODUCTION_TRIGGER_SHIFT: u32 = 4;
const TRANSPORT_CLASS_MASK: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductionTrigger {
    Cyclic,
    ChangeOfState,
    ApplicationObject,
    Reserved(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClass {
    Class0,
    Class1,
    Class2,
    Class3,
    Other(u8),
}

/// Transport class and trigger byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportTrigger(pub u8);

impl TransportTrigger {
    pub fn is_server(self) -> bool {
        self.0 & IS_SERVER_MASK != 0
    }

    pub fn set_server(&mut self, server: bool) {
        self.0 = (self.0 & !IS_SERVER_MASK) | if server { IS_SERVER_MASK } else { 0 };
    }

    pub fn production_trigger(self) -> ProductionTrigger {
        match (self.0 & PRODUCTION_TRIGGER_MASK) >> PRODUCTION_TRIGGER_SHIFT {
            0 => ProductionTrigger::Cyclic,
            1 => ProductionTrigger::ChangeOfState,
            2 => ProductionTrigger::ApplicationObject,
            other => ProductionTrigger::Reserved(other),
        }
    }

    pub fn set_production_trigger(&mut self, trigger: ProductionTrigger) {
        let bits = match trigger {
            ProductionTrigger::Cyclic => 0,
            ProductionTrigger::ChangeOfState => 1,
            ProductionTrigger::ApplicationObject => 2,
            ProductionTrigger::Reserved(bits) => bits,
        };
        self.0 = (self.0 & !PRODUCTION_TRIGGER_MASK)
            | ((bits << PRODUCTION_TRIGGER_SHIFT) & PRODUCTION_TRIGGER_MASK);
    }

    pub fn transport_class(self) -> TransportClass {
        match self.0 & TRANSPORT_CLASS_MASK {
            0 => TransportClass::Class0,
            1 => TransportClass::Class1,
            2 => TransportClass::Class2,
            3 => TransportClass::Class3,
            other => TransportClass::Other(other),
        }
    }

    pub fn set_transport_class(&mut self, class: TransportClass) {
        let bits = match class {
            TransportClass::Class0 => 0,
            TransportClass::Class1 => 1,
            TransportClass::Class2 => 2,
            TransportClass::Class3 => 3,
            TransportClass::Other(bits) => bits,
        };
        self.0 = (self.0 & !TRANSPORT_CLASS_MASK) | (bits & TRANSPORT_CLASS_MASK);
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Route to the controller's Message Router through backplane `port`, `slot`
pub fn connection_path(port: u8, slot: u8) -> Vec<PathSegment> {
    vec![
        PathSegment::port(port, slot),
        PathSegment::class(CLASS_MESSAGE_ROUTER),
        PathSegment::instance(0x01),
    ]
}

fn connection_manager_path() -> Vec<PathSegment> {
    vec![
        PathSegment::class(CLASS_CONNECTION_MANAGER),
        PathSegment::instance(0x01),
    ]
}

fn check_app_reply(size_words: u8, reply: &[u8]) -> EipResult<()> {
    if size_words as usize * 2 != reply.len() {
        return Err(EipError::protocol(format!(
            "Application reply size {} words does not match {} bytes",
            size_words,
            reply.len()
        )));
    }
    Ok(())
}

// ============================================================================
// Forward Open
// ============================================================================

/// Fixed part of a Forward-Open request ahead of the connection path
pub const FORWARD_OPEN_FIXED_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenRequest {
    pub priority_tick: PriorityTick,
    pub timeout_ticks: u8,
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub timeout_multiplier: u8,
    pub o_t_rpi: u32,
    pub o_t_params: NetworkConnectionParams,
    pub t_o_rpi: u32,
    pub t_o_params: NetworkConnectionParams,
    pub transport_trigger: TransportTrigger,
    /// Declared connection path size in words
    pub path_size: u8,
    pub path: Vec<PathSegment>,
}

impl ForwardOpenRequest {
    pub fn encoded_len(&self) -> usize {
        FORWARD_OPEN_FIXED_LEN + path_len(&self.path)
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u8(self.priority_tick.0);
        buf.put_u8(self.timeout_ticks);
        buf.put_u32_le(self.o_t_connection_id);
        buf.put_u32_le(self.t_o_connection_id);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u8(self.timeout_multiplier);
        buf.put_slice(&[0, 0, 0]);
        buf.put_u32_le(self.o_t_rpi);
        buf.put_u16_le(self.o_t_params.0);
        buf.put_u32_le(self.t_o_rpi);
        buf.put_u16_le(self.t_o_params.0);
        buf.put_u8(self.transport_trigger.0);
        buf.put_u8(self.path_size);
        encode_path(&self.path, self.path_size, &mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let priority_tick = PriorityTick(reader.read_u8()?);
        let timeout_ticks = reader.read_u8()?;
        let o_t_connection_id = reader.read_u32()?;
        let t_o_connection_id = reader.read_u32()?;
        let connection_serial = reader.read_u16()?;
        let vendor_id = reader.read_u16()?;
        let originator_serial = reader.read_u32()?;
        let timeout_multiplier = reader.read_u8()?;
        reader.skip(3)?;
        let o_t_rpi = reader.read_u32()?;
        let o_t_params = NetworkConnectionParams(reader.read_u16()?);
        let t_o_rpi = reader.read_u32()?;
        let t_o_params = NetworkConnectionParams(reader.read_u16()?);
        let transport_trigger = TransportTrigger(reader.read_u8()?);
        let path_size = reader.read_u8()?;
        let path = crate::segment::decode_path(reader.read_bytes(path_size as usize * 2)?)?;
        reader.finish("Forward open request")?;
        Ok(Self {
            priority_tick,
            timeout_ticks,
            o_t_connection_id,
            t_o_connection_id,
            connection_serial,
            vendor_id,
            originator_serial,
            timeout_multiplier,
            o_t_rpi,
            o_t_params,
            t_o_rpi,
            t_o_params,
            transport_trigger,
            path_size,
            path,
        })
    }

    /// Unconnected request to the Connection Manager
    pub fn to_router_request(&self) -> EipResult<MessageRouterRequest> {
        MessageRouterRequest::new(SERVICE_FORWARD_OPEN, connection_manager_path(), self.to_bytes()?)
    }

    /// Matching Forward-Close for this connection
    pub fn close_request(&self) -> EipResult<ForwardCloseRequest> {
        Ok(ForwardCloseRequest {
            priority_tick: self.priority_tick,
            timeout_ticks: self.timeout_ticks,
            connection_serial: self.connection_serial,
            vendor_id: self.vendor_id,
            originator_serial: self.originator_serial,
            path_size: path_words(&self.path)?,
            path: self.path.clone(),
        })
    }
}

/// Accepted Forward-Open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenSuccess {
    pub o_t_connection_id: u32,
    pub t_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    /// Actual packet interval O->T (microseconds)
    pub o_t_api: u32,
    /// Actual packet interval T->O (microseconds)
    pub t_o_api: u32,
    /// Declared application reply size in words
    pub app_reply_size: u8,
    pub app_reply: Vec<u8>,
}

/// Rejected Forward-Open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOpenFailure {
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub remaining_path_size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOpenResponse {
    Ok(ForwardOpenSuccess),
    Failed(ForwardOpenFailure),
}

impl ForwardOpenResponse {
    /// Decode the reply data; the router's general status picks the variant
    pub fn decode(general_status: u8, bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let response = if general_status == 0 {
            let o_t_connection_id = reader.read_u32()?;
            let t_o_connection_id = reader.read_u32()?;
            let connection_serial = reader.read_u16()?;
            let vendor_id = reader.read_u16()?;
            let originator_serial = reader.read_u32()?;
            let o_t_api = reader.read_u32()?;
            let t_o_api = reader.read_u32()?;
            let app_reply_size = reader.read_u8()?;
            reader.skip(1)?;
            let app_reply = reader.read_bytes(app_reply_size as usize * 2)?.to_vec();
            ForwardOpenResponse::Ok(ForwardOpenSuccess {
                o_t_connection_id,
                t_o_connection_id,
                connection_serial,
                vendor_id,
                originator_serial,
                o_t_api,
                t_o_api,
                app_reply_size,
                app_reply,
            })
        } else {
            let connection_serial = reader.read_u16()?;
            let vendor_id = reader.read_u16()?;
            let originator_serial = reader.read_u32()?;
            let remaining_path_size = reader.read_u8()?;
            reader.skip(1)?;
            ForwardOpenResponse::Failed(ForwardOpenFailure {
                connection_serial,
                vendor_id,
                originator_serial,
                remaining_path_size,
            })
        };
        reader.finish("Forward open response")?;
        Ok(response)
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            ForwardOpenResponse::Ok(ok) => {
                check_app_reply(ok.app_reply_size, &ok.app_reply)?;
                buf.put_u32_le(ok.o_t_connection_id);
                buf.put_u32_le(ok.t_o_connection_id);
                buf.put_u16_le(ok.connection_serial);
                buf.put_u16_le(ok.vendor_id);
                buf.put_u32_le(ok.originator_serial);
                buf.put_u32_le(ok.o_t_api);
                buf.put_u32_le(ok.t_o_api);
                buf.put_u8(ok.app_reply_size);
                buf.put_u8(0);
                buf.put_slice(&ok.app_reply);
            }
            ForwardOpenResponse::Failed(failed) => {
                buf.put_u16_le(failed.connection_serial);
                buf.put_u16_le(failed.vendor_id);
                buf.put_u32_le(failed.originator_serial);
                buf.put_u8(failed.remaining_path_size);
                buf.put_u8(0);
            }
        }
        Ok(buf)
    }
}

// ============================================================================
// Forward Close
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseRequest {
    pub priority_tick: PriorityTick,
    pub timeout_ticks: u8,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    /// Declared connection path size in words
    pub path_size: u8,
    pub path: Vec<PathSegment>,
}

impl ForwardCloseRequest {
    pub fn encoded_len(&self) -> usize {
        12 + path_len(&self.path)
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u8(self.priority_tick.0);
        buf.put_u8(self.timeout_ticks);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u8(self.path_size);
        buf.put_u8(0);
        encode_path(&self.path, self.path_size, &mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let priority_tick = PriorityTick(reader.read_u8()?);
        let timeout_ticks = reader.read_u8()?;
        let connection_serial = reader.read_u16()?;
        let vendor_id = reader.read_u16()?;
        let originator_serial = reader.read_u32()?;
        let path_size = reader.read_u8()?;
        reader.skip(1)?;
        let path = crate::segment::decode_path(reader.read_bytes(path_size as usize * 2)?)?;
        reader.finish("Forward close request")?;
        Ok(Self {
            priority_tick,
            timeout_ticks,
            connection_serial,
            vendor_id,
            originator_serial,
            path_size,
            path,
        })
    }

    pub fn to_router_request(&self) -> EipResult<MessageRouterRequest> {
        MessageRouterRequest::new(SERVICE_FORWARD_CLOSE, connection_manager_path(), self.to_bytes()?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseSuccess {
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    /// Declared application reply size in words
    pub app_reply_size: u8,
    pub app_reply: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardCloseFailure {
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub remaining_path_size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardCloseResponse {
    Ok(ForwardCloseSuccess),
    Failed(ForwardCloseFailure),
}

impl ForwardCloseResponse {
    pub fn decode(general_status: u8, bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let connection_serial = reader.read_u16()?;
        let vendor_id = reader.read_u16()?;
        let originator_serial = reader.read_u32()?;
        let size = reader.read_u8()?;
        reader.skip(1)?;
        let response = if general_status == 0 {
            let app_reply = reader.read_bytes(size as usize * 2)?.to_vec();
            ForwardCloseResponse::Ok(ForwardCloseSuccess {
                connection_serial,
                vendor_id,
                originator_serial,
                app_reply_size: size,
                app_reply,
            })
        } else {
            ForwardCloseResponse::Failed(ForwardCloseFailure {
                connection_serial,
                vendor_id,
                originator_serial,
                remaining_path_size: size,
            })
        };
        reader.finish("Forward close response")?;
        Ok(response)
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            ForwardCloseResponse::Ok(ok) => {
                check_app_reply(ok.app_reply_size, &ok.app_reply)?;
                buf.put_u16_le(ok.connection_serial);
                buf.put_u16_le(ok.vendor_id);
                buf.put_u32_le(ok.originator_serial);
                buf.put_u8(ok.app_reply_size);
                buf.put_u8(0);
                buf.put_slice(&ok.app_reply);
            }
            ForwardCloseResponse::Failed(failed) => {
                buf.put_u16_le(failed.connection_serial);
                buf.put_u16_le(failed.vendor_id);
                buf.put_u32_le(failed.originator_serial);
                buf.put_u8(failed.remaining_path_size);
                buf.put_u8(0);
            }
        }
        Ok(buf)
    }
}
