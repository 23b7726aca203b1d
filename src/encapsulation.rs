//! # EtherNet/IP Encapsulation
//!
//! Every EtherNet/IP message starts with a fixed 24-byte header:
//!
//! | Offset | Field | Size |
//! |--------|-------|------|
//! | 0 | Command | u16 |
//! | 2 | Length of payload | u16 |
//! | 4 | Session handle | u32 |
//! | 8 | Status | u32 |
//! | 12 | Sender context | 8 bytes |
//! | 20 | Options | u32 |
//!
//! All fields are little-endian. The payload that follows is exactly
//! `Length` bytes. For SendRRData / SendUnitData the payload is a 6-byte
//! prefix (interface handle, timeout) followed by a CPF frame.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::*;
use crate::cpf::CpfFrame;
use crate::error::{EipError, EipResult};
use crate::wire::WireReader;

/// Encapsulation command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Nop,
    ListServices,
    ListIdentity,
    ListInterfaces,
    RegisterSession,
    UnregisterSession,
    SendRRData,
    SendUnitData,
    IndicateStatus,
    Cancel,
    /// Any code this client does not know
    Other(u16),
}

impl Command {
    pub fn from_u16(code: u16) -> Self {
        match code {
            CMD_NOP => Command::Nop,
            CMD_LIST_SERVICES => Command::ListServices,
            CMD_LIST_IDENTITY => Command::ListIdentity,
            CMD_LIST_INTERFACES => Command::ListInterfaces,
            CMD_REGISTER_SESSION => Command::RegisterSession,
            CMD_UNREGISTER_SESSION => Command::UnregisterSession,
            CMD_SEND_RR_DATA => Command::SendRRData,
            CMD_SEND_UNIT_DATA => Command::SendUnitData,
            CMD_INDICATE_STATUS => Command::IndicateStatus,
            CMD_CANCEL => Command::Cancel,
            other => Command::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Command::Nop => CMD_NOP,
            Command::ListServices => CMD_LIST_SERVICES,
            Command::ListIdentity => CMD_LIST_IDENTITY,
            Command::ListInterfaces => CMD_LIST_INTERFACES,
            Command::RegisterSession => CMD_REGISTER_SESSION,
            Command::UnregisterSession => CMD_UNREGISTER_SESSION,
            Command::SendRRData => CMD_SEND_RR_DATA,
            Command::SendUnitData => CMD_SEND_UNIT_DATA,
            Command::IndicateStatus => CMD_INDICATE_STATUS,
            Command::Cancel => CMD_CANCEL,
            Command::Other(code) => code,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Other(code) => write!(f, "Command(0x{:04X})", code),
            named => write!(f, "{:?}", named),
        }
    }
}

/// Status field of the encapsulation header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncapsulationStatus {
    Success,
    UnsupportedCommand,
    InsufficientMemory,
    InvalidData,
    InvalidSessionHandle,
    InvalidLength,
    UnsupportedProtocolRevision,
    Unknown(u32),
}

impl EncapsulationStatus {
    pub fn from_u32(code: u32) -> Self {
        match code {
            ENCAP_STATUS_SUCCESS => EncapsulationStatus::Success,
            ENCAP_STATUS_UNSUPPORTED_COMMAND => EncapsulationStatus::UnsupportedCommand,
            ENCAP_STATUS_INSUFFICIENT_MEMORY => EncapsulationStatus::InsufficientMemory,
            ENCAP_STATUS_INVALID_DATA => EncapsulationStatus::InvalidData,
            ENCAP_STATUS_INVALID_SESSION_HANDLE => EncapsulationStatus::InvalidSessionHandle,
            ENCAP_STATUS_INVALID_LENGTH => EncapsulationStatus::InvalidLength,
            ENCAP_STATUS_UNSUPPORTED_PROTOCOL_REVISION => {
                EncapsulationStatus::UnsupportedProtocolRevision
            }
            other => EncapsulationStatus::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            EncapsulationStatus::Success => "Success",
            EncapsulationStatus::UnsupportedCommand => "Unsupported command",
            EncapsulationStatus::InsufficientMemory => "Insufficient memory",
            EncapsulationStatus::InvalidData => "Invalid data",
            EncapsulationStatus::InvalidSessionHandle => "Invalid session handle",
            EncapsulationStatus::InvalidLength => "Invalid length",
            EncapsulationStatus::UnsupportedProtocolRevision => "Unsupported protocol revision",
            EncapsulationStatus::Unknown(_) => "Unrecognized status",
        }
    }
}

/// The fixed 24-byte encapsulation header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationHeader {
    pub command: Command,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub sender_context: [u8; 8],
    pub options: u32,
}

impl EncapsulationHeader {
    pub fn new(command: Command, length: u16, session_handle: u32) -> Self {
        Self {
            command,
            length,
            session_handle,
            status: ENCAP_STATUS_SUCCESS,
            sender_context: [0; 8],
            options: 0,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.command.to_u16());
        buf.put_u16_le(self.length);
        buf.put_u32_le(self.session_handle);
        buf.put_u32_le(self.status);
        buf.put_slice(&self.sender_context);
        buf.put_u32_le(self.options);
    }

    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        Ok(Self {
            command: Command::from_u16(reader.read_u16()?),
            length: reader.read_u16()?,
            session_handle: reader.read_u32()?,
            status: reader.read_u32()?,
            sender_context: reader.read_array()?,
            options: reader.read_u32()?,
        })
    }

    pub fn from_bytes(bytes: &[u8; ENCAPSULATION_HEADER_LEN]) -> EipResult<Self> {
        Self::decode(&mut WireReader::new(bytes))
    }

    pub fn status(&self) -> EncapsulationStatus {
        EncapsulationStatus::from_u32(self.status)
    }
}

/// Header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulationPacket {
    pub header: EncapsulationHeader,
    pub data: Bytes,
}

impl EncapsulationPacket {
    /// Build a packet whose header length matches `data`
    pub fn new(command: Command, session_handle: u32, data: impl Into<Bytes>) -> EipResult<Self> {
        let data = data.into();
        let length = u16::try_from(data.len()).map_err(|_| {
            EipError::protocol(format!("Encapsulated payload too large: {} bytes", data.len()))
        })?;
        Ok(Self {
            header: EncapsulationHeader::new(command, length, session_handle),
            data,
        })
    }

    pub fn command(&self) -> Command {
        self.header.command
    }

    pub fn encoded_len(&self) -> usize {
        ENCAPSULATION_HEADER_LEN + self.data.len()
    }

    /// Serialize header and payload, checking the declared length
    pub fn encode(&self) -> EipResult<BytesMut> {
        if self.header.length as usize != self.data.len() {
            return Err(EipError::protocol(format!(
                "Header length {} does not match payload length {}",
                self.header.length,
                self.data.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.data);
        Ok(buf)
    }

    /// Decode a complete packet, as delivered in one datagram
    pub fn decode(bytes: &[u8]) -> EipResult<Self> {
        if bytes.len() < ENCAPSULATION_HEADER_LEN {
            return Err(EipError::protocol("Poorly formed EIP datagram"));
        }
        let mut reader = WireReader::new(bytes);
        let header = EncapsulationHeader::decode(&mut reader)?;
        if header.length as usize != reader.remaining() {
            return Err(EipError::protocol("Poorly formed EIP datagram"));
        }
        Ok(Self {
            header,
            data: Bytes::copy_from_slice(reader.read_rest()),
        })
    }

    /// Fail with the header status if it is non-zero
    pub fn check_status(&self) -> EipResult<()> {
        if self.header.status == ENCAP_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(EipError::Encapsulation {
                command: self.header.command.to_u16(),
                status: self.header.status,
            })
        }
    }

    /// CPF frame carried by this packet
    ///
    /// SendRRData and SendUnitData payloads start with interface handle and
    /// timeout, which are skipped. Other commands carry the frame directly.
    pub fn cpf(&self) -> EipResult<CpfFrame> {
        match self.header.command {
            Command::SendRRData | Command::SendUnitData => {
                let mut reader = WireReader::new(&self.data);
                reader.skip(SEND_DATA_PREFIX_LEN)?;
                CpfFrame::from_bytes(reader.read_rest())
            }
            _ => CpfFrame::from_bytes(&self.data),
        }
    }

    // ========================================================================
    // Packet factory
    // ========================================================================

    pub fn nop(data: Vec<u8>) -> EipResult<Self> {
        Self::new(Command::Nop, 0, data)
    }

    pub fn list_identity() -> Self {
        Self::bare(Command::ListIdentity, 0)
    }

    pub fn list_services() -> Self {
        Self::bare(Command::ListServices, 0)
    }

    pub fn list_interfaces() -> Self {
        Self::bare(Command::ListInterfaces, 0)
    }

    /// RegisterSession: protocol version 1, no options
    pub fn register_session() -> Self {
        let mut data = Vec::with_capacity(4);
        data.put_u16_le(ENCAPSULATION_PROTOCOL_VERSION);
        data.put_u16_le(0);
        Self {
            header: EncapsulationHeader::new(Command::RegisterSession, 4, 0),
            data: Bytes::from(data),
        }
    }

    pub fn unregister_session(session_handle: u32) -> Self {
        Self::bare(Command::UnregisterSession, session_handle)
    }

    /// Unconnected request/reply exchange
    pub fn send_rr_data(session_handle: u32, frame: &CpfFrame) -> EipResult<Self> {
        Self::new(
            Command::SendRRData,
            session_handle,
            Self::send_data_payload(frame)?,
        )
    }

    /// Connected exchange over an open CIP connection
    pub fn send_unit_data(session_handle: u32, frame: &CpfFrame) -> EipResult<Self> {
        Self::new(
            Command::SendUnitData,
            session_handle,
            Self::send_data_payload(frame)?,
        )
    }

    fn bare(command: Command, session_handle: u32) -> Self {
        Self {
            header: EncapsulationHeader::new(command, 0, session_handle),
            data: Bytes::new(),
        }
    }

    fn send_data_payload(frame: &CpfFrame) -> EipResult<Vec<u8>> {
        let mut data = Vec::with_capacity(SEND_DATA_PREFIX_LEN + frame.encoded_len());
        data.put_u32_le(0); // interface handle
        data.put_u16_le(0); // timeout
        frame.encode(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut header = EncapsulationHeader::new(Command::SendRRData, 0x0010, 0x12345678);
        header.sender_context = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), ENCAPSULATION_HEADER_LEN);
        assert_eq!(&buf[0..2], &[0x6F, 0x00]);
        assert_eq!(&buf[2..4], &[0x10, 0x00]);
        assert_eq!(&buf[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&buf[12..20], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let array: [u8; ENCAPSULATION_HEADER_LEN] = buf.as_slice().try_into().unwrap();
        assert_eq!(EncapsulationHeader::from_bytes(&array).unwrap(), header);
    }

    #[test]
    fn test_register_session_payload() {
        let packet = EncapsulationPacket::register_session();
        let bytes = packet.encode().unwrap();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &[0x65, 0x00, 0x04, 0x00]);
        assert_eq!(&bytes[24..], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut packet = EncapsulationPacket::nop(vec![1, 2, 3]).unwrap();
        packet.header.length = 2;
        assert!(matches!(
            packet.encode(),
            Err(EipError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_datagram_decode() {
        let packet = EncapsulationPacket::nop(vec![9, 9]).unwrap();
        let bytes = packet.encode().unwrap();
        assert_eq!(EncapsulationPacket::decode(&bytes).unwrap(), packet);

        assert!(EncapsulationPacket::decode(&bytes[..20]).is_err());
        assert!(EncapsulationPacket::decode(&bytes[..25]).is_err());
    }

    #[test]
    fn test_send_rr_data_skips_prefix() {
        let frame = CpfFrame::unconnected(vec![0x54, 0x02]);
        let packet = EncapsulationPacket::send_rr_data(0xAABBCCDD, &frame).unwrap();
        assert_eq!(packet.header.session_handle, 0xAABBCCDD);
        assert_eq!(&packet.data[..6], &[0; 6]);
        assert_eq!(packet.cpf().unwrap(), frame);
    }

    #[test]
    fn test_status_check() {
        let mut packet = EncapsulationPacket::list_identity();
        assert!(packet.check_status().is_ok());
        packet.header.status = ENCAP_STATUS_INVALID_SESSION_HANDLE;
        assert_eq!(
            packet.check_status().unwrap_err(),
            EipError::Encapsulation {
                command: CMD_LIST_IDENTITY,
                status: 0x64
            }
        );
        assert_eq!(packet.header.status().description(), "Invalid session handle");
    }

    #[test]
    fn test_command_codes_roundtrip() {
        for code in [0x0000, 0x0004, 0x0063, 0x0064, 0x0065, 0x0066, 0x006F, 0x0070, 0x0072, 0x0073, 0x1234] {
            assert_eq!(Command::from_u16(code).to_u16(), code);
        }
        assert_eq!(Command::from_u16(0x1234), Command::Other(0x1234));
    }
}
