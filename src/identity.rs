//! Device identity and service records (ListIdentity / ListServices)
//!
//! ## Identity item (type 0x000C)
//!
//! | Field | Size | Byte order |
//! |-------|------|------------|
//! | Encapsulation protocol version | 2 | LE |
//! | Socket address | 16 | see [`SockAddr`] |
//! | Vendor ID | 2 | LE |
//! | Device type | 2 | LE |
//! | Product code | 2 | LE |
//! | Revision (major, minor) | 2 | - |
//! | Status | 2 | LE |
//! | Serial number | 4 | LE |
//! | Product name | 1 + n | length-prefixed ASCII |
//! | State | 1 | - |

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::BufMut;

use crate::constants::{ITEM_IDENTITY, ITEM_LIST_SERVICES};
use crate::cpf::{CpfFrame, CpfItem};
use crate::error::{EipError, EipResult};
use crate::wire::WireReader;

/// AF_INET as carried in socket address items
pub const AF_INET: i16 = 2;

/// Encoded size of [`SockAddr`]
pub const SOCKADDR_LEN: usize = 16;

/// Smallest identity item: fixed fields, empty product name, state
pub const IDENTITY_MIN_LEN: usize = 34;

const SERVICE_NAME_LEN: usize = 16;
const CAPABILITY_CIP_OVER_TCP: u16 = 1 << 5;
const CAPABILITY_CIP_OVER_UDP: u16 = 1 << 8;

// ============================================================================
// Socket address
// ============================================================================

/// `sockaddr_in` as embedded in identity items
///
/// Family and port are big-endian; the address keeps its octet order; the
/// eight zero bytes are written in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub family: i16,
    pub port: u16,
    pub addr: Ipv4Addr,
    pub zero: [u8; 8],
}

impl SockAddr {
    pub const ZERO: SockAddr = SockAddr {
        family: 0,
        port: 0,
        addr: Ipv4Addr::UNSPECIFIED,
        zero: [0; 8],
    };

    pub fn to_socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.addr, self.port)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i16(self.family);
        buf.put_u16(self.port);
        buf.put_slice(&self.addr.octets());
        for byte in self.zero.iter().rev() {
            buf.put_u8(*byte);
        }
    }

    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        let family = reader.read_i16_be()?;
        let port = reader.read_u16_be()?;
        let addr = Ipv4Addr::from(reader.read_array::<4>()?);
        let mut zero: [u8; 8] = reader.read_array()?;
        zero.reverse();
        Ok(Self {
            family,
            port,
            addr,
            zero,
        })
    }
}

impl From<SocketAddrV4> for SockAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            family: AF_INET,
            port: addr.port(),
            addr: *addr.ip(),
            zero: [0; 8],
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Device revision; the low byte of the word is the major revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.major, self.minor)
    }
}

/// Device identity as returned by ListIdentity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub protocol_version: u16,
    pub socket_address: SockAddr,
    pub vendor_id: u16,
    pub device_type: u16,
    pub product_code: u16,
    pub revision: Revision,
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
    pub state: u8,
}

impl Identity {
    pub fn to_cpf_item(&self) -> EipResult<CpfItem> {
        let name_len = u8::try_from(self.product_name.len())
            .ok()
            .filter(|_| self.product_name.is_ascii())
            .ok_or_else(|| EipError::protocol("Product name must be ASCII and under 256 bytes"))?;

        let mut buf = Vec::with_capacity(IDENTITY_MIN_LEN + self.product_name.len());
        buf.put_u16_le(self.protocol_version);
        self.socket_address.encode(&mut buf);
        buf.put_u16_le(self.vendor_id);
        buf.put_u16_le(self.device_type);
        buf.put_u16_le(self.product_code);
        buf.put_u8(self.revision.major);
        buf.put_u8(self.revision.minor);
        buf.put_u16_le(self.status);
        buf.put_u32_le(self.serial_number);
        buf.put_u8(name_len);
        buf.put_slice(self.product_name.as_bytes());
        buf.put_u8(self.state);
        Ok(CpfItem::new(ITEM_IDENTITY, buf))
    }

    pub fn from_cpf_item(item: &CpfItem) -> EipResult<Self> {
        let data = item.expect_type(ITEM_IDENTITY)?;
        if data.len() < IDENTITY_MIN_LEN {
            return Err(EipError::protocol(format!(
                "Identity item must be at least {} bytes, got {}",
                IDENTITY_MIN_LEN,
                data.len()
            )));
        }

        let mut reader = WireReader::new(data);
        let protocol_version = reader.read_u16()?;
        let socket_address = SockAddr::decode(&mut reader)?;
        let vendor_id = reader.read_u16()?;
        let device_type = reader.read_u16()?;
        let product_code = reader.read_u16()?;
        let revision = Revision {
            major: reader.read_u8()?,
            minor: reader.read_u8()?,
        };
        let status = reader.read_u16()?;
        let serial_number = reader.read_u32()?;
        let name_len = reader.read_u8()? as usize;
        let product_name = String::from_utf8_lossy(reader.read_bytes(name_len)?).into_owned();
        let state = reader.read_u8()?;
        reader.finish("Identity item")?;

        Ok(Self {
            protocol_version,
            socket_address,
            vendor_id,
            device_type,
            product_code,
            revision,
            status,
            serial_number,
            product_name,
            state,
        })
    }

    /// Every identity item in a ListIdentity reply
    pub fn list_from_frame(frame: &CpfFrame) -> EipResult<Vec<Self>> {
        frame
            .items
            .iter()
            .filter(|item| item.type_id == ITEM_IDENTITY)
            .map(Self::from_cpf_item)
            .collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rev {} (vendor 0x{:04X}, type 0x{:04X}, product 0x{:04X}, serial {:08X}) at {}",
            self.product_name,
            self.revision,
            self.vendor_id,
            self.device_type,
            self.product_code,
            self.serial_number,
            self.socket_address
        )
    }
}

// ============================================================================
// Services
// ============================================================================

/// One entry of a ListServices reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub type_id: u16,
    pub protocol_version: u16,
    pub capability: u16,
    pub name: String,
}

impl ServiceInfo {
    /// The "Communications" service every EtherNet/IP device advertises
    pub fn communications() -> Self {
        Self {
            type_id: ITEM_LIST_SERVICES,
            protocol_version: 1,
            capability: CAPABILITY_CIP_OVER_TCP | CAPABILITY_CIP_OVER_UDP,
            name: "Communications".to_string(),
        }
    }

    pub fn supports_cip_over_tcp(&self) -> bool {
        self.capability & CAPABILITY_CIP_OVER_TCP != 0
    }

    pub fn set_cip_over_tcp(&mut self, enabled: bool) {
        if enabled {
            self.capability |= CAPABILITY_CIP_OVER_TCP;
        } else {
            self.capability &= !CAPABILITY_CIP_OVER_TCP;
        }
    }

    pub fn supports_cip_over_udp(&self) -> bool {
        self.capability & CAPABILITY_CIP_OVER_UDP != 0
    }

    pub fn set_cip_over_udp(&mut self, enabled: bool) {
        if enabled {
            self.capability |= CAPABILITY_CIP_OVER_UDP;
        } else {
            self.capability &= !CAPABILITY_CIP_OVER_UDP;
        }
    }

    /// Encode; the name is NUL-padded or truncated to 16 bytes
    pub fn to_cpf_item(&self) -> CpfItem {
        let mut buf = Vec::with_capacity(4 + SERVICE_NAME_LEN);
        buf.put_u16_le(self.protocol_version);
        buf.put_u16_le(self.capability);
        let mut name = [0u8; SERVICE_NAME_LEN];
        for (dst, src) in name.iter_mut().zip(self.name.bytes()) {
            *dst = src;
        }
        buf.put_slice(&name);
        CpfItem::new(self.type_id, buf)
    }

    pub fn from_cpf_item(item: &CpfItem) -> EipResult<Self> {
        let mut reader = WireReader::new(&item.data);
        let protocol_version = reader.read_u16()?;
        let capability = reader.read_u16()?;
        let raw = reader.read_bytes(SERVICE_NAME_LEN)?;
        let name = String::from_utf8_lossy(raw)
            .trim_end_matches(['\0', ' '])
            .to_string();
        Ok(Self {
            type_id: item.type_id,
            protocol_version,
            capability,
            name,
        })
    }

    pub fn list_from_frame(frame: &CpfFrame) -> EipResult<Vec<Self>> {
        frame.items.iter().map(Self::from_cpf_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_identity() -> Identity {
        Identity {
            protocol_version: 1,
            socket_address: SockAddr::from(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 44818)),
            vendor_id: 1,
            device_type: 0x0E,
            product_code: 0x0037,
            revision: Revision { major: 20, minor: 11 },
            status: 0x0030,
            serial_number: 0x00C0FFEE,
            product_name: "1756-L61/B LOGIX5561".to_string(),
            state: 3,
        }
    }

    #[test]
    fn test_sockaddr_byte_order() {
        let mut addr = SockAddr::from(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 44818));
        addr.zero = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        assert_eq!(buf.len(), SOCKADDR_LEN);
        assert_eq!(&buf[0..2], &[0x00, 0x02]);
        assert_eq!(&buf[2..4], &[0xAF, 0x12]);
        assert_eq!(&buf[4..8], &[10, 1, 2, 3]);
        assert_eq!(&buf[8..16], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(SockAddr::decode(&mut WireReader::new(&buf)).unwrap(), addr);
    }

    #[test]
    fn test_identity_roundtrip() {
        let identity = sample_identity();
        let item = identity.to_cpf_item().unwrap();
        assert_eq!(item.type_id, ITEM_IDENTITY);
        assert_eq!(item.data.len(), IDENTITY_MIN_LEN + identity.product_name.len());
        assert_eq!(Identity::from_cpf_item(&item).unwrap(), identity);
    }

    #[test]
    fn test_identity_empty_name() {
        let mut identity = sample_identity();
        identity.product_name.clear();
        let item = identity.to_cpf_item().unwrap();
        assert_eq!(item.data.len(), IDENTITY_MIN_LEN);
        assert_eq!(Identity::from_cpf_item(&item).unwrap(), identity);
    }

    #[test]
    fn test_identity_too_short() {
        let item = CpfItem::new(ITEM_IDENTITY, vec![0; 20]);
        assert!(Identity::from_cpf_item(&item).is_err());
        let wrong_type = CpfItem::new(0x00B2, vec![0; 40]);
        assert!(Identity::from_cpf_item(&wrong_type).is_err());
    }

    #[test]
    fn test_identity_name_length_must_fit() {
        let mut item = sample_identity().to_cpf_item().unwrap();
        item.data.pop();
        assert!(Identity::from_cpf_item(&item).is_err());
    }

    #[test]
    fn test_revision_word_order() {
        let item = sample_identity().to_cpf_item().unwrap();
        // version(2) + sockaddr(16) + vendor(2) + type(2) + product(2)
        assert_eq!(&item.data[24..26], &[20, 11]);
    }

    #[test]
    fn test_service_capabilities() {
        let service = ServiceInfo::communications();
        assert!(service.supports_cip_over_tcp());
        assert!(service.supports_cip_over_udp());

        let item = service.to_cpf_item();
        assert_eq!(item.data.len(), 20);
        assert_eq!(&item.data[2..4], &[0x20, 0x01]);
        assert_eq!(ServiceInfo::from_cpf_item(&item).unwrap(), service);

        let mut tcp_only = service.clone();
        tcp_only.set_cip_over_udp(false);
        assert!(!tcp_only.supports_cip_over_udp());
        assert_eq!(tcp_only.capability, 0x0020);
    }

    #[test]
    fn test_service_name_truncated() {
        let mut service = ServiceInfo::communications();
        service.name = "A very long service name".to_string();
        let decoded = ServiceInfo::from_cpf_item(&service.to_cpf_item()).unwrap();
        assert_eq!(decoded.name, "A very long serv");
    }
}
