//! Common Packet Format (CPF) items and frames
//!
//! A CPF frame is `count: u16` followed by `count` items, each
//! `{type_id: u16, length: u16, data}`. SendRRData and SendUnitData carry an
//! address item followed by a data item:
//!
//! | Exchange | Address item | Data item |
//! |----------|--------------|-----------|
//! | Unconnected (SendRRData) | Null `0x0000` | Unconnected data `0x00B2` |
//! | Connected (SendUnitData) | Connected address `0x00A1` | Connected data `0x00B1` |

use bytes::BufMut;

use crate::constants::{
    ITEM_CONNECTED_ADDRESS, ITEM_CONNECTED_DATA, ITEM_NULL_ADDRESS, ITEM_SEQUENCED_ADDRESS,
    ITEM_UNCONNECTED_DATA,
};
use crate::error::{EipError, EipResult};
use crate::wire::WireReader;

/// One CPF item; the wire length is always `data.len()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfItem {
    pub type_id: u16,
    pub data: Vec<u8>,
}

impl CpfItem {
    pub fn new(type_id: u16, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }

    /// Null address item (unconnected messages)
    pub fn null_address() -> Self {
        Self::new(ITEM_NULL_ADDRESS, Vec::new())
    }

    /// Connected address item carrying the O->T connection ID
    pub fn connected_address(connection_id: u32) -> Self {
        Self::new(ITEM_CONNECTED_ADDRESS, connection_id.to_le_bytes().to_vec())
    }

    /// Sequenced address item (connection ID + sequence count)
    pub fn sequenced_address(connection_id: u32, sequence: u32) -> Self {
        let mut data = Vec::with_capacity(8);
        data.put_u32_le(connection_id);
        data.put_u32_le(sequence);
        Self::new(ITEM_SEQUENCED_ADDRESS, data)
    }

    /// Connected data item wrapping an encoded connected-service request
    pub fn connected_data(data: Vec<u8>) -> Self {
        Self::new(ITEM_CONNECTED_DATA, data)
    }

    /// Unconnected data item wrapping an encoded message-router request
    pub fn unconnected_data(data: Vec<u8>) -> Self {
        Self::new(ITEM_UNCONNECTED_DATA, data)
    }

    /// Encoded size including the 4-byte item header
    pub fn encoded_len(&self) -> usize {
        4 + self.data.len()
    }

    /// Return the payload if this item has the expected type
    pub fn expect_type(&self, type_id: u16) -> EipResult<&[u8]> {
        if self.type_id != type_id {
            return Err(EipError::protocol(format!(
                "Expected CPF item 0x{:04X}, got 0x{:04X}",
                type_id, self.type_id
            )));
        }
        Ok(&self.data)
    }

    /// Connection ID of a connected address item
    pub fn connection_id(&self) -> EipResult<u32> {
        let mut reader = WireReader::new(self.expect_type(ITEM_CONNECTED_ADDRESS)?);
        let id = reader.read_u32()?;
        reader.finish("Connected address item")?;
        Ok(id)
    }

    /// Connection ID and sequence of a sequenced address item
    pub fn sequence(&self) -> EipResult<(u32, u32)> {
        let mut reader = WireReader::new(self.expect_type(ITEM_SEQUENCED_ADDRESS)?);
        let id = reader.read_u32()?;
        let seq = reader.read_u32()?;
        reader.finish("Sequenced address item")?;
        Ok((id, seq))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> EipResult<()> {
        let len = u16::try_from(self.data.len()).map_err(|_| {
            EipError::protocol(format!("CPF item too large: {} bytes", self.data.len()))
        })?;
        buf.put_u16_le(self.type_id);
        buf.put_u16_le(len);
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        let type_id = reader.read_u16()?;
        let len = reader.read_u16()? as usize;
        let data = reader.read_bytes(len)?.to_vec();
        Ok(Self { type_id, data })
    }
}

/// Ordered list of CPF items with a 16-bit count prefix
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpfFrame {
    pub items: Vec<CpfItem>,
}

impl CpfFrame {
    pub fn new(items: Vec<CpfItem>) -> Self {
        Self { items }
    }

    /// Null address + unconnected data
    pub fn unconnected(request: Vec<u8>) -> Self {
        Self::new(vec![CpfItem::null_address(), CpfItem::unconnected_data(request)])
    }

    /// Connected address + connected data
    pub fn connected(connection_id: u32, request: Vec<u8>) -> Self {
        Self::new(vec![
            CpfItem::connected_address(connection_id),
            CpfItem::connected_data(request),
        ])
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.items.iter().map(CpfItem::encoded_len).sum::<usize>()
    }

    /// Item at `index`, or a protocol violation if the frame is too short
    pub fn item(&self, index: usize) -> EipResult<&CpfItem> {
        self.items.get(index).ok_or_else(|| {
            EipError::protocol(format!(
                "CPF frame has {} items, item {} requested",
                self.items.len(),
                index
            ))
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> EipResult<()> {
        let count = u16::try_from(self.items.len())
            .map_err(|_| EipError::protocol("Too many CPF items"))?;
        buf.put_u16_le(count);
        for item in &self.items {
            item.encode(buf)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a frame that occupies exactly `data`
    pub fn from_bytes(data: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(data);
        let count = reader.read_u16()?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(CpfItem::decode(&mut reader)?);
        }
        reader.finish("CPF frame")?;
        Ok(Self { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_address_layout() {
        let mut buf = Vec::new();
        CpfItem::null_address().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_connected_frame_layout() {
        let frame = CpfFrame::connected(0x11223344, vec![0xAA, 0xBB]);
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x02, 0x00, // count
                0xA1, 0x00, 0x04, 0x00, 0x44, 0x33, 0x22, 0x11, // address
                0xB1, 0x00, 0x02, 0x00, 0xAA, 0xBB, // data
            ]
        );
        assert_eq!(bytes.len(), frame.encoded_len());
        assert_eq!(CpfFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_connection_id_extraction() {
        let frame = CpfFrame::connected(0xDEADBEEF, vec![]);
        assert_eq!(frame.item(0).unwrap().connection_id().unwrap(), 0xDEADBEEF);
        assert!(frame.item(1).unwrap().connection_id().is_err());
        assert!(frame.item(2).is_err());
    }

    #[test]
    fn test_sequenced_address() {
        let item = CpfItem::sequenced_address(7, 9);
        assert_eq!(item.sequence().unwrap(), (7, 9));
    }

    #[test]
    fn test_truncated_item_rejected() {
        // count = 1, item claims 4 bytes but carries 2
        let bytes = vec![0x01, 0x00, 0xB2, 0x00, 0x04, 0x00, 0x01, 0x02];
        assert!(CpfFrame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = CpfFrame::unconnected(vec![0x01]).to_bytes().unwrap();
        bytes.push(0x00);
        assert!(CpfFrame::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_empty_frame() {
        let frame = CpfFrame::default();
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x00, 0x00]);
        assert_eq!(CpfFrame::from_bytes(&bytes).unwrap(), frame);
    }
}
