//! # Logix Tag Codec
//!
//! Request builders for the Logix tag services and typed decoding of their
//! replies. Every read reply starts with the CIP data type of the tag:
//!
//! | Reply | Header | Payload |
//! |-------|--------|---------|
//! | Atomic | type (2) | value bytes |
//! | Structure | type `0x02A0` (2) + handle (2) | structure bytes |
//!
//! Logix STRING is a structure whose payload is `LEN: i32` followed by the
//! character data, padded to a multiple of four bytes.

use bytes::BufMut;

use crate::constants::{
    BOOL_TRUE, DATA_TYPE_BOOL, DATA_TYPE_BOOL_MASK, DATA_TYPE_DINT, DATA_TYPE_DWORD,
    DATA_TYPE_INT, DATA_TYPE_LINT, DATA_TYPE_REAL, DATA_TYPE_SINT, DATA_TYPE_STRUCT,
    SERVICE_READ_TAG, SERVICE_READ_TAG_FRAGMENTED, SERVICE_WRITE_TAG,
    SERVICE_WRITE_TAG_FRAGMENTED, WRITE_FRAGMENT_OVERHEAD,
};
use crate::error::{EipError, EipResult};
use crate::router::{MessageRouterRequest, MessageRouterResponse};
use crate::segment::parse_tag_path;
use crate::value::{TagType, TagValue};
use crate::wire::{i32_at, u16_at};

/// Header length of an atomic reply (data type)
pub const ATOMIC_HEADER_LEN: usize = 2;

/// Header length of a structure reply (data type + handle)
pub const STRUCT_HEADER_LEN: usize = 4;

/// Logix tag codec: request builders for the tag services.
pub struct LogixCodec;

// ============================================================================
// Data type checks
// ============================================================================

/// Data type tag at the start of a read reply
pub fn reply_data_type(reply: &[u8]) -> EipResult<u16> {
    u16_at(reply, 0)
}

/// Per-fragment header length for a reply of `data_type`
pub fn fragment_header_len(data_type: u16) -> usize {
    if data_type == DATA_TYPE_STRUCT {
        STRUCT_HEADER_LEN
    } else {
        ATOMIC_HEADER_LEN
    }
}

/// BOOL replies carry the bit number in the high byte, so only the mask bits
/// are compared. Packed BOOL arrays (DWORD) also satisfy the mask.
pub fn is_bool_type(data_type: u16) -> bool {
    data_type & DATA_TYPE_BOOL_MASK == DATA_TYPE_BOOL_MASK
}

/// Verify that `actual` is acceptable for a read of `tag_type`
pub fn check_data_type(tag_type: TagType, actual: u16) -> EipResult<()> {
    let ok = match tag_type {
        TagType::Bool => is_bool_type(actual),
        TagType::UInt32 => actual == DATA_TYPE_DINT || actual == DATA_TYPE_DWORD,
        other => actual == other.data_type(),
    };
    if ok {
        Ok(())
    } else {
        Err(EipError::BadType {
            expected: tag_type.data_type(),
            actual,
        })
    }
}

// ============================================================================
// Typed decoding
// ============================================================================

fn value_bytes<const N: usize>(reply: &[u8]) -> EipResult<[u8; N]> {
    reply
        .get(ATOMIC_HEADER_LEN..ATOMIC_HEADER_LEN + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            EipError::protocol(format!(
                "Reply too short for a {}-byte value: {} bytes",
                N,
                reply.len()
            ))
        })
}

/// Decode a ReadTag reply (`type + value`) as `tag_type`.
///
/// A data type that does not match the request yields `BadType`.
pub fn decode_tag_value(tag_type: TagType, reply: &[u8]) -> EipResult<TagValue> {
    let data_type = reply_data_type(reply)?;
    check_data_type(tag_type, data_type)?;

    let value = match tag_type {
        TagType::Bool => TagValue::Bool(value_bytes::<1>(reply)?[0] > 0),
        TagType::UInt8 => TagValue::U8(value_bytes::<1>(reply)?[0]),
        TagType::Int8 => TagValue::I8(value_bytes::<1>(reply)?[0] as i8),
        TagType::UInt16 => TagValue::U16(u16::from_le_bytes(value_bytes(reply)?)),
        TagType::Int16 => TagValue::I16(i16::from_le_bytes(value_bytes(reply)?)),
        TagType::UInt32 => TagValue::U32(u32::from_le_bytes(value_bytes(reply)?)),
        TagType::Int32 => TagValue::I32(i32::from_le_bytes(value_bytes(reply)?)),
        TagType::UInt64 => TagValue::U64(u64::from_le_bytes(value_bytes(reply)?)),
        TagType::Int64 => TagValue::I64(i64::from_le_bytes(value_bytes(reply)?)),
        TagType::Single => TagValue::F32(f32::from_le_bytes(value_bytes(reply)?)),
        TagType::Double => TagValue::F64(f64::from_bits(u64::from_le_bytes(value_bytes(reply)?))),
        TagType::String => TagValue::String(decode_logix_string(&reply[STRUCT_HEADER_LEN.min(reply.len())..])?),
    };
    Ok(value)
}

/// Structure handle from a structure read reply
pub fn decode_structure_handle(reply: &[u8]) -> EipResult<u16> {
    let data_type = reply_data_type(reply)?;
    if data_type != DATA_TYPE_STRUCT {
        return Err(EipError::BadType {
            expected: DATA_TYPE_STRUCT,
            actual: data_type,
        });
    }
    u16_at(reply, 2)
}

/// Concatenate the payloads of a fragmented read, checking every fragment's
/// data type against `tag_type`.
pub fn reassemble_fragments(
    tag_type: TagType,
    fragments: &[MessageRouterResponse],
) -> EipResult<Vec<u8>> {
    let mut buffer = Vec::new();
    for fragment in fragments {
        let data_type = reply_data_type(&fragment.data)?;
        check_data_type(tag_type, data_type)?;
        buffer.extend_from_slice(fragment_payload(&fragment.data, data_type)?);
    }
    Ok(buffer)
}

/// Concatenate the payloads of a fragmented structure read
pub fn reassemble_struct_fragments(fragments: &[MessageRouterResponse]) -> EipResult<Vec<u8>> {
    let mut buffer = Vec::new();
    for fragment in fragments {
        let data_type = reply_data_type(&fragment.data)?;
        if data_type != DATA_TYPE_STRUCT {
            return Err(EipError::BadType {
                expected: DATA_TYPE_STRUCT,
                actual: data_type,
            });
        }
        buffer.extend_from_slice(fragment_payload(&fragment.data, data_type)?);
    }
    Ok(buffer)
}

/// Reply data minus its type header
pub fn fragment_payload(reply: &[u8], data_type: u16) -> EipResult<&[u8]> {
    let header = fragment_header_len(data_type);
    reply.get(header..).ok_or_else(|| {
        EipError::protocol(format!(
            "Fragment shorter than its {}-byte header: {} bytes",
            header,
            reply.len()
        ))
    })
}

// ============================================================================
// Logix STRING
// ============================================================================

/// Decode a STRING structure payload (`LEN: i32` + characters)
pub fn decode_logix_string(payload: &[u8]) -> EipResult<String> {
    let len = i32_at(payload, 0)?;
    let len = usize::try_from(len)
        .map_err(|_| EipError::protocol(format!("Negative STRING length {}", len)))?;
    let chars = payload.get(4..4 + len).ok_or_else(|| {
        EipError::protocol(format!(
            "STRING length {} exceeds payload of {} bytes",
            len,
            payload.len().saturating_sub(4)
        ))
    })?;
    Ok(String::from_utf8_lossy(chars).into_owned())
}

/// Encode a STRING structure of capacity `max_len`.
///
/// The value is truncated to `max_len` characters; the character area is
/// NUL-filled and padded to a multiple of four bytes.
pub fn encode_logix_string(value: &str, max_len: usize) -> EipResult<Vec<u8>> {
    if !value.is_ascii() {
        return Err(EipError::client("STRING values must be ASCII"));
    }
    let len = value.len().min(max_len);
    let len_field = i32::try_from(len)
        .map_err(|_| EipError::client(format!("STRING length {} out of range", len)))?;
    let padded = max_len.div_ceil(4) * 4;

    let mut buf = Vec::with_capacity(4 + padded);
    buf.put_i32_le(len_field);
    buf.put_slice(&value.as_bytes()[..len]);
    buf.resize(4 + padded, 0);
    Ok(buf)
}

// ============================================================================
// Arrays
// ============================================================================

/// Number of 32-bit words holding `count` packed BOOLs
pub fn bool_word_count(count: usize) -> usize {
    count.div_ceil(32)
}

/// Unpack LSB-first BOOLs, keeping the first `count`
pub fn unpack_bools(bytes: &[u8], count: usize) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .take(count)
        .collect()
}

/// Split a little-endian byte buffer into `N`-byte elements
pub fn decode_elements<T, const N: usize>(bytes: &[u8], from_le: fn([u8; N]) -> T) -> EipResult<Vec<T>> {
    if bytes.len() % N != 0 {
        return Err(EipError::protocol(format!(
            "Array payload of {} bytes is not a multiple of {}",
            bytes.len(),
            N
        )));
    }
    Ok(bytes
        .chunks_exact(N)
        .map(|chunk| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(chunk);
            from_le(raw)
        })
        .collect())
}

/// Concatenate little-endian element bytes
pub fn encode_elements<T: Copy, const N: usize>(values: &[T], to_le: fn(T) -> [u8; N]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * N);
    for value in values {
        buf.put_slice(&to_le(*value));
    }
    buf
}

/// Split a structure-array buffer into `count` equal elements
pub fn split_structs(bytes: &[u8], count: usize) -> EipResult<Vec<Vec<u8>>> {
    if count == 0 || bytes.len() % count != 0 {
        return Err(EipError::protocol(format!(
            "Structure payload of {} bytes does not split into {} elements",
            bytes.len(),
            count
        )));
    }
    Ok(bytes.chunks_exact(bytes.len() / count).map(<[u8]>::to_vec).collect())
}

/// Element size of a writable atomic data type
pub fn element_size_for(data_type: u16) -> EipResult<usize> {
    match data_type {
        DATA_TYPE_SINT => Ok(1),
        DATA_TYPE_INT => Ok(2),
        DATA_TYPE_DINT | DATA_TYPE_DWORD | DATA_TYPE_REAL => Ok(4),
        DATA_TYPE_LINT => Ok(8),
        other => Err(EipError::client(format!(
            "Data type 0x{:04X} has no fixed element size",
            other
        ))),
    }
}

/// Largest write fragment for a connection, rounded down to `element_size`
pub fn max_write_fragment(connection_size: u16, path_words: u8, element_size: usize) -> EipResult<usize> {
    let raw = (connection_size as usize).saturating_sub(WRITE_FRAGMENT_OVERHEAD + path_words as usize * 2);
    let max = raw - raw % element_size.max(1);
    if max == 0 {
        return Err(EipError::client(format!(
            "Connection size {} leaves no room for write data",
            connection_size
        )));
    }
    Ok(max)
}

// ============================================================================
// Request builders
// ============================================================================

impl LogixCodec {
    /// ReadTag: `elements(2)`
    pub fn read_tag(tag: &str, elements: u16) -> EipResult<MessageRouterRequest> {
        MessageRouterRequest::new(SERVICE_READ_TAG, parse_tag_path(tag)?, elements.to_le_bytes().to_vec())
    }

    /// ReadTagFragmented: `elements(2) offset(4)`
    pub fn read_tag_fragmented(tag: &str, elements: u16, offset: u32) -> EipResult<MessageRouterRequest> {
        let mut data = Vec::with_capacity(6);
        data.put_u16_le(elements);
        data.put_u32_le(offset);
        MessageRouterRequest::new(SERVICE_READ_TAG_FRAGMENTED, parse_tag_path(tag)?, data)
    }

    /// WriteTag: `type(2) elements(2) value`
    pub fn write_tag(tag: &str, data_type: u16, elements: u16, value: &[u8]) -> EipResult<MessageRouterRequest> {
        let mut data = Vec::with_capacity(4 + value.len());
        data.put_u16_le(data_type);
        data.put_u16_le(elements);
        data.put_slice(value);
        MessageRouterRequest::new(SERVICE_WRITE_TAG, parse_tag_path(tag)?, data)
    }

    /// Single-element write of a typed value
    pub fn write_value(tag: &str, value: &TagValue) -> EipResult<MessageRouterRequest> {
        let (data_type, bytes): (u16, Vec<u8>) = match value {
            TagValue::Bool(v) => (DATA_TYPE_BOOL, vec![if *v { BOOL_TRUE } else { 0x00 }]),
            TagValue::U8(v) => (DATA_TYPE_SINT, vec![*v]),
            TagValue::I8(v) => (DATA_TYPE_SINT, vec![*v as u8]),
            TagValue::U16(v) => (DATA_TYPE_INT, v.to_le_bytes().to_vec()),
            TagValue::I16(v) => (DATA_TYPE_INT, v.to_le_bytes().to_vec()),
            TagValue::U32(v) => (DATA_TYPE_DINT, v.to_le_bytes().to_vec()),
            TagValue::I32(v) => (DATA_TYPE_DINT, v.to_le_bytes().to_vec()),
            TagValue::U64(v) => (DATA_TYPE_LINT, v.to_le_bytes().to_vec()),
            TagValue::I64(v) => (DATA_TYPE_LINT, v.to_le_bytes().to_vec()),
            TagValue::F32(v) => (DATA_TYPE_REAL, v.to_le_bytes().to_vec()),
            TagValue::F64(v) => (DATA_TYPE_LINT, v.to_bits().to_le_bytes().to_vec()),
            TagValue::String(_) => {
                return Err(EipError::client("STRING values are written as structures"));
            }
        };
        Self::write_tag(tag, data_type, 1, &bytes)
    }

    /// WriteTagFragmented frame for an atomic array:
    /// `type(2) elements(2) offset(4) bytes`
    pub fn write_fragment_data(data_type: u16, elements: u16, offset: u32, bytes: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(8 + bytes.len());
        data.put_u16_le(data_type);
        data.put_u16_le(elements);
        data.put_u32_le(offset);
        data.put_slice(bytes);
        data
    }

    /// WriteTagFragmented frame for a structure:
    /// `0x02A0(2) handle(2) elements=1(2) offset(4) bytes`
    pub fn write_struct_fragment_data(handle: u16, offset: u32, bytes: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(10 + bytes.len());
        data.put_u16_le(DATA_TYPE_STRUCT);
        data.put_u16_le(handle);
        data.put_u16_le(1);
        data.put_u32_le(offset);
        data.put_slice(bytes);
        data
    }

    /// Empty WriteTagFragmented request whose data the frame producer fills
    pub fn write_tag_fragmented(tag: &str) -> EipResult<MessageRouterRequest> {
        MessageRouterRequest::new(SERVICE_WRITE_TAG_FRAGMENTED, parse_tag_path(tag)?, Vec::new())
    }
}

// ============================================================================
// Write frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameHeader {
    Atomic { data_type: u16, elements: u16 },
    Structure { handle: u16 },
}

/// Lazy sequence of WriteTagFragmented request payloads.
///
/// Each frame carries at most `max_frame` bytes of the buffer and its own
/// running byte offset. The sequence is finite and cannot be restarted.
#[derive(Debug)]
pub struct WriteFrames<'a> {
    header: FrameHeader,
    bytes: &'a [u8],
    offset: usize,
    max_frame: usize,
}

impl<'a> WriteFrames<'a> {
    /// Frames for an atomic array of `elements` values of `data_type`
    pub fn atomic(data_type: u16, elements: u16, bytes: &'a [u8], max_frame: usize) -> Self {
        Self {
            header: FrameHeader::Atomic { data_type, elements },
            bytes,
            offset: 0,
            max_frame,
        }
    }

    /// Frames for one structure value
    pub fn structure(handle: u16, bytes: &'a [u8], max_frame: usize) -> Self {
        Self {
            header: FrameHeader::Structure { handle },
            bytes,
            offset: 0,
            max_frame,
        }
    }

    /// Bytes not yet handed out
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

impl Iterator for WriteFrames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.remaining() == 0 || self.max_frame == 0 {
            return None;
        }
        let take = self.remaining().min(self.max_frame);
        let chunk = &self.bytes[self.offset..self.offset + take];
        let offset = self.offset as u32;
        self.offset += take;
        Some(match self.header {
            FrameHeader::Atomic { data_type, elements } => {
                LogixCodec::write_fragment_data(data_type, elements, offset, chunk)
            }
            FrameHeader::Structure { handle } => LogixCodec::write_struct_fragment_data(handle, offset, chunk),
        })
    }
}
