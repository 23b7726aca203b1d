//! # CIP Path Segments
//!
//! A CIP request path is an ordered list of segments, each introduced by one
//! type-selector byte. Four encodings are supported:
//!
//! | Segment | Layout | Length |
//! |---------|--------|--------|
//! | 8-bit logical / port | `[selector, value]` | 2 |
//! | 16-bit logical | `[selector, 0, value LE16]` | 4 |
//! | 32-bit logical | `[selector, 0, value LE32]` | 6 |
//! | ANSI extended symbolic | `[0x91, len, ascii.., pad?]` | `2 + len + len % 2` |
//!
//! Route segments reuse the 8-bit layout: the port byte (any value) is the
//! selector and the link address (slot) the value. Only selectors 0x00-0x0F
//! decode back as ports.
//!
//! Paths are always an even number of bytes; the word count is what request
//! headers declare.
//!
//! ## Tag paths
//!
//! [`parse_tag_path`] turns `Program:Main.Motors[12].Speed` into symbolic
//! segments, emitting an element segment after every bracketed index.

use bytes::BufMut;

use crate::error::{EipError, EipResult};
use crate::wire::WireReader;

/// Selector byte of an ANSI extended symbolic segment
pub const SEGMENT_SYMBOLIC_EXTENDED: u8 = 0x91;

/// Highest selector that decodes as a port segment
pub const SEGMENT_PORT_MAX: u8 = 0x0F;

const LOGICAL_SEGMENT: u8 = 0x20;
const LOGICAL_SEGMENT_MASK: u8 = 0xE0;
const LOGICAL_TYPE_MASK: u8 = 0x1C;
const LOGICAL_FORMAT_MASK: u8 = 0x03;

/// Logical segment types (bits 2-4 of the selector)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Class,
    Instance,
    Element,
    ConnectionPoint,
    Attribute,
}

impl LogicalType {
    /// Selector of the 8-bit form; OR in 1 for 16-bit and 2 for 32-bit
    pub const fn base_selector(self) -> u8 {
        match self {
            LogicalType::Class => 0x20,
            LogicalType::Instance => 0x24,
            LogicalType::Element => 0x28,
            LogicalType::ConnectionPoint => 0x2C,
            LogicalType::Attribute => 0x30,
        }
    }

    fn from_type_bits(bits: u8) -> Option<Self> {
        match bits {
            0x00 => Some(LogicalType::Class),
            0x04 => Some(LogicalType::Instance),
            0x08 => Some(LogicalType::Element),
            0x0C => Some(LogicalType::ConnectionPoint),
            0x10 => Some(LogicalType::Attribute),
            _ => None,
        }
    }
}

/// What a numeric segment addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    /// Port segment; the port byte is written as the selector unchanged
    Port(u8),
    Logical(LogicalType),
}

impl SegmentKind {
    fn selector(self, format: u8) -> EipResult<u8> {
        match self {
            SegmentKind::Port(port) if format == 0 => Ok(port),
            SegmentKind::Port(port) => Err(EipError::protocol(format!(
                "Port {} cannot be encoded as a {}-bit segment",
                port,
                8 << format
            ))),
            SegmentKind::Logical(kind) => Ok(kind.base_selector() | format),
        }
    }
}

/// One element of a CIP request path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Logical8 { kind: SegmentKind, value: u8 },
    Logical16 { kind: SegmentKind, value: u16 },
    Logical32 { kind: SegmentKind, value: u32 },
    SymbolicExtended { name: String },
}

impl PathSegment {
    /// 8-bit class segment
    pub fn class(class: u8) -> Self {
        PathSegment::Logical8 {
            kind: SegmentKind::Logical(LogicalType::Class),
            value: class,
        }
    }

    /// 8-bit instance segment
    pub fn instance(instance: u8) -> Self {
        PathSegment::Logical8 {
            kind: SegmentKind::Logical(LogicalType::Instance),
            value: instance,
        }
    }

    /// 8-bit attribute segment
    pub fn attribute(attribute: u8) -> Self {
        PathSegment::Logical8 {
            kind: SegmentKind::Logical(LogicalType::Attribute),
            value: attribute,
        }
    }

    /// Route segment: backplane port plus link address (slot), two raw bytes
    pub fn port(port: u8, link: u8) -> Self {
        PathSegment::Logical8 {
            kind: SegmentKind::Port(port),
            value: link,
        }
    }

    /// Element segment sized to the smallest encoding that holds `index`
    pub fn element(index: u32) -> Self {
        let kind = SegmentKind::Logical(LogicalType::Element);
        if let Ok(value) = u8::try_from(index) {
            PathSegment::Logical8 { kind, value }
        } else if let Ok(value) = u16::try_from(index) {
            PathSegment::Logical16 { kind, value }
        } else {
            PathSegment::Logical32 { kind, value: index }
        }
    }

    /// ANSI extended symbolic segment
    pub fn symbolic<S: Into<String>>(name: S) -> Self {
        PathSegment::SymbolicExtended { name: name.into() }
    }

    /// Number of bytes this segment occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            PathSegment::Logical8 { .. } => 2,
            PathSegment::Logical16 { .. } => 4,
            PathSegment::Logical32 { .. } => 6,
            PathSegment::SymbolicExtended { name } => 2 + name.len() + name.len() % 2,
        }
    }

    /// Append the encoded segment to `buf`
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> EipResult<()> {
        match self {
            PathSegment::Logical8 { kind, value } => {
                buf.put_u8(kind.selector(0)?);
                buf.put_u8(*value);
            }
            PathSegment::Logical16 { kind, value } => {
                buf.put_u8(kind.selector(1)?);
                buf.put_u8(0);
                buf.put_u16_le(*value);
            }
            PathSegment::Logical32 { kind, value } => {
                buf.put_u8(kind.selector(2)?);
                buf.put_u8(0);
                buf.put_u32_le(*value);
            }
            PathSegment::SymbolicExtended { name } => {
                if name.is_empty() {
                    return Err(EipError::protocol("Symbolic segment name is empty"));
                }
                if !name.is_ascii() {
                    return Err(EipError::protocol(format!(
                        "Symbolic segment name is not ASCII: {}",
                        name
                    )));
                }
                let len = u8::try_from(name.len()).map_err(|_| {
                    EipError::protocol(format!(
                        "Symbolic segment name too long: {} bytes",
                        name.len()
                    ))
                })?;
                buf.put_u8(SEGMENT_SYMBOLIC_EXTENDED);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
                if len % 2 == 1 {
                    buf.put_u8(0);
                }
            }
        }
        Ok(())
    }

    /// Decode one segment, dispatching on the selector byte
    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        let selector = reader.read_u8()?;

        if selector <= SEGMENT_PORT_MAX {
            let value = reader.read_u8()?;
            return Ok(PathSegment::Logical8 {
                kind: SegmentKind::Port(selector),
                value,
            });
        }

        if selector == SEGMENT_SYMBOLIC_EXTENDED {
            let len = reader.read_u8()? as usize;
            let raw = reader.read_bytes(len)?;
            if len % 2 == 1 {
                reader.skip(1)?;
            }
            let name = std::str::from_utf8(raw)
                .ok()
                .filter(|s| s.is_ascii())
                .ok_or_else(|| EipError::protocol("Symbolic segment name is not ASCII"))?;
            return Ok(PathSegment::SymbolicExtended {
                name: name.to_string(),
            });
        }

        if selector & LOGICAL_SEGMENT_MASK == LOGICAL_SEGMENT {
            if let Some(logical) = LogicalType::from_type_bits(selector & LOGICAL_TYPE_MASK) {
                let kind = SegmentKind::Logical(logical);
                match selector & LOGICAL_FORMAT_MASK {
                    0 => {
                        let value = reader.read_u8()?;
                        return Ok(PathSegment::Logical8 { kind, value });
                    }
                    1 => {
                        reader.skip(1)?;
                        let value = reader.read_u16()?;
                        return Ok(PathSegment::Logical16 { kind, value });
                    }
                    2 => {
                        reader.skip(1)?;
                        let value = reader.read_u32()?;
                        return Ok(PathSegment::Logical32 { kind, value });
                    }
                    _ => {}
                }
            }
        }

        Err(EipError::protocol(format!(
            "Unexpected segment encoding 0x{:02X}",
            selector
        )))
    }
}

// ============================================================================
// Whole paths
// ============================================================================

/// Encoded length of a path in bytes
pub fn path_len(path: &[PathSegment]) -> usize {
    path.iter().map(PathSegment::encoded_len).sum()
}

/// Encoded length of a path in 16-bit words, as declared in request headers
pub fn path_words(path: &[PathSegment]) -> EipResult<u8> {
    let len = path_len(path);
    u8::try_from(len / 2)
        .map_err(|_| EipError::protocol(format!("Path too long: {} bytes", len)))
}

/// Encode a path, checking it against the word count the caller will declare
pub fn encode_path<B: BufMut>(
    path: &[PathSegment],
    declared_words: u8,
    buf: &mut B,
) -> EipResult<()> {
    let actual = path_len(path);
    if actual != declared_words as usize * 2 {
        return Err(EipError::protocol(format!(
            "Path size {} words does not match encoded path of {} bytes",
            declared_words, actual
        )));
    }
    for segment in path {
        segment.encode(buf)?;
    }
    Ok(())
}

/// Encode a path on its own
pub fn path_to_bytes(path: &[PathSegment]) -> EipResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(path_len(path));
    encode_path(path, path_words(path)?, &mut buf)?;
    Ok(buf)
}

/// Decode a path that occupies exactly `data`
pub fn decode_path(data: &[u8]) -> EipResult<Vec<PathSegment>> {
    let mut reader = WireReader::new(data);
    let mut path = Vec::new();
    while !reader.is_empty() {
        path.push(PathSegment::decode(&mut reader)?);
    }
    Ok(path)
}

// ============================================================================
// Tag names
// ============================================================================

fn is_tag_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b':'
}

/// Parse a dotted Logix tag name into a request path
///
/// Each dot-separated member becomes a symbolic segment. A trailing `[n]`
/// adds an element segment sized to fit `n`.
///
/// # Example
///
/// ```rust
/// use logix_eip::segment::{parse_tag_path, PathSegment};
///
/// let path = parse_tag_path("Line1.Counts[300]").unwrap();
/// assert_eq!(path, vec![
///     PathSegment::symbolic("Line1"),
///     PathSegment::symbolic("Counts"),
///     PathSegment::element(300),
/// ]);
/// ```
pub fn parse_tag_path(tag: &str) -> EipResult<Vec<PathSegment>> {
    let invalid = || EipError::client(format!("Invalid tag name: {:?}", tag));

    let mut path = Vec::new();
    for part in tag.split('.') {
        let (name, index) = match part.find('[') {
            Some(open) => {
                let digits = part[open + 1..].strip_suffix(']').ok_or_else(invalid)?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let index: u32 = digits.parse().map_err(|_| invalid())?;
                (&part[..open], Some(index))
            }
            None => (part, None),
        };

        if name.is_empty() || !name.bytes().all(is_tag_name_char) {
            return Err(invalid());
        }

        path.push(PathSegment::symbolic(name));
        if let Some(index) = index {
            path.push(PathSegment::element(index));
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(segment: &PathSegment) -> Vec<u8> {
        let mut buf = Vec::new();
        segment.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_segment_length_table() {
        assert_eq!(encode(&PathSegment::class(0x02)).len(), 2);
        assert_eq!(encode(&PathSegment::element(0x1234)).len(), 4);
        assert_eq!(encode(&PathSegment::element(0x12345)).len(), 6);
        assert_eq!(encode(&PathSegment::symbolic("AB")), vec![0x91, 2, b'A', b'B']);
        assert_eq!(
            encode(&PathSegment::symbolic("ABC")),
            vec![0x91, 3, b'A', b'B', b'C', 0]
        );
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for segment in [
            PathSegment::port(1, 0),
            PathSegment::instance(1),
            PathSegment::element(70000),
            PathSegment::symbolic("Odd"),
            PathSegment::symbolic("Even"),
        ] {
            assert_eq!(segment.encoded_len(), encode(&segment).len());
        }
    }

    #[test]
    fn test_logical_layouts() {
        assert_eq!(encode(&PathSegment::class(0x06)), vec![0x20, 0x06]);
        assert_eq!(encode(&PathSegment::instance(0x01)), vec![0x24, 0x01]);
        assert_eq!(encode(&PathSegment::port(1, 3)), vec![0x01, 0x03]);
        assert_eq!(
            encode(&PathSegment::element(0x0102)),
            vec![0x29, 0x00, 0x02, 0x01]
        );
        assert_eq!(
            encode(&PathSegment::element(0x01020304)),
            vec![0x2A, 0x00, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_odd_symbolic_pad_skipped_on_decode() {
        let bytes = vec![0x91, 3, b'A', b'B', b'C', 0, 0x28, 0x05];
        let path = decode_path(&bytes).unwrap();
        assert_eq!(
            path,
            vec![PathSegment::symbolic("ABC"), PathSegment::element(5)]
        );
    }

    #[test]
    fn test_empty_symbolic_rejected() {
        let mut buf = Vec::new();
        let err = PathSegment::symbolic("").encode(&mut buf).unwrap_err();
        assert!(matches!(err, EipError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_route_bytes_written_raw() {
        assert_eq!(encode(&PathSegment::port(0, 0)), vec![0x00, 0x00]);
        assert_eq!(encode(&PathSegment::port(0x20, 5)), vec![0x20, 0x05]);
        assert_eq!(encode(&PathSegment::port(255, 255)), vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_wide_port_rejected() {
        let segment = PathSegment::Logical16 {
            kind: SegmentKind::Port(1),
            value: 0,
        };
        let mut buf = Vec::new();
        assert!(segment.encode(&mut buf).is_err());
    }

    #[test]
    fn test_unknown_selector_rejected() {
        let err = decode_path(&[0x40, 0x00]).unwrap_err();
        assert!(err.to_string().contains("Unexpected segment encoding"));
        // Reserved logical format
        assert!(decode_path(&[0x23, 0x00]).is_err());
    }

    #[test]
    fn test_truncated_segment_rejected() {
        assert!(decode_path(&[0x29, 0x00, 0x01]).is_err());
        assert!(decode_path(&[0x91, 4, b'A', b'B']).is_err());
    }

    #[test]
    fn test_path_word_count_mismatch() {
        let path = vec![PathSegment::class(0x02), PathSegment::instance(0x01)];
        assert_eq!(path_words(&path).unwrap(), 2);

        let mut buf = Vec::new();
        let err = encode_path(&path, 3, &mut buf).unwrap_err();
        assert!(matches!(err, EipError::ProtocolViolation { .. }));

        buf.clear();
        encode_path(&path, 2, &mut buf).unwrap();
        assert_eq!(buf, vec![0x20, 0x02, 0x24, 0x01]);
    }

    #[test]
    fn test_parse_simple_tag() {
        assert_eq!(
            parse_tag_path("Tag1").unwrap(),
            vec![PathSegment::symbolic("Tag1")]
        );
    }

    #[test]
    fn test_parse_program_scoped_member() {
        let path = parse_tag_path("Program:Main.Motor[2].Speed").unwrap();
        assert_eq!(
            path,
            vec![
                PathSegment::symbolic("Program:Main"),
                PathSegment::symbolic("Motor"),
                PathSegment::element(2),
                PathSegment::symbolic("Speed"),
            ]
        );
    }

    #[test]
    fn test_parse_index_sizes() {
        let path = parse_tag_path("Big[70000]").unwrap();
        assert!(matches!(path[1], PathSegment::Logical32 { value: 70000, .. }));
        let path = parse_tag_path("Mid[256]").unwrap();
        assert!(matches!(path[1], PathSegment::Logical16 { value: 256, .. }));
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for bad in ["", "A..B", "A[", "A[]", "A[x]", "A[1]B", "Tag-1", "A[1][2]"] {
            assert!(
                matches!(parse_tag_path(bad), Err(EipError::Client { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_symbolic_roundtrip(name in "[A-Za-z_][A-Za-z0-9_]{0,60}") {
            let segment = PathSegment::symbolic(name);
            let bytes = encode(&segment);
            prop_assert_eq!(bytes.len() % 2, 0);
            prop_assert_eq!(decode_path(&bytes).unwrap(), vec![segment]);
        }

        #[test]
        fn prop_element_roundtrip(index in any::<u32>()) {
            let segment = PathSegment::element(index);
            let bytes = encode(&segment);
            prop_assert_eq!(bytes.len(), segment.encoded_len());
            prop_assert_eq!(decode_path(&bytes).unwrap(), vec![segment]);
        }
    }
}
