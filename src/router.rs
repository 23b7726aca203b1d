//! Message-router and connected-service requests/responses
//!
//! ```text
//! MessageRouterRequest   service(1) path_size(1, words) path data..
//! MessageRouterResponse  reply_service(1) reserved(1) status(1) ext_size(1) ext(2*n) data..
//! ConnectedService*      sequence(2) followed by the message-router layout
//! ```
//!
//! A multiple-service packet bundles several message-router requests into the
//! data of one request addressed to the Message Router object (class 0x02,
//! instance 1):
//!
//! ```text
//! count(2) offset[0](2) .. offset[n-1](2) request[0] .. request[n-1]
//! ```
//!
//! Offsets are measured from the start of the count field.

use bytes::BufMut;

use crate::constants::{CLASS_MESSAGE_ROUTER, GENERAL_STATUS_SUCCESS, SERVICE_MULTIPLE_SERVICE_PACKET};
use crate::error::{EipError, EipResult};
use crate::segment::{decode_path, encode_path, path_len, path_words, PathSegment};
use crate::wire::WireReader;

// ============================================================================
// Message router
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouterRequest {
    pub service: u8,
    /// Declared path size in 16-bit words
    pub path_size: u8,
    pub path: Vec<PathSegment>,
    pub data: Vec<u8>,
}

impl MessageRouterRequest {
    /// Build a request with the path size computed from `path`
    pub fn new(service: u8, path: Vec<PathSegment>, data: Vec<u8>) -> EipResult<Self> {
        Ok(Self {
            service,
            path_size: path_words(&path)?,
            path,
            data,
        })
    }

    /// Request addressed to the Message Router object itself
    pub fn to_message_router(service: u8, data: Vec<u8>) -> EipResult<Self> {
        Self::new(
            service,
            vec![
                PathSegment::class(CLASS_MESSAGE_ROUTER),
                PathSegment::instance(0x01),
            ],
            data,
        )
    }

    pub fn encoded_len(&self) -> usize {
        2 + path_len(&self.path) + self.data.len()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> EipResult<()> {
        buf.put_u8(self.service);
        buf.put_u8(self.path_size);
        encode_path(&self.path, self.path_size, buf)?;
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        let service = reader.read_u8()?;
        let path_size = reader.read_u8()?;
        let path = decode_path(reader.read_bytes(path_size as usize * 2)?)?;
        let data = reader.read_rest().to_vec();
        Ok(Self {
            service,
            path_size,
            path,
            data,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        Self::decode(&mut WireReader::new(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouterResponse {
    pub reply_service: u8,
    pub general_status: u8,
    /// Declared number of extended status words
    pub ext_status_size: u8,
    pub ext_status: Vec<u16>,
    pub data: Vec<u8>,
}

impl MessageRouterResponse {
    pub fn new(reply_service: u8, general_status: u8, ext_status: Vec<u16>, data: Vec<u8>) -> Self {
        Self {
            reply_service,
            general_status,
            ext_status_size: ext_status.len().min(u8::MAX as usize) as u8,
            ext_status,
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.general_status == GENERAL_STATUS_SUCCESS
    }

    /// Map a non-zero status to a service exception for `service`
    pub fn into_service_result(self, service: u8) -> EipResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.service_error(service))
        }
    }

    /// Service exception describing this response
    pub fn service_error(&self, service: u8) -> EipError {
        EipError::ServiceException {
            service,
            status: self.general_status,
            ext_status: self.ext_status.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        4 + self.ext_status.len() * 2 + self.data.len()
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) -> EipResult<()> {
        if self.ext_status_size as usize != self.ext_status.len() {
            return Err(EipError::protocol(format!(
                "Extended status size {} does not match {} status words",
                self.ext_status_size,
                self.ext_status.len()
            )));
        }
        buf.put_u8(self.reply_service);
        buf.put_u8(0);
        buf.put_u8(self.general_status);
        buf.put_u8(self.ext_status_size);
        for word in &self.ext_status {
            buf.put_u16_le(*word);
        }
        buf.put_slice(&self.data);
        Ok(())
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(reader: &mut WireReader<'_>) -> EipResult<Self> {
        let reply_service = reader.read_u8()?;
        reader.skip(1)?;
        let general_status = reader.read_u8()?;
        let ext_status_size = reader.read_u8()?;
        let ext_status = (0..ext_status_size)
            .map(|_| reader.read_u16())
            .collect::<EipResult<Vec<_>>>()?;
        let data = reader.read_rest().to_vec();
        Ok(Self {
            reply_service,
            general_status,
            ext_status_size,
            ext_status,
            data,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        Self::decode(&mut WireReader::new(bytes))
    }
}

// ============================================================================
// Connected service
// ============================================================================

/// Message-router request prefixed with the connection sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedServiceRequest {
    pub sequence: u16,
    pub request: MessageRouterRequest,
}

impl ConnectedServiceRequest {
    pub fn new(sequence: u16, request: MessageRouterRequest) -> Self {
        Self { sequence, request }
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.request.encoded_len()
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u16_le(self.sequence);
        self.request.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let sequence = reader.read_u16()?;
        let request = MessageRouterRequest::decode(&mut reader)?;
        Ok(Self { sequence, request })
    }
}

/// Message-router response prefixed with the connection sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedServiceResponse {
    pub sequence: u16,
    pub response: MessageRouterResponse,
}

impl ConnectedServiceResponse {
    pub fn new(sequence: u16, response: MessageRouterResponse) -> Self {
        Self { sequence, response }
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(2 + self.response.encoded_len());
        buf.put_u16_le(self.sequence);
        self.response.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let mut reader = WireReader::new(bytes);
        let sequence = reader.read_u16()?;
        let response = MessageRouterResponse::decode(&mut reader)?;
        Ok(Self { sequence, response })
    }
}

// ============================================================================
// Multiple service packet
// ============================================================================

fn offset_table_len(count: usize) -> usize {
    2 + 2 * count
}

/// Bundle of message-router requests
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultipleServiceRequest {
    pub requests: Vec<MessageRouterRequest>,
}

impl MultipleServiceRequest {
    pub fn new(requests: Vec<MessageRouterRequest>) -> Self {
        Self { requests }
    }

    pub fn encoded_len(&self) -> usize {
        offset_table_len(self.requests.len())
            + self
                .requests
                .iter()
                .map(MessageRouterRequest::encoded_len)
                .sum::<usize>()
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let count = u16::try_from(self.requests.len())
            .map_err(|_| EipError::protocol("Too many services in one packet"))?;
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u16_le(count);

        let mut offset = offset_table_len(self.requests.len());
        for request in &self.requests {
            let value = u16::try_from(offset)
                .map_err(|_| EipError::protocol("Multiple service packet too large"))?;
            buf.put_u16_le(value);
            offset += request.encoded_len();
        }
        for request in &self.requests {
            request.encode(&mut buf)?;
        }
        Ok(buf)
    }

    /// Wrap the bundle in a request to the Message Router object
    pub fn to_router_request(&self) -> EipResult<MessageRouterRequest> {
        MessageRouterRequest::to_message_router(SERVICE_MULTIPLE_SERVICE_PACKET, self.to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let requests = split_by_offsets(bytes)?
            .into_iter()
            .map(MessageRouterRequest::from_bytes)
            .collect::<EipResult<Vec<_>>>()?;
        Ok(Self { requests })
    }
}

/// Bundle of message-router responses
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultipleServiceResponse {
    pub responses: Vec<MessageRouterResponse>,
}

impl MultipleServiceResponse {
    pub fn new(responses: Vec<MessageRouterResponse>) -> Self {
        Self { responses }
    }

    pub fn to_bytes(&self) -> EipResult<Vec<u8>> {
        let count = u16::try_from(self.responses.len())
            .map_err(|_| EipError::protocol("Too many services in one packet"))?;
        let mut buf = Vec::new();
        buf.put_u16_le(count);

        let mut offset = offset_table_len(self.responses.len());
        for response in &self.responses {
            let value = u16::try_from(offset)
                .map_err(|_| EipError::protocol("Multiple service packet too large"))?;
            buf.put_u16_le(value);
            offset += response.encoded_len();
        }
        for response in &self.responses {
            response.encode(&mut buf)?;
        }
        Ok(buf)
    }

    /// Decode, rejecting offsets that point outside the buffer or go backwards
    pub fn from_bytes(bytes: &[u8]) -> EipResult<Self> {
        let responses = split_by_offsets(bytes)?
            .into_iter()
            .map(MessageRouterResponse::from_bytes)
            .collect::<EipResult<Vec<_>>>()?;
        Ok(Self { responses })
    }
}

/// Split a multiple-service body into one slice per embedded service
fn split_by_offsets(bytes: &[u8]) -> EipResult<Vec<&[u8]>> {
    let mut reader = WireReader::new(bytes);
    let count = reader.read_u16()? as usize;
    let offsets = (0..count)
        .map(|_| reader.read_u16().map(usize::from))
        .collect::<EipResult<Vec<_>>>()?;

    let table_end = offset_table_len(count);
    let mut slices = Vec::with_capacity(count);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(bytes.len());
        if start < table_end || start > end || end > bytes.len() {
            return Err(EipError::protocol(format!(
                "Multiple service offset {} of {} is out of range ({}..{})",
                i,
                count,
                start,
                end
            )));
        }
        slices.push(&bytes[start..end]);
    }
    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SERVICE_READ_TAG, SERVICE_REPLY_FLAG};
    use crate::segment::parse_tag_path;
    use proptest::prelude::*;

    fn read_request(tag: &str) -> MessageRouterRequest {
        MessageRouterRequest::new(SERVICE_READ_TAG, parse_tag_path(tag).unwrap(), vec![1, 0])
            .unwrap()
    }

    #[test]
    fn test_request_layout() {
        let request = read_request("Tag1");
        let bytes = request.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![0x4C, 0x03, 0x91, 0x04, b'T', b'a', b'g', b'1', 0x01, 0x00]
        );
        assert_eq!(bytes.len(), request.encoded_len());
        assert_eq!(MessageRouterRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_request_path_size_mismatch() {
        let mut request = read_request("Tag1");
        request.path_size = 2;
        assert!(matches!(
            request.to_bytes(),
            Err(EipError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_response_ext_status_mismatch() {
        let mut response = MessageRouterResponse::new(0xCC, 0xFF, vec![0x2107], vec![]);
        assert!(response.to_bytes().is_ok());
        response.ext_status_size = 2;
        assert!(matches!(
            response.to_bytes(),
            Err(EipError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_response_decode() {
        let bytes = vec![0xCC, 0x00, 0xFF, 0x01, 0x07, 0x21, 0xAA];
        let response = MessageRouterResponse::from_bytes(&bytes).unwrap();
        assert_eq!(response.reply_service, 0xCC);
        assert_eq!(response.general_status, 0xFF);
        assert_eq!(response.ext_status, vec![0x2107]);
        assert_eq!(response.data, vec![0xAA]);
        assert_eq!(response.to_bytes().unwrap(), bytes);

        let err = response.into_service_result(SERVICE_READ_TAG).unwrap_err();
        assert!(err.is_stale_structure_handle());
    }

    #[test]
    fn test_connected_request_prefix() {
        let request = ConnectedServiceRequest::new(0x0102, read_request("A"));
        let bytes = request.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0x02, 0x01]);
        assert_eq!(bytes.len(), request.encoded_len());
        assert_eq!(ConnectedServiceRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_connected_response_empty_payload() {
        let response = ConnectedServiceResponse::new(
            7,
            MessageRouterResponse::new(SERVICE_READ_TAG | SERVICE_REPLY_FLAG, 0, vec![], vec![]),
        );
        let bytes = response.to_bytes().unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(ConnectedServiceResponse::from_bytes(&bytes).unwrap(), response);
    }

    #[test]
    fn test_multiple_service_offsets() {
        let packet = MultipleServiceRequest::new(vec![read_request("A"), read_request("BB")]);
        let bytes = packet.to_bytes().unwrap();
        // count + 2 offsets = 6 bytes; "A" request is 2 + 4 + 2 = 8 bytes
        assert_eq!(&bytes[..6], &[0x02, 0x00, 0x06, 0x00, 0x0E, 0x00]);
        assert_eq!(bytes.len(), packet.encoded_len());
        assert_eq!(MultipleServiceRequest::from_bytes(&bytes).unwrap(), packet);

        let wrapped = packet.to_router_request().unwrap();
        assert_eq!(wrapped.service, SERVICE_MULTIPLE_SERVICE_PACKET);
        assert_eq!(wrapped.to_bytes().unwrap()[..6], [0x0A, 0x02, 0x20, 0x02, 0x24, 0x01]);
    }

    #[test]
    fn test_multiple_service_response_roundtrip() {
        let packet = MultipleServiceResponse::new(vec![
            MessageRouterResponse::new(0xCC, 0, vec![], vec![0xC4, 0x00, 42, 0, 0, 0]),
            MessageRouterResponse::new(0xCC, 0x05, vec![0x0000], vec![]),
        ]);
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(MultipleServiceResponse::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_multiple_service_offset_out_of_range() {
        // One service whose offset points past the end
        let bytes = vec![0x01, 0x00, 0x40, 0x00, 0xCC, 0x00, 0x00, 0x00];
        assert!(matches!(
            MultipleServiceResponse::from_bytes(&bytes),
            Err(EipError::ProtocolViolation { .. })
        ));
        // Offset pointing into the offset table
        let bytes = vec![0x01, 0x00, 0x02, 0x00, 0xCC, 0x00, 0x00, 0x00];
        assert!(MultipleServiceResponse::from_bytes(&bytes).is_err());
        // Offsets going backwards
        let bytes = vec![
            0x02, 0x00, 0x0A, 0x00, 0x06, 0x00, 0xCC, 0x00, 0x00, 0x00, 0xCC, 0x00, 0x00, 0x00,
        ];
        assert!(MultipleServiceResponse::from_bytes(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn prop_router_request_roundtrip(
            service in any::<u8>(),
            name in "[A-Za-z][A-Za-z0-9_]{0,20}",
            index in proptest::option::of(any::<u32>()),
            data in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut path = vec![PathSegment::symbolic(name)];
            if let Some(index) = index {
                path.push(PathSegment::element(index));
            }
            let request = MessageRouterRequest::new(service, path, data).unwrap();
            let bytes = request.to_bytes().unwrap();
            prop_assert_eq!(MessageRouterRequest::from_bytes(&bytes).unwrap(), request);
        }

        #[test]
        fn prop_router_response_roundtrip(
            status in any::<u8>(),
            ext in proptest::collection::vec(any::<u16>(), 0..4),
            data in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let response = MessageRouterResponse::new(0xCC, status, ext, data);
            let bytes = response.to_bytes().unwrap();
            prop_assert_eq!(MessageRouterResponse::from_bytes(&bytes).unwrap(), response);
        }
    }
}
