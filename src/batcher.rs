//! # Read Request Batching
//!
//! Packs ReadTag requests into Multiple Service Packets that fit the active
//! connection size.
//!
//! ## How It Works
//!
//! Requests are taken in submission order and never reordered. A packet
//! starts with 10 bytes of overhead (8-byte connected request header and the
//! 2-byte service count); each request adds its encoded size plus a 2-byte
//! offset entry. A request joins the current packet while the running size
//! stays below the connection size, otherwise it opens the next packet. The
//! grouping is therefore a pure function of the request sizes and the
//! connection size.
//!
//! ## Example
//!
//! ```rust
//! use logix_eip::batcher::plan_batches;
//!
//! let groups = plan_batches(&[100, 100, 100, 100, 100], 504).unwrap();
//! assert_eq!(groups, vec![0..4, 4..5]);
//! ```

use std::ops::Range;

use tracing::debug;

use crate::constants::MULTIPLE_SERVICE_OVERHEAD;
use crate::error::{EipError, EipResult};
use crate::router::{MessageRouterRequest, MultipleServiceRequest};

/// Bytes each request adds to a packet besides its own encoding
pub const OFFSET_ENTRY_LEN: usize = 2;

/// Group consecutive request sizes into packets under `connection_size`.
///
/// Fails when a single request cannot fit an otherwise empty packet.
pub fn plan_batches(sizes: &[usize], connection_size: u16) -> EipResult<Vec<Range<usize>>> {
    let limit = connection_size as usize;
    let mut groups = Vec::new();
    let mut start = 0;

    while start < sizes.len() {
        let mut packet_size = MULTIPLE_SERVICE_OVERHEAD;
        let mut end = start;
        while end < sizes.len() && packet_size + OFFSET_ENTRY_LEN + sizes[end] < limit {
            packet_size += OFFSET_ENTRY_LEN + sizes[end];
            end += 1;
        }
        if end == start {
            return Err(EipError::client(format!(
                "Request {} ({} bytes) does not fit connection size {}",
                start, sizes[start], connection_size
            )));
        }
        groups.push(start..end);
        start = end;
    }

    Ok(groups)
}

/// Collects read requests and releases them as packed Multiple Service
/// Packets.
#[derive(Debug)]
pub struct RequestBatcher {
    pending: Vec<MessageRouterRequest>,
    connection_size: u16,
}

impl RequestBatcher {
    pub fn new(connection_size: u16) -> Self {
        Self {
            pending: Vec::new(),
            connection_size,
        }
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn add_request(&mut self, request: MessageRouterRequest) {
        self.pending.push(request);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Take every pending request, packed in submission order
    pub fn take_batches(&mut self) -> EipResult<Vec<MultipleServiceRequest>> {
        let requests = std::mem::take(&mut self.pending);
        let sizes: Vec<usize> = requests.iter().map(MessageRouterRequest::encoded_len).collect();
        let groups = plan_batches(&sizes, self.connection_size)?;
        debug!(
            requests = requests.len(),
            packets = groups.len(),
            connection_size = self.connection_size,
            "Packed read requests"
        );

        let mut remaining = requests.into_iter();
        Ok(groups
            .into_iter()
            .map(|group| MultipleServiceRequest::new(remaining.by_ref().take(group.len()).collect()))
            .collect())
    }
}
