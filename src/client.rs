//! # Tag Transaction Engine
//!
//! High-level Logix client: tag reads and writes over a Class 3 connection.
//!
//! Establishment runs on a background task started at construction. Every
//! operation first waits (up to the transaction timeout) for it to finish
//! and fails with `NotConnected` if the connection never came up or has
//! faulted since. Transactions are serialized by an async mutex around the
//! session, so a client can be cloned and shared between tasks.
//!
//! ## Protocols
//!
//! | Operation | Service | Notes |
//! |-----------|---------|-------|
//! | `read_tag`, `read_<type>` | ReadTag `0x4C` | one element |
//! | `read_tag_fragmented`, `read_<type>s` | ReadTagFragmented `0x52` | loops while status is `0x06` |
//! | `read_tags`, `read_tags_typed` | Multiple Service Packet `0x0A` | greedy packing, `0x1E` is partial success |
//! | `write_<type>` | WriteTag `0x4D` | one element |
//! | `write_<type>s`, `write_struct` | WriteTagFragmented `0x53` | frames sized to the connection |
//!
//! ## Structure handles
//!
//! Structure writes need the handle the controller assigned to the tag's
//! type. Handles are cached per tag name (case-insensitive). A write that
//! fails with `0xFF / 0x2107` re-queries the handle once; a changed handle
//! is cached and the write retried once, an unchanged one is an error.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use logix_eip::{ClientConfig, EipResult, LogixTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> EipResult<()> {
//!     let client = LogixTcpClient::from_address("192.168.1.10", ClientConfig::new().with_slot(0))?;
//!
//!     let speed = client.read_f32("Line1.Speed").await?;
//!     client.write_u16s("Recipe.Steps", &[10, 20, 30]).await?;
//!     println!("Speed: {}", speed);
//!
//!     client.close().await
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::batcher::RequestBatcher;
use crate::codec::{
    bool_word_count, decode_elements, decode_structure_handle, decode_tag_value, element_size_for,
    encode_elements, encode_logix_string, fragment_payload, max_write_fragment, reassemble_fragments,
    reassemble_struct_fragments, reply_data_type, split_structs, unpack_bools, LogixCodec, WriteFrames,
};
use crate::config::ClientConfig;
use crate::constants::{
    DATA_TYPE_DINT, DATA_TYPE_INT, DATA_TYPE_LINT, DATA_TYPE_REAL, DATA_TYPE_SINT,
    GENERAL_STATUS_EMBEDDED_SERVICE_ERROR, GENERAL_STATUS_PARTIAL_TRANSFER, GENERAL_STATUS_SUCCESS,
    SERVICE_MULTIPLE_SERVICE_PACKET, SERVICE_READ_TAG, SERVICE_READ_TAG_FRAGMENTED, SERVICE_WRITE_TAG,
    SERVICE_WRITE_TAG_FRAGMENTED,
};
use crate::error::{EipError, EipResult};
use crate::identity::{Identity, ServiceInfo};
use crate::logging::CallbackLogger;
use crate::router::{ConnectedServiceRequest, MessageRouterRequest, MessageRouterResponse, MultipleServiceResponse};
use crate::session::SessionManager;
use crate::state::{ConnectionState, StateCell};
use crate::transport::{EipTransport, TcpChannel, TransportStats};
use crate::value::{TagType, TagValue};

// ============================================================================
// Sequence numbers
// ============================================================================

/// Connected-service sequence counter.
///
/// Starts from a per-process seed, wraps back to the seed after `0xFFFF`
/// and never hands out zero.
#[derive(Debug)]
pub struct SequenceGenerator {
    seed: u16,
    current: StdMutex<u16>,
}

impl SequenceGenerator {
    pub fn new(seed: u16) -> Self {
        Self {
            seed,
            current: StdMutex::new(seed),
        }
    }

    /// Seed derived from the process ID
    pub fn from_process() -> Self {
        Self::new((std::process::id() % 32768) as u16)
    }

    pub fn next_sequence(&self) -> u16 {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = if *current == u16::MAX { self.seed } else { *current + 1 };
        if *current == 0 {
            *current = 1;
        }
        *current
    }
}

// ============================================================================
// Method generators
// ============================================================================

macro_rules! scalar_reads {
    ($($(#[$meta:meta])* $name:ident => $tag_type:ident, $variant:ident, $ty:ty;)*) => {$(
        $(#[$meta])*
        pub async fn $name(&self, tag: &str) -> EipResult<$ty> {
            match self.read_value(tag, TagType::$tag_type).await? {
                TagValue::$variant(value) => Ok(value),
                other => Err(EipError::unexpected(format!(
                    "Decoded a {} value for a {} read",
                    other.tag_type(),
                    TagType::$tag_type
                ))),
            }
        }
    )*};
}

macro_rules! array_reads {
    ($($(#[$meta:meta])* $name:ident => $tag_type:ident, $ty:ty;)*) => {$(
        $(#[$meta])*
        pub async fn $name(&self, tag: &str, count: u16) -> EipResult<Vec<$ty>> {
            let bytes = self.read_array_bytes(tag, TagType::$tag_type, count).await?;
            decode_elements(&bytes, <$ty>::from_le_bytes)
        }
    )*};
}

macro_rules! scalar_writes {
    ($($name:ident => $variant:ident, $ty:ty;)*) => {$(
        pub async fn $name(&self, tag: &str, value: $ty) -> EipResult<()> {
            self.write_value(tag, &TagValue::$variant(value)).await
        }
    )*};
}

macro_rules! array_writes {
    ($($name:ident => $data_type:ident, $ty:ty;)*) => {$(
        pub async fn $name(&self, tag: &str, values: &[$ty]) -> EipResult<()> {
            let bytes = encode_elements(values, <$ty>::to_le_bytes);
            self.write_elements(tag, $data_type, values.len(), &bytes).await
        }
    )*};
}

// ============================================================================
// Generic client
// ============================================================================

struct ClientInner<T: EipTransport> {
    session: Arc<Mutex<Option<SessionManager<T>>>>,
    state: Arc<StateCell>,
    config: ClientConfig,
    endpoint: String,
    sequence: SequenceGenerator,
    struct_handles: StdMutex<HashMap<String, u16>>,
}

/// Logix client over any [`EipTransport`].
///
/// Cloning is cheap; clones share the connection.
pub struct GenericLogixClient<T: EipTransport + 'static> {
    inner: Arc<ClientInner<T>>,
}

impl<T: EipTransport + 'static> Clone for GenericLogixClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: EipTransport + 'static> GenericLogixClient<T> {
    /// Start establishment over an already connected transport.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(transport: T, endpoint: impl Into<String>, config: ClientConfig) -> EipResult<Self> {
        Self::spawn(endpoint.into(), config, None, async move { Ok(transport) })
    }

    /// Like [`new`](Self::new), dumping packets to `logger`
    pub fn with_logger(
        transport: T,
        endpoint: impl Into<String>,
        config: ClientConfig,
        logger: CallbackLogger,
    ) -> EipResult<Self> {
        Self::spawn(endpoint.into(), config, Some(logger), async move { Ok(transport) })
    }

    /// Connect the transport and establish the session on a background task
    pub fn spawn<F>(endpoint: String, config: ClientConfig, logger: Option<CallbackLogger>, connect: F) -> EipResult<Self>
    where
        F: Future<Output = EipResult<T>> + Send + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| EipError::client("A Logix client must be created inside a tokio runtime"))?;

        let state = Arc::new(StateCell::new());
        let session = Arc::new(Mutex::new(None));
        // Held until the session is stored, so operations queue behind establishment.
        let mut guard = Arc::clone(&session)
            .try_lock_owned()
            .map_err(|_| EipError::client("Session lock unavailable"))?;

        let task_state = Arc::clone(&state);
        let task_config = config.clone();
        let task_endpoint = endpoint.clone();
        runtime.spawn(async move {
            match connect.await {
                Ok(transport) => {
                    let mut manager =
                        SessionManager::new(transport, task_config, task_endpoint, task_state).with_logger(logger);
                    if let Err(e) = manager.establish().await {
                        debug!(endpoint = %manager.endpoint(), error = %e, "Establishment failed");
                    }
                    *guard = Some(manager);
                }
                Err(e) => {
                    debug!(endpoint = %task_endpoint, error = %e, "Transport connect failed");
                    task_state.fault(e);
                    task_state.mark_finished();
                }
            }
        });

        debug!(endpoint = %endpoint, port = config.port, slot = config.slot, "Logix client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                session,
                state,
                config,
                endpoint,
                sequence: SequenceGenerator::from_process(),
                struct_handles: StdMutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    /// Cause of the first fault, if the client has faulted
    pub fn fault_cause(&self) -> Option<EipError> {
        self.inner.state.fault_cause().cloned()
    }

    /// Wait up to the transaction timeout for establishment; true if connected
    pub async fn wait_for_connection(&self) -> bool {
        self.inner.state.wait_for_connection(self.inner.config.transaction_timeout).await
    }

    fn not_connected(&self) -> EipError {
        EipError::not_connected(self.inner.endpoint.clone(), self.inner.config.port, self.inner.config.slot)
    }

    async fn connected_session(&self) -> EipResult<MappedMutexGuard<'_, SessionManager<T>>> {
        if !self.wait_for_connection().await {
            return Err(self.not_connected());
        }
        let guard = self.inner.session.lock().await;
        if !self.inner.state.is_connected() {
            return Err(self.not_connected());
        }
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| self.not_connected())
    }

    /// One connected request/reply; any exchange error faults the client
    async fn exchange(
        &self,
        session: &mut SessionManager<T>,
        request: MessageRouterRequest,
    ) -> EipResult<MessageRouterResponse> {
        let deadline = Instant::now() + self.inner.config.transaction_timeout;
        let request = ConnectedServiceRequest::new(self.inner.sequence.next_sequence(), request);
        trace!(
            service = request.request.service,
            sequence = request.sequence,
            "Sending connected request"
        );
        match session.send_unit_data(&request, deadline).await {
            Ok(reply) => Ok(reply.response),
            Err(e) => {
                self.inner.state.fault(e.clone());
                Err(e)
            }
        }
    }

    /// Send a raw connected request and return the unclassified reply
    pub async fn send_request(&self, request: MessageRouterRequest) -> EipResult<MessageRouterResponse> {
        let mut session = self.connected_session().await?;
        self.exchange(&mut session, request).await
    }

    // ========================================================================
    // Session operations
    // ========================================================================

    /// Cycle the connection with Forward-Close and Forward-Open
    pub async fn keep_alive(&self) -> EipResult<()> {
        let mut session = self.connected_session().await?;
        session.keep_alive().await
    }

    /// ListIdentity over the session
    pub async fn get_device_identity(&self) -> EipResult<Option<Identity>> {
        let mut session = self.connected_session().await?;
        session.list_identity().await
    }

    /// ListServices over the session
    pub async fn get_device_services(&self) -> EipResult<Vec<ServiceInfo>> {
        let mut session = self.connected_session().await?;
        session.list_services().await
    }

    /// Statistics of the underlying transport, once establishment has settled
    pub async fn transport_stats(&self) -> Option<TransportStats> {
        let session = self.inner.session.lock().await;
        session.as_ref().map(|s| s.transport().get_stats())
    }

    /// Unregister the session and release the transport.
    ///
    /// The client is faulted afterwards; later calls fail with `NotConnected`.
    pub async fn close(&self) -> EipResult<()> {
        let mut guard = self.inner.session.lock().await;
        let result = match guard.take() {
            Some(mut session) => session.close().await,
            None => Ok(()),
        };
        self.inner.state.fault(EipError::transport("Client closed"));
        result
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// ReadTag of `elements` elements; the reply holds the data type and value
    pub async fn read_tag(&self, tag: &str, elements: u16) -> EipResult<MessageRouterResponse> {
        let request = LogixCodec::read_tag(tag, elements)?;
        self.send_request(request)
            .await?
            .into_service_result(SERVICE_READ_TAG)
    }

    /// ReadTagFragmented until the controller stops reporting partial data.
    ///
    /// Returns every fragment in order; each still carries its type header.
    pub async fn read_tag_fragmented(&self, tag: &str, elements: u16) -> EipResult<Vec<MessageRouterResponse>> {
        let mut session = self.connected_session().await?;
        self.read_fragments(&mut session, tag, elements).await
    }

    async fn read_fragments(
        &self,
        session: &mut SessionManager<T>,
        tag: &str,
        elements: u16,
    ) -> EipResult<Vec<MessageRouterResponse>> {
        let mut fragments = Vec::new();
        let mut offset: u32 = 0;
        loop {
            let request = LogixCodec::read_tag_fragmented(tag, elements, offset)?;
            let reply = self.exchange(session, request).await?;
            match reply.general_status {
                GENERAL_STATUS_SUCCESS => {
                    fragments.push(reply);
                    trace!(tag, fragments = fragments.len(), "Fragmented read complete");
                    return Ok(fragments);
                }
                GENERAL_STATUS_PARTIAL_TRANSFER => {
                    let data_type = reply_data_type(&reply.data)?;
                    let received = fragment_payload(&reply.data, data_type)?.len();
                    if received == 0 {
                        return Err(EipError::protocol("Partial transfer reply carried no data"));
                    }
                    offset = u32::try_from(received)
                        .ok()
                        .and_then(|n| offset.checked_add(n))
                        .ok_or_else(|| EipError::protocol("Fragment offset overflow"))?;
                    trace!(tag, offset, "More fragments follow");
                    fragments.push(reply);
                }
                _ => return Err(reply.service_error(SERVICE_READ_TAG_FRAGMENTED)),
            }
        }
    }

    /// Read one element and decode it as `tag_type`
    pub async fn read_value(&self, tag: &str, tag_type: TagType) -> EipResult<TagValue> {
        let reply = self.read_tag(tag, 1).await?;
        decode_tag_value(tag_type, &reply.data)
    }

    scalar_reads! {
        read_bool => Bool, Bool, bool;
        read_u8 => UInt8, U8, u8;
        read_i8 => Int8, I8, i8;
        read_u16 => UInt16, U16, u16;
        read_i16 => Int16, I16, i16;
        /// Accepts DINT and DWORD replies
        read_u32 => UInt32, U32, u32;
        read_i32 => Int32, I32, i32;
        read_u64 => UInt64, U64, u64;
        read_i64 => Int64, I64, i64;
        read_f32 => Single, F32, f32;
        /// Carried in a LINT
        read_f64 => Double, F64, f64;
        /// Logix STRING structure
        read_string => String, String, String;
    }

    async fn read_array_bytes(&self, tag: &str, tag_type: TagType, elements: u16) -> EipResult<Vec<u8>> {
        let fragments = self.read_tag_fragmented(tag, elements).await?;
        reassemble_fragments(tag_type, &fragments)
    }

    /// Read `count` BOOLs packed LSB-first in 32-bit words
    pub async fn read_bools(&self, tag: &str, count: u16) -> EipResult<Vec<bool>> {
        let words = u16::try_from(bool_word_count(count as usize))
            .map_err(|_| EipError::client(format!("Too many BOOLs requested: {}", count)))?;
        let bytes = self.read_array_bytes(tag, TagType::Bool, words).await?;
        Ok(unpack_bools(&bytes, count as usize))
    }

    array_reads! {
        read_u8s => UInt8, u8;
        read_i8s => Int8, i8;
        read_u16s => UInt16, u16;
        read_i16s => Int16, i16;
        read_u32s => UInt32, u32;
        read_i32s => Int32, i32;
        read_f32s => Single, f32;
        read_u64s => UInt64, u64;
        read_i64s => Int64, i64;
        /// Elements carried as LINT
        read_f64s => Double, f64;
    }

    /// Read `count` structures as raw byte buffers of equal size
    pub async fn read_structs(&self, tag: &str, count: u16) -> EipResult<Vec<Vec<u8>>> {
        let fragments = self.read_tag_fragmented(tag, count).await?;
        let bytes = reassemble_struct_fragments(&fragments)?;
        split_structs(&bytes, count as usize)
    }

    /// Raw bytes of one structure
    pub async fn read_struct(&self, tag: &str) -> EipResult<Vec<u8>> {
        let fragments = self.read_tag_fragmented(tag, 1).await?;
        reassemble_struct_fragments(&fragments)
    }

    /// Handle the controller assigned to the structure type of `tag`
    pub async fn query_structure_handle(&self, tag: &str) -> EipResult<u16> {
        let mut session = self.connected_session().await?;
        self.query_handle(&mut session, tag).await
    }

    async fn query_handle(&self, session: &mut SessionManager<T>, tag: &str) -> EipResult<u16> {
        let fragments = self.read_fragments(session, tag, 1).await?;
        let last = fragments
            .last()
            .ok_or_else(|| EipError::protocol("Structure read returned no fragments"))?;
        let handle = decode_structure_handle(&last.data)?;
        debug!(tag, handle, "Queried structure handle");
        Ok(handle)
    }

    /// Read many tags, packed into as few Multiple Service Packets as fit.
    ///
    /// Per-item failures stay in the returned responses; only a packet
    /// that cannot be decoded fails the call.
    pub async fn read_tags(&self, tags: &[&str]) -> EipResult<Vec<MessageRouterResponse>> {
        let mut batcher = RequestBatcher::new(self.inner.config.connection_size);
        for tag in tags {
            batcher.add_request(LogixCodec::read_tag(tag, 1)?);
        }
        let batches = batcher.take_batches()?;

        let mut session = self.connected_session().await?;
        let mut replies = Vec::with_capacity(tags.len());
        for batch in batches {
            let reply = self.exchange(&mut session, batch.to_router_request()?).await?;
            let decoded = decode_batch_reply(reply)?;
            if decoded.responses.len() != batch.requests.len() {
                return Err(EipError::protocol(format!(
                    "Batch of {} requests answered with {} replies",
                    batch.requests.len(),
                    decoded.responses.len()
                )));
            }
            replies.extend(decoded.responses);
        }
        Ok(replies)
    }

    /// Batched read decoded per tag.
    ///
    /// A tag the controller could not read yields `None`; a reply of the
    /// wrong data type fails the call with `BadType`.
    pub async fn read_tags_typed(&self, tags: &[(TagType, &str)]) -> EipResult<Vec<Option<TagValue>>> {
        let names: Vec<&str> = tags.iter().map(|(_, name)| *name).collect();
        let replies = self.read_tags(&names).await?;
        if replies.len() != tags.len() {
            return Err(EipError::client(format!(
                "Requested {} tags, received {} replies",
                tags.len(),
                replies.len()
            )));
        }
        tags.iter()
            .zip(replies)
            .map(|((tag_type, name), reply)| {
                if reply.is_success() {
                    decode_tag_value(*tag_type, &reply.data).map(Some)
                } else {
                    trace!(tag = name, status = reply.general_status, "Batched read item failed");
                    Ok(None)
                }
            })
            .collect()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// WriteTag with raw element bytes
    pub async fn write_tag(&self, tag: &str, data_type: u16, elements: u16, value: &[u8]) -> EipResult<()> {
        let request = LogixCodec::write_tag(tag, data_type, elements, value)?;
        self.send_request(request)
            .await?
            .into_service_result(SERVICE_WRITE_TAG)?;
        Ok(())
    }

    /// Single-element write of a typed value
    pub async fn write_value(&self, tag: &str, value: &TagValue) -> EipResult<()> {
        let request = LogixCodec::write_value(tag, value)?;
        self.send_request(request)
            .await?
            .into_service_result(SERVICE_WRITE_TAG)?;
        Ok(())
    }

    scalar_writes! {
        write_bool => Bool, bool;
        write_u8 => U8, u8;
        write_i8 => I8, i8;
        write_u16 => U16, u16;
        write_i16 => I16, i16;
        write_u32 => U32, u32;
        write_i32 => I32, i32;
        write_u64 => U64, u64;
        write_i64 => I64, i64;
        write_f32 => F32, f32;
        write_f64 => F64, f64;
    }

    /// Send every frame of `frames` as a WriteTagFragmented request to `tag`
    pub async fn write_tag_fragmented(&self, tag: &str, frames: WriteFrames<'_>) -> EipResult<()> {
        let base = LogixCodec::write_tag_fragmented(tag)?;
        let mut session = self.connected_session().await?;
        self.write_frames(&mut session, &base, frames).await
    }

    /// Stops at the first rejected frame and returns its service error
    async fn write_frames(
        &self,
        session: &mut SessionManager<T>,
        base: &MessageRouterRequest,
        frames: WriteFrames<'_>,
    ) -> EipResult<()> {
        let mut sent = 0usize;
        for data in frames {
            let mut request = base.clone();
            request.data = data;
            self.exchange(session, request)
                .await?
                .into_service_result(SERVICE_WRITE_TAG_FRAGMENTED)?;
            sent += 1;
        }
        trace!(frames = sent, "Fragmented write complete");
        Ok(())
    }

    async fn write_elements(&self, tag: &str, data_type: u16, count: usize, bytes: &[u8]) -> EipResult<()> {
        if count == 0 {
            return Err(EipError::client("No elements to write"));
        }
        let elements = u16::try_from(count)
            .map_err(|_| EipError::client(format!("Too many elements to write: {}", count)))?;
        let base = LogixCodec::write_tag_fragmented(tag)?;
        let max_frame = max_write_fragment(
            self.inner.config.connection_size,
            base.path_size,
            element_size_for(data_type)?,
        )?;

        let mut session = self.connected_session().await?;
        let frames = WriteFrames::atomic(data_type, elements, bytes, max_frame);
        self.write_frames(&mut session, &base, frames).await
    }

    array_writes! {
        write_u8s => DATA_TYPE_SINT, u8;
        write_i8s => DATA_TYPE_SINT, i8;
        write_u16s => DATA_TYPE_INT, u16;
        write_i16s => DATA_TYPE_INT, i16;
        write_u32s => DATA_TYPE_DINT, u32;
        write_i32s => DATA_TYPE_DINT, i32;
        write_f32s => DATA_TYPE_REAL, f32;
        write_u64s => DATA_TYPE_LINT, u64;
        write_i64s => DATA_TYPE_LINT, i64;
        write_f64s => DATA_TYPE_LINT, f64;
    }

    async fn write_struct_frames(
        &self,
        session: &mut SessionManager<T>,
        tag: &str,
        handle: u16,
        bytes: &[u8],
    ) -> EipResult<()> {
        if bytes.is_empty() {
            return Err(EipError::client("Structure buffer is empty"));
        }
        let base = LogixCodec::write_tag_fragmented(tag)?;
        let max_frame = max_write_fragment(self.inner.config.connection_size, base.path_size, 1)?;
        self.write_frames(session, &base, WriteFrames::structure(handle, bytes, max_frame))
            .await
    }

    /// Write a structure with a handle the caller already knows
    pub async fn write_struct_with_handle(&self, tag: &str, handle: u16, bytes: &[u8]) -> EipResult<()> {
        let mut session = self.connected_session().await?;
        self.write_struct_frames(&mut session, tag, handle, bytes).await
    }

    /// Write a structure, looking up its handle in the cache first
    pub async fn write_struct(&self, tag: &str, bytes: &[u8]) -> EipResult<()> {
        if bytes.is_empty() {
            return Err(EipError::client("Structure buffer is empty"));
        }
        let key = tag.to_lowercase();
        let mut session = self.connected_session().await?;

        let handle = match self.cached_handle(&key) {
            Some(handle) => handle,
            None => {
                let handle = self.query_handle(&mut session, tag).await?;
                self.cache_handle(key.clone(), handle);
                handle
            }
        };

        match self.write_struct_frames(&mut session, tag, handle, bytes).await {
            Err(e) if e.is_stale_structure_handle() => {
                let fresh = self.query_handle(&mut session, tag).await?;
                if fresh == handle {
                    return Err(e);
                }
                debug!(tag, old = handle, new = fresh, "Structure handle changed, retrying write");
                self.cache_handle(key, fresh);
                self.write_struct_frames(&mut session, tag, fresh, bytes).await
            }
            other => other,
        }
    }

    /// Write equally sized structures to `tag[0]`, `tag[1]`, ...
    pub async fn write_structs<B: AsRef<[u8]>>(&self, tag: &str, values: &[B]) -> EipResult<()> {
        let size = match values.first() {
            Some(first) => first.as_ref().len(),
            None => return Err(EipError::client("No structures to write")),
        };
        if values.iter().any(|v| v.as_ref().len() != size) {
            return Err(EipError::client("Structures must all have the same size"));
        }
        for (index, value) in values.iter().enumerate() {
            self.write_struct(&format!("{}[{}]", tag, index), value.as_ref())
                .await?;
        }
        Ok(())
    }

    /// Write a Logix STRING of capacity `max_len`
    pub async fn write_string(&self, tag: &str, value: &str, max_len: usize) -> EipResult<()> {
        let bytes = encode_logix_string(value, max_len)?;
        self.write_struct(tag, &bytes).await
    }

    fn cached_handle(&self, key: &str) -> Option<u16> {
        let handles = self
            .inner
            .struct_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.get(key).copied()
    }

    fn cache_handle(&self, key: String, handle: u16) {
        let mut handles = self
            .inner
            .struct_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handles.insert(key, handle);
    }
}

/// Decode a Multiple Service Packet reply; `0x1E` means some items failed
fn decode_batch_reply(reply: MessageRouterResponse) -> EipResult<MultipleServiceResponse> {
    match reply.general_status {
        GENERAL_STATUS_SUCCESS => MultipleServiceResponse::from_bytes(&reply.data),
        GENERAL_STATUS_EMBEDDED_SERVICE_ERROR => MultipleServiceResponse::from_bytes(&reply.data)
            .map_err(|_| reply.service_error(SERVICE_MULTIPLE_SERVICE_PACKET)),
        _ => Err(reply.service_error(SERVICE_MULTIPLE_SERVICE_PACKET)),
    }
}

// ============================================================================
// TCP client
// ============================================================================

/// Logix client over EtherNet/IP TCP
pub struct LogixTcpClient {
    inner: GenericLogixClient<TcpChannel>,
    target: SocketAddr,
}

impl LogixTcpClient {
    /// Connect to `target` in the background and establish the session
    pub fn new(target: SocketAddr, config: ClientConfig) -> EipResult<Self> {
        Self::with_logging(target, config, None)
    }

    /// Create a client that dumps packets to `logger`
    pub fn with_logging(target: SocketAddr, config: ClientConfig, logger: Option<CallbackLogger>) -> EipResult<Self> {
        let connect_timeout = config.io_timeout;
        let inner = GenericLogixClient::spawn(
            target.to_string(),
            config,
            logger,
            TcpChannel::connect(target, connect_timeout),
        )?;
        Ok(Self { inner, target })
    }

    /// Create a client from `"ip"` or `"ip:port"`; a bare IP uses the configured TCP port
    pub fn from_address(addr: &str, config: ClientConfig) -> EipResult<Self> {
        let target = match addr.parse::<SocketAddr>() {
            Ok(target) => target,
            Err(_) => {
                let ip: IpAddr = addr
                    .parse()
                    .map_err(|e| EipError::configuration(format!("Invalid address {}: {}", addr, e)))?;
                SocketAddr::new(ip, config.tcp_port)
            }
        };
        Self::new(target, config)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Shared handle to the underlying generic client
    pub fn client(&self) -> GenericLogixClient<TcpChannel> {
        self.inner.clone()
    }
}

impl Deref for LogixTcpClient {
    type Target = GenericLogixClient<TcpChannel>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::constants::{DATA_TYPE_STRUCT, EXT_STATUS_STALE_STRUCTURE_HANDLE, GENERAL_STATUS_VENDOR_SPECIFIC};
    use crate::encapsulation::Command;
    use crate::testing::*;

    const ENDPOINT: &str = "10.0.0.5:44818";

    async fn connected_client(mock: &MockTransport) -> GenericLogixClient<MockTransport> {
        script_establish(mock);
        let client = GenericLogixClient::new(mock.clone(), ENDPOINT, ClientConfig::default()).unwrap();
        assert!(client.wait_for_connection().await);
        client
    }

    /// ReadTagFragmented reply of a structure carrying `handle`
    fn struct_reply(handle: u16) -> crate::encapsulation::EncapsulationPacket {
        let mut data = DATA_TYPE_STRUCT.to_le_bytes().to_vec();
        data.extend_from_slice(&handle.to_le_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        service_reply(SERVICE_READ_TAG_FRAGMENTED, 0, data)
    }

    fn stale_handle_reply() -> crate::encapsulation::EncapsulationPacket {
        unit_reply(MessageRouterResponse::new(
            SERVICE_WRITE_TAG_FRAGMENTED | 0x80,
            GENERAL_STATUS_VENDOR_SPECIFIC,
            vec![EXT_STATUS_STALE_STRUCTURE_HANDLE],
            Vec::new(),
        ))
    }

    fn frame_offset(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_sequence_increments_and_skips_zero() {
        let sequence = SequenceGenerator::new(0);
        assert_eq!(sequence.next_sequence(), 1);
        assert_eq!(sequence.next_sequence(), 2);
    }

    #[test]
    fn test_sequence_reseeds_after_max() {
        let sequence = SequenceGenerator {
            seed: 7,
            current: StdMutex::new(0xFFFE),
        };
        assert_eq!(sequence.next_sequence(), 0xFFFF);
        assert_eq!(sequence.next_sequence(), 7);
        assert_eq!(sequence.next_sequence(), 8);
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = GenericLogixClient::new(MockTransport::new(), ENDPOINT, ClientConfig::default());
        assert!(matches!(result, Err(EipError::Client { .. })));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = ClientConfig::default().with_connection_size(0);
        let result = GenericLogixClient::new(MockTransport::new(), ENDPOINT, config);
        assert!(matches!(result, Err(EipError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_establish_connects() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(mock.get_requests()[2].command(), Command::RegisterSession);

        mock.add_packet(read_reply(DATA_TYPE_DINT, &1u32.to_le_bytes()));
        client.read_i32("Tag1").await.unwrap();
        let last = mock.get_requests().pop().unwrap();
        assert_eq!(last.command(), Command::SendUnitData);
        assert_eq!(last.header.session_handle, SESSION);
    }

    #[tokio::test]
    async fn test_read_u32() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(read_reply(DATA_TYPE_DINT, &42u32.to_le_bytes()));
        assert_eq!(client.read_u32("Tag1").await.unwrap(), 42);

        let sent = mock.connected_requests();
        assert_eq!(sent[0].request.service, SERVICE_READ_TAG);
        assert_eq!(sent[0].request.data, vec![0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_read_type_mismatch() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(read_reply(DATA_TYPE_INT, &42u16.to_le_bytes()));
        let err = client.read_u32("Tag1").await.unwrap_err();
        assert_eq!(
            err,
            EipError::BadType {
                expected: DATA_TYPE_DINT,
                actual: DATA_TYPE_INT
            }
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_read_service_error() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(service_reply(SERVICE_READ_TAG, 0x05, Vec::new()));
        let err = client.read_f32("Missing").await.unwrap_err();
        assert_eq!(err.general_status(), Some(0x05));
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(read_reply(DATA_TYPE_INT, &1u16.to_le_bytes()));
        mock.add_packet(read_reply(DATA_TYPE_INT, &2u16.to_le_bytes()));
        client.read_u16("A").await.unwrap();
        client.read_u16("B").await.unwrap();

        let sent = mock.connected_requests();
        assert_ne!(sent[0].sequence, 0);
        assert_eq!(sent[1].sequence, sent[0].sequence + 1);
    }

    #[tokio::test]
    async fn test_fragmented_read() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        let values: Vec<u16> = (0..30).collect();
        for (i, chunk) in values.chunks(10).enumerate() {
            let mut data = DATA_TYPE_INT.to_le_bytes().to_vec();
            data.extend(encode_elements(chunk, u16::to_le_bytes));
            let status = if i < 2 { GENERAL_STATUS_PARTIAL_TRANSFER } else { 0 };
            mock.add_packet(service_reply(SERVICE_READ_TAG_FRAGMENTED, status, data));
        }

        assert_eq!(client.read_u16s("Arr", 30).await.unwrap(), values);

        let offsets: Vec<u32> = mock
            .connected_requests()
            .iter()
            .map(|r| frame_offset(&r.request.data, 2))
            .collect();
        assert_eq!(offsets, vec![0, 20, 40]);
    }

    #[tokio::test]
    async fn test_fragmented_read_fatal_status() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(service_reply(SERVICE_READ_TAG_FRAGMENTED, 0x05, Vec::new()));
        let err = client.read_i32s("Arr", 4).await.unwrap_err();
        assert!(matches!(
            err,
            EipError::ServiceException {
                service: SERVICE_READ_TAG_FRAGMENTED,
                status: 0x05,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_read_bools_unpacks_words() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        let mut data = crate::constants::DATA_TYPE_DWORD.to_le_bytes().to_vec();
        data.extend_from_slice(&0x8000_0005u32.to_le_bytes());
        mock.add_packet(service_reply(SERVICE_READ_TAG_FRAGMENTED, 0, data));

        let bits = client.read_bools("Flags", 32).await.unwrap();
        assert_eq!(bits.len(), 32);
        assert!(bits[0] && !bits[1] && bits[2] && bits[31]);
        assert_eq!(&mock.connected_requests()[0].request.data[..2], &[1, 0]);
    }

    #[tokio::test]
    async fn test_array_write_frames() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        let values: Vec<u16> = (0..300).collect();
        client.write_u16s("Arr", &values).await.unwrap();

        let sent = mock.connected_requests();
        assert_eq!(sent.len(), 2);
        let mut covered = 0u32;
        for request in &sent {
            let data = &request.request.data;
            assert_eq!(request.request.service, SERVICE_WRITE_TAG_FRAGMENTED);
            assert_eq!(&data[..2], &DATA_TYPE_INT.to_le_bytes());
            assert_eq!(&data[2..4], &300u16.to_le_bytes());
            assert_eq!(frame_offset(data, 4), covered);
            let payload = data.len() - 8;
            assert_eq!(payload % 2, 0);
            covered += payload as u32;
        }
        assert_eq!(sent[0].request.data.len() - 8, 480);
        assert_eq!(covered, 600);
    }

    #[tokio::test]
    async fn test_empty_array_write_rejected() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;
        let err = client.write_f32s("Arr", &[]).await.unwrap_err();
        assert!(matches!(err, EipError::Client { .. }));
        assert!(mock.connected_requests().is_empty());
    }

    #[tokio::test]
    async fn test_scalar_write() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(service_reply(SERVICE_WRITE_TAG, 0, Vec::new()));
        client.write_f32("Speed", 1.5).await.unwrap();

        let data = &mock.connected_requests()[0].request.data;
        assert_eq!(&data[..4], &[0xCA, 0x00, 0x01, 0x00]);
        assert_eq!(&data[4..], &1.5f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_write_struct_caches_handle() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(struct_reply(0x1234));
        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        client.write_struct("Recipe", &[1, 2, 3, 4]).await.unwrap();
        client.write_struct("RECIPE", &[5, 6, 7, 8]).await.unwrap();

        let sent = mock.connected_requests();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].request.service, SERVICE_READ_TAG_FRAGMENTED);
        assert_eq!(&sent[2].request.data[2..4], &0x1234u16.to_le_bytes());
    }

    #[tokio::test]
    async fn test_stale_handle_retried_once() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(struct_reply(1));
        mock.add_packet(stale_handle_reply());
        mock.add_packet(struct_reply(2));
        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        client.write_struct("Udt", &[1, 2, 3, 4]).await.unwrap();

        let sent = mock.connected_requests();
        assert_eq!(sent.len(), 4);
        assert_eq!(&sent[3].request.data[2..4], &2u16.to_le_bytes());
    }

    #[tokio::test]
    async fn test_unchanged_stale_handle_fails() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(struct_reply(1));
        mock.add_packet(stale_handle_reply());
        mock.add_packet(struct_reply(1));
        let err = client.write_struct("Udt", &[1, 2, 3, 4]).await.unwrap_err();

        assert!(err.is_stale_structure_handle());
        assert_eq!(mock.connected_requests().len(), 3);
        assert_eq!(mock.pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_write_structs_rejects_uneven_sizes() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        let uneven: [&[u8]; 2] = [&[1, 2], &[3]];
        assert!(client.write_structs("Items", &uneven).await.is_err());
        let empty: [&[u8]; 0] = [];
        assert!(client.write_structs("Items", &empty).await.is_err());
        assert!(mock.connected_requests().is_empty());
    }

    #[tokio::test]
    async fn test_write_string_layout() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(struct_reply(0x0FCE));
        mock.add_packet(service_reply(SERVICE_WRITE_TAG_FRAGMENTED, 0, Vec::new()));
        client.write_string("Msg", "HI", 82).await.unwrap();

        let data = &mock.connected_requests()[1].request.data;
        assert_eq!(data.len(), 10 + 4 + 84);
        assert_eq!(&data[10..14], &2i32.to_le_bytes());
        assert_eq!(&data[14..16], b"HI");
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        let mut ok = DATA_TYPE_DINT.to_le_bytes().to_vec();
        ok.extend_from_slice(&42u32.to_le_bytes());
        let batch = MultipleServiceResponse::new(vec![
            MessageRouterResponse::new(SERVICE_READ_TAG | 0x80, 0, Vec::new(), ok),
            MessageRouterResponse::new(SERVICE_READ_TAG | 0x80, 0x05, vec![0], Vec::new()),
        ]);
        mock.add_packet(service_reply(
            SERVICE_MULTIPLE_SERVICE_PACKET,
            GENERAL_STATUS_EMBEDDED_SERVICE_ERROR,
            batch.to_bytes().unwrap(),
        ));

        let values = client
            .read_tags_typed(&[(TagType::UInt32, "Good"), (TagType::Int16, "Missing")])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(TagValue::U32(42)), None]);
        assert_eq!(mock.connected_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_envelope_failure() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(service_reply(
            SERVICE_MULTIPLE_SERVICE_PACKET,
            GENERAL_STATUS_EMBEDDED_SERVICE_ERROR,
            vec![0xFF],
        ));
        let err = client.read_tags(&["A", "B"]).await.unwrap_err();
        assert!(matches!(
            err,
            EipError::ServiceException {
                service: SERVICE_MULTIPLE_SERVICE_PACKET,
                status: GENERAL_STATUS_EMBEDDED_SERVICE_ERROR,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_not_connected_after_failed_establish() {
        let mock = MockTransport::new();
        let config = ClientConfig::default().with_transaction_timeout(Duration::from_millis(200));
        let client = GenericLogixClient::new(mock.clone(), ENDPOINT, config).unwrap();

        assert!(!client.wait_for_connection().await);
        assert_eq!(client.state(), ConnectionState::Faulted);
        let err = client.read_u32("Tag1").await.unwrap_err();
        assert_eq!(err, EipError::not_connected(ENDPOINT, 1, 0));
        assert_eq!(err.to_string(), "10.0.0.5:44818.1,0 Not Connected");
    }

    #[tokio::test]
    async fn test_exchange_failure_faults_client() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        let err = client.read_u8("Tag1").await.unwrap_err();
        assert!(err.is_transport_fault());
        assert_eq!(client.state(), ConnectionState::Faulted);
        assert_eq!(client.fault_cause(), Some(err));
        assert!(matches!(client.read_u8("Tag1").await, Err(EipError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_keep_alive_cycles_connection() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(forward_close_reply(0));
        mock.add_packet(forward_open_reply(CONNECTION_ID));
        client.keep_alive().await.unwrap();

        let requests = mock.get_requests();
        let tail: Vec<u8> = requests[requests.len() - 2..]
            .iter()
            .map(|p| rr_request(p).service)
            .collect();
        assert_eq!(
            tail,
            vec![crate::constants::SERVICE_FORWARD_CLOSE, crate::constants::SERVICE_FORWARD_OPEN]
        );
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_close_unregisters() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;

        mock.add_packet(forward_close_reply(0));
        client.close().await.unwrap();
        assert!(mock.is_closed());
        let mut requests = mock.get_requests();
        assert_eq!(requests.pop().unwrap().command(), Command::UnregisterSession);
        assert_eq!(requests.pop().unwrap().command(), Command::SendRRData);
        assert_eq!(client.state(), ConnectionState::Faulted);
        assert!(client.transport_stats().await.is_none());
        assert!(matches!(client.read_u8("Tag1").await, Err(EipError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_clones_share_connection() {
        let mock = MockTransport::new();
        let client = connected_client(&mock).await;
        let other = client.clone();

        mock.add_packet(read_reply(DATA_TYPE_INT, &7u16.to_le_bytes()));
        assert_eq!(other.read_i16("Tag1").await.unwrap(), 7);
        assert_eq!(client.transport_stats().await.unwrap().requests_sent, 6);
    }

    #[tokio::test]
    async fn test_from_address_rejects_garbage() {
        let result = LogixTcpClient::from_address("not-an-address", ClientConfig::default());
        assert!(matches!(result, Err(EipError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_faults() {
        let config = ClientConfig::default()
            .with_io_timeout(Duration::from_millis(200))
            .with_transaction_timeout(Duration::from_secs(2));
        let client = LogixTcpClient::from_address("127.0.0.1:1", config).unwrap();
        assert_eq!(client.target().port(), 1);
        assert!(!client.wait_for_connection().await);
        assert!(client.fault_cause().is_some());
    }
}
