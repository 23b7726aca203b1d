//! # EtherNet/IP Transport Channels
//!
//! Framed, deadline-bounded packet exchange over TCP (stream) and UDP
//! (datagram).
//!
//! | Channel | Framing | Filtered receive |
//! |---------|---------|------------------|
//! | [`StreamChannel`] / [`TcpChannel`] | 24-byte header, then `length` bytes | discards non-matching packets |
//! | [`UdpChannel`] | one packet per datagram | returns the next datagram |
//!
//! Every operation takes an absolute deadline, so one transaction's send and
//! receive share a single budget. Any I/O failure faults the channel; the
//! first fault is kept and every later call fails without touching the
//! socket. A receive whose deadline passes before the first byte of a packet
//! arrives is not a failure: it yields `None` and leaves the channel usable.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::constants::{ENCAPSULATION_HEADER_LEN, MAX_UDP_PACKET_SIZE};
use crate::encapsulation::{Command, EncapsulationHeader, EncapsulationPacket};
use crate::error::{EipError, EipResult};
use crate::identity::Identity;

// ============================================================================
// Statistics
// ============================================================================

/// Channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub faults: u64,
}

// ============================================================================
// Transport trait
// ============================================================================

/// Packet transport used by the session manager and tag engine
pub trait EipTransport: Send + Sync {
    /// Write one packet before `deadline`
    fn send(
        &mut self,
        packet: &EncapsulationPacket,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<()>> + Send;

    /// Read one packet; `None` if the deadline passes before it starts
    fn try_receive(
        &mut self,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<Option<EncapsulationPacket>>> + Send;

    /// Record a fault; only the first one is kept. Returns `cause`.
    fn record_fault(&mut self, cause: EipError) -> EipError;

    /// First recorded fault
    fn fault_cause(&self) -> Option<&EipError>;

    fn is_faulted(&self) -> bool {
        self.fault_cause().is_some()
    }

    fn get_stats(&self) -> TransportStats;

    /// Release the socket; the channel is faulted afterwards
    fn close(&mut self) -> impl Future<Output = EipResult<()>> + Send;

    /// Read one packet, faulting the channel on timeout
    fn receive(
        &mut self,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<EncapsulationPacket>> + Send
    where
        Self: Sized,
    {
        async move {
            let started = Instant::now();
            match self.try_receive(deadline).await? {
                Some(packet) => Ok(packet),
                None => Err(self.record_fault(EipError::timeout(
                    "Receive timed out.",
                    budget_ms(started, deadline),
                ))),
            }
        }
    }

    /// Next packet carrying `command`, discarding others until the deadline.
    /// `None` when nothing matching arrived in time.
    fn receive_filtered(
        &mut self,
        command: Command,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<Option<EncapsulationPacket>>> + Send
    where
        Self: Sized,
    {
        async move {
            while let Some(packet) = self.try_receive(deadline).await? {
                if packet.command() == command {
                    return Ok(Some(packet));
                }
                debug!(
                    expected = %command,
                    received = %packet.command(),
                    "Discarding unexpected packet"
                );
            }
            Ok(None)
        }
    }

    /// Like [`receive_filtered`](Self::receive_filtered), but a timeout is a
    /// fault
    fn receive_command(
        &mut self,
        command: Command,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<EncapsulationPacket>> + Send
    where
        Self: Sized,
    {
        async move {
            let started = Instant::now();
            match self.receive_filtered(command, deadline).await? {
                Some(packet) => Ok(packet),
                None => Err(self.record_fault(EipError::timeout(
                    format!("Timed out waiting for {}", command),
                    budget_ms(started, deadline),
                ))),
            }
        }
    }

    /// Collect packets until the deadline passes
    fn receive_many(
        &mut self,
        deadline: Instant,
    ) -> impl Future<Output = EipResult<Vec<EncapsulationPacket>>> + Send
    where
        Self: Sized,
    {
        async move {
            let mut packets = Vec::new();
            while let Some(packet) = self.try_receive(deadline).await? {
                packets.push(packet);
            }
            Ok(packets)
        }
    }
}

/// Milliseconds an operation started at `started` was given
fn budget_ms(started: Instant, deadline: Instant) -> u64 {
    deadline.saturating_duration_since(started).as_millis() as u64
}

fn channel_unusable(cause: &EipError) -> EipError {
    EipError::transport(format!("Channel faulted: {}", cause))
}

// ============================================================================
// Stream channel
// ============================================================================

/// Framed channel over any byte stream
pub struct StreamChannel<S> {
    stream: Option<S>,
    peer: String,
    fault: Option<EipError>,
    stats: TransportStats,
}

/// Stream channel over TCP
pub type TcpChannel = StreamChannel<TcpStream>;

impl TcpChannel {
    /// Connect to `addr` within `connect_timeout`
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> EipResult<Self> {
        debug!(%addr, ?connect_timeout, "Connecting");
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(EipError::transport(format!("Connect to {} failed: {}", addr, e)));
            }
            Err(_) => {
                return Err(EipError::timeout(
                    format!("Connect to {} timed out", addr),
                    connect_timeout.as_millis() as u64,
                ));
            }
        };
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, addr.to_string()))
    }
}

impl<S> StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            fault: None,
            stats: TransportStats::default(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn usable_stream(&mut self) -> EipResult<&mut S> {
        if let Some(cause) = &self.fault {
            return Err(channel_unusable(cause));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| EipError::transport("Channel closed"))
    }

    async fn read_packet(&mut self, deadline: Instant) -> EipResult<Option<EncapsulationPacket>> {
        let started = Instant::now();
        let stream = self.usable_stream()?;

        let mut header = [0u8; ENCAPSULATION_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            match timeout_at(deadline, stream.read(&mut header[filled..])).await {
                Err(_) if filled == 0 => return Ok(None),
                Err(_) => return Err(EipError::timeout("Receive timed out.", budget_ms(started, deadline))),
                Ok(Ok(0)) => return Err(EipError::transport("Connection Reset")),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        let header = EncapsulationHeader::from_bytes(&header)?;
        let mut data = vec![0u8; header.length as usize];
        match timeout_at(deadline, stream.read_exact(&mut data)).await {
            Err(_) => return Err(EipError::timeout("Receive timed out.", budget_ms(started, deadline))),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(_)) => {}
        }

        Ok(Some(EncapsulationPacket {
            header,
            data: data.into(),
        }))
    }
}

impl<S> EipTransport for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn send(&mut self, packet: &EncapsulationPacket, deadline: Instant) -> EipResult<()> {
        let started = Instant::now();
        let buf = packet.encode()?;
        let stream = self.usable_stream()?;
        let result = match timeout_at(deadline, stream.write_all(&buf)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EipError::from(e)),
            Err(_) => Err(EipError::timeout("Send timed out.", budget_ms(started, deadline))),
        };
        match result {
            Ok(()) => {
                self.stats.requests_sent += 1;
                self.stats.bytes_sent += buf.len() as u64;
                trace!(
                    command = %packet.command(),
                    length = packet.header.length,
                    session = packet.header.session_handle,
                    "Sent packet"
                );
                Ok(())
            }
            Err(e) => Err(self.record_fault(e)),
        }
    }

    async fn try_receive(&mut self, deadline: Instant) -> EipResult<Option<EncapsulationPacket>> {
        match self.read_packet(deadline).await {
            Ok(Some(packet)) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += packet.encoded_len() as u64;
                trace!(
                    command = %packet.command(),
                    length = packet.header.length,
                    session = packet.header.session_handle,
                    "Received packet"
                );
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) if self.fault.is_some() => Err(e),
            Err(e) => Err(self.record_fault(e)),
        }
    }

    fn record_fault(&mut self, cause: EipError) -> EipError {
        if self.fault.is_none() {
            warn!(peer = %self.peer, %cause, "Channel faulted");
            self.fault = Some(cause.clone());
            self.stats.faults += 1;
        }
        cause
    }

    fn fault_cause(&self) -> Option<&EipError> {
        self.fault.as_ref()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }

    async fn close(&mut self) -> EipResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        if self.fault.is_none() {
            self.fault = Some(EipError::transport("Channel disposed"));
        }
        Ok(())
    }
}

// ============================================================================
// Datagram channel
// ============================================================================

/// Datagram channel; every datagram holds exactly one packet
pub struct UdpChannel {
    /// `None` once closed
    socket: Option<UdpSocket>,
    peer: Option<SocketAddr>,
    fault: Option<EipError>,
    stats: TransportStats,
    buffer: Vec<u8>,
}

impl UdpChannel {
    /// Bind to a local IPv4 address
    pub async fn bind(local: SocketAddr) -> EipResult<Self> {
        if !local.is_ipv4() {
            return Err(EipError::configuration(format!(
                "Local endpoint must be IPv4, got {}",
                local
            )));
        }
        let socket = UdpSocket::bind(local).await?;
        debug!(local = ?socket.local_addr().ok(), "Bound datagram channel");
        Ok(Self {
            socket: Some(socket),
            peer: None,
            fault: None,
            stats: TransportStats::default(),
            buffer: vec![0u8; MAX_UDP_PACKET_SIZE],
        })
    }

    /// Default destination for [`EipTransport::send`]; replies from other
    /// hosts are ignored once set
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn local_addr(&self) -> EipResult<SocketAddr> {
        Ok(self.socket()?.local_addr()?)
    }

    pub fn set_broadcast(&self, enabled: bool) -> EipResult<()> {
        Ok(self.socket()?.set_broadcast(enabled)?)
    }

    fn socket(&self) -> EipResult<&UdpSocket> {
        live_socket(&self.socket, &self.fault)
    }

    pub async fn send_to(
        &mut self,
        packet: &EncapsulationPacket,
        target: SocketAddr,
        deadline: Instant,
    ) -> EipResult<()> {
        let started = Instant::now();
        let buf = packet.encode()?;
        let sent = timeout_at(deadline, self.socket()?.send_to(&buf, target)).await;
        let result = match sent {
            Ok(Ok(n)) if n == buf.len() => Ok(()),
            Ok(Ok(n)) => Err(EipError::transport(format!(
                "Short datagram send: {} of {} bytes",
                n,
                buf.len()
            ))),
            Ok(Err(e)) => Err(EipError::from(e)),
            Err(_) => Err(EipError::timeout("Send timed out.", budget_ms(started, deadline))),
        };
        match result {
            Ok(()) => {
                self.stats.requests_sent += 1;
                self.stats.bytes_sent += buf.len() as u64;
                trace!(command = %packet.command(), %target, "Sent datagram");
                Ok(())
            }
            Err(e) => Err(self.record_fault(e)),
        }
    }

    /// Next well-formed packet and its source; `None` at the deadline.
    ///
    /// Malformed datagrams are protocol violations but leave the channel
    /// usable.
    pub async fn receive_from(
        &mut self,
        deadline: Instant,
    ) -> EipResult<Option<(EncapsulationPacket, SocketAddr)>> {
        loop {
            let socket = live_socket(&self.socket, &self.fault)?;
            let received = timeout_at(deadline, socket.recv_from(&mut self.buffer)).await;
            let (len, source) = match received {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(self.record_fault(e.into())),
                Ok(Ok(received)) => received,
            };
            if self.peer.is_some_and(|peer| peer != source) {
                trace!(%source, "Ignoring datagram from another host");
                continue;
            }
            self.stats.responses_received += 1;
            self.stats.bytes_received += len as u64;
            let packet = EncapsulationPacket::decode(&self.buffer[..len])?;
            trace!(command = %packet.command(), %source, "Received datagram");
            return Ok(Some((packet, source)));
        }
    }

    /// Collect datagrams until the deadline, skipping malformed ones
    pub async fn receive_many_from(
        &mut self,
        deadline: Instant,
    ) -> EipResult<Vec<(EncapsulationPacket, SocketAddr)>> {
        let mut packets = Vec::new();
        loop {
            match self.receive_from(deadline).await {
                Ok(Some(received)) => packets.push(received),
                Ok(None) => return Ok(packets),
                Err(EipError::ProtocolViolation { message }) => {
                    debug!(%message, "Skipping malformed datagram");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Broadcast ListIdentity and collect every identity that answers
    /// before `wait` elapses
    pub async fn discover(broadcast: SocketAddr, wait: Duration) -> EipResult<Vec<(SocketAddr, Identity)>> {
        let mut channel = Self::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
        channel.set_broadcast(true)?;

        let deadline = Instant::now() + wait;
        channel
            .send_to(&EncapsulationPacket::list_identity(), broadcast, deadline)
            .await?;

        let mut found = Vec::new();
        for (packet, source) in channel.receive_many_from(deadline).await? {
            if packet.command() != Command::ListIdentity {
                continue;
            }
            match packet.cpf().and_then(|frame| Identity::list_from_frame(&frame)) {
                Ok(identities) => found.extend(identities.into_iter().map(|identity| (source, identity))),
                Err(e) => debug!(%source, error = %e, "Ignoring unreadable identity reply"),
            }
        }
        debug!(%broadcast, devices = found.len(), "Discovery finished");
        Ok(found)
    }
}

impl EipTransport for UdpChannel {
    async fn send(&mut self, packet: &EncapsulationPacket, deadline: Instant) -> EipResult<()> {
        let target = self
            .peer
            .ok_or_else(|| EipError::configuration("Datagram channel has no peer"))?;
        self.send_to(packet, target, deadline).await
    }

    async fn try_receive(&mut self, deadline: Instant) -> EipResult<Option<EncapsulationPacket>> {
        Ok(self.receive_from(deadline).await?.map(|(packet, _)| packet))
    }

    /// Datagrams are already framed, so the next one is returned whatever
    /// its command
    async fn receive_filtered(
        &mut self,
        _command: Command,
        deadline: Instant,
    ) -> EipResult<Option<EncapsulationPacket>> {
        self.try_receive(deadline).await
    }

    fn record_fault(&mut self, cause: EipError) -> EipError {
        if self.fault.is_none() {
            warn!(peer = ?self.peer, %cause, "Datagram channel faulted");
            self.fault = Some(cause.clone());
            self.stats.faults += 1;
        }
        cause
    }

    fn fault_cause(&self) -> Option<&EipError> {
        self.fault.as_ref()
    }

    fn get_stats(&self) -> TransportStats {
        self.stats
    }

    async fn close(&mut self) -> EipResult<()> {
        if self.socket.take().is_some() {
            debug!(peer = ?self.peer, "Released datagram socket");
        }
        if self.fault.is_none() {
            self.fault = Some(EipError::transport("Channel disposed"));
        }
        Ok(())
    }
}

fn live_socket<'a>(socket: &'a Option<UdpSocket>, fault: &Option<EipError>) -> EipResult<&'a UdpSocket> {
    if let Some(cause) = fault {
        return Err(channel_unusable(cause));
    }
    socket
        .as_ref()
        .ok_or_else(|| EipError::transport("Channel closed"))
}
