//! Scripted transport and reply builders shared by the session and client tests

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::connection::{ForwardOpenResponse, ForwardOpenSuccess};
use crate::cpf::{CpfFrame, CpfItem};
use crate::encapsulation::{Command, EncapsulationPacket};
use crate::error::{EipError, EipResult};
use crate::identity::{Identity, Revision, ServiceInfo, SockAddr};
use crate::router::{ConnectedServiceRequest, ConnectedServiceResponse, MessageRouterRequest, MessageRouterResponse};
use crate::transport::{EipTransport, TransportStats};

pub const SESSION: u32 = 0x12345678;
pub const CONNECTION_ID: u32 = 0x0BAD_F00D;

/// Transport that records sent packets and replays a FIFO of replies.
///
/// Clones share the same queues, so a test keeps one handle while the
/// client owns the other. An empty queue behaves like a silent peer.
#[derive(Clone, Default)]
pub struct MockTransport {
    requests: Arc<Mutex<Vec<EncapsulationPacket>>>,
    responses: Arc<Mutex<VecDeque<EipResult<EncapsulationPacket>>>>,
    fault: Option<EipError>,
    closed: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, response: EipResult<EncapsulationPacket>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn add_packet(&self, packet: EncapsulationPacket) {
        self.add_response(Ok(packet));
    }

    pub fn get_requests(&self) -> Vec<EncapsulationPacket> {
        self.requests.lock().unwrap().clone()
    }

    /// Connected requests sent so far, in order
    pub fn connected_requests(&self) -> Vec<ConnectedServiceRequest> {
        self.get_requests()
            .iter()
            .filter(|packet| packet.command() == Command::SendUnitData)
            .map(|packet| {
                let frame = packet.cpf().unwrap();
                ConnectedServiceRequest::from_bytes(&frame.items[1].data).unwrap()
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl EipTransport for MockTransport {
    async fn send(&mut self, packet: &EncapsulationPacket, _deadline: Instant) -> EipResult<()> {
        if let Some(cause) = &self.fault {
            return Err(cause.clone());
        }
        self.requests.lock().unwrap().push(packet.clone());
        Ok(())
    }

    async fn try_receive(&mut self, _deadline: Instant) -> EipResult<Option<EncapsulationPacket>> {
        if let Some(cause) = &self.fault {
            return Err(cause.clone());
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(packet)) => Ok(Some(packet)),
            Some(Err(e)) => Err(self.record_fault(e)),
            None => Ok(None),
        }
    }

    fn record_fault(&mut self, cause: EipError) -> EipError {
        if self.fault.is_none() {
            self.fault = Some(cause.clone());
        }
        cause
    }

    fn fault_cause(&self) -> Option<&EipError> {
        self.fault.as_ref()
    }

    fn get_stats(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests.lock().unwrap().len() as u64,
            ..TransportStats::default()
        }
    }

    async fn close(&mut self) -> EipResult<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

// ============================================================================
// Reply builders
// ============================================================================

pub fn sample_identity() -> Identity {
    Identity {
        protocol_version: 1,
        socket_address: SockAddr::from(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 44818)),
        vendor_id: 1,
        device_type: 0x0E,
        product_code: 0x5A,
        revision: Revision { major: 32, minor: 11 },
        status: 0x0060,
        serial_number: 0xC0FFEE01,
        product_name: "1756-L83E/B".to_string(),
        state: 3,
    }
}

pub fn list_identity_reply() -> EncapsulationPacket {
    let frame = CpfFrame::new(vec![sample_identity().to_cpf_item().unwrap()]);
    EncapsulationPacket::new(Command::ListIdentity, 0, frame.to_bytes().unwrap()).unwrap()
}

pub fn list_services_reply() -> EncapsulationPacket {
    let frame = CpfFrame::new(vec![ServiceInfo::communications().to_cpf_item()]);
    EncapsulationPacket::new(Command::ListServices, 0, frame.to_bytes().unwrap()).unwrap()
}

pub fn register_reply(session: u32) -> EncapsulationPacket {
    let mut packet = EncapsulationPacket::register_session();
    packet.header.session_handle = session;
    packet
}

/// SendRRData reply wrapping an unconnected router response
pub fn rr_reply(response: MessageRouterResponse) -> EncapsulationPacket {
    let frame = CpfFrame::unconnected(response.to_bytes().unwrap());
    EncapsulationPacket::send_rr_data(SESSION, &frame).unwrap()
}

pub fn forward_close_reply(status: u8) -> EncapsulationPacket {
    let data = if status == 0 {
        vec![0x01, 0x00, 0xDD, 0xBA, 0, 0, 0, 0, 0, 0]
    } else {
        Vec::new()
    };
    rr_reply(MessageRouterResponse::new(0xCE, status, Vec::new(), data))
}

pub fn forward_open_reply(connection_id: u32) -> EncapsulationPacket {
    let ok = ForwardOpenResponse::Ok(ForwardOpenSuccess {
        o_t_connection_id: connection_id,
        t_o_connection_id: 0x2222,
        connection_serial: 1,
        vendor_id: 0xBADD,
        originator_serial: 7,
        o_t_api: 2_000_000,
        t_o_api: 2_000_000,
        app_reply_size: 0,
        app_reply: Vec::new(),
    });
    rr_reply(MessageRouterResponse::new(0xD4, 0, Vec::new(), ok.to_bytes().unwrap()))
}

/// SendUnitData reply wrapping a connected router response
pub fn unit_reply(response: MessageRouterResponse) -> EncapsulationPacket {
    let connected = ConnectedServiceResponse::new(1, response);
    let frame = CpfFrame::connected(CONNECTION_ID, connected.to_bytes().unwrap());
    EncapsulationPacket::send_unit_data(SESSION, &frame).unwrap()
}

/// Successful reply of `service` carrying `data`
pub fn service_reply(service: u8, status: u8, data: Vec<u8>) -> EncapsulationPacket {
    unit_reply(MessageRouterResponse::new(service | 0x80, status, Vec::new(), data))
}

/// ReadTag reply: data type followed by the value bytes
pub fn read_reply(data_type: u16, value: &[u8]) -> EncapsulationPacket {
    let mut data = data_type.to_le_bytes().to_vec();
    data.extend_from_slice(value);
    service_reply(crate::constants::SERVICE_READ_TAG, 0, data)
}

/// Queue the replies of a full establishment
pub fn script_establish(mock: &MockTransport) {
    mock.add_packet(list_identity_reply());
    mock.add_packet(list_services_reply());
    mock.add_packet(register_reply(SESSION));
    mock.add_packet(forward_close_reply(0x01));
    mock.add_packet(forward_open_reply(CONNECTION_ID));
}

/// Router request carried by a SendRRData packet
pub fn rr_request(packet: &EncapsulationPacket) -> MessageRouterRequest {
    let frame = packet.cpf().unwrap();
    let item: &CpfItem = &frame.items[1];
    MessageRouterRequest::from_bytes(&item.data).unwrap()
}
