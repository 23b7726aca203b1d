//! # Session & Connection Manager
//!
//! Drives one transport through the establishment sequence and owns the
//! resulting session handle and Class 3 connection.
//!
//! ## Establishment
//!
//! | Step | Command | Failure |
//! |------|---------|---------|
//! | 1 | ListIdentity | tolerated unless strict discovery |
//! | 2 | ListServices | tolerated unless strict discovery |
//! | 3 | RegisterSession | fatal |
//! | 4 | Forward-Close (stale connection) | fatal unless status 0x00 / 0x01 |
//! | 5 | Forward-Open | fatal |
//!
//! A fatal failure faults the shared [`StateCell`]; nothing is retried.
//! [`SessionManager::keep_alive`] repeats steps 4 and 5 on demand.

use std::sync::Arc;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::{
    connection_path, ConnectionPriority, ConnectionType, ForwardCloseRequest, ForwardOpenRequest,
    ForwardOpenResponse, NetworkConnectionParams, PriorityTick, ProductionTrigger, TransportClass,
    TransportTrigger,
};
use crate::constants::{
    GENERAL_STATUS_CONNECTION_FAILURE, GENERAL_STATUS_SUCCESS, ITEM_CONNECTED_DATA, ITEM_IDENTITY,
    ITEM_UNCONNECTED_DATA,
};
use crate::cpf::CpfFrame;
use crate::encapsulation::{Command, EncapsulationPacket};
use crate::error::{EipError, EipResult};
use crate::identity::{Identity, ServiceInfo};
use crate::logging::CallbackLogger;
use crate::router::{ConnectedServiceRequest, ConnectedServiceResponse, MessageRouterRequest, MessageRouterResponse};
use crate::segment::path_words;
use crate::state::StateCell;
use crate::transport::EipTransport;

/// Session and connection owner for one transport
pub struct SessionManager<T: EipTransport> {
    transport: T,
    config: ClientConfig,
    endpoint: String,
    state: Arc<StateCell>,
    logger: Option<CallbackLogger>,
    session_handle: u32,
    connection_id: u32,
    accepted_open: Option<ForwardOpenRequest>,
    identity: Option<Identity>,
    services: Vec<ServiceInfo>,
}

impl<T: EipTransport> SessionManager<T> {
    pub fn new(transport: T, config: ClientConfig, endpoint: impl Into<String>, state: Arc<StateCell>) -> Self {
        Self {
            transport,
            config,
            endpoint: endpoint.into(),
            state,
            logger: None,
            session_handle: 0,
            connection_id: 0,
            accepted_open: None,
            identity: None,
            services: Vec::new(),
        }
    }

    pub fn with_logger(mut self, logger: Option<CallbackLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn state(&self) -> &Arc<StateCell> {
        &self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn session_handle(&self) -> u32 {
        self.session_handle
    }

    /// O->T connection ID of the open connection, 0 when closed
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn accepted_open(&self) -> Option<&ForwardOpenRequest> {
        self.accepted_open.as_ref()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn transaction_deadline(&self) -> Instant {
        Instant::now() + self.config.transaction_timeout
    }

    fn not_connected(&self) -> EipError {
        EipError::not_connected(self.endpoint.clone(), self.config.port, self.config.slot)
    }

    // ========================================================================
    // Establishment
    // ========================================================================

    /// Run the establishment sequence and settle the state.
    ///
    /// Marks the state cell finished whatever the outcome.
    pub async fn establish(&mut self) -> EipResult<()> {
        let result = self.run_establish().await;
        match &result {
            Ok(()) => {
                self.state.try_set_connected();
                debug!(
                    endpoint = %self.endpoint,
                    session = self.session_handle,
                    connection_id = self.connection_id,
                    "Connection established"
                );
            }
            Err(e) => {
                self.state.fault(e.clone());
            }
        }
        self.state.mark_finished();
        result
    }

    async fn run_establish(&mut self) -> EipResult<()> {
        if let Err(e) = self.list_identity().await {
            if !self.config.tolerate_discovery_failure {
                return Err(e);
            }
            debug!(error = %e, "ListIdentity failed, continuing");
        }
        if let Err(e) = self.list_services().await {
            if !self.config.tolerate_discovery_failure {
                return Err(e);
            }
            debug!(error = %e, "ListServices failed, continuing");
        }
        self.register_session().await?;
        self.connect_to_message_router().await
    }

    /// Forward-Close then Forward-Open; a failure faults the state
    pub async fn keep_alive(&mut self) -> EipResult<()> {
        if let Err(e) = self.connect_to_message_router().await {
            self.state.fault(e.clone());
            return Err(e);
        }
        Ok(())
    }

    async fn connect_to_message_router(&mut self) -> EipResult<()> {
        self.forward_close().await?;
        self.forward_open().await
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// ListIdentity; the reply holds at most one identity item
    pub async fn list_identity(&mut self) -> EipResult<Option<Identity>> {
        let reply = self.discover(EncapsulationPacket::list_identity()).await?;
        let frame = reply.cpf()?;
        let mut items = frame.items.iter().filter(|item| item.type_id == ITEM_IDENTITY);
        let identity = match (items.next(), items.next()) {
            (None, _) => None,
            (Some(item), None) => Some(Identity::from_cpf_item(item)?),
            (Some(_), Some(_)) => {
                return Err(EipError::protocol("ListIdentity reply holds more than one identity"));
            }
        };
        if let Some(identity) = &identity {
            debug!(%identity, "Device identity");
        }
        self.identity = identity.clone();
        Ok(identity)
    }

    pub async fn list_services(&mut self) -> EipResult<Vec<ServiceInfo>> {
        let reply = self.discover(EncapsulationPacket::list_services()).await?;
        let services = ServiceInfo::list_from_frame(&reply.cpf()?)?;
        debug!(count = services.len(), "Device services");
        self.services = services.clone();
        Ok(services)
    }

    async fn discover(&mut self, request: EncapsulationPacket) -> EipResult<EncapsulationPacket> {
        let timeout = self.config.discovery_timeout;
        let deadline = Instant::now() + timeout;
        let command = request.command();
        self.send_logged(&request, deadline).await?;
        let reply = self
            .transport
            .receive_filtered(command, deadline)
            .await?
            .ok_or_else(|| EipError::timeout(format!("No reply to {}", command), timeout.as_millis() as u64))?;
        self.log_reply(&reply);
        reply.check_status()?;
        Ok(reply)
    }

    // ========================================================================
    // Session
    // ========================================================================

    pub async fn register_session(&mut self) -> EipResult<u32> {
        let deadline = self.transaction_deadline();
        self.send_logged(&EncapsulationPacket::register_session(), deadline)
            .await?;
        let reply = self.transport.receive(deadline).await?;
        self.log_reply(&reply);
        if reply.command() != Command::RegisterSession {
            return Err(EipError::protocol("Unexpected reply packet"));
        }
        reply.check_status()?;
        self.session_handle = reply.header.session_handle;
        debug!(session = format_args!("0x{:08X}", self.session_handle), "Session registered");
        Ok(self.session_handle)
    }

    /// UnregisterSession has no reply
    pub async fn unregister_session(&mut self) -> EipResult<()> {
        let deadline = self.transaction_deadline();
        let request = EncapsulationPacket::unregister_session(self.session_handle);
        self.send_logged(&request, deadline).await?;
        debug!(session = format_args!("0x{:08X}", self.session_handle), "Session unregistered");
        Ok(())
    }

    /// Best-effort Forward-Close and UnregisterSession when connected, then
    /// release the transport. Failures of either request are ignored.
    pub async fn close(&mut self) -> EipResult<()> {
        if self.state.is_connected() {
            if self.accepted_open.is_some() {
                if let Err(e) = self.forward_close().await {
                    debug!(error = %e, "Ignoring Forward-Close failure");
                }
            }
            if let Err(e) = self.unregister_session().await {
                debug!(error = %e, "Ignoring UnregisterSession failure");
            }
        }
        self.transport.close().await
    }

    // ========================================================================
    // Connection manager
    // ========================================================================

    /// Open parameters for a fresh Class 3 connection with random serials
    pub fn build_forward_open(&self) -> EipResult<ForwardOpenRequest> {
        let mut rng = rand::thread_rng();

        let mut params = NetworkConnectionParams::default();
        params.set_redundant_owner(false);
        params.set_connection_type(ConnectionType::PointToPoint);
        params.set_priority(ConnectionPriority::Low);
        params.set_variable_size(true);
        params.set_size(self.config.connection_size)?;

        let mut trigger = TransportTrigger::default();
        trigger.set_server(true);
        trigger.set_production_trigger(ProductionTrigger::ApplicationObject);
        trigger.set_transport_class(TransportClass::Class3);

        let path = connection_path(self.config.port, self.config.slot);
        Ok(ForwardOpenRequest {
            priority_tick: PriorityTick::new(false, self.config.tick_time)?,
            timeout_ticks: self.config.timeout_ticks,
            o_t_connection_id: 0,
            t_o_connection_id: rng.gen_range(0..=i32::MAX as u32),
            connection_serial: rng.gen_range(0..u16::MAX),
            vendor_id: self.config.vendor_id,
            originator_serial: rng.gen_range(0..=i32::MAX as u32),
            timeout_multiplier: self.config.timeout_multiplier,
            o_t_rpi: self.config.rpi_us,
            o_t_params: params,
            t_o_rpi: self.config.rpi_us,
            t_o_params: params,
            transport_trigger: trigger,
            path_size: path_words(&path)?,
            path,
        })
    }

    fn build_forward_close(&self) -> EipResult<ForwardCloseRequest> {
        if let Some(open) = &self.accepted_open {
            return open.close_request();
        }
        let path = connection_path(self.config.port, self.config.slot);
        Ok(ForwardCloseRequest {
            priority_tick: PriorityTick::new(false, self.config.tick_time)?,
            timeout_ticks: self.config.timeout_ticks,
            connection_serial: 0,
            vendor_id: self.config.vendor_id,
            originator_serial: 0,
            path_size: path_words(&path)?,
            path,
        })
    }

    /// Close the current (or a leftover) connection.
    ///
    /// General status 0x01 means the connection did not exist and counts as
    /// closed.
    pub async fn forward_close(&mut self) -> EipResult<()> {
        let deadline = self.transaction_deadline();
        let request = self.build_forward_close()?.to_router_request()?;
        let response = self.send_rr_data(&request, deadline).await?;
        match response.general_status {
            GENERAL_STATUS_SUCCESS | GENERAL_STATUS_CONNECTION_FAILURE => {
                debug!(status = response.general_status, "Forward-Close accepted");
                self.accepted_open = None;
                self.connection_id = 0;
                Ok(())
            }
            status => Err(EipError::unexpected(format!(
                "Forward_Close failed with GeneralStatus = {:02X}",
                status
            ))),
        }
    }

    pub async fn forward_open(&mut self) -> EipResult<()> {
        let deadline = self.transaction_deadline();
        let open = self.build_forward_open()?;
        let response = self.send_rr_data(&open.to_router_request()?, deadline).await?;
        if response.general_status != GENERAL_STATUS_SUCCESS {
            warn!(
                status = response.general_status,
                ext_status = ?response.ext_status,
                "Forward-Open rejected"
            );
            return Err(EipError::unexpected(format!(
                "Forward_Open failed with GeneralStatus = {:02X}",
                response.general_status
            )));
        }
        match ForwardOpenResponse::decode(response.general_status, &response.data)? {
            ForwardOpenResponse::Ok(accepted) => {
                debug!(
                    o_t_connection_id = accepted.o_t_connection_id,
                    t_o_connection_id = accepted.t_o_connection_id,
                    o_t_api = accepted.o_t_api,
                    "Forward-Open accepted"
                );
                self.connection_id = accepted.o_t_connection_id;
                self.accepted_open = Some(open);
                Ok(())
            }
            ForwardOpenResponse::Failed(_) => Err(EipError::unexpected(format!(
                "Forward_Open failed with GeneralStatus = {:02X}",
                response.general_status
            ))),
        }
    }

    // ========================================================================
    // Exchanges
    // ========================================================================

    /// Unconnected request through SendRRData
    pub async fn send_rr_data(
        &mut self,
        request: &MessageRouterRequest,
        deadline: Instant,
    ) -> EipResult<MessageRouterResponse> {
        let frame = CpfFrame::unconnected(request.to_bytes()?);
        let packet = EncapsulationPacket::send_rr_data(self.session_handle, &frame)?;
        let reply = self.exchange(&packet, deadline).await?;
        let frame = reply.cpf()?;
        MessageRouterResponse::from_bytes(frame.item(1)?.expect_type(ITEM_UNCONNECTED_DATA)?)
    }

    /// Connected request through SendUnitData over the open connection
    pub async fn send_unit_data(
        &mut self,
        request: &ConnectedServiceRequest,
        deadline: Instant,
    ) -> EipResult<ConnectedServiceResponse> {
        if self.accepted_open.is_none() {
            return Err(self.not_connected());
        }
        let frame = CpfFrame::connected(self.connection_id, request.to_bytes()?);
        let packet = EncapsulationPacket::send_unit_data(self.session_handle, &frame)?;
        let reply = self.exchange(&packet, deadline).await?;
        let frame = reply.cpf()?;
        ConnectedServiceResponse::from_bytes(frame.item(1)?.expect_type(ITEM_CONNECTED_DATA)?)
    }

    async fn exchange(&mut self, packet: &EncapsulationPacket, deadline: Instant) -> EipResult<EncapsulationPacket> {
        self.send_logged(packet, deadline).await?;
        let reply = self.transport.receive_command(packet.command(), deadline).await?;
        self.log_reply(&reply);
        reply.check_status()?;
        Ok(reply)
    }

    async fn send_logged(&mut self, packet: &EncapsulationPacket, deadline: Instant) -> EipResult<()> {
        if let Some(logger) = &self.logger {
            logger.log_request(packet.command(), packet.header.session_handle, &packet.data);
        }
        self.transport.send(packet, deadline).await
    }

    fn log_reply(&self, packet: &EncapsulationPacket) {
        if let Some(logger) = &self.logger {
            logger.log_response(packet.command(), packet.header.session_handle, &packet.data);
        }
    }
}
