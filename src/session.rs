//! The data pump: owns one client connection end-to-end, from the protocol
//! header through backend selection, handshake splicing, opaque frame
//! forwarding, and teardown.
//!
//! Grounded on spec.md §4.3/§4.4 (`libamqpprox_session.cpp`/
//! `amqpprox_connectionselector.cpp`). The original drives this with a
//! chain of Boost.Asio completion handlers reading via edge-triggered
//! null-buffer probes; per spec.md §9's "Callback-heavy socket
//! abstraction" redesign note, this is rebuilt as a single async task per
//! session instead, using `tokio::select!` to race the two socket halves
//! rather than a handler chain. `attempt_resolved_connection`'s endpoint
//! retry is likewise collapsed from a separate recursive step into a loop
//! inside [`Session::attempt_connection`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, info_span, warn, Instrument};

use amqpprox_core::SessionId;

use crate::auth::{AuthDecision, AuthInterceptor};
use crate::backend::Backend;
use crate::buffer::BufferPool;
use crate::connection_selector::{ConnectionSelector, Status as SelectorStatus};
use crate::connector::{self, Connector, ConnectorConfig, ConnectorState, FlowType};
use crate::dns::DnsResolver;
use crate::events::EventSource;
use crate::hostname::HostnameMapper;
use crate::fieldtable::CodecError;
use crate::frame::{self, DecodeOutcome};
use crate::methods;
use crate::proxyprotocol::{self, ProxyProtocolError};
use crate::resourcemap::ConnectionManager;
use crate::socket::{Socket, TlsContext};
use crate::stats::SessionRegistry;
use crate::control::VhostState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] frame::DecodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    ProxyProtocol(#[from] ProxyProtocolError),
    #[error(transparent)]
    InvalidServerName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("no client TLS config is configured but backend requires TLS")]
    TlsNotConfigured,
}

/// Once set, must never revert - see spec.md §4.3's `DisconnectStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectStatus {
    NotDisconnected = 0,
    DisconnectedCleanly = 1,
    DisconnectedClient = 2,
    DisconnectedServer = 3,
    DisconnectedProxy = 4,
}

impl DisconnectStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::DisconnectedCleanly,
            2 => Self::DisconnectedClient,
            3 => Self::DisconnectedServer,
            4 => Self::DisconnectedProxy,
            _ => Self::NotDisconnected,
        }
    }
}

/// A set-once cell: the first non-zero write wins, every later write is
/// ignored. Backs `SessionState::disconnect_status`.
#[derive(Default)]
struct DisconnectCell(AtomicU8);

impl DisconnectCell {
    fn set(&self, status: DisconnectStatus) {
        let _ = self
            .0
            .compare_exchange(0, status as u8, Ordering::AcqRel, Ordering::Acquire);
    }

    fn get(&self) -> DisconnectStatus {
        DisconnectStatus::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Per-connection state, readable from the control thread for `STAT`
/// reporting while mutated only from the session's own task. Fields named
/// per spec.md §4.3's `SessionState`.
pub struct SessionState {
    pub id: SessionId,
    vhost: RwLock<Option<String>>,
    paused: AtomicBool,
    ready_to_connect_on_unpause: AtomicBool,
    disconnect_status: DisconnectCell,
    pub ingress_local: SocketAddr,
    pub ingress_remote: SocketAddr,
    egress_local: RwLock<Option<SocketAddr>>,
    egress_remote: RwLock<Option<SocketAddr>>,
    pub ingress_secured: bool,
    limited_connection: AtomicBool,
    auth_denied_connection: AtomicBool,
    force_disconnect_requested: AtomicBool,
    backend_disconnect_requested: AtomicBool,

    ingress_bytes: AtomicU64,
    ingress_frames: AtomicU64,
    ingress_packets: AtomicU64,
    egress_bytes: AtomicU64,
    egress_frames: AtomicU64,
    egress_packets: AtomicU64,
    ingress_latency_total: AtomicU64,
    ingress_latency_count: AtomicU64,
    egress_latency_total: AtomicU64,
    egress_latency_count: AtomicU64,
}

impl SessionState {
    fn new(ingress_local: SocketAddr, ingress_remote: SocketAddr, ingress_secured: bool) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::next(),
            vhost: RwLock::new(None),
            paused: AtomicBool::new(false),
            ready_to_connect_on_unpause: AtomicBool::new(false),
            disconnect_status: DisconnectCell::default(),
            ingress_local,
            ingress_remote,
            egress_local: RwLock::new(None),
            egress_remote: RwLock::new(None),
            ingress_secured,
            limited_connection: AtomicBool::new(false),
            auth_denied_connection: AtomicBool::new(false),
            force_disconnect_requested: AtomicBool::new(false),
            backend_disconnect_requested: AtomicBool::new(false),
            ingress_bytes: AtomicU64::new(0),
            ingress_frames: AtomicU64::new(0),
            ingress_packets: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            egress_frames: AtomicU64::new(0),
            egress_packets: AtomicU64::new(0),
            ingress_latency_total: AtomicU64::new(0),
            ingress_latency_count: AtomicU64::new(0),
            egress_latency_total: AtomicU64::new(0),
            egress_latency_count: AtomicU64::new(0),
        })
    }

    pub fn vhost(&self) -> Option<String> {
        self.vhost.read().clone()
    }

    fn set_vhost(&self, vhost: String) {
        *self.vhost.write() = Some(vhost);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Exposed beyond the owning `Session` so the control channel's `VHOST
    /// PAUSE`/`UNPAUSE` verbs can toggle a session they don't otherwise
    /// hold a `&mut` reference to; the session's own task observes this
    /// flag cooperatively (see `Session::drive`'s poll tick).
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// `VHOST FORCE_DISCONNECT`: ask the owning session's task to tear the
    /// whole connection down next time it polls.
    pub fn request_force_disconnect(&self) {
        self.force_disconnect_requested.store(true, Ordering::Release);
    }

    fn take_force_disconnect_request(&self) -> bool {
        self.force_disconnect_requested.swap(false, Ordering::AcqRel)
    }

    /// `VHOST BACKEND_DISCONNECT`: ask the owning session's task to shut
    /// down just the broker leg, leaving the client leg for the Connector's
    /// own close handling to observe.
    pub fn request_backend_disconnect(&self) {
        self.backend_disconnect_requested.store(true, Ordering::Release);
    }

    fn take_backend_disconnect_request(&self) -> bool {
        self.backend_disconnect_requested.swap(false, Ordering::AcqRel)
    }

    fn set_ready_to_connect_on_unpause(&self, ready: bool) {
        self.ready_to_connect_on_unpause.store(ready, Ordering::Release);
    }

    pub fn disconnect_status(&self) -> DisconnectStatus {
        self.disconnect_status.get()
    }

    pub fn finished(&self) -> bool {
        self.disconnect_status() != DisconnectStatus::NotDisconnected
    }

    fn egress_endpoints(&self) -> (Option<SocketAddr>, Option<SocketAddr>) {
        (*self.egress_local.read(), *self.egress_remote.read())
    }

    /// The backend endpoint this session is (or was) connected to, for
    /// stats aggregation by backend.
    pub fn egress_remote(&self) -> Option<SocketAddr> {
        *self.egress_remote.read()
    }

    fn set_egress_endpoints(&self, local: SocketAddr, remote: SocketAddr) {
        *self.egress_local.write() = Some(local);
        *self.egress_remote.write() = Some(remote);
    }

    pub fn limited_connection(&self) -> bool {
        self.limited_connection.load(Ordering::Acquire)
    }

    pub fn auth_denied_connection(&self) -> bool {
        self.auth_denied_connection.load(Ordering::Acquire)
    }

    fn count(&self, direction: FlowType, bytes: u64, frames: u64) {
        let (b, f, p) = match direction {
            FlowType::Ingress => (&self.ingress_bytes, &self.ingress_frames, &self.ingress_packets),
            FlowType::Egress => (&self.egress_bytes, &self.egress_frames, &self.egress_packets),
        };
        b.fetch_add(bytes, Ordering::Relaxed);
        f.fetch_add(frames, Ordering::Relaxed);
        p.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ingress_bytes(&self) -> u64 {
        self.ingress_bytes.load(Ordering::Relaxed)
    }

    pub fn egress_bytes(&self) -> u64 {
        self.egress_bytes.load(Ordering::Relaxed)
    }

    pub fn ingress_frames(&self) -> u64 {
        self.ingress_frames.load(Ordering::Relaxed)
    }

    pub fn egress_frames(&self) -> u64 {
        self.egress_frames.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(ingress_local: SocketAddr, ingress_remote: SocketAddr, secured: bool) -> Arc<Self> {
        Self::new(ingress_local, ingress_remote, secured)
    }

    #[cfg(test)]
    pub(crate) fn set_vhost_for_test(&self, vhost: String) {
        self.set_vhost(vhost);
    }

    #[cfg(test)]
    pub(crate) fn count_for_test(&self, direction: FlowType, bytes: u64, frames: u64) {
        self.count(direction, bytes, frames);
    }

    #[cfg(test)]
    pub(crate) fn mark_finished_for_test(&self) {
        self.disconnect_status.set(DisconnectStatus::DisconnectedCleanly);
    }
}

/// The dependencies a session needs beyond its own two sockets: shared
/// stores and services that outlive any single connection.
pub struct SessionDeps {
    pub connector_config: Arc<ConnectorConfig>,
    pub buffer_pool: Arc<BufferPool>,
    pub events: Arc<EventSource>,
    pub dns: Arc<DnsResolver>,
    pub hostname_mapper: Arc<HostnameMapper>,
    pub connection_selector: Arc<ConnectionSelector>,
    /// Shared with the control channel's `ControlState::auth` so `AUTH
    /// SET`/`AUTH CLEAR` take effect on already-running sessions too.
    pub auth: Arc<RwLock<Option<Arc<AuthInterceptor>>>>,
    /// Shared with `ControlState::tls` for the same reason, for `TLS
    /// SERVER`/`TLS CLIENT`/`TLS CLEAR_CLIENT`.
    pub tls: Arc<RwLock<TlsContext>>,
    pub local_hostname: String,
    pub max_frame_size: usize,
    pub registry: Arc<SessionRegistry>,
    pub vhost_state: Arc<VhostState>,
}

enum ReadOutcome {
    Data(Vec<u8>),
    Eof,
}

async fn read_chunk(socket: &mut Socket, pool: &Arc<BufferPool>, max_frame_size: usize) -> std::io::Result<ReadOutcome> {
    let mut handle = pool.acquire(max_frame_size);
    let n = socket.read(handle.spare_capacity()).await?;
    if n == 0 {
        return Ok(ReadOutcome::Eof);
    }
    handle.advance(n);
    Ok(ReadOutcome::Data(handle.as_slice().to_vec()))
}

pub struct Session {
    ingress: Socket,
    egress: Option<Socket>,
    connector: Connector,
    state: Arc<SessionState>,
    deps: Arc<SessionDeps>,
    ingress_staging: BytesMut,
    egress_staging: BytesMut,
    retry_count: usize,
    current_manager: Option<ConnectionManager>,
    /// Last pause state observed by this task's own poll loop, so
    /// `poll_control_requests` can detect the pause -> unpause edge rather
    /// than reacting to "currently unpaused" on every tick.
    was_paused: bool,
}

impl Session {
    /// Accept a new client connection: terminate ingress TLS if configured,
    /// record endpoints, and construct the session ready to `run`.
    pub async fn accept(stream: tokio::net::TcpStream, deps: Arc<SessionDeps>) -> std::io::Result<Self> {
        let mut socket = Socket::from_tcp(stream)?;
        let acceptor = deps.tls.read().acceptor();
        let secured = acceptor.is_some();
        if let Some(acceptor) = acceptor {
            socket = socket.upgrade_server(acceptor).await?;
        }
        let info = socket.info();
        let state = SessionState::new(info.local_addr, info.peer_addr, secured);
        deps.events.emit_connection_received(state.id);
        deps.registry.register(state.clone());
        deps.hostname_mapper.prime(&[info.local_addr, info.peer_addr]).await;

        Ok(Self {
            ingress: socket,
            egress: None,
            connector: Connector::new(deps.connector_config.clone()),
            state,
            deps,
            ingress_staging: BytesMut::new(),
            egress_staging: BytesMut::new(),
            retry_count: 0,
            current_manager: None,
            was_paused: false,
        })
    }

    pub fn state(&self) -> Arc<SessionState> {
        self.state.clone()
    }

    /// Drive the session to completion: client handshake, backend
    /// handshake, opaque forwarding, teardown.
    pub async fn run(mut self) {
        let span = info_span!("session", id = %self.state.id);
        async move {
            self.drive().await;
        }
        .instrument(span)
        .await;
    }

    async fn drive(&mut self) {
        // Polled rather than pushed: the control channel runs on its own
        // task and only has an `Arc<SessionState>`, so VHOST PAUSE/UNPAUSE/
        // FORCE_DISCONNECT/BACKEND_DISCONNECT set flags there and this tick
        // is what actually acts on them from the session's own task.
        let mut control_tick = tokio::time::interval(Duration::from_millis(50));
        control_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Ingress-only until the broker leg exists: the client drives
        // everything up through `connection.open`.
        while self.egress.is_none() && !self.state.finished() {
            tokio::select! {
                result = read_chunk(&mut self.ingress, &self.deps.buffer_pool, self.deps.max_frame_size) => {
                    match result {
                        Ok(ReadOutcome::Data(data)) => {
                            if let Err(e) = self.handle_data(FlowType::Ingress, &data).await {
                                warn!(error = %e, "ingress decode error before backend established");
                                self.force_disconnect().await;
                            }
                        }
                        Ok(ReadOutcome::Eof) => {
                            self.attribute_peer_shutdown(FlowType::Ingress);
                        }
                        Err(e) => {
                            warn!(error = %e, "ingress read error before backend established");
                            self.attribute_peer_shutdown(FlowType::Ingress);
                        }
                    }
                }
                _ = control_tick.tick() => {
                    self.poll_control_requests().await;
                }
            }
        }

        while !self.state.finished() {
            if self.egress.is_none() {
                break;
            }
            tokio::select! {
                result = read_chunk(&mut self.ingress, &self.deps.buffer_pool, self.deps.max_frame_size) => {
                    self.on_read(FlowType::Ingress, result).await;
                }
                result = read_chunk(self.egress.as_mut().unwrap(), &self.deps.buffer_pool, self.deps.max_frame_size) => {
                    self.on_read(FlowType::Egress, result).await;
                }
                _ = control_tick.tick() => {
                    self.poll_control_requests().await;
                }
            }
        }

        self.teardown().await;
    }

    async fn poll_control_requests(&mut self) {
        if self.state.take_force_disconnect_request() {
            self.force_disconnect().await;
            return;
        }
        if self.state.take_backend_disconnect_request() {
            self.backend_disconnect().await;
        }
        let now_paused = self.state.is_paused();
        if self.was_paused && !now_paused {
            // `unpause()` in spec.md §4.3.5: a session that was paused while
            // still waiting to establish its backend connection resumes that
            // attempt. One paused after already reaching `Open` dropped
            // ingress frames while suppressed and is no longer viable, so it
            // is force-disconnected instead of resumed.
            if self.state.ready_to_connect_on_unpause.swap(false, Ordering::AcqRel) {
                if let Err(e) = self.establish_connection().await {
                    warn!(error = %e, "reconnect after unpause failed");
                    self.force_disconnect().await;
                }
            } else {
                self.force_disconnect().await;
            }
        }
        self.was_paused = now_paused;
    }

    async fn on_read(&mut self, direction: FlowType, result: std::io::Result<ReadOutcome>) {
        if direction == FlowType::Ingress && self.state.is_paused() {
            // Paused sessions suppress ingress processing; the bytes are
            // simply dropped until unpause, per spec.md §4.3.2 step 4. The
            // broker leg keeps flowing normally.
            return;
        }
        match result {
            Ok(ReadOutcome::Data(data)) => {
                if let Err(e) = self.handle_data(direction, &data).await {
                    warn!(error = %e, ?direction, "frame decode error");
                    self.force_disconnect().await;
                }
            }
            Ok(ReadOutcome::Eof) => self.attribute_peer_shutdown(direction),
            Err(e) => {
                warn!(error = %e, ?direction, "socket read error");
                self.attribute_peer_shutdown(direction);
            }
        }
    }

    fn staging(&mut self, direction: FlowType) -> &mut BytesMut {
        match direction {
            FlowType::Ingress => &mut self.ingress_staging,
            FlowType::Egress => &mut self.egress_staging,
        }
    }

    /// Feed freshly read bytes through the connector (for handshake frames)
    /// or forward them opaquely (once OPEN). See spec.md §4.3.3.
    async fn handle_data(&mut self, direction: FlowType, data: &[u8]) -> Result<(), SessionError> {
        let mut buf = std::mem::take(self.staging(direction));
        buf.extend_from_slice(data);

        if self.connector.state() == ConnectorState::AwaitingProtocolHeader {
            if buf.len() < 8 {
                *self.staging(direction) = buf;
                return Ok(());
            }
            let header = buf.split_to(8);
            self.connector.receive_protocol_header(&header);
            self.flush_connector_output().await?;
        }

        let mut forward_bytes: u64 = 0;
        let mut forward_frames: u64 = 0;
        let mut forward_buf = BytesMut::new();

        loop {
            match frame::decode(&buf, self.deps.max_frame_size) {
                Ok(DecodeOutcome::NeedMoreData) => break,
                Err(e) => return Err(e.into()),
                Ok(DecodeOutcome::Frame { frame, consumed }) => {
                    if frame.frame_type == frame::FRAME_TYPE_METHOD && self.connector.state() != ConnectorState::Open {
                        // Hand every method frame to the connector even if it
                        // isn't connection-class - the connector itself
                        // rejects anything else with a state transition to
                        // Error, which we still need to observe below.
                        let (header, rest) = methods::decode_method_header(frame.payload)?;
                        let prev_state = self.connector.state();
                        self.connector.receive_method(header, rest, direction);
                        self.flush_connector_output().await?;

                        if prev_state == ConnectorState::AwaitingOpen
                            && self.connector.state() == ConnectorState::AwaitingConnection
                        {
                            if let Some(vhost) = self.connector.vhost() {
                                self.deps
                                    .events
                                    .emit_connection_vhost_established(self.state.id, vhost.to_string());
                                // A session whose vhost was paused by a
                                // `VHOST PAUSE` issued before this handshake
                                // even started must still be held, per
                                // spec.md §9's vhost bookkeeping note.
                                if self.deps.vhost_state.is_paused(vhost) {
                                    self.pause();
                                }
                            }
                            self.establish_connection().await?;
                        } else if prev_state == ConnectorState::AwaitingConnection
                            && self.connector.state() == ConnectorState::StartOkSent
                        {
                            // The broker just sent its connection.start; splice
                            // the original client's identity into the captured
                            // StartOk and forward it, continuing the broker
                            // side of the handshake.
                            let outbound_port = self
                                .state
                                .egress_endpoints()
                                .0
                                .map(|addr| addr.port())
                                .unwrap_or(0);
                            self.connector.inject_client_identity(
                                &self.deps.hostname_mapper.map_to_hostname(self.state.ingress_remote.ip()),
                                self.state.ingress_remote.port(),
                                &self.deps.local_hostname,
                                outbound_port,
                            );
                            self.connector.forward_start_ok();
                            self.flush_connector_output().await?;
                        } else if self.connector.state() == ConnectorState::Open {
                            self.deps.events.emit_connection_established(self.state.id);
                        }
                    } else if self.connector.state() == ConnectorState::Open {
                        forward_buf.extend_from_slice(&buf[..consumed]);
                        forward_bytes += consumed as u64;
                        forward_frames += 1;
                    }
                    buf.advance(consumed);
                }
            }
        }

        if forward_frames > 0 {
            self.write_to_opposite(direction, &forward_buf).await?;
            self.state.count(direction, forward_bytes, forward_frames);
        }

        *self.staging(direction) = buf;

        match self.connector.state() {
            ConnectorState::Closed => {
                self.state.disconnect_status.set(DisconnectStatus::DisconnectedCleanly);
                self.deps.events.emit_clean_disconnect(self.state.id);
            }
            ConnectorState::Error => {
                self.force_disconnect().await;
            }
            _ => {}
        }

        Ok(())
    }

    async fn flush_connector_output(&mut self) -> Result<(), SessionError> {
        while let Some(output) = self.connector.take_output() {
            if output.to_ingress {
                self.ingress.write_all(&output.bytes).await?;
            } else if let Some(egress) = self.egress.as_mut() {
                egress.write_all(&output.bytes).await?;
            }
        }
        Ok(())
    }

    async fn write_to_opposite(&mut self, direction: FlowType, data: &[u8]) -> Result<(), SessionError> {
        match direction {
            FlowType::Ingress => {
                if let Some(egress) = self.egress.as_mut() {
                    egress.write_all(data).await?;
                }
            }
            FlowType::Egress => self.ingress.write_all(data).await?,
        }
        Ok(())
    }

    /// `establish_connection` in spec.md §4.3.4: vhost is known, select and
    /// connect a backend.
    async fn establish_connection(&mut self) -> Result<(), SessionError> {
        if self.state.is_paused() {
            self.state.set_ready_to_connect_on_unpause(true);
            return Ok(());
        }

        let vhost = self.connector.vhost().unwrap_or_default().to_string();
        self.state.set_vhost(vhost.clone());

        let manager = match self.deps.connection_selector.acquire_connection(&vhost) {
            Ok(manager) => manager,
            Err(SelectorStatus::Limit) => {
                self.state.limited_connection.store(true, Ordering::Release);
                tokio::time::sleep(Duration::from_millis(750)).await;
                self.connector.synthesize_custom_close_error(
                    connector::REPLY_RESOURCE_ERROR,
                    &format!("The connection for {vhost}, is limited by proxy."),
                );
                self.flush_connector_output().await.ok();
                self.force_disconnect().await;
                return Ok(());
            }
            Err(SelectorStatus::NoFarm | SelectorStatus::ErrorFarm | SelectorStatus::NoBackend) => {
                self.connector.synthesize_custom_close_error(
                    connector::REPLY_RESOURCE_ERROR,
                    &format!("No known broker mapping for vhost {vhost}"),
                );
                self.flush_connector_output().await.ok();
                self.force_disconnect().await;
                return Ok(());
            }
        };

        if let Some(auth) = self.deps.auth.read().clone() {
            let start_ok = self.connector.captured_start_ok().cloned();
            let (mechanism, credentials) = start_ok
                .as_ref()
                .map(|s| {
                    let creds = match &s.response {
                        crate::fieldtable::FieldValue::LongString(bytes) => bytes.to_vec(),
                        _ => Vec::new(),
                    };
                    (s.mechanism.clone(), creds)
                })
                .unwrap_or_default();
            let client_host = self.deps.hostname_mapper.map_to_hostname(self.state.ingress_remote.ip());

            match auth.authenticate(&vhost, &mechanism, &credentials, &client_host).await {
                Ok(AuthDecision::Denied { reason }) => {
                    self.state.auth_denied_connection.store(true, Ordering::Release);
                    if self.connector.client_advertises_capability("authentication_failure_close") {
                        self.connector
                            .synthesize_custom_close_error(connector::REPLY_ACCESS_REFUSED, "ACCESS_REFUSED");
                        self.flush_connector_output().await.ok();
                    }
                    if let Some(reason) = reason {
                        info!(vhost, reason, "auth denied connection");
                    }
                    self.force_disconnect().await;
                    return Ok(());
                }
                Ok(AuthDecision::Allowed { reason, new_credentials }) => {
                    if let Some(creds) = new_credentials {
                        self.connector
                            .set_captured_credentials(creds.mechanism, bytes::Bytes::from(creds.response));
                    }
                    if let Some(reason) = reason {
                        self.connector.set_auth_reason_property(&reason);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "auth service request failed");
                    self.force_disconnect().await;
                    return Ok(());
                }
            }
        }

        self.current_manager = Some(manager);
        self.retry_count = 0;
        self.attempt_connection().await
    }

    /// `attempt_connection` + `attempt_resolved_connection` in spec.md
    /// §4.3.4, collapsed into one loop: select a backend at the current
    /// retry count, resolve it, try every resolved endpoint, and advance
    /// the retry count on any failure.
    async fn attempt_connection(&mut self) -> Result<(), SessionError> {
        let Some(manager) = self.current_manager.clone() else {
            self.force_disconnect().await;
            return Ok(());
        };

        loop {
            let Some(backend) = manager.get_connection(self.retry_count) else {
                self.force_disconnect().await;
                return Ok(());
            };

            let (host, port) = backend.resolve_target();
            let endpoints = match self.deps.dns.resolve(host, port).await {
                Ok(endpoints) if !endpoints.is_empty() => endpoints,
                _ => {
                    self.deps.events.emit_connection_failed(backend.as_ref().clone());
                    self.retry_count += 1;
                    continue;
                }
            };

            let candidates: Vec<SocketAddr> = if backend.dns_based {
                endpoints
            } else {
                vec![endpoints[0]]
            };

            let mut connected = false;
            for endpoint in candidates {
                match self.attempt_endpoint_connection(endpoint, &backend).await {
                    Ok(()) => {
                        connected = true;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, %endpoint, backend = %backend.name, "backend connect attempt failed");
                    }
                }
            }

            if connected {
                return Ok(());
            }
            self.deps.events.emit_connection_failed(backend.as_ref().clone());
            self.retry_count += 1;
        }
    }

    /// `attempt_endpoint_connection` in spec.md §4.3.4: TCP connect, then
    /// (optionally) the PROXY protocol line, then the TLS handshake, then
    /// the proxy's own protocol header - the broker now drives the
    /// client-side handshake path of §4.2.
    async fn attempt_endpoint_connection(&mut self, endpoint: SocketAddr, backend: &Backend) -> Result<(), SessionError> {
        let mut socket = Socket::connect(endpoint).await?;
        let info = socket.info();
        self.state.set_egress_endpoints(info.local_addr, info.peer_addr);

        if backend.send_proxy {
            let ingress_info = self.ingress.info();
            let line = proxyprotocol::encode_v1(ingress_info.peer_addr, info.peer_addr)?;
            socket.write_all(line.as_bytes()).await?;
        }

        let mut socket = if backend.tls_enabled {
            let connector = self.deps.tls.read().connector().ok_or(SessionError::TlsNotConfigured)?;
            let server_name = rustls::pki_types::ServerName::try_from(backend.host.clone())?;
            socket.upgrade_client(connector, server_name).await?
        } else {
            socket
        };

        let header = self.connector.synthesize_protocol_header();
        socket.write_all(&header).await?;

        self.egress = Some(socket);
        Ok(())
    }

    fn attribute_peer_shutdown(&mut self, direction: FlowType) {
        if self.connector.state() == ConnectorState::Closed {
            self.state.disconnect_status.set(DisconnectStatus::DisconnectedCleanly);
        } else {
            let status = match direction {
                FlowType::Ingress => DisconnectStatus::DisconnectedClient,
                FlowType::Egress => DisconnectStatus::DisconnectedServer,
            };
            self.state.disconnect_status.set(status);
            match direction {
                FlowType::Ingress => self.deps.events.emit_client_connection_snapped(self.state.id),
                FlowType::Egress => self.deps.events.emit_broker_connection_snapped(self.state.id),
            }
        }
    }

    /// `pause()` in spec.md §4.3.5.
    pub fn pause(&self) {
        self.state.set_paused(true);
    }

    /// `unpause()` in spec.md §4.3.5. A session that arrived at `Open`
    /// while paused left `ready_to_connect_on_unpause` set; the owning
    /// task's control-poll tick (see `poll_control_requests`) notices the
    /// clear on its next tick and re-drives `establish_connection`.
    pub fn unpause(&self) {
        self.state.set_paused(false);
    }

    /// `disconnect(forcible=true)` in spec.md §4.3.5.
    async fn force_disconnect(&mut self) {
        self.state.disconnect_status.set(DisconnectStatus::DisconnectedProxy);
        let _ = self.ingress.shutdown().await;
        if let Some(egress) = self.egress.as_mut() {
            let _ = egress.shutdown().await;
        }
    }

    /// `disconnect(forcible=false)` in spec.md §4.3.5: a graceful
    /// proxy-initiated close, letting the connector's close state machine
    /// drive the rest via subsequent `handle_data` calls.
    pub async fn disconnect_gracefully(&mut self) {
        self.connector.synthesize_close();
        let _ = self.flush_connector_output().await;
    }

    /// `backend_disconnect()` in spec.md §4.3.5.
    pub async fn backend_disconnect(&mut self) {
        if let Some(egress) = self.egress.as_mut() {
            let _ = egress.shutdown().await;
        }
    }

    pub fn finished(&self) -> bool {
        self.state.finished()
    }

    async fn teardown(&mut self) {
        let _ = self.ingress.shutdown().await;
        if let Some(egress) = self.egress.as_mut() {
            let _ = egress.shutdown().await;
        }
        if self.state.disconnect_status() == DisconnectStatus::NotDisconnected {
            self.state.disconnect_status.set(DisconnectStatus::DisconnectedProxy);
        }
        self.deps.connection_selector.connection_closed(&self.state.vhost().unwrap_or_default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_cell_is_set_once_and_does_not_revert() {
        let cell = DisconnectCell::default();
        assert_eq!(cell.get(), DisconnectStatus::NotDisconnected);
        cell.set(DisconnectStatus::DisconnectedClient);
        assert_eq!(cell.get(), DisconnectStatus::DisconnectedClient);
        cell.set(DisconnectStatus::DisconnectedProxy);
        assert_eq!(cell.get(), DisconnectStatus::DisconnectedClient);
    }

    #[test]
    fn session_state_counters_accumulate_per_direction() {
        let state = SessionState::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            false,
        );
        state.count(FlowType::Ingress, 100, 2);
        state.count(FlowType::Ingress, 50, 1);
        state.count(FlowType::Egress, 10, 1);

        assert_eq!(state.ingress_bytes(), 150);
        assert_eq!(state.ingress_frames(), 3);
        assert_eq!(state.egress_bytes(), 10);
        assert_eq!(state.egress_frames(), 1);
    }

    #[test]
    fn session_state_starts_unfinished_and_unpaused() {
        let state = SessionState::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            false,
        );
        assert!(!state.finished());
        assert!(!state.is_paused());
        assert!(!state.limited_connection());
        assert!(!state.auth_denied_connection());
    }

    #[test]
    fn egress_endpoints_round_trip() {
        let state = SessionState::new(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            false,
        );
        assert_eq!(state.egress_endpoints(), (None, None));
        let local: SocketAddr = "10.0.0.1:5672".parse().unwrap();
        let remote: SocketAddr = "10.0.0.2:5672".parse().unwrap();
        state.set_egress_endpoints(local, remote);
        assert_eq!(state.egress_endpoints(), (Some(local), Some(remote)));
    }
}
