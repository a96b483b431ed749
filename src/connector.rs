//! The dual-sided AMQP handshake state machine.
//!
//! Grounded on `libamqpprox/amqpprox_connector.cpp`: one state machine
//! instance per session, reused for both the client-facing and
//! broker-facing legs by passing a [`FlowType`] alongside each received
//! method. Output is pulled via [`Connector::take_output`] rather than
//! written directly, since the caller (the session's data pump) decides
//! which socket it lands on via [`Connector::send_to_ingress_side`].

use bytes::{Bytes, BytesMut};

use crate::fieldtable::{FieldTable, FieldValue};
use crate::methods::{self, Close, CloseOk, MethodHeader, Open, OpenOk, Start, StartOk, Tune};

pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\0\0\x09\x01";
/// Legacy clients (pre-0-9-1 finalisation) sent this literal instead.
pub const LEGACY_PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x01\x01\x09\x00";

pub const REPLY_OK: u16 = 200;
pub const REPLY_ACCESS_REFUSED: u16 = 403;
pub const REPLY_CLOSE_OK_EXPECTED: u16 = 504;
pub const REPLY_RESOURCE_ERROR: u16 = 506;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    AwaitingProtocolHeader,
    StartSent,
    TuneSent,
    AwaitingOpen,
    AwaitingConnection,
    StartOkSent,
    OpenSent,
    Open,
    ClientCloseSent,
    ServerCloseSent,
    Closed,
    Error,
}

/// The server-properties table the proxy advertises on its synthesized
/// `connection.start`, matching `ConnectorUtil::generateServerProperties`.
pub fn server_properties(cluster_name: &str, copyright: &str, product: &str, version: &str) -> FieldTable {
    let mut capabilities = FieldTable::new();
    for cap in [
        "publisher_confirms",
        "exchange_exchange_bindings",
        "basic.nack",
        "consumer_cancel_notify",
        "connection.blocked",
        "consumer_priorities",
        "authentication_failure_close",
        "per_consumer_qos",
        "direct_reply_to",
    ] {
        capabilities.push(cap, FieldValue::Boolean(true));
    }

    let mut properties = FieldTable::new();
    properties.push("capabilities", FieldValue::FieldTable(capabilities));
    properties.set_long_string("cluster_name", cluster_name);
    properties.set_long_string("copyright", copyright);
    properties.set_long_string("product", product);
    properties.set_long_string("version", version);
    properties
}

pub struct ConnectorConfig {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub mechanisms: String,
    pub locales: String,
    pub server_properties: FieldTable,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: crate::frame::DEFAULT_MAX_FRAME_SIZE as u32,
            heartbeat: 60,
            mechanisms: "PLAIN AMQPLAIN".to_string(),
            locales: "en_US".to_string(),
            server_properties: server_properties(
                "amqpprox",
                "Copyright (c) the proxy operator",
                "amqpprox",
                env!("CARGO_PKG_VERSION"),
            ),
        }
    }
}

/// Output of a state transition: bytes the session must write, and which
/// socket they go to.
#[derive(Debug, Clone)]
pub struct Output {
    pub bytes: Bytes,
    pub to_ingress: bool,
}

pub struct Connector {
    state: ConnectorState,
    config: std::sync::Arc<ConnectorConfig>,
    synthesized_start: Option<Start>,
    synthesized_tune: Option<Tune>,
    captured_start_ok: Option<StartOk>,
    captured_tune_ok: Option<Tune>,
    captured_open: Option<Open>,
    captured_close: Close,
    reconnection: bool,
    pending_output: Option<Output>,
    vhost: Option<String>,
}

impl Default for ConnectorState {
    fn default() -> Self {
        ConnectorState::AwaitingProtocolHeader
    }
}

impl Connector {
    pub fn new(config: std::sync::Arc<ConnectorConfig>) -> Self {
        Self {
            state: ConnectorState::AwaitingProtocolHeader,
            config,
            synthesized_start: None,
            synthesized_tune: None,
            captured_start_ok: None,
            captured_tune_ok: None,
            captured_open: None,
            captured_close: Close::default(),
            reconnection: false,
            pending_output: None,
            vhost: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn vhost(&self) -> Option<&str> {
        self.vhost.as_deref()
    }

    pub fn set_reconnection(&mut self, reconnection: bool) {
        self.reconnection = reconnection;
    }

    /// The client's `connection.start-ok`, captured once and reused for
    /// both identity injection and the session's auth handshake.
    pub fn captured_start_ok(&self) -> Option<&StartOk> {
        self.captured_start_ok.as_ref()
    }

    /// Whether the client's `start-ok` properties advertised `name` under
    /// its `capabilities` sub-table (e.g. `authentication_failure_close`).
    pub fn client_advertises_capability(&self, name: &str) -> bool {
        let Some(start_ok) = &self.captured_start_ok else {
            return false;
        };
        let Some(FieldValue::FieldTable(capabilities)) = start_ok.properties.find("capabilities") else {
            return false;
        };
        matches!(capabilities.find(name), Some(FieldValue::Boolean(true)))
    }

    /// Overwrite the captured `start-ok`'s mechanism/response, used when an
    /// auth interceptor rewrites credentials before forwarding to the
    /// broker.
    pub fn set_captured_credentials(&mut self, mechanism: String, response: Bytes) {
        if let Some(start_ok) = &mut self.captured_start_ok {
            start_ok.mechanism = mechanism;
            start_ok.response = FieldValue::LongString(response);
        }
    }

    /// Record an `amqpprox_auth` client property to be forwarded to the
    /// broker, set when the auth interceptor returns a reason.
    pub fn set_auth_reason_property(&mut self, reason: &str) {
        if let Some(start_ok) = &mut self.captured_start_ok {
            start_ok.properties.set_long_string("amqpprox_auth", reason);
        }
    }

    /// Bytes the caller must write, if the last transition produced any.
    pub fn take_output(&mut self) -> Option<Output> {
        self.pending_output.take()
    }

    fn emit_method(&mut self, payload: BytesMut, to_ingress: bool) {
        let mut framed = BytesMut::new();
        crate::frame::encode(
            crate::frame::FRAME_TYPE_METHOD,
            0,
            &payload,
            self.config.frame_max as usize,
            &mut framed,
        )
        .expect("synthesized handshake methods always fit within frame_max");
        let bytes = framed.freeze();
        match &mut self.pending_output {
            Some(existing) if existing.to_ingress == to_ingress => {
                let mut combined = BytesMut::from(&existing.bytes[..]);
                combined.extend_from_slice(&bytes);
                existing.bytes = combined.freeze();
            }
            _ => {
                self.pending_output = Some(Output { bytes, to_ingress });
            }
        }
    }

    /// Valid only in `AwaitingProtocolHeader`: matches the client's opening
    /// 8 bytes against either accepted protocol header literal.
    pub fn receive_protocol_header(&mut self, buffer: &[u8]) {
        if self.state != ConnectorState::AwaitingProtocolHeader {
            self.state = ConnectorState::Error;
            return;
        }

        if buffer == PROTOCOL_HEADER.as_slice() || buffer == LEGACY_PROTOCOL_HEADER.as_slice() {
            let start = Start {
                version_major: 0,
                version_minor: 9,
                properties: self.config.server_properties.clone(),
                mechanisms: self.config.mechanisms.clone(),
                locales: self.config.locales.clone(),
            };
            let mut payload = BytesMut::new();
            start.encode(&mut payload).expect("start always encodes");
            self.synthesized_start = Some(start);
            self.emit_method(payload, true);
            self.state = ConnectorState::StartSent;
        } else {
            self.pending_output = Some(Output {
                bytes: Bytes::copy_from_slice(PROTOCOL_HEADER.as_slice()),
                to_ingress: true,
            });
            self.state = ConnectorState::Error;
        }
    }

    /// Handle a decoded connection-class method arriving from `direction`.
    pub fn receive_method(&mut self, header: MethodHeader, payload: &[u8], direction: FlowType) {
        if header.class_id != methods::CLASS_CONNECTION {
            self.state = ConnectorState::Error;
            return;
        }

        match self.state {
            ConnectorState::Open => self.receive_in_open(header, direction),
            ConnectorState::StartSent => self.receive_start_ok(header, payload),
            ConnectorState::TuneSent => self.receive_tune_ok(header, payload),
            ConnectorState::AwaitingOpen => self.receive_open(header, payload),
            ConnectorState::AwaitingConnection => self.receive_server_start(header, payload),
            ConnectorState::StartOkSent => self.receive_server_tune(header, payload),
            ConnectorState::OpenSent => self.receive_open_ok(header, payload),
            ConnectorState::ClientCloseSent => self.receive_in_client_close_sent(header, direction),
            ConnectorState::ServerCloseSent => self.receive_in_server_close_sent(header, direction),
            ConnectorState::Closed | ConnectorState::Error | ConnectorState::AwaitingProtocolHeader => {}
        }
    }

    fn receive_in_open(&mut self, header: MethodHeader, _direction: FlowType) {
        // Both Close and CloseOk are tolerated here to cover misbehaving
        // clients that skip CloseOk - see spec.md's Close/CloseOk tolerance
        // design note; do not make this stricter.
        if header.is_connection_method(methods::METHOD_CLOSE)
            || header.is_connection_method(methods::METHOD_CLOSE_OK)
        {
            self.state = ConnectorState::Closed;
        }
    }

    fn receive_start_ok(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_START_OK) {
            self.state = ConnectorState::Error;
            return;
        }
        let Ok(start_ok) = StartOk::decode(payload) else {
            self.state = ConnectorState::Error;
            return;
        };
        self.captured_start_ok = Some(start_ok);

        let tune = Tune {
            channel_max: self.config.channel_max,
            frame_max: self.config.frame_max,
            heartbeat: self.config.heartbeat,
        };
        let mut out = BytesMut::new();
        tune.encode(&mut out).expect("tune always encodes");
        self.synthesized_tune = Some(tune);
        self.emit_method(out, true);
        self.state = ConnectorState::TuneSent;
    }

    fn receive_tune_ok(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_TUNE_OK) {
            self.state = ConnectorState::Error;
            return;
        }
        let Ok(tune_ok) = methods::decode_tune_ok(payload) else {
            self.state = ConnectorState::Error;
            return;
        };
        self.captured_tune_ok = Some(tune_ok);
        self.state = ConnectorState::AwaitingOpen;
    }

    fn receive_open(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_OPEN) {
            self.state = ConnectorState::Error;
            return;
        }
        let Ok(open) = Open::decode(payload) else {
            self.state = ConnectorState::Error;
            return;
        };
        self.vhost = Some(open.virtual_host.clone());
        self.captured_open = Some(open);
        self.state = ConnectorState::AwaitingConnection;
    }

    /// Acting as a client: the broker just sent its `connection.start`.
    /// `client_hostname`/`client_port` identify the original client;
    /// `local_hostname`/`outbound_port` identify this proxy's egress leg -
    /// both get spliced into the forwarded StartOk as `amqpprox_client` /
    /// `amqpprox_host`.
    fn receive_server_start(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_START) {
            self.state = ConnectorState::Error;
            return;
        }
        if Start::decode(payload).is_err() {
            self.state = ConnectorState::Error;
            return;
        }
        self.state = ConnectorState::StartOkSent;
    }

    /// Forward the captured StartOk (with identity already injected by the
    /// caller via [`Self::inject_client_identity`]) to the broker.
    pub fn forward_start_ok(&mut self) {
        if self.state != ConnectorState::StartOkSent {
            return;
        }
        if let Some(start_ok) = self.captured_start_ok.clone() {
            let mut out = BytesMut::new();
            start_ok.encode(&mut out).expect("start_ok always encodes");
            self.emit_method(out, false);
        }
    }

    pub fn inject_client_identity(
        &mut self,
        client_hostname: &str,
        client_remote_port: u16,
        local_hostname: &str,
        outbound_local_port: u16,
    ) {
        if let Some(start_ok) = &mut self.captured_start_ok {
            start_ok.inject_proxy_client_ident(
                client_hostname,
                client_remote_port,
                local_hostname,
                outbound_local_port,
            );
        }
    }

    fn receive_server_tune(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_TUNE) {
            self.state = ConnectorState::Error;
            return;
        }
        if Tune::decode(payload).is_err() {
            self.state = ConnectorState::Error;
            return;
        }
        if let Some(tune_ok) = self.captured_tune_ok {
            let mut out = BytesMut::new();
            methods::encode_tune_ok(&tune_ok, &mut out).expect("tune_ok always encodes");
            self.emit_method(out, false);
        }
        if let Some(open) = self.captured_open.clone() {
            let mut out = BytesMut::new();
            open.encode(&mut out).expect("open always encodes");
            self.emit_method(out, false);
        }
        self.state = ConnectorState::OpenSent;
    }

    fn receive_open_ok(&mut self, header: MethodHeader, payload: &[u8]) {
        if !header.is_connection_method(methods::METHOD_OPEN_OK) {
            return;
        }
        let Ok(open_ok) = OpenOk::decode(payload) else {
            self.state = ConnectorState::Error;
            return;
        };
        self.state = ConnectorState::Open;
        if !self.reconnection {
            let mut out = BytesMut::new();
            open_ok.encode(&mut out).expect("open_ok always encodes");
            self.emit_method(out, true);
        }
    }

    fn receive_in_client_close_sent(&mut self, header: MethodHeader, direction: FlowType) {
        let is_close = header.is_connection_method(methods::METHOD_CLOSE);
        let is_close_ok = header.is_connection_method(methods::METHOD_CLOSE_OK);

        if direction == FlowType::Ingress && is_close_ok {
            self.synthesize_close_internal(false);
        } else if is_close {
            if direction == FlowType::Ingress {
                self.send_close_ok(true);
                self.synthesize_close_internal(false);
            } else {
                self.send_close_ok(false);
                self.state = ConnectorState::Closed;
            }
        }
        // Any other method while awaiting client close confirmation is
        // discarded per the AMQP specification.
    }

    fn receive_in_server_close_sent(&mut self, header: MethodHeader, direction: FlowType) {
        let is_close = header.is_connection_method(methods::METHOD_CLOSE);
        let is_close_ok = header.is_connection_method(methods::METHOD_CLOSE_OK);
        if is_close || is_close_ok {
            if is_close {
                self.send_close_ok(direction == FlowType::Ingress);
            }
            if direction == FlowType::Egress {
                self.state = ConnectorState::Closed;
            }
        }
    }

    fn send_close_ok(&mut self, to_ingress: bool) {
        let mut out = BytesMut::new();
        CloseOk.encode(&mut out).expect("close_ok always encodes");
        self.emit_method(out, to_ingress);
    }

    fn synthesize_close_internal(&mut self, to_ingress: bool) {
        self.state = if to_ingress {
            ConnectorState::ClientCloseSent
        } else {
            ConnectorState::ServerCloseSent
        };
        self.captured_close.set_reply(REPLY_OK, "OK");
        let mut out = BytesMut::new();
        self.captured_close.encode(&mut out).expect("close always encodes");
        self.emit_method(out, to_ingress);
    }

    /// Proxy-initiated graceful close toward the client.
    pub fn synthesize_close(&mut self) {
        self.synthesize_close_internal(true);
    }

    pub fn synthesize_close_error(&mut self) {
        self.captured_close.set_reply(REPLY_CLOSE_OK_EXPECTED, "CloseOk expected");
        self.state = ConnectorState::ClientCloseSent;
        let mut out = BytesMut::new();
        self.captured_close.encode(&mut out).expect("close always encodes");
        self.emit_method(out, true);
    }

    pub fn synthesize_custom_close_error(&mut self, code: u16, text: &str) {
        self.captured_close.set_reply(code, text);
        self.state = ConnectorState::ClientCloseSent;
        let mut out = BytesMut::new();
        self.captured_close.encode(&mut out).expect("close always encodes");
        self.emit_method(out, true);
    }

    pub fn synthesize_protocol_header(&mut self) -> Bytes {
        Bytes::copy_from_slice(PROTOCOL_HEADER.as_slice())
    }
}
