//! Shared plumbing for the end-to-end tests: wiring up a runnable
//! `SessionDeps`, spawning a proxy listener that drives real `Session`s,
//! and scripting a minimal AMQP 0-9-1 client/broker over plain sockets.
//!
//! These exercise the same path `main.rs` wires together, just without a
//! control socket or CLI: build the stores, build `SessionDeps`, accept on
//! a loopback listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amqpprox::backend::Backend;
use amqpprox::buffer::{default_size_classes, BufferPool};
use amqpprox::connection_selector::ConnectionSelector;
use amqpprox::connector::ConnectorConfig;
use amqpprox::control::VhostState;
use amqpprox::dns::{DnsResolver, RawResolver, ResolveError};
use amqpprox::events::EventSource;
use amqpprox::farm::{BackendStore, FarmStore};
use amqpprox::fieldtable::FieldValue;
use amqpprox::frame::{self, DEFAULT_MAX_FRAME_SIZE};
use amqpprox::hostname::HostnameMapper;
use amqpprox::limiter::ConnectionLimiterManager;
use amqpprox::methods::{self, Close, CloseOk, Open, OpenOk, Start, StartOk, Tune, TuneOk};
use amqpprox::resourcemap::{MappingTarget, ResourceMap};
use amqpprox::session::{Session, SessionDeps};
use amqpprox::socket::TlsContext;
use amqpprox::stats::SessionRegistry;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A `RawResolver` a test fully controls: maps a host name to a fixed
/// endpoint list, or fails, without ever touching real DNS.
pub struct StaticResolver {
    entries: std::collections::HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self {
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn with(mut self, host: &str, endpoints: Vec<SocketAddr>) -> Self {
        self.entries.insert(host.to_string(), endpoints);
        self
    }
}

#[async_trait::async_trait]
impl RawResolver for StaticResolver {
    async fn lookup(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
        self.entries
            .get(host)
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ResolveError::Empty {
                host: host.to_string(),
                port: 0,
            })
    }
}

/// A `ReverseResolver` that never resolves anything, so `HostnameMapper`
/// falls back to the bare address in every scenario that doesn't care
/// about hostname splicing specifically.
struct NoopReverseResolver;

#[async_trait::async_trait]
impl amqpprox::hostname::ReverseResolver for NoopReverseResolver {
    async fn reverse_lookup(&self, _addr: std::net::IpAddr) -> Option<String> {
        None
    }
}

/// Everything a scenario needs to route traffic: the stores `SessionDeps`
/// was built from, kept alive and mutable so a test can add backends/farms
/// after the proxy is already listening.
pub struct Harness {
    pub deps: Arc<SessionDeps>,
    pub resource_map: Arc<ResourceMap>,
    pub backends: Arc<BackendStore>,
    pub farms: Arc<FarmStore>,
    pub limiters: Arc<ConnectionLimiterManager>,
}

impl Harness {
    pub fn new(resolver: impl RawResolver + 'static) -> Self {
        Self::with_tls(resolver, TlsContext::default())
    }

    pub fn with_tls(resolver: impl RawResolver + 'static, tls: TlsContext) -> Self {
        let resource_map = Arc::new(ResourceMap::new());
        let backends = Arc::new(BackendStore::new());
        let farms = Arc::new(FarmStore::new());
        let limiters = Arc::new(ConnectionLimiterManager::new());
        let connection_selector = Arc::new(ConnectionSelector::new(
            resource_map.clone(),
            farms.clone(),
            backends.clone(),
            limiters.clone(),
        ));

        let deps = Arc::new(SessionDeps {
            connector_config: Arc::new(ConnectorConfig::default()),
            buffer_pool: BufferPool::new(default_size_classes(DEFAULT_MAX_FRAME_SIZE)),
            events: Arc::new(EventSource::default()),
            dns: DnsResolver::new(Arc::new(resolver)),
            hostname_mapper: HostnameMapper::new(Arc::new(NoopReverseResolver)),
            connection_selector,
            auth: Arc::new(RwLock::new(None)),
            tls: Arc::new(RwLock::new(tls)),
            local_hostname: "proxy-under-test".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            registry: SessionRegistry::new(),
            vhost_state: VhostState::new(),
        });

        Self {
            deps,
            resource_map,
            backends,
            farms,
            limiters,
        }
    }

    pub fn route_vhost_to_backend(&self, vhost: &str, backend: Backend) {
        let name = backend.name.clone();
        self.backends.insert(backend);
        self.resource_map.set_mapping(vhost, MappingTarget::Backend(name));
    }

    /// Bind a loopback listener and accept exactly one connection, driving
    /// it through `Session::accept`/`Session::run` on a spawned task.
    pub async fn spawn_single_connection_proxy(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            match Session::accept(stream, deps).await {
                Ok(session) => session.run().await,
                Err(_) => {}
            }
        });
        addr
    }
}

/// A bare TCP listener standing in for a broker: hands back the accepted
/// stream to the test so it can script the broker side of the handshake
/// by hand.
pub async fn spawn_fake_broker() -> (SocketAddr, tokio::sync::oneshot::Receiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ = tx.send(stream);
    });
    (addr, rx)
}

/// Read exactly one frame off `stream`, blocking until enough bytes
/// arrive. Panics (test failure) on a decode error or EOF before a full
/// frame is seen.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> (u8, u16, Vec<u8>) {
    let mut buf = BytesMut::new();
    loop {
        match frame::decode(&buf, DEFAULT_MAX_FRAME_SIZE).expect("frame decodes") {
            frame::DecodeOutcome::Frame { frame, consumed } => {
                let result = (frame.frame_type, frame.channel, frame.payload.to_vec());
                buf.split_to(consumed);
                return result;
            }
            frame::DecodeOutcome::NeedMoreData => {
                let mut chunk = [0u8; 4096];
                let n = stream.read(&mut chunk).await.expect("socket read");
                assert!(n > 0, "peer closed before a full frame arrived");
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

pub async fn read_method<S: AsyncRead + Unpin>(stream: &mut S) -> (methods::MethodHeader, Vec<u8>) {
    let (frame_type, _channel, payload) = read_frame(stream).await;
    assert_eq!(frame_type, frame::FRAME_TYPE_METHOD);
    let (header, rest) = methods::decode_method_header(&payload).unwrap();
    (header, rest.to_vec())
}

async fn write_payload<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) {
    let bytes = frame::encode_to_bytes(frame::FRAME_TYPE_METHOD, 0, payload, DEFAULT_MAX_FRAME_SIZE).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

pub async fn write_start<S: AsyncWrite + Unpin>(stream: &mut S, start: &Start) {
    let mut payload = BytesMut::new();
    start.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_start_ok<S: AsyncWrite + Unpin>(stream: &mut S, mechanism: &str, credentials: &[u8]) {
    let start_ok = StartOk {
        mechanism: mechanism.to_string(),
        response: FieldValue::LongString(Bytes::copy_from_slice(credentials)),
        locale: "en_US".to_string(),
        ..Default::default()
    };
    let mut payload = BytesMut::new();
    start_ok.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_tune<S: AsyncWrite + Unpin>(stream: &mut S, tune: &Tune) {
    let mut payload = BytesMut::new();
    tune.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_tune_ok<S: AsyncWrite + Unpin>(stream: &mut S, tune_ok: &TuneOk) {
    let mut payload = BytesMut::new();
    methods::encode_tune_ok(tune_ok, &mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_open<S: AsyncWrite + Unpin>(stream: &mut S, vhost: &str) {
    let open = Open {
        virtual_host: vhost.to_string(),
        capabilities: String::new(),
        insist: false,
    };
    let mut payload = BytesMut::new();
    open.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_open_ok<S: AsyncWrite + Unpin>(stream: &mut S) {
    let open_ok = OpenOk {
        known_hosts: String::new(),
    };
    let mut payload = BytesMut::new();
    open_ok.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_close<S: AsyncWrite + Unpin>(stream: &mut S, reply_code: u16, reply_text: &str) {
    let mut close = Close::default();
    close.set_reply(reply_code, reply_text);
    let mut payload = BytesMut::new();
    close.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_close_ok<S: AsyncWrite + Unpin>(stream: &mut S) {
    let mut payload = BytesMut::new();
    CloseOk.encode(&mut payload).unwrap();
    write_payload(stream, &payload).await;
}

pub async fn write_protocol_header<S: AsyncWrite + Unpin>(stream: &mut S) {
    stream.write_all(amqpprox::connector::PROTOCOL_HEADER.as_slice()).await.unwrap();
}

pub async fn read_protocol_header<S: AsyncRead + Unpin>(stream: &mut S) -> [u8; 8] {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Plays the broker side of a connection attempt far enough to reach
/// `Open`: send `Start`, read the forwarded `StartOk`, send `Tune`, read
/// `TuneOk` + `Open`, send `OpenOk`.
pub async fn run_fake_broker_handshake(stream: &mut TcpStream) {
    run_fake_broker_handshake_on(stream).await
}

/// Same as [`run_fake_broker_handshake`] but generic over the transport, so
/// it can drive the handshake over a TLS-wrapped stream as well as a plain
/// `TcpStream`.
pub async fn run_fake_broker_handshake_on<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    let header = read_protocol_header(stream).await;
    assert_eq!(&header, amqpprox::connector::PROTOCOL_HEADER.as_slice());

    write_start(
        stream,
        &Start {
            version_major: 0,
            version_minor: 9,
            properties: amqpprox::fieldtable::FieldTable::new(),
            mechanisms: "PLAIN".to_string(),
            locales: "en_US".to_string(),
        },
    )
    .await;

    let (header, _payload) = read_method(stream).await;
    assert!(header.is_connection_method(methods::METHOD_START_OK));

    write_tune(
        stream,
        &Tune {
            channel_max: 2047,
            frame_max: DEFAULT_MAX_FRAME_SIZE as u32,
            heartbeat: 60,
        },
    )
    .await;

    let (header, _payload) = read_method(stream).await;
    assert!(header.is_connection_method(methods::METHOD_TUNE_OK));
    let (header, _payload) = read_method(stream).await;
    assert!(header.is_connection_method(methods::METHOD_OPEN));

    write_open_ok(stream).await;
}

/// Plays the client side far enough to reach `Open`, returning the stream
/// connected to `proxy_addr`.
pub async fn run_client_handshake(proxy_addr: SocketAddr, vhost: &str) -> TcpStream {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    write_protocol_header(&mut stream).await;

    let (header, _payload) = read_method(&mut stream).await;
    assert!(header.is_connection_method(methods::METHOD_START));

    write_start_ok(&mut stream, "PLAIN", b"\0guest\0guest").await;

    let (header, payload) = read_method(&mut stream).await;
    assert!(header.is_connection_method(methods::METHOD_TUNE));
    let tune = Tune::decode(&payload).unwrap();

    write_tune_ok(&mut stream, &tune).await;
    write_open(&mut stream, vhost).await;

    let (header, _payload) = read_method(&mut stream).await;
    assert!(header.is_connection_method(methods::METHOD_OPEN_OK));

    stream
}

pub fn short_timeout() -> Duration {
    Duration::from_secs(5)
}

/// A `TcpStream` with some already-read bytes spliced back onto the front
/// of its read side. Used to hand a TLS acceptor the remainder of a buffer
/// after peeling off a PROXY protocol line read in the same read call.
pub struct PrefixedStream {
    prefix: BytesMut,
    inner: TcpStream,
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = std::cmp::min(self.prefix.len(), buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.split_to(n);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: std::pin::Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read bytes off `stream` until a full `PROXY ...\r\n` line has arrived,
/// returning the line (without the CRLF) and a stream with any bytes read
/// past it spliced back onto the front.
pub async fn read_proxy_v1_line(mut stream: TcpStream) -> (String, PrefixedStream) {
    let mut buf = BytesMut::new();
    let end = loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 256];
        let n = stream.read(&mut chunk).await.expect("socket read");
        assert!(n > 0, "peer closed before a PROXY line arrived");
        buf.extend_from_slice(&chunk[..n]);
    };
    let line = String::from_utf8(buf[..end].to_vec()).expect("PROXY line is ASCII");
    buf.split_to(end + 2);
    (line, PrefixedStream { prefix: buf, inner: stream })
}
