use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use parking_lot::RwLock;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use amqpprox::auth::AuthInterceptor;
use amqpprox::config::Args;
use amqpprox::connection_selector::ConnectionSelector;
use amqpprox::connector::ConnectorConfig;
use amqpprox::control::{self, ControlState, VhostState};
use amqpprox::dns::{DnsResolver, HickoryRawResolver};
use amqpprox::events::EventSource;
use amqpprox::farm::{BackendStore, FarmStore};
use amqpprox::hostname::{HickoryReverseResolver, HostnameMapper};
use amqpprox::limiter::ConnectionLimiterManager;
use amqpprox::logging;
use amqpprox::resourcemap::ResourceMap;
use amqpprox::session::{Session, SessionDeps};
use amqpprox::socket::TlsContext;
use amqpprox::stats::{self, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // A TLS-capable build must install a crypto provider before any
    // `rustls::ServerConfig`/`ClientConfig` is constructed, including ones
    // built later via the `TLS` control verb.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("default rustls crypto provider installed exactly once");

    let args = Args::parse();
    let _log_guard = logging::init(&args.log_directory).context("failed to initialize logging")?;

    info!(listen = %args.listen, control_socket = %args.control_socket.display(), "starting amqpprox");

    let farms = Arc::new(FarmStore::new());
    let backends = Arc::new(BackendStore::new());
    let resource_map = Arc::new(ResourceMap::new());
    let limiters = Arc::new(ConnectionLimiterManager::new());
    let connection_selector = Arc::new(ConnectionSelector::new(
        resource_map.clone(),
        farms.clone(),
        backends.clone(),
        limiters.clone(),
    ));

    let events = Arc::new(EventSource::new());
    let dns = DnsResolver::new(Arc::new(HickoryRawResolver::from_system_config()));
    let hostname_mapper = HostnameMapper::new(Arc::new(HickoryReverseResolver::from_system_config()));
    let registry = SessionRegistry::new();
    let vhost_state = VhostState::new();

    let local_hostname =
        std::env::var("HOSTNAME").unwrap_or_else(|_| gethostname_fallback());

    let auth = Arc::new(RwLock::new(None));
    let tls = Arc::new(RwLock::new(TlsContext::default()));

    let deps = Arc::new(SessionDeps {
        connector_config: Arc::new(ConnectorConfig::default()),
        buffer_pool: amqpprox::buffer::BufferPool::with_default_classes(),
        events: events.clone(),
        dns,
        hostname_mapper,
        connection_selector: connection_selector.clone(),
        auth: auth.clone(),
        tls: tls.clone(),
        local_hostname,
        max_frame_size: amqpprox::frame::DEFAULT_MAX_FRAME_SIZE,
        registry: registry.clone(),
        vhost_state: vhost_state.clone(),
    });

    let shutdown = CancellationToken::new();

    let ingress_listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind ingress listener on {}", args.listen))?;
    let ingress_task = {
        let deps = deps.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { accept_loop(ingress_listener, deps, shutdown).await })
    };

    if args.control_socket.exists() {
        // A stale socket left by a prior, uncleanly-terminated run; a live
        // process would already hold the bind and this would fail anyway.
        let _ = std::fs::remove_file(&args.control_socket);
    }
    let control_listener = UnixListener::bind(&args.control_socket)
        .with_context(|| format!("failed to bind control socket at {}", args.control_socket.display()))?;

    let control_state = Arc::new(ControlState {
        farms,
        backends,
        resource_map,
        limiters,
        tls: tls.clone(),
        auth: auth.clone(),
        registry: registry.clone(),
        vhost_state,
    });
    let control_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { control::serve(control_listener, control_state, shutdown).await })
    };

    let cleanup_task = {
        let registry = registry.clone();
        let events = events.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(args.cleanup_interval_ms as u64);
        tokio::spawn(async move { stats::run_cleanup_task(registry, events, interval, shutdown).await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
    shutdown.cancel();

    let _ = ingress_task.await;
    let _ = control_task.await;
    let _ = cleanup_task.await;
    let _ = std::fs::remove_file(&args.control_socket);

    Ok(())
}

async fn accept_loop(listener: TcpListener, deps: Arc<SessionDeps>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let deps = deps.clone();
                        tokio::spawn(async move {
                            match Session::accept(stream, deps).await {
                                Ok(session) => session.run().await,
                                Err(e) => warn!(error = %e, %peer, "failed to accept session"),
                            }
                        });
                    }
                    Err(e) => error!("ingress accept error: {e}"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("ingress listener shutting down");
                break;
            }
        }
    }
}

fn gethostname_fallback() -> String {
    "amqpprox".to_string()
}
