//! The control channel: a UNIX domain socket that accepts newline-delimited
//! text commands and streams line-oriented output back, used to reconfigure
//! farms, backends, vhost mappings, limiters, auth and TLS without
//! restarting the process.
//!
//! Grounded on `libamqpprox/amqpprox_control.cpp` (`Control`/`ControlSession`)
//! for the read-a-line / split-off-the-verb / uppercase / dispatch / HELP
//! fallback shape, and `amqpprox_farmcontrolcommand.cpp` for the `FARM`
//! subcommand grammar. The accept loop itself follows the `UnixListener`
//! idiom from the daemon listener in the example pack: spawn one task per
//! accepted connection, `tokio::select!` the accept against a shared
//! cancellation signal rather than polling it.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthInterceptor;
use crate::backend::Backend;
use crate::farm::{BackendStore, Farm, FarmStore};
use crate::limiter::ConnectionLimiterManager;
use crate::partition_policy::{AffinityPartitionPolicy, PartitionPolicy};
use crate::resourcemap::{MappingTarget, ResourceMap};
use crate::socket::TlsContext;
use crate::stats::{self, ConnectionStats, SessionRegistry};
use crate::tls;

/// Tracks which vhosts have been paused independent of any individual
/// session, so a session that hasn't been created yet still starts paused
/// if its vhost was paused first.
///
/// Grounded on `amqpprox_vhostcontrolcommand.cpp`'s bookkeeping note: the
/// pause state outlives any one `SessionState`.
#[derive(Default)]
pub struct VhostState {
    paused: RwLock<BTreeSet<String>>,
}

impl VhostState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_paused(&self, vhost: &str, paused: bool) {
        let mut set = self.paused.write();
        if paused {
            set.insert(vhost.to_string());
        } else {
            set.remove(vhost);
        }
    }

    pub fn is_paused(&self, vhost: &str) -> bool {
        self.paused.read().contains(vhost)
    }

    pub fn paused_vhosts(&self) -> Vec<String> {
        self.paused.read().iter().cloned().collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown farm: {0}")]
    UnknownFarm(String),
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Tls(#[from] tls::TlsConfigError),
    #[error(transparent)]
    Auth(#[from] crate::auth::AuthError),
}

/// Everything a control command may touch. One instance is shared by every
/// connected control session.
pub struct ControlState {
    pub farms: Arc<FarmStore>,
    pub backends: Arc<BackendStore>,
    pub resource_map: Arc<ResourceMap>,
    pub limiters: Arc<ConnectionLimiterManager>,
    pub tls: Arc<RwLock<TlsContext>>,
    pub auth: Arc<RwLock<Option<Arc<AuthInterceptor>>>>,
    pub registry: Arc<SessionRegistry>,
    pub vhost_state: Arc<VhostState>,
}

/// Run the control listener until `shutdown` fires, spawning one task per
/// accepted connection.
pub async fn serve(listener: UnixListener, state: Arc<ControlState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let state = state.clone();
                        let session_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_session(stream, state, session_shutdown).await;
                        });
                    }
                    Err(e) => error!("control socket accept error: {e}"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("control listener shutting down");
                break;
            }
        }
    }
}

async fn handle_session(
    stream: tokio::net::UnixStream,
    state: Arc<ControlState>,
    shutdown: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.cancelled() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("control session read error: {e}");
                break;
            }
        };

        match dispatch_line(&line, &state) {
            Outcome::Reply(lines) => {
                for out in lines {
                    if writer.write_all(out.as_bytes()).await.is_err() {
                        return;
                    }
                    if writer.write_all(b"\n").await.is_err() {
                        return;
                    }
                }
            }
            Outcome::Exit => {
                let _ = writer.write_all(b"OK\n").await;
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
    debug!("control session closed");
}

enum Outcome {
    Reply(Vec<String>),
    Exit,
}

fn dispatch_line(line: &str, state: &ControlState) -> Outcome {
    let trimmed = line.trim();
    let mut split = trimmed.splitn(2, ' ');
    let verb = split.next().unwrap_or("").to_ascii_uppercase();
    let rest = split.next().unwrap_or("").trim();
    let args: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split_whitespace().collect()
    };

    let result = match verb.as_str() {
        "FARM" => farm_command(&args, state),
        "BACKEND" => backend_command(&args, state),
        "MAP" => map_command(&args, state),
        "VHOST" => vhost_command(&args, state),
        "LIMIT" => limit_command(&args, state),
        "AUTH" => auth_command(&args, state),
        "TLS" => tls_command(&args, state),
        "STAT" => stat_command(&args, state),
        "EXIT" => return Outcome::Exit,
        "HELP" | "" => Ok(help_lines()),
        other => Ok(vec![format!("unrecognised command '{other}', try HELP")]),
    };

    match result {
        Ok(lines) => Outcome::Reply(lines),
        Err(e) => Outcome::Reply(vec![format!("ERROR: {e}")]),
    }
}

fn help_lines() -> Vec<String> {
    [
        "FARM ADD_DNS|ADD_MANUAL|PARTITION|DELETE|PRINT",
        "BACKEND ADD|DELETE|PRINT",
        "MAP SET|DEFAULT_FARM|DELETE|PRINT",
        "VHOST PAUSE|UNPAUSE|FORCE_DISCONNECT|BACKEND_DISCONNECT|PRINT vhost",
        "LIMIT SET_RATE|SET_TOTAL|SET_ALARM_RATE|SET_ALARM_TOTAL|REMOVE_*|SET_DEFAULT_*|REMOVE_DEFAULT_*",
        "AUTH SERVICE host port target|ALWAYS_ALLOW|PRINT|CLEAR",
        "TLS SERVER|CLIENT|CLEAR_CLIENT",
        "STAT PRINT [human|json|prometheus]",
        "EXIT",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn arg<'a>(args: &[&'a str], index: usize, usage: &'static str) -> Result<&'a str, ControlError> {
    args.get(index).copied().ok_or(ControlError::Usage(usage))
}

fn parse_u32(s: &str) -> Result<u32, ControlError> {
    s.parse().map_err(|_| ControlError::InvalidArgument(format!("bad limit: {s}")))
}

fn parse_port(s: &str) -> Result<u16, ControlError> {
    s.parse().map_err(|_| ControlError::InvalidArgument(format!("bad port: {s}")))
}

fn farm_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("ADD_DNS") => {
            let name = arg(args, 1, "FARM ADD_DNS name dnsname port")?;
            let dns_name = arg(args, 2, "FARM ADD_DNS name dnsname port")?;
            let port = parse_port(arg(args, 3, "FARM ADD_DNS name dnsname port")?)?;

            let backend_name = format!("{name}-dns");
            let backend = Backend::new(backend_name.clone(), "", dns_name, IpAddr::from([0, 0, 0, 0]), port)
                .with_dns_based(true);
            state.backends.insert(backend);

            let mut farm = Farm::new(name);
            farm.add_member(backend_name);
            farm.recompute(&state.backends);
            state.farms.insert(farm);
            Ok(vec![format!("farm {name} added with DNS member {dns_name}:{port}")])
        }
        Some("ADD_MANUAL") => {
            let name = arg(args, 1, "FARM ADD_MANUAL name backend...")?;
            let members = &args[2.min(args.len())..];
            if members.is_empty() {
                return Err(ControlError::Usage("FARM ADD_MANUAL name backend..."));
            }
            let mut farm = Farm::new(name);
            for member in members {
                farm.add_member(*member);
            }
            farm.recompute(&state.backends);
            state.farms.insert(farm);
            Ok(vec![format!("farm {name} added with {} member(s)", members.len())])
        }
        Some("PARTITION") => {
            let name = arg(args, 1, "FARM PARTITION name policy")?;
            let policy = arg(args, 2, "FARM PARTITION name policy")?;
            let handle = state
                .farms
                .get(name)
                .ok_or_else(|| ControlError::UnknownFarm(name.to_string()))?;
            let datacenter = args.get(3).copied().unwrap_or_default();
            let boxed: Arc<dyn PartitionPolicy> = match policy.to_ascii_uppercase().as_str() {
                "AFFINITY" => Arc::new(AffinityPartitionPolicy::new(datacenter)),
                other => return Err(ControlError::InvalidArgument(format!("unknown policy: {other}"))),
            };
            let mut farm = handle.write();
            farm.add_partition_policy(boxed);
            farm.recompute(&state.backends);
            Ok(vec![format!("farm {name} repartitioned with {policy}")])
        }
        Some("DELETE") => {
            let name = arg(args, 1, "FARM DELETE name")?;
            state
                .farms
                .remove(name)
                .ok_or_else(|| ControlError::UnknownFarm(name.to_string()))?;
            Ok(vec![format!("farm {name} deleted")])
        }
        Some("PRINT") => Ok(state.farms.names()),
        _ => Err(ControlError::Usage(
            "FARM ADD_DNS|ADD_MANUAL|PARTITION|DELETE|PRINT ...",
        )),
    }
}

fn backend_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("ADD") => {
            let usage = "BACKEND ADD name datacenter host port [TLS] [PROXY]";
            let name = arg(args, 1, usage)?;
            let datacenter = arg(args, 2, usage)?;
            let host = arg(args, 3, usage)?;
            let port = parse_port(arg(args, 4, usage)?)?;

            let ip = host.parse::<IpAddr>().unwrap_or(IpAddr::from([0, 0, 0, 0]));
            let dns_based = host.parse::<IpAddr>().is_err();
            let mut backend = Backend::new(name, datacenter, host, ip, port).with_dns_based(dns_based);
            for flag in &args[5.min(args.len())..] {
                match flag.to_ascii_uppercase().as_str() {
                    "TLS" => backend = backend.with_tls(true),
                    "PROXY" => backend = backend.with_send_proxy(true),
                    other => return Err(ControlError::InvalidArgument(format!("unknown flag: {other}"))),
                }
            }
            state.backends.insert(backend);
            Ok(vec![format!("backend {name} added")])
        }
        Some("DELETE") => {
            let name = arg(args, 1, "BACKEND DELETE name")?;
            state
                .backends
                .remove(name)
                .ok_or_else(|| ControlError::UnknownBackend(name.to_string()))?;
            Ok(vec![format!("backend {name} deleted")])
        }
        Some("PRINT") => Ok(state.backends.names()),
        _ => Err(ControlError::Usage("BACKEND ADD|DELETE|PRINT ...")),
    }
}

fn map_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("SET") => {
            let usage = "MAP SET vhost FARM|BACKEND name";
            let vhost = arg(args, 1, usage)?;
            let kind = arg(args, 2, usage)?;
            let name = arg(args, 3, usage)?;
            let target = match kind.to_ascii_uppercase().as_str() {
                "FARM" => MappingTarget::Farm(name.to_string()),
                "BACKEND" => MappingTarget::Backend(name.to_string()),
                other => return Err(ControlError::InvalidArgument(format!("unknown target kind: {other}"))),
            };
            state.resource_map.set_mapping(vhost, target);
            Ok(vec![format!("{vhost} mapped to {kind} {name}")])
        }
        Some("DEFAULT_FARM") => {
            let name = arg(args, 1, "MAP DEFAULT_FARM name")?;
            state.resource_map.set_default_farm(Some(name.to_string()));
            Ok(vec![format!("default farm set to {name}")])
        }
        Some("DELETE") => {
            let vhost = arg(args, 1, "MAP DELETE vhost")?;
            state.resource_map.remove_mapping(vhost);
            Ok(vec![format!("mapping for {vhost} deleted")])
        }
        Some("PRINT") => {
            let mut lines = Vec::new();
            if let Some(default_farm) = state.resource_map.default_farm() {
                lines.push(format!("default farm: {default_farm}"));
            }
            lines.extend(state.farms.names().into_iter().map(|n| format!("farm: {n}")));
            Ok(lines)
        }
        _ => Err(ControlError::Usage("MAP SET|DEFAULT_FARM|DELETE|PRINT ...")),
    }
}

/// `VHOST PAUSE|UNPAUSE|FORCE_DISCONNECT|BACKEND_DISCONNECT|PRINT vhost`.
/// Unlike the other verbs, this operates on every currently live session
/// whose vhost matches (the registry is the only place sessions are
/// addressable from outside their own task), plus the vhost-wide pause
/// bookkeeping for sessions not yet created.
fn vhost_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("PAUSE") => {
            let vhost = arg(args, 1, "VHOST PAUSE vhost")?;
            state.vhost_state.set_paused(vhost, true);
            let mut affected = 0;
            for session in state.registry.snapshot() {
                if session.vhost().as_deref() == Some(vhost) {
                    session.set_paused(true);
                    affected += 1;
                }
            }
            Ok(vec![format!("{vhost} paused ({affected} live session(s))")])
        }
        Some("UNPAUSE") => {
            let vhost = arg(args, 1, "VHOST UNPAUSE vhost")?;
            state.vhost_state.set_paused(vhost, false);
            let mut affected = 0;
            for session in state.registry.snapshot() {
                if session.vhost().as_deref() == Some(vhost) {
                    session.set_paused(false);
                    affected += 1;
                }
            }
            Ok(vec![format!("{vhost} unpaused ({affected} live session(s))")])
        }
        Some("FORCE_DISCONNECT") => {
            let vhost = arg(args, 1, "VHOST FORCE_DISCONNECT vhost")?;
            let mut affected = 0;
            for session in state.registry.snapshot() {
                if session.vhost().as_deref() == Some(vhost) {
                    session.request_force_disconnect();
                    affected += 1;
                }
            }
            Ok(vec![format!("{vhost}: force-disconnecting {affected} live session(s)")])
        }
        Some("BACKEND_DISCONNECT") => {
            let vhost = arg(args, 1, "VHOST BACKEND_DISCONNECT vhost")?;
            let mut affected = 0;
            for session in state.registry.snapshot() {
                if session.vhost().as_deref() == Some(vhost) {
                    session.request_backend_disconnect();
                    affected += 1;
                }
            }
            Ok(vec![format!("{vhost}: disconnecting backend leg of {affected} live session(s)")])
        }
        Some("PRINT") => {
            let mut lines = state.vhost_state.paused_vhosts();
            lines.sort();
            lines = lines.into_iter().map(|v| format!("paused: {v}")).collect();
            Ok(lines)
        }
        _ => Err(ControlError::Usage(
            "VHOST PAUSE|UNPAUSE|FORCE_DISCONNECT|BACKEND_DISCONNECT|PRINT vhost",
        )),
    }
}

fn limit_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    let limiters = &state.limiters;
    match args.first().copied() {
        Some("SET_RATE") => {
            let vhost = arg(args, 1, "LIMIT SET_RATE vhost limit")?;
            let limit = parse_u32(arg(args, 2, "LIMIT SET_RATE vhost limit")?)?;
            limiters.add_connection_rate_limiter(vhost, limit);
            Ok(vec![format!("rate limit for {vhost} set to {limit}")])
        }
        Some("SET_ALARM_RATE") => {
            let vhost = arg(args, 1, "LIMIT SET_ALARM_RATE vhost limit")?;
            let limit = parse_u32(arg(args, 2, "LIMIT SET_ALARM_RATE vhost limit")?)?;
            limiters.add_alarm_only_connection_rate_limiter(vhost, limit);
            Ok(vec![format!("alarm-only rate limit for {vhost} set to {limit}")])
        }
        Some("SET_TOTAL") => {
            let vhost = arg(args, 1, "LIMIT SET_TOTAL vhost limit")?;
            let limit = parse_u32(arg(args, 2, "LIMIT SET_TOTAL vhost limit")?)?;
            limiters.add_total_connection_limiter(vhost, limit);
            Ok(vec![format!("total limit for {vhost} set to {limit}")])
        }
        Some("SET_ALARM_TOTAL") => {
            let vhost = arg(args, 1, "LIMIT SET_ALARM_TOTAL vhost limit")?;
            let limit = parse_u32(arg(args, 2, "LIMIT SET_ALARM_TOTAL vhost limit")?)?;
            limiters.add_alarm_only_total_connection_limiter(vhost, limit);
            Ok(vec![format!("alarm-only total limit for {vhost} set to {limit}")])
        }
        Some("REMOVE_RATE") => {
            let vhost = arg(args, 1, "LIMIT REMOVE_RATE vhost")?;
            limiters.remove_connection_rate_limiter(vhost);
            Ok(vec![format!("rate limit for {vhost} removed")])
        }
        Some("REMOVE_ALARM_RATE") => {
            let vhost = arg(args, 1, "LIMIT REMOVE_ALARM_RATE vhost")?;
            limiters.remove_alarm_only_connection_rate_limiter(vhost);
            Ok(vec![format!("alarm-only rate limit for {vhost} removed")])
        }
        Some("REMOVE_TOTAL") => {
            let vhost = arg(args, 1, "LIMIT REMOVE_TOTAL vhost")?;
            limiters.remove_total_connection_limiter(vhost);
            Ok(vec![format!("total limit for {vhost} removed")])
        }
        Some("REMOVE_ALARM_TOTAL") => {
            let vhost = arg(args, 1, "LIMIT REMOVE_ALARM_TOTAL vhost")?;
            limiters.remove_alarm_only_total_connection_limiter(vhost);
            Ok(vec![format!("alarm-only total limit for {vhost} removed")])
        }
        Some("SET_DEFAULT_RATE") => {
            let limit = parse_u32(arg(args, 1, "LIMIT SET_DEFAULT_RATE limit")?)?;
            limiters.set_default_connection_rate_limit(limit);
            Ok(vec![format!("default rate limit set to {limit}")])
        }
        Some("SET_DEFAULT_ALARM_RATE") => {
            let limit = parse_u32(arg(args, 1, "LIMIT SET_DEFAULT_ALARM_RATE limit")?)?;
            limiters.set_alarm_only_default_connection_rate_limit(limit);
            Ok(vec![format!("default alarm-only rate limit set to {limit}")])
        }
        Some("SET_DEFAULT_TOTAL") => {
            let limit = parse_u32(arg(args, 1, "LIMIT SET_DEFAULT_TOTAL limit")?)?;
            limiters.set_default_total_connection_limit(limit);
            Ok(vec![format!("default total limit set to {limit}")])
        }
        Some("SET_DEFAULT_ALARM_TOTAL") => {
            let limit = parse_u32(arg(args, 1, "LIMIT SET_DEFAULT_ALARM_TOTAL limit")?)?;
            limiters.set_alarm_only_default_total_connection_limit(limit);
            Ok(vec![format!("default alarm-only total limit set to {limit}")])
        }
        Some("REMOVE_DEFAULT_RATE") => {
            limiters.remove_default_connection_rate_limit();
            Ok(vec!["default rate limit removed".to_string()])
        }
        Some("REMOVE_DEFAULT_ALARM_RATE") => {
            limiters.remove_alarm_only_default_connection_rate_limit();
            Ok(vec!["default alarm-only rate limit removed".to_string()])
        }
        Some("REMOVE_DEFAULT_TOTAL") => {
            limiters.remove_default_total_connection_limit();
            Ok(vec!["default total limit removed".to_string()])
        }
        Some("REMOVE_DEFAULT_ALARM_TOTAL") => {
            limiters.remove_alarm_only_default_total_connection_limit();
            Ok(vec!["default alarm-only total limit removed".to_string()])
        }
        _ => Err(ControlError::Usage("LIMIT SET_*|REMOVE_*|SET_DEFAULT_*|REMOVE_DEFAULT_* ...")),
    }
}

fn auth_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("SERVICE") => {
            let usage = "AUTH SERVICE host port target";
            let host = arg(args, 1, usage)?;
            let port = parse_port(arg(args, 2, usage)?)?;
            let target = arg(args, 3, usage)?;
            let interceptor = AuthInterceptor::service(host, port, target)?;
            *state.auth.write() = Some(Arc::new(interceptor));
            Ok(vec![format!("auth service set to http://{host}:{port}{target}")])
        }
        Some("ALWAYS_ALLOW") => {
            *state.auth.write() = Some(Arc::new(AuthInterceptor::AlwaysAllow));
            Ok(vec!["auth interceptor set to always-allow".to_string()])
        }
        Some("PRINT") => {
            let description = match state.auth.read().as_deref() {
                None => "none".to_string(),
                Some(AuthInterceptor::AlwaysAllow) => "ALWAYS_ALLOW".to_string(),
                Some(AuthInterceptor::Service(_)) => "SERVICE".to_string(),
            };
            Ok(vec![format!("auth: {description}")])
        }
        Some("CLEAR") => {
            *state.auth.write() = None;
            Ok(vec!["auth interceptor cleared".to_string()])
        }
        _ => Err(ControlError::Usage(
            "AUTH SERVICE host port target | AUTH ALWAYS_ALLOW | AUTH PRINT | AUTH CLEAR",
        )),
    }
}

fn tls_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("SERVER") => {
            let usage = "TLS SERVER cert key [client_ca]";
            let cert = arg(args, 1, usage)?;
            let key = arg(args, 2, usage)?;
            let client_ca = args.get(3).map(PathBuf::from);
            let config = tls::server_config(
                &PathBuf::from(cert),
                &PathBuf::from(key),
                client_ca.as_deref(),
            )?;
            state.tls.write().server = Some(config);
            Ok(vec!["server TLS configuration reloaded".to_string()])
        }
        Some("CLIENT") => {
            let ca = args.get(1).map(PathBuf::from);
            let cert_key = match (args.get(2), args.get(3)) {
                (Some(c), Some(k)) => Some((PathBuf::from(c), PathBuf::from(k))),
                _ => None,
            };
            let cert_key_ref = cert_key.as_ref().map(|(c, k)| (c.as_path(), k.as_path()));
            let config = tls::client_config(ca.as_deref(), cert_key_ref)?;
            state.tls.write().client = Some(config);
            Ok(vec!["client TLS configuration reloaded".to_string()])
        }
        Some("CLEAR_CLIENT") => {
            state.tls.write().client = None;
            Ok(vec!["client TLS configuration cleared".to_string()])
        }
        _ => Err(ControlError::Usage(
            "TLS SERVER cert key [client_ca] | TLS CLIENT [ca] [cert key] | TLS CLEAR_CLIENT",
        )),
    }
}

fn stat_command(args: &[&str], state: &ControlState) -> Result<Vec<String>, ControlError> {
    match args.first().copied() {
        Some("PRINT") | None => {
            let format_name = args.get(1).copied().unwrap_or("human");
            let formatter = stats::formatter_for(format_name)
                .ok_or_else(|| ControlError::InvalidArgument(format!("unknown stat format: {format_name}")))?;
            let connection_stats = ConnectionStats::collect(&state.registry.snapshot());
            let body = formatter.format(&connection_stats);
            Ok(vec![
                format!("farms: {}", state.farms.names().len()),
                format!("backends: {}", state.backends.names().len()),
                format!("auth configured: {}", state.auth.read().is_some()),
                format!("server tls configured: {}", state.tls.read().server.is_some()),
                format!("client tls configured: {}", state.tls.read().client.is_some()),
            ]
            .into_iter()
            .chain(body.lines().map(str::to_string))
            .collect())
        }
        _ => Err(ControlError::Usage("STAT PRINT [human|json|prometheus]")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn state() -> ControlState {
        ControlState {
            farms: Arc::new(FarmStore::new()),
            backends: Arc::new(BackendStore::new()),
            resource_map: Arc::new(ResourceMap::new()),
            limiters: Arc::new(ConnectionLimiterManager::new()),
            tls: Arc::new(RwLock::new(TlsContext::default())),
            auth: Arc::new(RwLock::new(None)),
            registry: SessionRegistry::new(),
            vhost_state: VhostState::new(),
        }
    }

    #[test]
    fn backend_add_then_farm_add_manual_then_print() {
        let state = state();
        backend_command(&["ADD", "b1", "dc1", "10.0.0.1", "5672"], &state).unwrap();
        farm_command(&["ADD_MANUAL", "f1", "b1"], &state).unwrap();
        assert_eq!(state.backends.names(), vec!["b1".to_string()]);
        let farm = state.farms.get("f1").unwrap();
        assert_eq!(farm.read().current_set().total_backend_count(), 1);
    }

    #[test]
    fn farm_add_dns_creates_dns_backed_member() {
        let state = state();
        farm_command(&["ADD_DNS", "f1", "broker.internal", "5672"], &state).unwrap();
        let backend = state.backends.get("f1-dns").unwrap();
        assert!(backend.dns_based);
        assert_eq!(backend.host, "broker.internal");
    }

    #[test]
    fn map_set_then_print_includes_default_farm() {
        let state = state();
        map_command(&["DEFAULT_FARM", "f1"], &state).unwrap();
        map_command(&["SET", "/prod", "FARM", "f1"], &state).unwrap();
        assert_eq!(
            state.resource_map.get_mapping("/prod"),
            Some(MappingTarget::Farm("f1".to_string()))
        );
        assert_eq!(state.resource_map.default_farm(), Some("f1".to_string()));
    }

    #[test]
    fn limit_set_rate_then_remove() {
        let state = state();
        limit_command(&["SET_RATE", "/prod", "5"], &state).unwrap();
        assert!(state.limiters.allow_new_connection_for_vhost("/prod"));
        limit_command(&["REMOVE_RATE", "/prod"], &state).unwrap();
    }

    #[test]
    fn unknown_farm_delete_is_an_error() {
        let state = state();
        let err = farm_command(&["DELETE", "missing"], &state).unwrap_err();
        assert_matches!(err, ControlError::UnknownFarm(name) if name == "missing");
    }

    #[test]
    fn dispatch_line_falls_back_to_help_for_unknown_verb() {
        let state = state();
        match dispatch_line("NONSENSE", &state) {
            Outcome::Reply(lines) => assert!(lines[0].contains("unrecognised")),
            Outcome::Exit => panic!("expected reply"),
        }
    }

    #[test]
    fn dispatch_line_exit_returns_exit_outcome() {
        let state = state();
        assert_matches!(dispatch_line("EXIT", &state), Outcome::Exit);
    }

    #[test]
    fn stat_print_reports_counts() {
        let state = state();
        backend_command(&["ADD", "b1", "dc1", "10.0.0.1", "5672"], &state).unwrap();
        let lines = stat_command(&[], &state).unwrap();
        assert!(lines.iter().any(|l| l == "backends: 1"));
    }

    #[test]
    fn vhost_pause_then_print_lists_it() {
        let state = state();
        vhost_command(&["PAUSE", "/prod"], &state).unwrap();
        assert!(state.vhost_state.is_paused("/prod"));
        let lines = vhost_command(&["PRINT"], &state).unwrap();
        assert_eq!(lines, vec!["paused: /prod".to_string()]);
        vhost_command(&["UNPAUSE", "/prod"], &state).unwrap();
        assert!(!state.vhost_state.is_paused("/prod"));
    }
}
