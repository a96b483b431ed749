//! amqpprox: a reverse proxy for AMQP 0-9-1 (RabbitMQ-compatible) traffic.
//!
//! The core is the per-connection proxy engine: the frame codec, the
//! dual-sided handshake state machine ([`connector`]), the session data
//! pump ([`session`]) joining client and broker sockets, the backend
//! selection pipeline (`farm` → `partition_policy` → `selector` →
//! `resourcemap`/`connection_selector`), DNS resolution with a TTL cache,
//! and the vhost admission layer (`limiter`). A side-band control channel
//! ([`control`]) and a periodic stats/cleanup task ([`stats`]) round out a
//! runnable binary.

pub mod auth;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod connection_selector;
pub mod connector;
pub mod control;
pub mod dns;
pub mod events;
pub mod farm;
pub mod fieldtable;
pub mod frame;
pub mod hostname;
pub mod limiter;
pub mod logging;
pub mod methods;
pub mod partition_policy;
pub mod proxyprotocol;
pub mod resourcemap;
pub mod selector;
pub mod session;
pub mod socket;
pub mod stats;
pub mod tls;
