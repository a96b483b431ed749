//! Command-line configuration, matching the teacher's `#[derive(Parser)]`
//! pattern in `src/main.rs` and spec.md §7's CLI flag table.
//!
//! `--listen` is not one of spec.md's named flags (the original binds its
//! ingress port as a fixed startup argument outside the set of flags the
//! spec distilled); it's added here since a proxy with no configured
//! listen address can't do anything, documented in DESIGN.md.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Reverse proxy for AMQP 0-9-1 (RabbitMQ-compatible) traffic", long_about = None)]
pub struct Args {
    /// Address the ingress listener binds to.
    #[arg(long, default_value = "0.0.0.0:5673")]
    pub listen: String,

    /// Directory daily-rotated log files are written to.
    #[arg(long = "logDirectory", default_value = "logs")]
    pub log_directory: PathBuf,

    /// Path of the control channel's UNIX domain socket.
    #[arg(long = "controlSocket", default_value = "/tmp/amqpprox")]
    pub control_socket: PathBuf,

    /// Interval, in milliseconds, between session-cleanup sweeps.
    #[arg(long = "cleanupIntervalMs", default_value_t = 1000)]
    pub cleanup_interval_ms: u32,
}
