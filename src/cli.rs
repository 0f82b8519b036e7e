//! Command-line entry point arguments.
//!
//! The teacher's `main.rs` takes no arguments at all; this is new surface
//! area the corpus otherwise shows through `clap`'s derive macros for
//! binary entry points.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wavecore", version, about = "an RFC 6455 WebSocket server core")]
pub struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<String>,

    /// Overrides the configured listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Minimum log level: error, warn, info, debug, or trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
