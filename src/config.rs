//! CLI argument parsing: the out-of-scope "command-line front-end"
//! collaborator. Six positional arguments plus the listener flag, matching
//! the original `tappet` invocation exactly.

use std::path::PathBuf;

use clap::Parser;

/// Bridges a TAP interface to a peer across an authenticated, encrypted UDP tunnel.
#[derive(Parser, Debug)]
#[command(name = "tappet", version, about)]
pub struct Config {
    /// TAP interface to attach to (must already exist and be configured).
    pub iface: String,

    /// Path to the 4-byte nonce-prefix file.
    pub nonce_file: PathBuf,

    /// Path to our own secret-key file.
    pub our_secret_key: PathBuf,

    /// Path to the peer's public-key file.
    pub their_public_key: PathBuf,

    /// Peer address (listener: local bind address; initiator: server address).
    pub address: String,

    /// UDP port.
    pub port: u16,

    /// Run as the listener (bind and wait for the peer to authenticate)
    /// rather than the initiator (connect to `address`:`port`).
    #[arg(short = 'l', long = "listen")]
    pub listen: bool,
}

impl Config {
    pub fn parse_args() -> Self {
        Config::parse()
    }
}
