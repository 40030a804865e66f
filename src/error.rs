//! Tagged outcomes and the fatal error taxonomy from the error handling design.
//!
//! Soft outcomes (auth failure, replay, oversize/undersize datagrams, PMTU
//! exceeded, unreachable) are never `Result::Err` bubbled to `main` -- they
//! are values of the enums below, matched exhaustively where they occur and
//! turned into a log line or a silent drop. Only genuine failures become a
//! `FatalError` and terminate the process.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Every cause that terminates the tunnel process.
#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("monotonic clock unreadable: {0}")]
    ClockUnreadable(std::io::Error),

    #[error("TAP device {iface} reached end-of-file")]
    TapEof { iface: String },

    #[error("readiness poll failed: {0}")]
    PollFailed(std::io::Error),

    #[error("nonce prefix file {path:?} is malformed: {reason}")]
    MalformedPrefixFile { path: PathBuf, reason: String },

    #[error("nonce prefix counter in {path:?} would wrap past u32::MAX")]
    PrefixCounterWrap { path: PathBuf },

    #[error("failed to bind UDP socket on {addr}: {source}")]
    SocketBind { addr: SocketAddr, source: std::io::Error },

    #[error("failed to create UDP socket: {0}")]
    SocketCreate(std::io::Error),

    #[error("key file {path:?} is malformed: {reason}")]
    KeyFileFormat { path: PathBuf, reason: String },

    #[error("failed to attach TAP device {iface}: {source}")]
    TapAttach { iface: String, source: std::io::Error },

    #[error("must not be run as root")]
    RefusedRoot,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single `udp_recv` call (C3).
#[derive(Debug)]
pub enum RecvOutcome {
    /// `n` payload bytes (after the nonce) were read from `from`.
    Packet { n: usize, from: SocketAddr },
    /// No datagram currently queued; caller should stop draining.
    WouldBlock,
    /// Datagram was present but unusable (zero-length, undersized, or
    /// truncated by the kernel because it exceeded our buffer). Logged and
    /// ignored; the *next* call to `udp_recv` tries again, not this packet.
    Transient(TransientRecvReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientRecvReason {
    ZeroLength,
    UndersizedForNonce,
    Truncated,
}

impl fmt::Display for TransientRecvReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroLength => write!(f, "zero-length datagram"),
            Self::UndersizedForNonce => write!(f, "datagram shorter than nonce"),
            Self::Truncated => write!(f, "datagram truncated by kernel"),
        }
    }
}

/// Outcome of a single `udp_send` call (C3).
#[derive(Debug)]
pub enum SendOutcome {
    Ok,
    /// Path MTU would be exceeded (`EMSGSIZE`); the packet was dropped, not queued.
    PmtuExceeded { attempted: usize },
    /// Destination unreachable (`EHOSTUNREACH`/`ENETUNREACH`); soft, logged.
    NetUnreachable,
}

/// Outcome of a single non-blocking `tap_read` call (C4).
#[derive(Debug)]
pub enum TapReadOutcome {
    Frame { n: usize },
    WouldBlock,
}
