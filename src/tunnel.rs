//! C5: the tunnel loop. The conductor that owns every other component and
//! drives the single suspension point described in the concurrency model --
//! one readiness wait, 10-second timeout, UDP drained before TAP.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, trace, warn};

use crate::addr::{self, PeerAddr};
use crate::config::Config;
use crate::crypto::{CryptoContext, Nonce, NONCE_LEN};
use crate::error::{FatalError, RecvOutcome, SendOutcome, TapReadOutcome};
use crate::keys;
use crate::nonce::{is_replay_or_stale, NonceManager};
use crate::tap::TapDevice;
use crate::udp::{UdpFraming, MAX_CIPHERTEXT_LEN};

const UDP_TOKEN: Token = Token(0);
const TAP_TOKEN: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Ethernet frames shorter than this are treated as control messages rather
/// than TAP-bound traffic.
const MIN_FRAME_LEN: usize = 64;
const MTU_REPORT_TAG: u8 = 0xFE;
const MTU_REPORT_LEN: usize = 3;
const MAX_FRAME_LEN: usize = MAX_CIPHERTEXT_LEN - crate::crypto::TAG_LEN;

pub struct Tunnel {
    crypto: CryptoContext,
    nonce_mgr: NonceManager,
    ournonce: Nonce,
    theirnonce: Nonce,
    udp: UdpFraming,
    tap: TapDevice,
    peer: PeerAddr,
    biggest_tried: u16,
    biggest_sent: u16,
    biggest_rcvd: u16,
    tap_registered: bool,
    poll: Poll,
}

impl Tunnel {
    /// Build every component from a parsed CLI configuration. This is the
    /// point where the listener/initiator asymmetry collapses to nothing
    /// more than the initial value of `peer` (§9 design note).
    pub fn new(cfg: &Config) -> Result<Self, FatalError> {
        let our_secret = keys::load_secret_key(&cfg.our_secret_key)?;
        let their_public = keys::load_public_key(&cfg.their_public_key)?;
        let crypto = CryptoContext::new(&our_secret, &their_public);

        let mut nonce_mgr = NonceManager::start(&cfg.nonce_file)?;
        let ournonce = nonce_mgr.generate_nonce()?;

        let tap = TapDevice::attach(&cfg.iface)?;

        let server_addr = addr::resolve(&cfg.address, cfg.port)?;
        let (udp, peer) = if cfg.listen {
            (UdpFraming::bind(server_addr)?, PeerAddr::Unknown)
        } else {
            (UdpFraming::bind_ephemeral(server_addr.is_ipv6())?, PeerAddr::Known(server_addr))
        };

        info!(iface = %cfg.iface, listen = cfg.listen, "tunnel starting");

        Self::from_parts(crypto, nonce_mgr, ournonce, udp, tap, peer)
    }

    /// Assemble a tunnel from already-constructed components, bypassing CLI
    /// config, key-file loading, and TAP attach. This is how integration
    /// tests drive the real dispatch loop over a `TapDevice::pair`
    /// substitute instead of a real interface.
    pub fn from_parts(
        crypto: CryptoContext,
        nonce_mgr: NonceManager,
        ournonce: Nonce,
        udp: UdpFraming,
        tap: TapDevice,
        peer: PeerAddr,
    ) -> Result<Self, FatalError> {
        let poll = Poll::new().map_err(FatalError::PollFailed)?;

        Ok(Self {
            crypto,
            nonce_mgr,
            ournonce,
            theirnonce: [0u8; NONCE_LEN],
            udp,
            tap,
            peer,
            biggest_tried: 0,
            biggest_sent: 0,
            biggest_rcvd: 0,
            tap_registered: false,
            poll,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub fn theirnonce(&self) -> Nonce {
        self.theirnonce
    }

    pub fn biggest_tried(&self) -> u16 {
        self.biggest_tried
    }

    pub fn biggest_sent(&self) -> u16 {
        self.biggest_sent
    }

    pub fn biggest_rcvd(&self) -> u16 {
        self.biggest_rcvd
    }

    /// Run until a fatal error occurs. Never returns `Ok` in practice --
    /// the loop is unbounded, per the concurrency model's "no graceful
    /// shutdown protocol".
    pub fn run(&mut self) -> Result<(), FatalError> {
        self.start()?;
        loop {
            self.poll_once()?;
        }
    }

    /// Register the UDP socket and, if the peer is already known, send the
    /// startup greeting (S1). Must run once before the first `poll_once`.
    pub fn start(&mut self) -> Result<(), FatalError> {
        self.poll
            .registry()
            .register(self.udp.mio_source(), UDP_TOKEN, Interest::READABLE)
            .map_err(FatalError::PollFailed)?;

        if self.peer.is_known() {
            self.send_startup_greeting()?;
        }
        Ok(())
    }

    /// Run exactly one iteration of the event loop: sync TAP registration,
    /// wait for readiness or the 10s timeout, and dispatch. Split out from
    /// `run` so tests can drive the real dispatch logic a bounded number of
    /// times instead of looping forever.
    pub fn poll_once(&mut self) -> Result<(), FatalError> {
        self.sync_tap_registration()?;

        let mut events = Events::with_capacity(16);
        self.poll.poll(&mut events, Some(POLL_TIMEOUT)).map_err(FatalError::PollFailed)?;

        let mut udp_ready = false;
        let mut tap_ready = false;
        for event in events.iter() {
            match event.token() {
                UDP_TOKEN => udp_ready = true,
                TAP_TOKEN => tap_ready = true,
                _ => {}
            }
        }

        if !udp_ready && !tap_ready {
            return self.on_timeout();
        }

        if udp_ready {
            self.drain_udp()?;
        }
        if tap_ready {
            self.drain_tap()?;
        }
        Ok(())
    }

    /// The initiator sends one keepalive immediately so the listener can
    /// learn its address before any real frame arrives (S1). `biggest_rcvd`
    /// is still zero at this point, so the wire body is `0xFE 0x00 0x00`.
    fn send_startup_greeting(&mut self) -> Result<(), FatalError> {
        let report = self.biggest_rcvd.to_be_bytes();
        self.send_control(&[MTU_REPORT_TAG, report[0], report[1]])
    }

    /// TAP is only polled once a peer has authenticated; the listener must
    /// not forward outbound frames to an unknown destination.
    fn sync_tap_registration(&mut self) -> Result<(), FatalError> {
        if self.peer.is_known() && !self.tap_registered {
            let raw_fd = self.tap.as_raw_fd();
            self.poll
                .registry()
                .register(&mut SourceFd(&raw_fd), TAP_TOKEN, Interest::READABLE)
                .map_err(FatalError::PollFailed)?;
            self.tap_registered = true;
            trace!("TAP device registered for polling now that peer is known");
        }
        Ok(())
    }

    fn drain_udp(&mut self) -> Result<(), FatalError> {
        let mut nonce_buf = [0u8; NONCE_LEN];
        let mut ct_buf = [0u8; MAX_CIPHERTEXT_LEN];

        loop {
            match self.udp.recv(&mut nonce_buf, &mut ct_buf)? {
                RecvOutcome::WouldBlock => return Ok(()),
                RecvOutcome::Transient(reason) => {
                    debug!(%reason, "dropping unusable inbound datagram");
                    continue;
                }
                RecvOutcome::Packet { n, from } => {
                    self.handle_inbound_packet(nonce_buf, &ct_buf[..n], from);
                }
            }
        }
    }

    fn handle_inbound_packet(&mut self, candidate_nonce: Nonce, ciphertext: &[u8], from: SocketAddr) {
        if is_replay_or_stale(&candidate_nonce, &self.theirnonce) {
            debug!(%from, "dropping replayed or stale nonce");
            return;
        }

        let plaintext = match self.crypto.open(&candidate_nonce, ciphertext) {
            Ok(pt) => pt,
            Err(_) => {
                debug!(%from, "dropping datagram that failed authentication");
                return;
            }
        };

        self.theirnonce = candidate_nonce;
        self.peer.set(from);

        // MTU counters are measured as the full wire size (nonce + tag + payload)
        // so that biggest_tried/biggest_rcvd/biggest_sent are directly comparable.
        let wire_len = (NONCE_LEN + ciphertext.len()) as u16;
        if wire_len > self.biggest_rcvd {
            self.biggest_rcvd = wire_len;
        }

        if plaintext.len() < MIN_FRAME_LEN {
            self.handle_control_message(&plaintext);
        } else if let Err(e) = self.tap.write_frame(&plaintext) {
            warn!(error = %e, "failed to write frame to TAP device");
        }
    }

    fn handle_control_message(&mut self, plaintext: &[u8]) {
        if plaintext.len() == MTU_REPORT_LEN && plaintext[0] == MTU_REPORT_TAG {
            let reported = u16::from_be_bytes([plaintext[1], plaintext[2]]);
            self.biggest_sent = reported;
            trace!(reported, "peer confirmed largest ciphertext received");
        } else {
            trace!("received keepalive");
        }
    }

    fn drain_tap(&mut self) -> Result<(), FatalError> {
        let mut frame_buf = [0u8; MAX_FRAME_LEN];
        loop {
            match self.tap.read_frame(&mut frame_buf)? {
                TapReadOutcome::WouldBlock => return Ok(()),
                TapReadOutcome::Frame { n } => {
                    self.seal_and_send(&frame_buf[..n])?;
                }
            }
        }
    }

    fn on_timeout(&mut self) -> Result<(), FatalError> {
        if !self.peer.is_known() {
            return Ok(());
        }
        trace!("idle timeout; sending keepalive");
        let report = self.biggest_rcvd.to_be_bytes();
        self.send_control(&[MTU_REPORT_TAG, report[0], report[1]])
    }

    /// Seal and send a short control payload (empty keepalive or MTU report)
    /// under the next advanced nonce.
    fn send_control(&mut self, payload: &[u8]) -> Result<(), FatalError> {
        self.seal_and_send(payload)
    }

    fn seal_and_send(&mut self, plaintext: &[u8]) -> Result<(), FatalError> {
        let peer = match self.peer.addr() {
            Some(a) => a,
            None => return Ok(()),
        };

        self.nonce_mgr.advance_nonce(&mut self.ournonce)?;
        let ciphertext = self.crypto.seal(&self.ournonce, plaintext);

        let wire_len = (NONCE_LEN + ciphertext.len()) as u16;
        if wire_len > self.biggest_tried {
            self.biggest_tried = wire_len;
        }

        match self.udp.send(&self.ournonce, &ciphertext, peer)? {
            SendOutcome::Ok => Ok(()),
            SendOutcome::PmtuExceeded { attempted } => {
                warn!(attempted, "dropping outbound packet that exceeds path MTU");
                Ok(())
            }
            SendOutcome::NetUnreachable => {
                warn!(%peer, "destination unreachable; dropping outbound packet");
                Ok(())
            }
        }
    }
}
