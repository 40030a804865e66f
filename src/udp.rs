//! C3: UDP framing. Datagrams carry `[24-byte nonce ‖ ciphertext]` with no
//! length prefix; UDP itself supplies the framing. `send`/`recv` use
//! scatter-gather (`sendmsg`/`recvmsg`) from/into separate nonce and
//! ciphertext buffers, using raw `libc` socket calls over a higher-level
//! wrapper since the standard library has no portable equivalent for
//! `IP_MTU_DISCOVER`/`IP_PMTUDISC_DO` or the `MSG_TRUNC` truncation flag.

use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::crypto::NONCE_LEN;
use crate::error::{FatalError, RecvOutcome, SendOutcome, TransientRecvReason};

/// Largest ciphertext (nonce excluded) this implementation will stage a
/// buffer for; datagrams larger than this plus the nonce are reported as
/// `Transient(Truncated)` rather than silently growing an allocation.
pub const MAX_CIPHERTEXT_LEN: usize = 2048;

pub struct UdpFraming {
    socket: mio::net::UdpSocket,
}

impl UdpFraming {
    /// Bind a listener socket on `local_addr`, enabling PMTU discovery so
    /// oversize sends fail locally (`EMSGSIZE`) instead of being fragmented.
    pub fn bind(local_addr: SocketAddr) -> Result<Self, FatalError> {
        let std_socket = std::net::UdpSocket::bind(local_addr).map_err(|source| FatalError::SocketBind { addr: local_addr, source })?;
        std_socket.set_nonblocking(true)?;
        set_pmtu_discover_do(std_socket.as_raw_fd(), local_addr.is_ipv6())?;
        Ok(Self { socket: mio::net::UdpSocket::from_std(std_socket) })
    }

    /// Bind an ephemeral socket (any free local port), used by the initiator.
    pub fn bind_ephemeral(v6: bool) -> Result<Self, FatalError> {
        let local_addr: SocketAddr = if v6 { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
        Self::bind(local_addr)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn mio_source(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Read one `[nonce‖ciphertext]` datagram directly into separate staging
    /// buffers without touching any live tunnel state -- the caller decides
    /// whether to accept it.
    pub fn recv(&self, nonce_out: &mut [u8; NONCE_LEN], ct_out: &mut [u8; MAX_CIPHERTEXT_LEN]) -> Result<RecvOutcome, FatalError> {
        let fd = self.socket.as_raw_fd();

        let mut iov = [
            libc::iovec { iov_base: nonce_out.as_mut_ptr().cast(), iov_len: NONCE_LEN },
            libc::iovec { iov_base: ct_out.as_mut_ptr().cast(), iov_len: MAX_CIPHERTEXT_LEN },
        ];

        let mut src_storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = src_storage.as_mut_ptr().cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
                _ => Err(FatalError::Io(err)),
            };
        }

        let n = n as usize;
        if n == 0 {
            return Ok(RecvOutcome::Transient(TransientRecvReason::ZeroLength));
        }
        if msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Ok(RecvOutcome::Transient(TransientRecvReason::Truncated));
        }
        if n <= NONCE_LEN {
            return Ok(RecvOutcome::Transient(TransientRecvReason::UndersizedForNonce));
        }

        let from = sockaddr_storage_to_socketaddr(unsafe { src_storage.assume_init() }, msg.msg_namelen)?;
        Ok(RecvOutcome::Packet { n: n - NONCE_LEN, from })
    }

    /// Send one `[nonce‖ciphertext]` datagram to `peer`.
    pub fn send(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8], peer: SocketAddr) -> Result<SendOutcome, FatalError> {
        let fd = self.socket.as_raw_fd();
        let (addr_storage, addr_len) = socketaddr_to_sockaddr_storage(peer);

        let mut iov = [
            libc::iovec { iov_base: nonce.as_ptr() as *mut _, iov_len: NONCE_LEN },
            libc::iovec { iov_base: ciphertext.as_ptr() as *mut _, iov_len: ciphertext.len() },
        ];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &addr_storage as *const _ as *mut _;
        msg.msg_namelen = addr_len;
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;

        let n = unsafe { libc::sendmsg(fd, &msg, 0) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EMSGSIZE) => Ok(SendOutcome::PmtuExceeded { attempted: NONCE_LEN + ciphertext.len() }),
                Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => Ok(SendOutcome::NetUnreachable),
                _ => Err(FatalError::Io(err)),
            };
        }

        Ok(SendOutcome::Ok)
    }
}

#[cfg(target_os = "linux")]
fn set_pmtu_discover_do(fd: RawFd, v6: bool) -> Result<(), FatalError> {
    let (level, name, value) =
        if v6 { (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, libc::IPV6_PMTUDISC_DO) } else { (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO) };
    let rc = unsafe { libc::setsockopt(fd, level, name, &value as *const _ as *const libc::c_void, std::mem::size_of_val(&value) as libc::socklen_t) };
    if rc != 0 {
        return Err(FatalError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_pmtu_discover_do(_fd: RawFd, _v6: bool) -> Result<(), FatalError> {
    // IP_MTU_DISCOVER is Linux-specific; other platforms rely on the socket's
    // default PMTU behavior. The tunnel loop still handles EMSGSIZE if the
    // platform ever returns it.
    Ok(())
}

fn sockaddr_storage_to_socketaddr(storage: libc::sockaddr_storage, len: libc::socklen_t) -> Result<SocketAddr, FatalError> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
            // sin_addr.s_addr's raw bytes are the address octets in network
            // (big-endian) order; we stored them with the matching identity
            // conversion in socketaddr_to_sockaddr_storage, so the inverse
            // here is a byte-order-preserving round trip, not from_be().
            let ip = std::net::Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = unsafe { *(&storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::from((ip, port)))
        }
        _ => Err(FatalError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("unsupported address family (len {len})")))),
    }
}

fn socketaddr_to_sockaddr_storage(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: a.ip().octets() },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
