//! C4: TAP device framing. Attaches to an already-existing TAP interface and
//! does unbuffered, whole-frame reads and writes against it.
//!
//! Mirrors the original `tap_attach`: open `/dev/net/tun`, fill in an
//! `ifreq` with the interface name and `IFF_TAP | IFF_NO_PI`, and
//! `ioctl(TUNSETIFF)`. We never create the interface (that's left to
//! whatever out-of-band tooling configured it) and we never run as root, so
//! a missing interface is a hard failure, not something we paper over.
//!
//! Each read toggles the fd nonblocking first (readiness already told us
//! there's at least one frame queued, but draining needs `WouldBlock` to know
//! when to stop); each write toggles it back to blocking first, since a frame
//! accepted by TAP must not be silently dropped for lack of buffer space.

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{FatalError, TapReadOutcome};

const IFNAMSIZ: usize = 16;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// An attached TAP device. Holds the raw fd for its whole lifetime; dropped
/// at process exit (or test teardown), never explicitly closed early.
pub struct TapDevice {
    fd: RawFd,
    iface: String,
}

impl TapDevice {
    /// Attach to the pre-existing interface named `iface`. Fails if the
    /// device node can't be opened or the interface doesn't already exist.
    pub fn attach(iface: &str) -> Result<Self, FatalError> {
        if iface.len() >= IFNAMSIZ {
            return Err(FatalError::TapAttach {
                iface: iface.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "interface name too long"),
            });
        }

        let path = CString::new("/dev/net/tun").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(FatalError::TapAttach { iface: iface.to_string(), source: std::io::Error::last_os_error() });
        }

        let mut ifr: IfReq = unsafe { MaybeUninit::zeroed().assume_init() };
        let name_bytes = iface.as_bytes();
        for (i, b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = *b as libc::c_char;
        }
        ifr.ifr_flags = IFF_TAP | IFF_NO_PI;

        let n = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr as *mut IfReq) };
        if n < 0 {
            let source = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(FatalError::TapAttach { iface: iface.to_string(), source });
        }

        Ok(Self { fd, iface: iface.to_string() })
    }

    /// Wrap an already-open file descriptor as a `TapDevice`, taking
    /// ownership (it is closed on drop). Used to substitute a `socketpair`
    /// fd for a real tun/tap device in tests, since attaching to
    /// `/dev/net/tun` needs `CAP_NET_ADMIN` and a pre-provisioned interface.
    ///
    /// # Safety
    /// `fd` must be a valid, open, owned file descriptor that supports
    /// `read`/`write`/`fcntl` the way a TAP device does.
    pub unsafe fn from_raw_fd(fd: RawFd, iface: impl Into<String>) -> Self {
        Self { fd, iface: iface.into() }
    }

    /// Build a connected pair of `TapDevice`s over a `SOCK_DGRAM`
    /// `socketpair`, each end usable as a drop-in TAP substitute: one end
    /// plays the tunnel's attached device, the other plays "the rest of the
    /// NIC ring" for a test harness to read/write real frames against.
    pub fn pair(iface_a: &str, iface_b: &str) -> std::io::Result<(TapDevice, TapDevice)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok((unsafe { Self::from_raw_fd(fds[0], iface_a) }, unsafe { Self::from_raw_fd(fds[1], iface_b) }))
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    fn set_blocking(&self, blocking: bool) -> std::io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if blocking { flags & !libc::O_NONBLOCK } else { flags | libc::O_NONBLOCK };
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read one frame into `buf`, non-blocking. Call repeatedly after a
    /// readiness notification until it reports `WouldBlock`.
    pub fn read_frame(&self, buf: &mut [u8]) -> Result<TapReadOutcome, FatalError> {
        self.set_blocking(false)?;
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Ok(TapReadOutcome::WouldBlock)
            } else {
                Err(FatalError::Io(err))
            };
        }
        if n == 0 {
            return Err(FatalError::TapEof { iface: self.iface.clone() });
        }
        Ok(TapReadOutcome::Frame { n: n as usize })
    }

    /// Write one frame, blocking until TAP accepts it whole. Frames are
    /// never partially written or buffered by us: the kernel's TAP queue is
    /// the only buffer in this path.
    pub fn write_frame(&self, frame: &[u8]) -> Result<(), FatalError> {
        self.set_blocking(true)?;
        let n = unsafe { libc::write(self.fd, frame.as_ptr() as *const libc::c_void, frame.len()) };
        if n < 0 {
            return Err(FatalError::Io(std::io::Error::last_os_error()));
        }
        if n as usize != frame.len() {
            return Err(FatalError::Io(std::io::Error::new(std::io::ErrorKind::WriteZero, "short write to TAP device")));
        }
        Ok(())
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_interface_name() {
        let name = "a".repeat(IFNAMSIZ);
        let err = TapDevice::attach(&name).unwrap_err();
        assert!(matches!(err, FatalError::TapAttach { .. }));
    }

    // Attaching to a real interface requires CAP_NET_ADMIN and a
    // pre-provisioned TAP device; not reproducible in a sandboxed test run.
    // `pair()` is the substitute the tunnel-loop integration tests drive
    // instead (see tests/scenarios.rs).
    #[test]
    fn pair_round_trips_a_frame() {
        let (a, b) = TapDevice::pair("a", "b").unwrap();
        let frame = vec![0x11u8; 100];
        a.write_frame(&frame).unwrap();

        let mut buf = [0u8; 256];
        match b.read_frame(&mut buf).unwrap() {
            TapReadOutcome::Frame { n } => assert_eq!(&buf[..n], &frame[..]),
            other => panic!("expected a frame, got {other:?}"),
        }
    }
}
