//! C2: the nonce manager. Generates and monotonically advances the 24-byte
//! nonce, and persists a 4-byte prefix across runs so that restarting this
//! side never reuses a prefix it has already used under the same key.
//!
//! Layout (bytes, big-endian-comparable as a whole):
//!   0..4   prefix  -- read from / written to the prefix file at startup
//!   4..16  salt    -- 12 random bytes drawn once at startup
//!   16..24 counter -- monotonic-clock nanoseconds, advanced before every send

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::crypto::{Nonce, NONCE_LEN};
use crate::error::FatalError;

const PREFIX_LEN: usize = 4;
const SALT_LEN: usize = 12;
const COUNTER_LEN: usize = 8;
const _: () = assert!(PREFIX_LEN + SALT_LEN + COUNTER_LEN == NONCE_LEN);

/// Open the prefix file, read its 4 bytes as a big-endian `u32`, increment,
/// reject a wrap to zero, rewrite in place, and return the incremented value.
///
/// The file is opened read-write and held open only for the duration of this
/// call: the whole read-increment-write sequence is the "exclusive file-range
/// open/write/close" access described for this resource.
pub fn acquire_prefix(path: impl AsRef<Path>) -> Result<u32, FatalError> {
    let path = path.as_ref();
    let mut file = OpenOptions::new().read(true).write(true).open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            FatalError::MalformedPrefixFile { path: path.to_path_buf(), reason: "file does not exist".to_string() }
        } else {
            FatalError::Io(source)
        }
    })?;

    let mut buf = [0u8; PREFIX_LEN];
    let n = file.read(&mut buf)?;
    if n != PREFIX_LEN {
        return Err(FatalError::MalformedPrefixFile {
            path: path.to_path_buf(),
            reason: format!("expected {PREFIX_LEN} bytes, read {n}"),
        });
    }
    // A short extra read would mean the file is larger than 4 bytes.
    let mut trailing = [0u8; 1];
    if file.read(&mut trailing)? != 0 {
        return Err(FatalError::MalformedPrefixFile { path: path.to_path_buf(), reason: "file is larger than 4 bytes".to_string() });
    }

    let current = u32::from_be_bytes(buf);
    let next = current.checked_add(1).ok_or_else(|| FatalError::PrefixCounterWrap { path: path.to_path_buf() })?;
    if next == 0 {
        return Err(FatalError::PrefixCounterWrap { path: path.to_path_buf() });
    }

    file.seek(SeekFrom::Start(0))?;
    let written = file.write(&next.to_be_bytes())?;
    if written != PREFIX_LEN {
        return Err(FatalError::MalformedPrefixFile { path: path.to_path_buf(), reason: "short write while persisting prefix".to_string() });
    }
    file.flush()?;

    Ok(next)
}

/// Owns the monotonic state needed to keep producing strictly increasing
/// nonces for outbound packets from this process for its whole lifetime.
pub struct NonceManager {
    prefix: u32,
    salt: [u8; SALT_LEN],
    last_counter: u64,
}

impl NonceManager {
    /// Acquire a prefix from `prefix_file_path` and draw a fresh random salt.
    pub fn start(prefix_file_path: impl AsRef<Path>) -> Result<Self, FatalError> {
        let prefix = acquire_prefix(prefix_file_path)?;
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Ok(Self { prefix, salt, last_counter: 0 })
    }

    #[cfg(test)]
    fn for_test(prefix: u32, salt: [u8; SALT_LEN]) -> Self {
        Self { prefix, salt, last_counter: 0 }
    }

    /// Build a brand-new nonce: prefix + fresh salt region content (the
    /// salt is fixed for the process, per §4.2) + an advanced counter.
    pub fn generate_nonce(&mut self) -> Result<Nonce, FatalError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[0..PREFIX_LEN].copy_from_slice(&self.prefix.to_be_bytes());
        nonce[PREFIX_LEN..PREFIX_LEN + SALT_LEN].copy_from_slice(&self.salt);
        self.advance_nonce(&mut nonce)?;
        Ok(nonce)
    }

    /// Advance the counter region of an existing nonce buffer in place.
    /// Guarantees the resulting nonce is strictly greater (as a 24-byte
    /// big-endian integer) than the one produced by the previous call, even
    /// if the monotonic clock reports the same or an earlier nanosecond
    /// count than last time.
    pub fn advance_nonce(&mut self, nonce: &mut Nonce) -> Result<(), FatalError> {
        let now_ns = monotonic_nanos()?;

        let next_counter = if now_ns > self.last_counter { now_ns } else { self.last_counter.saturating_add(1) };
        self.last_counter = next_counter;

        nonce[PREFIX_LEN + SALT_LEN..].copy_from_slice(&next_counter.to_be_bytes());
        Ok(())
    }
}

/// Read `CLOCK_MONOTONIC` as `tv_sec * 1e9 + tv_nsec`, per §4.2. Unlike
/// `std::time::Instant`, this surfaces the underlying syscall failure
/// instead of making clock reads infallible by construction.
fn monotonic_nanos() -> Result<u64, FatalError> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return Err(FatalError::ClockUnreadable(std::io::Error::last_os_error()));
    }
    Ok((ts.tv_sec as u64).saturating_mul(1_000_000_000).saturating_add(ts.tv_nsec as u64))
}

/// True if `candidate` would be a replay or reordering relative to
/// `last_accepted` -- i.e. it is not strictly greater, compared as a 24-byte
/// big-endian unsigned integer. Used by the tunnel loop's replay defence.
pub fn is_replay_or_stale(candidate: &Nonce, last_accepted: &Nonce) -> bool {
    candidate <= last_accepted
}
