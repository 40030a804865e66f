//! Hex key-file parsing and the secret/public key wrapper types.
//!
//! Key files are two lines of 64 lowercase hex characters (one 32-byte key
//! per line), each terminated by `\n`. The secret-key file produced by
//! `tappet-keygen` carries both the secret key (line 1) and its matching
//! public key (line 2), but the tunnel only ever reads line 1 of whichever
//! file it's pointed at -- a secret-key file for `--secret-key` and a
//! (separately supplied) public-key file for `--peer-key`. Only line 1 is
//! load-bearing in either case.

use std::fmt;
use std::path::{Path, PathBuf};

use zeroize::Zeroize;

use crate::error::FatalError;

pub const KEY_LEN: usize = 32;

/// A long-term X25519 secret key. Zeroed on drop and never printed in full.
#[derive(Clone)]
pub struct SecretKey(pub(crate) [u8; KEY_LEN]);

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A long-term X25519 public key. Safe to log (truncated) for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) [u8; KEY_LEN]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}…)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Read the first line of `path` as 64 lowercase hex characters and decode
/// it into a 32-byte array. Any other content on the file is ignored.
fn read_first_line_key(path: &Path) -> Result<[u8; KEY_LEN], FatalError> {
    let contents = std::fs::read_to_string(path)?;
    let first_line = contents.lines().next().ok_or_else(|| FatalError::KeyFileFormat {
        path: path.to_path_buf(),
        reason: "file is empty".to_string(),
    })?;

    if first_line.len() != KEY_LEN * 2 {
        return Err(FatalError::KeyFileFormat {
            path: path.to_path_buf(),
            reason: format!("expected {} hex characters, found {}", KEY_LEN * 2, first_line.len()),
        });
    }

    let mut decoded = [0u8; KEY_LEN];
    hex::decode_to_slice(first_line, &mut decoded).map_err(|e| FatalError::KeyFileFormat {
        path: path.to_path_buf(),
        reason: format!("invalid hex: {e}"),
    })?;

    Ok(decoded)
}

pub fn load_secret_key(path: impl AsRef<Path>) -> Result<SecretKey, FatalError> {
    Ok(SecretKey(read_first_line_key(path.as_ref())?))
}

pub fn load_public_key(path: impl AsRef<Path>) -> Result<PublicKey, FatalError> {
    Ok(PublicKey(read_first_line_key(path.as_ref())?))
}

/// Write a freshly generated keypair as `<name>.secret` (two lines: secret
/// then public) and `<name>.public` (one line: public), refusing to clobber
/// existing files. This is the collaborator behind the `tappet-keygen` binary.
pub fn write_keypair(name_stem: &str, secret: &SecretKey, public: &PublicKey) -> std::io::Result<(PathBuf, PathBuf)> {
    let secret_path = PathBuf::from(format!("{name_stem}.secret"));
    let public_path = PathBuf::from(format!("{name_stem}.public"));

    for p in [&secret_path, &public_path] {
        if p.exists() {
            return Err(std::io::Error::new(std::io::ErrorKind::AlreadyExists, format!("{} already exists", p.display())));
        }
    }

    let secret_contents = format!("{}\n{}\n", hex::encode(secret.0), public);
    let public_contents = format!("{public}\n");

    write_restricted(&secret_path, secret_contents.as_bytes())?;
    std::fs::write(&public_path, public_contents.as_bytes())?;

    Ok((secret_path, public_path))
}

#[cfg(unix)]
fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut f = std::fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)?;
    f.write_all(contents)
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = crypto_box::SecretKey::generate(&mut rand_core::OsRng);
    let public = secret.public_key();
    (SecretKey(*secret.as_bytes()), PublicKey(*public.as_bytes()))
}
