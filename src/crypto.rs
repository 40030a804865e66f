//! C1: the crypto context. Holds a single precomputed shared secret `K` for
//! the lifetime of the process and performs authenticated seal/open.
//!
//! This is NaCl `crypto_box_afternm`/`crypto_box_open_afternm` semantics --
//! X25519 Diffie-Hellman folded through HSalsa20 once at startup
//! (`box_beforenm`), then XSalsa20-Poly1305 keyed by the result for every
//! packet. `crypto_box` (RustCrypto) implements this construction directly,
//! so unlike the C source there is no reserved zero/MAC padding region to
//! manage by hand: `seal` returns exactly `plaintext.len() + 16` bytes and
//! `open` returns exactly the original plaintext.

use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::Aead;
use crypto_box::{PublicKey as BoxPublicKey, SalsaBox, SecretKey as BoxSecretKey};

use crate::keys::{PublicKey, SecretKey};

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

/// Returned by `open` when the MAC fails to verify. Callers must discard the
/// packet and continue; this is a soft, silent failure (no oracle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFailed;

pub struct CryptoContext {
    sealed_box: SalsaBox,
}

impl CryptoContext {
    /// Precompute `K = beforenm(their_public, our_secret)` once, at startup.
    pub fn new(our_secret: &SecretKey, their_public: &PublicKey) -> Self {
        let sk = BoxSecretKey::from(our_secret.0);
        let pk = BoxPublicKey::from(their_public.0);
        Self { sealed_box: SalsaBox::new(&pk, &sk) }
    }

    /// Authenticated-encrypt `plaintext` under (`K`, `nonce`). Ciphertext is
    /// `plaintext.len() + TAG_LEN` bytes; this only fails on a programming
    /// error (it can't, given fixed-size inputs, so callers may `expect`).
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Vec<u8> {
        self.sealed_box
            .encrypt(GenericArray::from_slice(nonce), plaintext)
            .expect("XSalsa20-Poly1305 seal cannot fail for well-formed inputs")
    }

    /// Verify and decrypt `ciphertext` under (`K`, `nonce`). `Err(AuthFailed)`
    /// is the soft, silent-drop path from the error handling design.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, AuthFailed> {
        self.sealed_box
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| AuthFailed)
    }
}

/// Ciphertext length produced by `seal` for a plaintext of `plaintext_len` bytes.
pub fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_LEN
}
