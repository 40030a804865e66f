//! Property-based tests for the invariants in the testable-properties list
//! that are worth exercising over random input rather than fixed cases.

use proptest::prelude::*;

use tappet::crypto::{ciphertext_len, CryptoContext, Nonce, NONCE_LEN};
use tappet::keys::generate_keypair;
use tappet::nonce::is_replay_or_stale;

proptest! {
    /// Property 1: seal/open round-trips for any message, and the shared
    /// secret is symmetric regardless of which side computed it.
    #[test]
    fn property_1_seal_open_round_trips(msg in proptest::collection::vec(any::<u8>(), 0..512)) {
        let (sk_a, pk_a) = generate_keypair();
        let (sk_b, pk_b) = generate_keypair();
        let ctx_a = CryptoContext::new(&sk_a, &pk_b);
        let ctx_b = CryptoContext::new(&sk_b, &pk_a);

        let nonce: Nonce = [0x42u8; NONCE_LEN];
        let ct = ctx_a.seal(&nonce, &msg);
        prop_assert_eq!(ct.len(), ciphertext_len(msg.len()));

        let pt = ctx_b.open(&nonce, &ct).unwrap();
        prop_assert_eq!(pt, msg);
    }

    /// Property 3: a nonce no greater than the last accepted one is always
    /// classified as a replay/stale, for any pair of 24-byte values.
    #[test]
    fn property_3_replay_check_matches_big_endian_ordering(
        a in proptest::collection::vec(any::<u8>(), NONCE_LEN..=NONCE_LEN),
        b in proptest::collection::vec(any::<u8>(), NONCE_LEN..=NONCE_LEN),
    ) {
        let candidate: Nonce = a.clone().try_into().unwrap();
        let last_accepted: Nonce = b.clone().try_into().unwrap();

        let rejected = is_replay_or_stale(&candidate, &last_accepted);
        prop_assert_eq!(rejected, candidate <= last_accepted);
    }

    /// Boundary property 7/8-adjacent: ciphertext_len is always exactly
    /// plaintext_len + TAG_LEN, which is what the wire-size MTU accounting
    /// in the tunnel loop depends on.
    #[test]
    fn property_ciphertext_len_is_plaintext_plus_tag(len in 0usize..4096) {
        prop_assert_eq!(ciphertext_len(len), len + tappet::crypto::TAG_LEN);
    }
}
