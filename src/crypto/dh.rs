//! Ephemeral Diffie-Hellman key agreement
//!
//! Uses the 1024-bit MODP group (RFC 2409 second Oakley group, generator 2).
//! One pair is generated per side per handshake; the public value travels
//! with a 2-byte big-endian length prefix.

use num_bigint_dig::{BigUint, RandBigInt};
use std::sync::LazyLock;

// RFC 2409 §6.2 prime, 1024 bits.
const MODP1024_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF"
);

static GROUP_P: LazyLock<BigUint> =
    LazyLock::new(|| BigUint::parse_bytes(MODP1024_HEX.as_bytes(), 16).expect("group prime"));

static GROUP_G: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(2u32));

/// Ephemeral DH key pair with its wire-ready public encoding.
pub struct DhKeyPair {
    private: BigUint,
    /// Big-endian public value bytes.
    pub public: Vec<u8>,
    /// 2-byte big-endian length prefix for `public`.
    pub public_len: [u8; 2],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let two = BigUint::from(2u32);
        let private = rng.gen_biguint_range(&two, &(&*GROUP_P - &two));
        let public = GROUP_G.modpow(&private, &GROUP_P).to_bytes_be();
        let public_len = (public.len() as u16).to_be_bytes();
        DhKeyPair {
            private,
            public,
            public_len,
        }
    }

    /// Compute the shared secret from the peer's public value.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Vec<u8> {
        let peer = BigUint::from_bytes_be(peer_public);
        peer.modpow(&self.private, &GROUP_P).to_bytes_be()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_secret_agreement() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();

        let s1 = alice.shared_secret(&bob.public);
        let s2 = bob.shared_secret(&alice.public);
        assert_eq!(s1, s2);
        assert!(!s1.is_empty());
    }

    #[test]
    fn test_public_len_prefix() {
        let pair = DhKeyPair::generate();
        let len = u16::from_be_bytes(pair.public_len) as usize;
        assert_eq!(len, pair.public.len());
        assert!(len <= 128);
    }

    #[test]
    fn test_pairs_are_ephemeral() {
        let a = DhKeyPair::generate();
        let b = DhKeyPair::generate();
        assert_ne!(a.public, b.public);
    }
}
