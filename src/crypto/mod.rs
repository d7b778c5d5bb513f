//! Cryptographic primitives for the tunnel protocol
//!
//! This module provides:
//! - Stream cipher factory (RC4, AES-128-CFB, AES-256-CFB) with MD5 key
//!   expansion of the DH shared secret
//! - RSA-OAEP-SHA1 wrapping of the client identity block
//! - Diffie-Hellman key agreement over the 1024-bit MODP group
//! - SHA-1 snapshot hashing for the handshake cross-check

mod cipher;
mod dh;
mod rsa;

pub use self::cipher::{CipherFactory, CipherKind, CipherPair, Decryptor, Encryptor};
pub use self::dh::DhKeyPair;
pub use self::rsa::{rsa_decrypt, rsa_encrypt, RsaKeyPair};

use sha1::{Digest, Sha1};
use thiserror::Error;

/// SHA-1 digest size; also the token size on the wire.
pub const HASH_LEN: usize = 20;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Invalid key length: {0}")]
    InvalidKeyLength(usize),

    #[error("RSA error: {0}")]
    Rsa(#[from] ::rsa::Error),

    #[error("RSA key encoding error: {0}")]
    RsaKeyEncoding(String),
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

/// SHA-1 of a byte slice, as a fixed 20-byte array.
pub fn hash20(data: &[u8]) -> [u8; HASH_LEN] {
    let mut sha = Sha1::new();
    sha.update(data);
    sha.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_hash20_known_vector() {
        // SHA-1("abc")
        let sum = hash20(b"abc");
        assert_eq!(
            sum,
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }
}
