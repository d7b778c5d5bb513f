//! Stream cipher factory
//!
//! A `CipherFactory` is built once per session from the DH shared secret and
//! stamps out `CipherPair`s, one per tunnel. RC4 clones a single key schedule
//! into both directions; AES-CFB derives its IV from the key when none is
//! supplied (the data-tunnel join path supplies the token as IV).

use super::CryptoError;
use aes::{Aes128, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use rc4::{consts::U16, KeyInit, Rc4, StreamCipher};

const MD5_LEN: usize = 16;
const AES_BLOCK: usize = 16;

/// Recognized cipher algorithms and their key lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Rc4,
    Aes128Cfb,
    Aes256Cfb,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name {
            "RC4" => Ok(CipherKind::Rc4),
            "AES128CFB" => Ok(CipherKind::Aes128Cfb),
            "AES256CFB" => Ok(CipherKind::Aes256Cfb),
            _ => Err(CryptoError::UnsupportedCipher(name.to_string())),
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Rc4 | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes256Cfb => 32,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Rc4 => "RC4",
            CipherKind::Aes128Cfb => "AES128CFB",
            CipherKind::Aes256Cfb => "AES256CFB",
        }
    }
}

/// Encrypting half of a cipher pair.
pub enum Encryptor {
    Rc4(Rc4<U16>),
    Aes128(BufEncryptor<Aes128>),
    Aes256(BufEncryptor<Aes256>),
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encryptor::Rc4(_) => f.write_str("Encryptor::Rc4(..)"),
            Encryptor::Aes128(_) => f.write_str("Encryptor::Aes128(..)"),
            Encryptor::Aes256(_) => f.write_str("Encryptor::Aes256(..)"),
        }
    }
}

/// Decrypting half of a cipher pair.
pub enum Decryptor {
    Rc4(Rc4<U16>),
    Aes128(BufDecryptor<Aes128>),
    Aes256(BufDecryptor<Aes256>),
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decryptor::Rc4(_) => f.write_str("Decryptor::Rc4(..)"),
            Decryptor::Aes128(_) => f.write_str("Decryptor::Aes128(..)"),
            Decryptor::Aes256(_) => f.write_str("Decryptor::Aes256(..)"),
        }
    }
}

impl Encryptor {
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        match self {
            Encryptor::Rc4(c) => c.apply_keystream(buf),
            Encryptor::Aes128(c) => c.encrypt(buf),
            Encryptor::Aes256(c) => c.encrypt(buf),
        }
    }
}

impl Decryptor {
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        match self {
            Decryptor::Rc4(c) => c.apply_keystream(buf),
            Decryptor::Aes128(c) => c.decrypt(buf),
            Decryptor::Aes256(c) => c.decrypt(buf),
        }
    }
}

/// Paired encrypt/decrypt stream state for one tunnel.
pub struct CipherPair {
    pub enc: Encryptor,
    pub dec: Decryptor,
}

impl CipherPair {
    pub fn split(self) -> (Encryptor, Decryptor) {
        (self.enc, self.dec)
    }
}

/// Builds cipher pairs from a key expanded out of the DH shared secret.
#[derive(Clone, Debug)]
pub struct CipherFactory {
    key: Vec<u8>,
    kind: CipherKind,
}

impl CipherFactory {
    pub fn new(name: &str, secret: &[u8]) -> Result<Self, CryptoError> {
        let kind = CipherKind::from_name(name)?;
        let key = to_secret_key(secret, kind.key_len())?;
        Ok(CipherFactory { key, kind })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Build a fresh cipher pair. When `iv` is absent the first 16 bytes of
    /// the key are used; when present only its first 16 bytes matter.
    pub fn new_cipher(&self, iv: Option<&[u8]>) -> CipherPair {
        let iv = match iv {
            Some(iv) => &iv[..AES_BLOCK],
            None => &self.key[..AES_BLOCK],
        };
        match self.kind {
            CipherKind::Rc4 => {
                // encrypt and decrypt start from the same key schedule
                let enc = Rc4::new_from_slice(&self.key).expect("rc4 key length");
                let dec = Rc4::new_from_slice(&self.key).expect("rc4 key length");
                CipherPair {
                    enc: Encryptor::Rc4(enc),
                    dec: Decryptor::Rc4(dec),
                }
            }
            CipherKind::Aes128Cfb => CipherPair {
                enc: Encryptor::Aes128(
                    BufEncryptor::<Aes128>::new_from_slices(&self.key, iv)
                        .expect("aes128 key/iv length"),
                ),
                dec: Decryptor::Aes128(
                    BufDecryptor::<Aes128>::new_from_slices(&self.key, iv)
                        .expect("aes128 key/iv length"),
                ),
            },
            CipherKind::Aes256Cfb => CipherPair {
                enc: Encryptor::Aes256(
                    BufEncryptor::<Aes256>::new_from_slices(&self.key, iv)
                        .expect("aes256 key/iv length"),
                ),
                dec: Decryptor::Aes256(
                    BufDecryptor::<Aes256>::new_from_slices(&self.key, iv)
                        .expect("aes256 key/iv length"),
                ),
            },
        }
    }
}

/// Expand `secret` into a `size`-byte key by repeated MD5 accumulation.
///
/// Each 16-byte slot receives only the first 15 digest bytes; the final byte
/// of every slot stays zero. Both peers derive keys this way, so the layout
/// is part of the wire contract and must not be "fixed" unilaterally.
fn to_secret_key(secret: &[u8], size: usize) -> Result<Vec<u8>, CryptoError> {
    if size % MD5_LEN != 0 || size == 0 {
        return Err(CryptoError::InvalidKeyLength(size));
    }
    let mut buf = vec![0u8; size];
    let mut h = Md5::new();
    for i in 0..size / MD5_LEN {
        h.update(secret);
        let digest = h.clone().finalize();
        buf[MD5_LEN * i..MD5_LEN * (i + 1) - 1].copy_from_slice(&digest[..MD5_LEN - 1]);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_cipher_rejected() {
        assert!(matches!(
            CipherFactory::new("CHACHA20", b"secret"),
            Err(CryptoError::UnsupportedCipher(_))
        ));
    }

    #[test]
    fn test_key_lengths() {
        assert_eq!(CipherKind::Rc4.key_len(), 16);
        assert_eq!(CipherKind::Aes128Cfb.key_len(), 16);
        assert_eq!(CipherKind::Aes256Cfb.key_len(), 32);
    }

    #[test]
    fn test_secret_key_slot_gap() {
        let key = to_secret_key(b"some shared secret", 32).unwrap();
        assert_eq!(key.len(), 32);
        // last byte of each 16-byte slot is left zero
        assert_eq!(key[15], 0);
        assert_eq!(key[31], 0);
        // slots differ (second slot digests the secret twice)
        assert_ne!(&key[..15], &key[16..31]);
    }

    #[test]
    fn test_secret_key_rejects_odd_sizes() {
        assert!(to_secret_key(b"s", 20).is_err());
        assert!(to_secret_key(b"s", 0).is_err());
    }

    #[test]
    fn test_roundtrip_all_ciphers() {
        for name in ["RC4", "AES128CFB", "AES256CFB"] {
            let factory = CipherFactory::new(name, b"shared secret bytes").unwrap();
            let mut a = factory.new_cipher(None);
            let mut b = factory.new_cipher(None);

            let plain = b"The quick brown fox jumps over the lazy dog";
            let mut buf = plain.to_vec();
            a.enc.encrypt(&mut buf);
            assert_ne!(&buf[..], &plain[..]);
            b.dec.decrypt(&mut buf);
            assert_eq!(&buf[..], &plain[..], "cipher {name}");
        }
    }

    #[test]
    fn test_stateful_across_chunks() {
        let factory = CipherFactory::new("AES128CFB", b"another secret").unwrap();
        let mut enc = factory.new_cipher(None);
        let mut dec = factory.new_cipher(None);

        let mut part1 = b"hello ".to_vec();
        let mut part2 = b"world".to_vec();
        enc.enc.encrypt(&mut part1);
        enc.enc.encrypt(&mut part2);
        dec.dec.decrypt(&mut part1);
        dec.dec.decrypt(&mut part2);
        assert_eq!(part1, b"hello ");
        assert_eq!(part2, b"world");
    }

    #[test]
    fn test_explicit_iv_differs_from_default() {
        let factory = CipherFactory::new("AES128CFB", b"secret").unwrap();
        let iv = [0xA5u8; 20];
        let mut with_iv = factory.new_cipher(Some(&iv));
        let mut without = factory.new_cipher(None);

        let mut b1 = b"same plaintext".to_vec();
        let mut b2 = b1.clone();
        with_iv.enc.encrypt(&mut b1);
        without.enc.encrypt(&mut b2);
        assert_ne!(b1, b2);
    }
}
