//! RSA-OAEP-SHA1 wrapping of the identity block
//!
//! The client identity (`user\0pass`) is the only thing RSA ever protects
//! here; under a 1024-bit modulus the OAEP-SHA1 plaintext limit is 86 bytes.

use super::CryptoError;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;

/// RSA modulus size used by the handshake.
pub const RSA_BITS: usize = 1024;

/// Ciphertext (and identity block) size on the wire.
pub const RSA_BLOCK_LEN: usize = RSA_BITS / 8;

/// Single block encrypt. Plaintext must be at most 86 bytes.
pub fn rsa_encrypt(plain: &[u8], public: &RsaPublicKey) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::thread_rng();
    Ok(public.encrypt(&mut rng, Oaep::new::<Sha1>(), plain)?)
}

/// Single block decrypt.
pub fn rsa_decrypt(cipher: &[u8], private: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    Ok(private.decrypt(Oaep::new::<Sha1>(), cipher)?)
}

/// Server key pair, persisted as PKCS#8 PEM in the config files.
pub struct RsaKeyPair {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
}

impl RsaKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, RSA_BITS)?;
        let public = RsaPublicKey::from(&private);
        Ok(RsaKeyPair { private, public })
    }

    pub fn private_pem(&self) -> Result<String, CryptoError> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|p| p.to_string())
            .map_err(|e| CryptoError::RsaKeyEncoding(e.to_string()))
    }

    pub fn public_pem(&self) -> Result<String, CryptoError> {
        self.public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::RsaKeyEncoding(e.to_string()))
    }

    pub fn private_from_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
        RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::RsaKeyEncoding(e.to_string()))
    }

    pub fn public_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| CryptoError::RsaKeyEncoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oaep_roundtrip() {
        let keys = RsaKeyPair::generate().unwrap();
        let plain = b"alice\x00s3cret";
        let cipher = rsa_encrypt(plain, &keys.public).unwrap();
        assert_eq!(cipher.len(), RSA_BLOCK_LEN);
        let out = rsa_decrypt(&cipher, &keys.private).unwrap();
        assert_eq!(out, plain);
    }

    #[test]
    fn test_oaep_max_plaintext() {
        let keys = RsaKeyPair::generate().unwrap();
        let plain = vec![0x5a; 86];
        let cipher = rsa_encrypt(&plain, &keys.public).unwrap();
        assert_eq!(rsa_decrypt(&cipher, &keys.private).unwrap(), plain);

        let too_long = vec![0x5a; 87];
        assert!(rsa_encrypt(&too_long, &keys.public).is_err());
    }

    #[test]
    fn test_pem_roundtrip() {
        let keys = RsaKeyPair::generate().unwrap();
        let priv_pem = keys.private_pem().unwrap();
        let pub_pem = keys.public_pem().unwrap();

        let private = RsaKeyPair::private_from_pem(&priv_pem).unwrap();
        let public = RsaKeyPair::public_from_pem(&pub_pem).unwrap();

        let cipher = rsa_encrypt(b"roundtrip", &public).unwrap();
        assert_eq!(rsa_decrypt(&cipher, &private).unwrap(), b"roundtrip");
    }
}
