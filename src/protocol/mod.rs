//! Negotiation protocol: constants, markers, tunnel parameters
//!
//! The wire protocol is identified by the magic byte 0xd5, which doubles as
//! the target of the additive sum validation on obfuscation markers.

mod hashed;
mod negotiation;

pub use hashed::HashedConn;
pub use negotiation::{data_tunnel_prelude, negotiate_server, ClientNegotiation, ServerOutcome};

use crate::crypto::CipherFactory;
use std::time::Duration;
use thiserror::Error;

/// Protocol magic byte and sum-validation target.
pub const D5: u8 = 0xd5;

/// Token size in bytes (SHA-1 width).
pub const TKSZ: usize = 20;

/// Initial read length selecting the full handshake.
pub const DMLEN1: usize = 384;

/// Initial read length selecting token resumption: token + 2 markers.
pub const DMLEN2: usize = TKSZ + 2;

/// Tunnel parameter block size on the wire.
pub const TUN_PARAMS_LEN: usize = 32;

/// Socket deadline applied to every handshake step.
pub const GENERAL_SO_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens minted per full handshake.
pub const GENERATE_TOKEN_NUM: usize = 64;

/// Data tunnels opened per session.
pub const PARALLEL_TUN_QTY: u8 = 2;

/// Signal-tunnel ping interval, seconds.
pub const ST_PING_INTERVAL: u16 = 60;

/// Data-tunnel ping interval, seconds.
pub const DT_PING_INTERVAL: u16 = 90;

/// Back-off when no upstream endpoint is available.
pub const REST_INTERVAL: Duration = Duration::from_secs(5);

/// Marker byte complement: `d5_sum_valid(a, d5_sub(a))` holds for all `a`.
pub fn d5_sub(a: u8) -> u8 {
    (D5 as i16 - (a as i8) as i16) as u8
}

/// Signed additive check against the magic byte.
pub fn d5_sum_valid(a: u8, b: u8) -> bool {
    ((a as i8 as i16 + b as i8 as i16) as u16) & 0xff == D5 as u16
}

/// Negotiation errors. All protocol-level kinds are warnings: they terminate
/// the offending connection, get logged, and never take the process down.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Invalid D5Params: {0}")]
    InvalidD5Params(String),

    #[error("D5Server is unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Auth failed")]
    AuthFailed,

    #[error("Validation failed: {0}")]
    ValidationFailed(&'static str),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Incompatible version: remote {0}")]
    IncompatibleVersion(String),

    #[error("Inconsistent hash")]
    InconsistentHash,

    #[error("Negotiation timed out")]
    Timeout,

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NegotiationError {
    pub fn is_warning(&self) -> bool {
        !matches!(self, NegotiationError::Io(_) | NegotiationError::Crypto(_))
    }
}

/// Parameters the server hands the client inside the handshake, plus the
/// session cipher factory derived from the DH exchange.
#[derive(Debug)]
pub struct TunParams {
    pub cipher_factory: CipherFactory,
    pub st_interval: u16,
    pub dt_interval: u16,
    pub tun_qty: u8,
    pub tokens: Vec<[u8; TKSZ]>,
}

impl TunParams {
    /// Parse the length-delimited block the server sends: a 32-byte parameter
    /// header followed by `n * 20` bytes of tokens. The version word at the
    /// head has already been vetted by the caller.
    pub fn parse(buf: &[u8], cipher_factory: CipherFactory) -> Result<Self, NegotiationError> {
        if buf.len() < TUN_PARAMS_LEN || (buf.len() - TUN_PARAMS_LEN) % TKSZ != 0 {
            return Err(NegotiationError::NegotiationFailed(format!(
                "bad params block length {}",
                buf.len()
            )));
        }
        let st_interval = u16::from_be_bytes([buf[4], buf[5]]);
        let dt_interval = u16::from_be_bytes([buf[6], buf[7]]);
        let tun_qty = buf[8];
        let tokens = buf[TUN_PARAMS_LEN..]
            .chunks_exact(TKSZ)
            .map(|c| {
                let mut t = [0u8; TKSZ];
                t.copy_from_slice(c);
                t
            })
            .collect();
        Ok(TunParams {
            cipher_factory,
            st_interval,
            dt_interval,
            tun_qty,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_d5_sub_complements_all_bytes() {
        for a in 0..=255u8 {
            assert!(d5_sum_valid(a, d5_sub(a)), "a = {a:#04x}");
        }
    }

    #[test]
    fn test_d5_sum_rejects_off_by_one() {
        for a in 0..=255u8 {
            let b = d5_sub(a).wrapping_add(1);
            assert!(!d5_sum_valid(a, b), "a = {a:#04x}");
        }
    }

    #[test]
    fn test_tun_params_parse() {
        let factory = CipherFactory::new("AES128CFB", b"secret").unwrap();
        let mut buf = vec![0u8; TUN_PARAMS_LEN + 2 * TKSZ];
        buf[0..4].copy_from_slice(&crate::version_word().to_be_bytes());
        buf[4..6].copy_from_slice(&60u16.to_be_bytes());
        buf[6..8].copy_from_slice(&90u16.to_be_bytes());
        buf[8] = 2;
        buf[TUN_PARAMS_LEN..TUN_PARAMS_LEN + TKSZ].fill(0xaa);
        buf[TUN_PARAMS_LEN + TKSZ..].fill(0xbb);

        let tp = TunParams::parse(&buf, factory).unwrap();
        assert_eq!(tp.st_interval, 60);
        assert_eq!(tp.dt_interval, 90);
        assert_eq!(tp.tun_qty, 2);
        assert_eq!(tp.tokens.len(), 2);
        assert_eq!(tp.tokens[0], [0xaa; TKSZ]);
        assert_eq!(tp.tokens[1], [0xbb; TKSZ]);
    }

    #[test]
    fn test_tun_params_rejects_ragged_tokens() {
        let factory = CipherFactory::new("AES128CFB", b"secret").unwrap();
        let buf = vec![0u8; TUN_PARAMS_LEN + 7];
        assert!(TunParams::parse(&buf, factory).is_err());
    }
}
