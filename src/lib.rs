//! # d5tun
//!
//! An encrypted multiplexing tunnel proxy. A client accepts local SOCKS5 or
//! HTTP CONNECT requests and tunnels them over long-lived authenticated
//! encrypted connections to a server, which egresses the plaintext traffic
//! to the requested upstream host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Front End Layer                      │
//! │            (SOCKS5, HTTP CONNECT)                    │
//! ├─────────────────────────────────────────────────────┤
//! │                Multiplexing Layer                    │
//! │     (streams, egress router, per-edge queues)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel Layer                         │
//! │    (negotiation, sessions, tokens, framing)          │
//! ├─────────────────────────────────────────────────────┤
//! │                Transport Layer                       │
//! │           (TCP + stream cipher)                      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod session;
pub mod tunnel;

pub use config::{ClientConfig, ServerConfig};

/// Release coordinates folded into the negotiation version word.
pub const VER_MAJOR: u8 = 0;
pub const VER_MINOR: u8 = 9;
pub const VER_BUILD: u16 = 2;

/// Version word exchanged during negotiation: `major<<24 | minor<<16 | build`.
pub const fn version_word() -> u32 {
    (VER_MAJOR as u32) << 24 | (VER_MINOR as u32) << 16 | VER_BUILD as u32
}

/// Human form of a version word, e.g. `0.9.0002`.
pub fn version_string(word: u32) -> String {
    format!("{}.{}.{:04}", word >> 24, (word >> 16) & 0xff, word & 0xffff)
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] protocol::NegotiationError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

impl Error {
    /// Warnings terminate one session but never the process; callers log
    /// them at WARN and keep serving.
    pub fn is_warning(&self) -> bool {
        match self {
            Error::Negotiation(e) => e.is_warning(),
            Error::Proxy(_) | Error::ConnectionClosed | Error::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_word_layout() {
        let w = version_word();
        assert_eq!(w >> 24, VER_MAJOR as u32);
        assert_eq!((w >> 16) & 0xff, VER_MINOR as u32);
        assert_eq!(w & 0xffff, VER_BUILD as u32);
    }

    #[test]
    fn test_version_string() {
        assert_eq!(version_string(0x0009_0002), "0.9.0002");
    }
}
