//! Local proxy front ends
//!
//! Provides:
//! - SOCKS5 front end (RFC 1928, CONNECT only)
//! - HTTP CONNECT front end
//!
//! Both reduce a local request to a `host:port` target string; the byte
//! stream that follows belongs to the multiplexer.

mod http;
mod socks5;

pub use http::http_handshake;
pub use socks5::socks5_handshake;

use thiserror::Error;
use tokio::net::TcpStream;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid socks5 header")]
    InvalidSocks5Header,

    #[error("Invalid socks5 request")]
    InvalidSocks5Request,

    #[error("General failure: {0}")]
    GeneralFailure(String),

    #[error("Host is unreachable")]
    HostUnreachable,

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Unrecognized protocol, first byte {0:#04x}")]
    UnrecognizedProtocol(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// SOCKS5 reply byte matching the error kind.
    pub fn socks5_code(&self) -> u8 {
        match self {
            ProxyError::InvalidSocks5Header => 0xff,
            ProxyError::InvalidSocks5Request => 0x07,
            ProxyError::HostUnreachable => 0x04,
            _ => 0x01,
        }
    }
}

/// Which local protocol a fresh connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqProtocol {
    Socks5,
    Http,
}

/// Classify a local connection without consuming its bytes: SOCKS5 leads
/// with its version byte (≤ 5), HTTP with an ASCII method letter.
pub async fn detect_protocol(stream: &TcpStream) -> Result<ReqProtocol, ProxyError> {
    let mut head = [0u8; 1];
    let n = stream.peek(&mut head).await?;
    if n == 0 {
        return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    match head[0] {
        0..=5 => Ok(ReqProtocol::Socks5),
        0x41..=0x7a => Ok(ReqProtocol::Http),
        b => Err(ProxyError::UnrecognizedProtocol(b)),
    }
}
