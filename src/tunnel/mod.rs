//! Tunnel layer - encrypted multiplexed transport
//!
//! Provides:
//! - Cipher-bound connections and tunnel handles
//! - Frame encoding/decoding
//! - Stream multiplexing over a pool of parallel tunnels
//! - Per-edge egress queues with half-close semantics

mod conn;
mod frame;
mod multiplexer;
mod pool;
mod router;

pub use conn::{Conn, ConnReader, ConnWriter, Tunnel};
pub use frame::{Action, Frame, FRAME_HEADER_LEN, MAX_PAYLOAD};
pub use multiplexer::Multiplexer;
pub use pool::ConnPool;
pub use router::{Edge, EgressRouter};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("No available tunnel")]
    NoTunnel,

    #[error("Stream ids exhausted")]
    StreamIdsExhausted,

    #[error("Stream open refused by peer")]
    OpenRefused,

    #[error("Stream open timed out")]
    OpenTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interval of the egress router's idle sweep.
pub const TICKER_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

/// Read side of a local conn has been shut.
pub const TCP_CLOSE_R: u8 = 1;
/// Write side of a local conn has been shut.
pub const TCP_CLOSE_W: u8 = 1 << 1;
/// Both halves gone; the edge is garbage.
pub const TCP_CLOSED: u8 = TCP_CLOSE_R | TCP_CLOSE_W;
