//! Frame encoding/decoding for the multiplexer protocol
//!
//! Frame format (big endian), travelling inside the cipher stream:
//! ```text
//! +--------+-----------------+-----------------+============+
//! | action |  stream id (2B) |   length (2B)   |  payload   |
//! +--------+-----------------+-----------------+============+
//! ```

use super::TunnelError;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 5;

/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD: usize = 8192;

/// Frame actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    /// Payload data in either direction
    Data = 0x00,
    /// Open a new stream; payload is the `host:port` target
    Syn = 0x01,
    /// Upstream dial succeeded
    SynAck = 0x02,
    /// Upstream dial failed
    SynErr = 0x03,
    /// Peer closed its read side; close the local write side
    CloseR = 0x04,
    /// Peer closed its write side; close the local read side
    CloseW = 0x05,
    /// Full stream teardown
    Close = 0x06,
    /// Keepalive probe
    Ping = 0x07,
    /// Keepalive response
    Pong = 0x08,
}

impl TryFrom<u8> for Action {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Action::Data),
            0x01 => Ok(Action::Syn),
            0x02 => Ok(Action::SynAck),
            0x03 => Ok(Action::SynErr),
            0x04 => Ok(Action::CloseR),
            0x05 => Ok(Action::CloseW),
            0x06 => Ok(Action::Close),
            0x07 => Ok(Action::Ping),
            0x08 => Ok(Action::Pong),
            _ => Err(TunnelError::InvalidFrame(format!(
                "unknown action: {value:#04x}"
            ))),
        }
    }
}

/// A multiplexer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub action: Action,
    pub stream_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(action: Action, stream_id: u16) -> Self {
        Frame {
            action,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u16, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);
        Frame {
            action: Action::Data,
            stream_id,
            payload,
        }
    }

    pub fn syn(stream_id: u16, target: &str) -> Self {
        Frame {
            action: Action::Syn,
            stream_id,
            payload: Bytes::copy_from_slice(target.as_bytes()),
        }
    }

    pub fn ping() -> Self {
        Frame::new(Action::Ping, 0)
    }

    pub fn pong() -> Self {
        Frame::new(Action::Pong, 0)
    }

    /// Encode header + payload into a single buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.action as u8);
        buf.put_u16(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a header; the payload is read separately by the tunnel reader.
    pub fn parse_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(Action, u16, usize), TunnelError> {
        let action = Action::try_from(header[0])?;
        let stream_id = u16::from_be_bytes([header[1], header[2]]);
        let length = u16::from_be_bytes([header[3], header[4]]) as usize;
        Ok((action, stream_id, length))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame[{:?} #{:04x} len={}]",
            self.action,
            self.stream_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::data(42, Bytes::from_static(b"hello world"));
        let encoded = frame.encode();

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&encoded[..FRAME_HEADER_LEN]);
        let (action, stream_id, length) = Frame::parse_header(&header).unwrap();

        assert_eq!(action, Action::Data);
        assert_eq!(stream_id, 42);
        assert_eq!(length, 11);
        assert_eq!(&encoded[FRAME_HEADER_LEN..], b"hello world");
    }

    #[test]
    fn test_syn_carries_target() {
        let frame = Frame::syn(7, "example.com:443");
        assert_eq!(frame.action, Action::Syn);
        assert_eq!(&frame.payload[..], b"example.com:443");
    }

    #[test]
    fn test_unknown_action_rejected() {
        let header = [0x7f, 0, 1, 0, 0];
        assert!(Frame::parse_header(&header).is_err());
    }

    #[test]
    fn test_control_frames_empty() {
        for frame in [Frame::ping(), Frame::pong(), Frame::new(Action::Close, 9)] {
            assert!(frame.payload.is_empty());
            assert_eq!(frame.encode().len(), FRAME_HEADER_LEN);
        }
    }
}
