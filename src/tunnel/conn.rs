//! Cipher-bound connections and tunnel handles
//!
//! A `Conn` is a TCP connection that transparently applies a stream cipher
//! once one is installed. After negotiation it splits into owned halves: the
//! reader feeds the multiplexer dispatch loop, the writer is shared behind a
//! lock so edges and keepalive can interleave whole frames.

use super::frame::Frame;
use crate::crypto::{CipherPair, Decryptor, Encryptor};
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A TCP connection with an optional stream cipher bound to it.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
    enc: Option<Encryptor>,
    dec: Option<Decryptor>,
}

impl Conn {
    pub fn new(stream: TcpStream) -> Self {
        Conn {
            stream,
            enc: None,
            dec: None,
        }
    }

    pub fn set_cipher(&mut self, pair: CipherPair) {
        let (enc, dec) = pair.split();
        self.enc = Some(enc);
        self.dec = Some(dec);
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    /// One read call; decrypts in place when a cipher is installed.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf).await?;
        if let Some(dec) = &mut self.dec {
            dec.decrypt(&mut buf[..n]);
        }
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.stream.read_exact(buf).await?;
        if let Some(dec) = &mut self.dec {
            dec.decrypt(buf);
        }
        Ok(())
    }

    /// Encrypts a copy of `data` when a cipher is installed, then writes it
    /// out in full.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.enc {
            Some(enc) => {
                let mut out = data.to_vec();
                enc.encrypt(&mut out);
                self.stream.write_all(&out).await
            }
            None => self.stream.write_all(data).await,
        }
    }

    pub fn split(self) -> (ConnReader, ConnWriter) {
        let (read, write) = self.stream.into_split();
        (
            ConnReader {
                half: read,
                dec: self.dec,
            },
            ConnWriter {
                half: write,
                enc: self.enc,
            },
        )
    }
}

/// Decrypting read half of a split `Conn`.
pub struct ConnReader {
    half: OwnedReadHalf,
    dec: Option<Decryptor>,
}

impl ConnReader {
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.half.read_exact(buf).await?;
        if let Some(dec) = &mut self.dec {
            dec.decrypt(buf);
        }
        Ok(())
    }

    /// Read one whole frame: header, then payload.
    pub async fn read_frame(&mut self) -> Result<Frame, super::TunnelError> {
        let mut header = [0u8; super::frame::FRAME_HEADER_LEN];
        self.read_exact(&mut header).await?;
        let (action, stream_id, length) = Frame::parse_header(&header)?;
        let payload = if length > 0 {
            let mut buf = vec![0u8; length];
            self.read_exact(&mut buf).await?;
            bytes::Bytes::from(buf)
        } else {
            bytes::Bytes::new()
        };
        Ok(Frame {
            action,
            stream_id,
            payload,
        })
    }
}

/// Encrypting write half of a split `Conn`.
pub struct ConnWriter {
    half: OwnedWriteHalf,
    enc: Option<Encryptor>,
}

impl ConnWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.enc {
            Some(enc) => {
                let mut out = data.to_vec();
                enc.encrypt(&mut out);
                self.half.write_all(&out).await
            }
            None => self.half.write_all(data).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}

/// Round-robin-with-stickiness selection state.
pub(super) struct TsPriority {
    pub last: Instant,
    pub rank: i64,
}

/// A single encrypted TCP connection carrying multiplexed streams.
///
/// The reader half is consumed by the multiplexer's dispatch loop at
/// registration; the tunnel keeps only the locked writer plus bookkeeping.
pub struct Tunnel {
    pub identifier: String,
    state: AtomicI32,
    pub(super) priority: Mutex<TsPriority>,
    last_read: Mutex<Instant>,
    writer: tokio::sync::Mutex<ConnWriter>,
}

impl Tunnel {
    pub fn new(identifier: String, writer: ConnWriter) -> Self {
        Tunnel {
            identifier,
            state: AtomicI32::new(0),
            priority: Mutex::new(TsPriority {
                last: Instant::now(),
                rank: 0,
            }),
            last_read: Mutex::new(Instant::now()),
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    pub fn alive(&self) -> bool {
        self.state.load(Ordering::Acquire) >= 0
    }

    pub fn mark_dead(&self) {
        self.state.store(-1, Ordering::Release);
    }

    pub fn touch_read(&self) {
        *self.last_read.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_read.lock().unwrap().elapsed()
    }

    /// Serialize a whole frame through the shared writer. Only the holder of
    /// the writer lock touches the cipher state, keeping the keystream
    /// aligned across concurrent senders.
    pub async fn write_frame(&self, frame: &Frame) -> io::Result<()> {
        let buf = frame.encode();
        let mut writer = self.writer.lock().await;
        match writer.write_all(&buf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_dead();
                Err(e)
            }
        }
    }

    pub async fn safe_close(&self) {
        self.mark_dead();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
