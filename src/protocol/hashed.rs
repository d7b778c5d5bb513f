//! Hashed connection middleware for the handshake
//!
//! Wraps a `Conn` and maintains two independent SHA-1 accumulators over the
//! plaintext as the application observes it: `rhash` over bytes delivered
//! from reads (after decryption), `whash` over bytes accepted for writes
//! (before encryption). Snapshots do not consume the accumulators. Once the
//! handshake completes, the wrapper is discarded and the cipher-bound `Conn`
//! continues as the tunnel.

use super::NegotiationError;
use crate::crypto::{CipherPair, HASH_LEN};
use crate::tunnel::Conn;
use sha1::{Digest, Sha1};
use std::io;

pub struct HashedConn {
    inner: Conn,
    rhash: Sha1,
    whash: Sha1,
}

impl HashedConn {
    pub fn new(inner: Conn) -> Self {
        HashedConn {
            inner,
            rhash: Sha1::new(),
            whash: Sha1::new(),
        }
    }

    pub fn set_cipher(&mut self, pair: CipherPair) {
        self.inner.set_cipher(pair);
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.peer_addr()
    }

    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read_some(buf).await?;
        self.rhash.update(&buf[..n]);
        Ok(n)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await?;
        self.rhash.update(&buf[..]);
        Ok(())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.whash.update(data);
        self.inner.write_all(data).await
    }

    /// Read a block whose length travels in a 2-byte big-endian prefix.
    pub async fn read_len_prefixed(&mut self) -> Result<Vec<u8>, NegotiationError> {
        let mut lb = [0u8; 2];
        self.read_exact(&mut lb).await?;
        let len = u16::from_be_bytes(lb) as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Snapshot of the read-side accumulator; does not reset it.
    pub fn rhash_sum(&self) -> [u8; HASH_LEN] {
        self.rhash.clone().finalize().into()
    }

    /// Snapshot of the write-side accumulator; does not reset it.
    pub fn whash_sum(&self) -> [u8; HASH_LEN] {
        self.whash.clone().finalize().into()
    }

    /// Drop the hashing layer, keeping the cipher-bound connection.
    pub fn into_inner(self) -> Conn {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_hashes_track_plaintext_and_snapshots_do_not_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(b"pong").await.unwrap();
            let mut sink = [0u8; 4];
            tokio::io::AsyncReadExt::read_exact(&mut s, &mut sink).await.unwrap();
            sink
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut hconn = HashedConn::new(Conn::new(stream));

        let mut buf = [0u8; 4];
        hconn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(hconn.rhash_sum(), crate::crypto::hash20(b"pong"));
        // second snapshot identical: not consuming
        assert_eq!(hconn.rhash_sum(), crate::crypto::hash20(b"pong"));

        hconn.write_all(b"ping").await.unwrap();
        assert_eq!(hconn.whash_sum(), crate::crypto::hash20(b"ping"));

        assert_eq!(&peer.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_hashes_see_plaintext_under_cipher() {
        use crate::crypto::CipherFactory;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let factory = CipherFactory::new("AES128CFB", b"shared").unwrap();
        let peer_factory = factory.clone();

        let peer = tokio::spawn(async move {
            let (s, _) = listener.accept().await.unwrap();
            let mut conn = Conn::new(s);
            conn.set_cipher(peer_factory.new_cipher(None));
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut hconn = HashedConn::new(Conn::new(stream));
        hconn.set_cipher(factory.new_cipher(None));
        hconn.write_all(b"hello").await.unwrap();

        // whash is over the plaintext, not the ciphertext
        assert_eq!(hconn.whash_sum(), crate::crypto::hash20(b"hello"));
        // and the peer still decrypts the bytes correctly
        assert_eq!(&peer.await.unwrap(), b"hello");
    }
}
