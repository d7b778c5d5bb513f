//! Stream multiplexer
//!
//! Dispatches frames arriving on any tunnel of a session to the right edge,
//! opens streams on the client side and dials upstream targets on the server
//! side. Stream keys are `tunnel_identifier + "#" + hex(stream_id)` so router
//! cleanup by tunnel prefix works.

use super::conn::{ConnReader, Tunnel};
use super::frame::{Action, Frame, MAX_PAYLOAD};
use super::pool::ConnPool;
use super::router::{notify_close_r, Edge, EgressRouter};
use super::{TunnelError, TCP_CLOSE_R};
use crate::protocol::GENERAL_SO_TIMEOUT;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub struct Multiplexer {
    is_client: bool,
    pub pool: Arc<ConnPool>,
    router: Arc<EgressRouter>,
    id_counter: AtomicU32,
}

fn stream_key(tun_identifier: &str, stream_id: u16) -> String {
    format!("{tun_identifier}#{stream_id:04x}")
}

impl Multiplexer {
    pub fn new(is_client: bool) -> Arc<Self> {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), is_client);
        Arc::new(Multiplexer {
            is_client,
            pool,
            router,
            id_counter: AtomicU32::new(1),
        })
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    pub fn edge_count(&self) -> usize {
        self.router.len()
    }

    /// Attach a tunnel: spawn its serial frame reader and its keepalive.
    /// The returned handle completes when the tunnel dies, after the router
    /// has been swept of its edges.
    pub fn add_tunnel(
        self: &Arc<Self>,
        tun: Arc<Tunnel>,
        reader: ConnReader,
        ping_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        self.pool.push(Arc::clone(&tun));
        info!(tun = %tun.identifier, "tunnel attached");

        let ping_tun = Arc::clone(&tun);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !ping_tun.alive() {
                    return;
                }
                if ping_tun.idle_for() >= ping_interval
                    && ping_tun.write_frame(&Frame::ping()).await.is_err()
                {
                    return;
                }
            }
        });

        let mux = Arc::clone(self);
        tokio::spawn(async move {
            mux.reader_loop(Arc::clone(&tun), reader).await;
            tun.mark_dead();
            mux.pool.remove(&tun);
            mux.router.clean_of_tun(&tun.identifier);
            info!(tun = %tun.identifier, "tunnel detached");
        })
    }

    /// Serial frame pump: header, payload, dispatch; one task per tunnel.
    async fn reader_loop(self: &Arc<Self>, tun: Arc<Tunnel>, mut reader: ConnReader) {
        loop {
            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(tun = %tun.identifier, "tunnel read ended: {e}");
                    return;
                }
            };
            tun.touch_read();
            trace!(tun = %tun.identifier, %frame, "recv");
            self.dispatch(&tun, frame).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, tun: &Arc<Tunnel>, frame: Frame) {
        let key = stream_key(&tun.identifier, frame.stream_id);
        match frame.action {
            Action::Ping => {
                let _ = tun.write_frame(&Frame::pong()).await;
            }
            Action::Pong => {}
            Action::Syn => {
                if self.is_client {
                    warn!(tun = %tun.identifier, "SYN on client side ignored");
                    return;
                }
                let target = String::from_utf8_lossy(&frame.payload).into_owned();
                let mux = Arc::clone(self);
                let tun = Arc::clone(tun);
                tokio::spawn(async move {
                    mux.handle_syn(tun, frame.stream_id, target).await;
                });
            }
            Action::SynAck => {
                if let Some(edge) = self.router.get(&key) {
                    edge.start_equeue(Arc::clone(&self.pool), self.is_client);
                    edge.signal_ready(true);
                }
            }
            Action::SynErr => {
                if let Some(edge) = self.router.get(&key) {
                    edge.signal_ready(false);
                    edge.deliver(Frame::new(Action::Close, frame.stream_id));
                    self.router.remove(&key);
                }
            }
            Action::Data => match self.router.get(&key) {
                Some(edge) => edge.deliver(frame),
                None => {
                    debug!(%key, "data for unknown stream");
                    let _ = tun
                        .write_frame(&Frame::new(Action::Close, frame.stream_id))
                        .await;
                }
            },
            Action::CloseR => {
                // peer closed its read side: half-close our local write
                if let Some(edge) = self.router.get(&key) {
                    edge.deliver(Frame::new(Action::CloseW, frame.stream_id));
                }
            }
            Action::CloseW => {
                // peer closed its write side: stop reading our local side
                if let Some(edge) = self.router.get(&key) {
                    edge.close_read();
                }
            }
            Action::Close => {
                if let Some(edge) = self.router.get(&key) {
                    edge.deliver(Frame::new(Action::Close, frame.stream_id));
                }
            }
        }
    }

    /// Server side of SYN: dial the target, ack, then pump its bytes back.
    async fn handle_syn(self: Arc<Self>, tun: Arc<Tunnel>, stream_id: u16, target: String) {
        let key = stream_key(&tun.identifier, stream_id);
        match timeout(GENERAL_SO_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(upstream)) => {
                let _ = upstream.set_nodelay(true);
                debug!(%target, %key, "upstream dialed");
                let edge = self
                    .router
                    .register(&key, &target, stream_id, &tun, upstream, false);
                if tun
                    .write_frame(&Frame::new(Action::SynAck, stream_id))
                    .await
                    .is_err()
                {
                    edge.deliver(Frame::new(Action::Close, stream_id));
                    return;
                }
                self.pump_local(edge, tun).await;
            }
            _ => {
                warn!(%target, "upstream dial failed");
                let _ = tun
                    .write_frame(&Frame::new(Action::SynErr, stream_id))
                    .await;
            }
        }
    }

    /// Client side: allocate a stream over a pooled tunnel, send SYN, wait
    /// for the peer's verdict, then relay until either side closes.
    pub async fn client_serve(
        self: &Arc<Self>,
        local: TcpStream,
        target: String,
    ) -> Result<(), TunnelError> {
        let tun = self.pool.select().ok_or(TunnelError::NoTunnel)?;
        let (stream_id, key) = self.alloc_stream_id(&tun.identifier)?;
        let edge = self
            .router
            .register(&key, &target, stream_id, &tun, local, true);
        let ready = edge.arm_ready();

        tun.write_frame(&Frame::syn(stream_id, &target)).await?;

        match timeout(GENERAL_SO_TIMEOUT, ready).await {
            Ok(Ok(true)) => {
                self.pump_local(edge, tun).await;
                Ok(())
            }
            Ok(_) => {
                edge.deliver(Frame::new(Action::Close, stream_id));
                self.router.remove(&key);
                Err(TunnelError::OpenRefused)
            }
            Err(_) => {
                edge.deliver(Frame::new(Action::Close, stream_id));
                self.router.remove(&key);
                Err(TunnelError::OpenTimeout)
            }
        }
    }

    /// Read the edge's local conn and push DATA frames upstream. On local
    /// EOF the peer is told to wind down its write side; on tunnel failure
    /// the whole tunnel is retired.
    async fn pump_local(self: &Arc<Self>, edge: Arc<Edge>, tun: Arc<Tunnel>) {
        let Some(mut local) = edge.take_read_half() else {
            return;
        };
        let mut buf = vec![0u8; MAX_PAYLOAD];
        loop {
            tokio::select! {
                _ = edge.wait_close() => return,
                res = local.read(&mut buf) => match res {
                    Ok(0) | Err(_) => {
                        edge.set_closed(TCP_CLOSE_R);
                        if edge.take_peer_notify() {
                            notify_close_r(&edge, &self.pool, self.is_client).await;
                        }
                        return;
                    }
                    Ok(n) => {
                        let frame = Frame::data(edge.stream_id, Bytes::copy_from_slice(&buf[..n]));
                        if tun.write_frame(&frame).await.is_err() {
                            tun.mark_dead();
                            self.pool.remove(&tun);
                            self.router.clean_of_tun(&tun.identifier);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn alloc_stream_id(&self, tun_identifier: &str) -> Result<(u16, String), TunnelError> {
        for _ in 0..=u16::MAX as u32 {
            let id = (self.id_counter.fetch_add(1, Ordering::Relaxed) & 0xffff) as u16;
            let key = stream_key(tun_identifier, id);
            if !self.router.contains(&key) {
                return Ok((id, key));
            }
        }
        Err(TunnelError::StreamIdsExhausted)
    }

    /// Tear down streams and tunnels but keep the multiplexer reusable for
    /// the next negotiated session.
    pub async fn reset(&self) {
        self.router.close_all();
        self.pool.destroy().await;
    }

    pub async fn destroy(&self) {
        self.router.destroy();
        self.pool.destroy().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_format() {
        assert_eq!(stream_key("10.0.0.1:9000", 0x2a), "10.0.0.1:9000#002a");
        assert_eq!(stream_key("t", 0xffff), "t#ffff");
    }

    #[tokio::test]
    async fn test_stream_id_allocation_is_monotonic() {
        let mux = Multiplexer::new(true);
        let (a, _) = mux.alloc_stream_id("t").unwrap();
        let (b, _) = mux.alloc_stream_id("t").unwrap();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_client_serve_without_tunnels() {
        let mux = Multiplexer::new(true);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let local = TcpStream::connect(addr).await.unwrap();
        let _peer = accept.await.unwrap().unwrap();

        let res = mux.client_serve(local, "example.com:80".to_string()).await;
        assert!(matches!(res, Err(TunnelError::NoTunnel)));
    }
}
