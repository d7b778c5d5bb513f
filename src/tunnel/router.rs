//! Egress router and per-edge send queues
//!
//! The router owns every edge. An edge owns its local TCP connection and its
//! equeue, and holds only a weak handle to the tunnel it was opened over; a
//! broken tunnel is re-resolved through the pool on the client side.
//!
//! Exactly one tunnel reader pushes frames onto an edge's equeue and exactly
//! one send loop writes to the edge's local socket, which yields per-stream
//! ordering without any lock on the socket itself.

use super::conn::Tunnel;
use super::frame::{Action, Frame};
use super::pool::ConnPool;
use super::{TCP_CLOSED, TCP_CLOSE_R, TCP_CLOSE_W, TICKER_INTERVAL};
use crate::protocol::GENERAL_SO_TIMEOUT;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// One endpoint of a logical stream.
pub struct Edge {
    pub key: String,
    pub dest: String,
    pub stream_id: u16,
    /// True when this side initiated the open (client side).
    pub positive: bool,
    tun: Mutex<Weak<Tunnel>>,
    closed: AtomicU8,
    peer_notified: AtomicBool,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    ready_tx: Mutex<Option<oneshot::Sender<bool>>>,
    close_notify: Notify,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
}

impl Edge {
    fn new(
        key: String,
        dest: String,
        stream_id: u16,
        tun: &Arc<Tunnel>,
        local: TcpStream,
        positive: bool,
    ) -> Arc<Self> {
        let (read_half, write_half) = local.into_split();
        Arc::new(Edge {
            key,
            dest,
            stream_id,
            positive,
            tun: Mutex::new(Arc::downgrade(tun)),
            closed: AtomicU8::new(0),
            peer_notified: AtomicBool::new(false),
            queue_tx: Mutex::new(None),
            ready_tx: Mutex::new(None),
            close_notify: Notify::new(),
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
        })
    }

    pub fn closed_flags(&self) -> u8 {
        self.closed.load(Ordering::Acquire)
    }

    pub fn fully_closed(&self) -> bool {
        self.closed_flags() >= TCP_CLOSED
    }

    pub fn set_closed(&self, bits: u8) {
        self.closed.fetch_or(bits, Ordering::AcqRel);
    }

    /// One CLOSE_R per edge, whichever path loses the stream first.
    pub fn take_peer_notify(&self) -> bool {
        !self.peer_notified.swap(true, Ordering::AcqRel)
    }

    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tun.lock().unwrap().upgrade()
    }

    /// Park a ready signal for a positive edge awaiting its SYN_ACK.
    pub fn arm_ready(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *self.ready_tx.lock().unwrap() = Some(tx);
        rx
    }

    pub fn signal_ready(&self, ok: bool) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(ok);
        }
    }

    pub fn take_read_half(&self) -> Option<OwnedReadHalf> {
        self.read_half.lock().unwrap().take()
    }

    /// Hand a frame to the send loop. Without a running equeue only the
    /// CLOSE sentinel has an effect; anything else is dropped, which can
    /// only happen to a peer violating the SYN_ACK ordering.
    pub fn deliver(&self, frame: Frame) {
        let queue = self.queue_tx.lock().unwrap();
        match queue.as_ref() {
            Some(tx) => {
                let _ = tx.send(frame);
            }
            None => {
                if frame.action == Action::Close {
                    self.set_closed(TCP_CLOSED);
                    self.close_notify.notify_one();
                } else {
                    trace!(key = %self.key, %frame, "dropped frame for queueless edge");
                }
            }
        }
    }

    /// Stop the local-read pump without telling the peer.
    pub fn close_read(&self) {
        self.set_closed(TCP_CLOSE_R);
        self.close_notify.notify_one();
    }

    pub async fn wait_close(&self) {
        self.close_notify.notified().await;
    }

    /// Spawn the dedicated send loop that owns the local write half.
    pub fn start_equeue(self: &Arc<Self>, pool: Arc<ConnPool>, is_client: bool) {
        let mut queue = self.queue_tx.lock().unwrap();
        if queue.is_some() {
            return;
        }
        let Some(write_half) = self.write_half.lock().unwrap().take() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        *queue = Some(tx);
        let edge = Arc::clone(self);
        tokio::spawn(send_loop(edge, rx, write_half, pool, is_client));
    }
}

/// The equeue drain: pops frames in order and applies them to the local
/// socket. CLOSE and CLOSE_W are terminal sentinels; everything else is
/// payload written under the general socket deadline.
async fn send_loop(
    edge: Arc<Edge>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut conn: OwnedWriteHalf,
    pool: Arc<ConnPool>,
    is_client: bool,
) {
    while let Some(frame) = rx.recv().await {
        match frame.action {
            Action::Close => {
                debug!(dest = %edge.dest, "close");
                let _ = conn.shutdown().await;
                edge.set_closed(TCP_CLOSED);
                edge.close_notify.notify_one();
                return;
            }
            Action::CloseW => {
                debug!(dest = %edge.dest, "closeW by peer");
                let _ = conn.shutdown().await;
                edge.set_closed(TCP_CLOSE_W);
                return;
            }
            _ => {
                let wrote = timeout(GENERAL_SO_TIMEOUT, conn.write_all(&frame.payload)).await;
                if !matches!(wrote, Ok(Ok(()))) {
                    warn!(dest = %edge.dest, %frame, "write edge error");
                    if edge.closed_flags() & TCP_CLOSE_W == 0 {
                        edge.set_closed(TCP_CLOSE_W);
                        if edge.take_peer_notify() {
                            notify_close_r(&edge, &pool, is_client).await;
                        }
                    }
                    let _ = conn.shutdown().await;
                    edge.set_closed(TCP_CLOSED);
                    edge.close_notify.notify_one();
                    return;
                }
            }
        }
    }
    // registry dropped the sender: treat as a forced close
    let _ = conn.shutdown().await;
    edge.set_closed(TCP_CLOSED);
    edge.close_notify.notify_one();
}

/// Tell the peer to wind down its write side. The edge's original tunnel may
/// be broken; clients fall back to any pool member for the notification.
pub(super) async fn notify_close_r(edge: &Edge, pool: &ConnPool, is_client: bool) {
    let tun = match edge.tunnel().filter(|t| t.alive()) {
        Some(t) => Some(t),
        None if is_client => pool.select(),
        None => None,
    };
    if let Some(tun) = tun {
        let _ = tun
            .write_frame(&Frame::new(Action::CloseR, edge.stream_id))
            .await;
    }
}

/// Maps stream keys to edges and sweeps out the dead ones.
pub struct EgressRouter {
    registry: RwLock<HashMap<String, Arc<Edge>>>,
    pool: Arc<ConnPool>,
    is_client: bool,
    stop: Arc<Notify>,
}

impl EgressRouter {
    pub fn new(pool: Arc<ConnPool>, is_client: bool) -> Arc<Self> {
        let router = Arc::new(EgressRouter {
            registry: RwLock::new(HashMap::new()),
            pool,
            is_client,
            stop: Arc::new(Notify::new()),
        });
        let sweeper = Arc::clone(&router);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICKER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweeper.clean(),
                    _ = sweeper.stop.notified() => return,
                }
            }
        });
        router
    }

    /// Return the registered edge or build a fresh one. Negative (server)
    /// edges get their equeue started immediately; positive edges defer it
    /// until the SYN_ACK arrives.
    pub fn register(
        &self,
        key: &str,
        dest: &str,
        stream_id: u16,
        tun: &Arc<Tunnel>,
        local: TcpStream,
        positive: bool,
    ) -> Arc<Edge> {
        let mut registry = self.registry.write().unwrap();
        if let Some(existing) = registry.get(key) {
            return Arc::clone(existing);
        }
        let edge = Edge::new(
            key.to_string(),
            dest.to_string(),
            stream_id,
            tun,
            local,
            positive,
        );
        if !positive {
            edge.start_equeue(Arc::clone(&self.pool), self.is_client);
        }
        registry.insert(key.to_string(), Arc::clone(&edge));
        edge
    }

    /// Lookup that purges fully closed entries as it goes.
    pub fn get(&self, key: &str) -> Option<Arc<Edge>> {
        let edge = self.registry.read().unwrap().get(key).cloned()?;
        if edge.fully_closed() {
            self.registry.write().unwrap().remove(key);
            return None;
        }
        Some(edge)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.registry.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.registry.read().unwrap().len()
    }

    pub fn remove(&self, key: &str) {
        self.registry.write().unwrap().remove(key);
    }

    fn clean(&self) {
        let mut registry = self.registry.write().unwrap();
        registry.retain(|_, e| !e.fully_closed());
    }

    /// A tunnel died: force-close every edge keyed under its identifier and
    /// drop the entries.
    pub fn clean_of_tun(&self, tun_identifier: &str) {
        let prefix = format!("{tun_identifier}#");
        let mut registry = self.registry.write().unwrap();
        registry.retain(|key, edge| {
            if key.starts_with(&prefix) {
                edge.deliver(Frame::new(Action::Close, edge.stream_id));
                false
            } else {
                true
            }
        });
    }

    /// Broadcast CLOSE to every edge and drop the entries; the sweeper
    /// keeps running.
    pub fn close_all(&self) {
        let mut registry = self.registry.write().unwrap();
        for edge in registry.values() {
            edge.deliver(Frame::new(Action::Close, edge.stream_id));
        }
        registry.clear();
    }

    /// Broadcast CLOSE to every edge and stop the sweeper.
    pub fn destroy(&self) {
        self.close_all();
        self.stop.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Conn;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tunnel_pair() -> (Arc<Tunnel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        let peer = accept.await.unwrap();
        let (_r, w) = Conn::new(stream).split();
        (Arc::new(Tunnel::new("tun1".to_string(), w)), peer)
    }

    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        (stream, accept.await.unwrap())
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), true);
        let (tun, _peer) = tunnel_pair().await;
        let (local, _app) = local_pair().await;
        let (local2, _app2) = local_pair().await;

        let e1 = router.register("tun1#0001", "x:1", 1, &tun, local, true);
        let e2 = router.register("tun1#0001", "x:1", 1, &tun, local2, true);
        assert!(Arc::ptr_eq(&e1, &e2));
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_get_purges_fully_closed() {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), true);
        let (tun, _peer) = tunnel_pair().await;
        let (local, _app) = local_pair().await;

        let edge = router.register("tun1#0002", "x:2", 2, &tun, local, true);
        assert!(router.get("tun1#0002").is_some());

        edge.set_closed(TCP_CLOSED);
        assert!(router.get("tun1#0002").is_none());
        assert_eq!(router.len(), 0);
    }

    #[tokio::test]
    async fn test_equeue_orders_payload_writes() {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), false);
        let (tun, _peer) = tunnel_pair().await;
        let (local, mut app) = local_pair().await;

        // negative edge: equeue starts at registration
        let edge = router.register("tun1#0003", "x:3", 3, &tun, local, false);
        edge.deliver(Frame::data(3, bytes::Bytes::from_static(b"first ")));
        edge.deliver(Frame::data(3, bytes::Bytes::from_static(b"second")));

        let mut buf = [0u8; 12];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first second");
    }

    #[tokio::test]
    async fn test_close_sentinel_shuts_local_conn() {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), false);
        let (tun, _peer) = tunnel_pair().await;
        let (local, mut app) = local_pair().await;

        let edge = router.register("tun1#0004", "x:4", 4, &tun, local, false);
        edge.deliver(Frame::new(Action::Close, 4));

        let mut buf = [0u8; 1];
        let n = app.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "local conn sees EOF");
        // edge becomes purgeable
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(edge.fully_closed());
    }

    #[tokio::test]
    async fn test_clean_of_tun_drops_prefixed_edges() {
        let pool = Arc::new(ConnPool::new());
        let router = EgressRouter::new(Arc::clone(&pool), false);
        let (tun, _peer) = tunnel_pair().await;
        let (l1, _a1) = local_pair().await;
        let (l2, _a2) = local_pair().await;

        router.register("tun1#0005", "x:5", 5, &tun, l1, false);
        router.register("other#0001", "x:6", 1, &tun, l2, false);

        router.clean_of_tun("tun1");
        assert!(!router.contains("tun1#0005"));
        assert!(router.contains("other#0001"));
    }
}
