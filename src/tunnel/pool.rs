//! Priority tunnel pool
//!
//! Selection sorts by rank descending, returns the head, and decrements its
//! rank, so repeated selections rotate through the members with a little
//! stickiness toward recently added tunnels.

use super::conn::Tunnel;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::trace;

#[derive(Default)]
pub struct ConnPool {
    pool: Mutex<Vec<Arc<Tunnel>>>,
}

impl ConnPool {
    pub fn new() -> Self {
        ConnPool::default()
    }

    pub fn push(&self, tun: Arc<Tunnel>) {
        self.pool.lock().unwrap().push(tun);
    }

    pub fn remove(&self, tun: &Arc<Tunnel>) -> bool {
        let mut pool = self.pool.lock().unwrap();
        let before = pool.len();
        pool.retain(|t| !Arc::ptr_eq(t, tun));
        pool.len() != before
    }

    pub fn len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self) -> Option<Arc<Tunnel>> {
        let mut pool = self.pool.lock().unwrap();
        if pool.is_empty() {
            return None;
        }
        pool.sort_by(|a, b| {
            let ra = a.priority.lock().unwrap().rank;
            let rb = b.priority.lock().unwrap().rank;
            rb.cmp(&ra)
        });
        let selected = Arc::clone(&pool[0]);
        {
            let mut prio = selected.priority.lock().unwrap();
            prio.rank -= 1;
            prio.last = Instant::now();
        }
        trace!(tun = %selected.identifier, "selected tunnel");
        Some(selected)
    }

    pub async fn destroy(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.pool.lock().unwrap());
        for tun in drained {
            tun.safe_close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Conn;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_tunnel(id: &str) -> Arc<Tunnel> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let stream = TcpStream::connect(addr).await.unwrap();
        // keep the peer half alive for the duration of the test
        std::mem::forget(accept);
        let (_reader, writer) = Conn::new(stream).split();
        Arc::new(Tunnel::new(id.to_string(), writer))
    }

    #[tokio::test]
    async fn test_select_on_empty_pool() {
        let pool = ConnPool::new();
        assert!(pool.select().is_none());
    }

    #[tokio::test]
    async fn test_select_single_decrements_rank() {
        let pool = ConnPool::new();
        let tun = test_tunnel("t1").await;
        pool.push(Arc::clone(&tun));

        let selected = pool.select().unwrap();
        assert!(Arc::ptr_eq(&selected, &tun));
        assert_eq!(tun.priority.lock().unwrap().rank, -1);
    }

    #[tokio::test]
    async fn test_select_rotates() {
        let pool = ConnPool::new();
        let a = test_tunnel("a").await;
        let b = test_tunnel("b").await;
        pool.push(Arc::clone(&a));
        pool.push(Arc::clone(&b));

        let first = pool.select().unwrap();
        let second = pool.select().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = ConnPool::new();
        let tun = test_tunnel("t").await;
        pool.push(Arc::clone(&tun));
        assert!(pool.remove(&tun));
        assert!(!pool.remove(&tun));
        assert!(pool.is_empty());
    }
}
