//! Session and token management
//!
//! A session groups every tunnel belonging to one authenticated client. It is
//! identified by the single-use tokens minted during the full handshake;
//! presenting a valid token lets an additional data tunnel join the session
//! without renegotiating.

use crate::crypto::{random_bytes, CipherFactory};
use crate::protocol::TKSZ;
use crate::tunnel::Multiplexer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Server-side state for one authenticated client.
pub struct Session {
    pub cipher_factory: CipherFactory,
    pub identity: String,
    pub mux: Arc<Multiplexer>,
    tunnel_count: AtomicUsize,
}

impl Session {
    pub fn new(cipher_factory: CipherFactory, identity: String) -> Arc<Self> {
        Arc::new(Session {
            cipher_factory,
            identity,
            mux: Multiplexer::new(false),
            tunnel_count: AtomicUsize::new(0),
        })
    }

    pub fn tunnel_attached(&self) {
        self.tunnel_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the departing tunnel was the last one.
    pub fn tunnel_detached(&self) -> bool {
        self.tunnel_count.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnel_count.load(Ordering::SeqCst)
    }
}

/// Process-wide token registry.
///
/// Tokens are minted in batches during the handshake and consumed at most
/// once; `take` is the linearization point, so two concurrent presenters of
/// the same token cannot both succeed.
#[derive(Default)]
pub struct SessionManager {
    tokens: Mutex<HashMap<[u8; TKSZ], Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager::default()
    }

    /// Mint `n` random tokens pointing at `session` and return them
    /// concatenated in the order installed.
    pub fn create_tokens(&self, session: &Arc<Session>, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n * TKSZ);
        let mut tokens = self.tokens.lock().unwrap();
        for _ in 0..n {
            let mut token = [0u8; TKSZ];
            loop {
                random_bytes(&mut token);
                if !tokens.contains_key(&token) {
                    break;
                }
            }
            tokens.insert(token, Arc::clone(session));
            out.extend_from_slice(&token);
        }
        debug!(
            identity = %session.identity,
            count = n,
            total = tokens.len(),
            "minted session tokens"
        );
        out
    }

    /// Atomic lookup-and-remove.
    pub fn take(&self, token: &[u8; TKSZ]) -> Option<Arc<Session>> {
        self.tokens.lock().unwrap().remove(token)
    }

    /// Drop every token still pointing at `session`.
    pub fn remove(&self, session: &Arc<Session>) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|_, s| !Arc::ptr_eq(s, session));
    }

    pub fn token_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}
