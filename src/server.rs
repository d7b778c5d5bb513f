//! Server side: accept, negotiate, serve
//!
//! Every accepted connection goes through the server negotiation. A full
//! handshake yields a fresh session whose connection becomes the signal
//! tunnel; a valid token joins an existing session as a data tunnel feeding
//! that session's multiplexer. When the last tunnel of a session drops, its
//! remaining tokens are purged and its router is torn down.

use crate::auth::AuthProvider;
use crate::config::ServerConfig;
use crate::crypto::RsaKeyPair;
use crate::protocol::{negotiate_server, HashedConn, ServerOutcome, DT_PING_INTERVAL, TKSZ};
use crate::session::{Session, SessionManager};
use crate::tunnel::{Action, Conn, Frame, Tunnel};
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub struct Server {
    config: ServerConfig,
    rsa_private: RsaPrivateKey,
    auth: Box<dyn AuthProvider>,
    session_mgr: Arc<SessionManager>,
}

impl Server {
    pub fn new(config: ServerConfig) -> crate::Result<Arc<Self>> {
        let rsa_private =
            RsaKeyPair::private_from_pem(&config.rsa_private_key).map_err(crate::Error::Crypto)?;
        let auth = crate::auth::from_backend(&config.auth_backend)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(Arc::new(Server {
            config,
            rsa_private,
            auth,
            session_mgr: Arc::new(SessionManager::new()),
        }))
    }

    pub fn session_mgr(&self) -> &Arc<SessionManager> {
        &self.session_mgr
    }

    /// Accept loop; one task per connection.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("server is listening on {}", self.config.listen_addr);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.tunnel_serve(stream).await;
                    });
                }
                Err(e) => warn!("accept error: {e}"),
            }
        }
    }

    /// Negotiate one accepted connection and serve whatever it became.
    pub async fn tunnel_serve(self: &Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        let hconn = HashedConn::new(Conn::new(stream));

        match negotiate_server(
            hconn,
            &self.rsa_private,
            &self.config.cipher_algo,
            self.auth.as_ref(),
            &self.session_mgr,
        )
        .await
        {
            Ok(ServerOutcome::Establish { conn, session }) => {
                info!(%peer, identity = %session.identity, "session established");
                self.serve_signal_tunnel(conn, session, peer).await;
            }
            Ok(ServerOutcome::Join {
                conn,
                session,
                token,
            }) => {
                debug!(%peer, identity = %session.identity, "data tunnel joined");
                self.serve_data_tunnel(conn, session, token, peer).await;
            }
            Err(e) => {
                if e.is_warning() {
                    warn!(%peer, "negotiation: {e}");
                } else {
                    error!(%peer, "negotiation: {e}");
                }
            }
        }
    }

    /// The negotiated connection stays as the session's signal tunnel; it
    /// only carries keepalive until it drops, which counts against the
    /// session's tunnel population like any data tunnel.
    async fn serve_signal_tunnel(&self, conn: Conn, session: Arc<Session>, peer: String) {
        session.tunnel_attached();
        let (mut reader, writer) = conn.split();
        let tun = Tunnel::new(format!("sig:{peer}"), writer);

        loop {
            match reader.read_frame().await {
                Ok(frame) => {
                    tun.touch_read();
                    match frame.action {
                        Action::Ping => {
                            if tun.write_frame(&Frame::pong()).await.is_err() {
                                break;
                            }
                        }
                        Action::Pong => {}
                        _ => debug!(%frame, "unexpected frame on signal tunnel"),
                    }
                }
                Err(_) => break,
            }
        }
        debug!(%peer, "signal tunnel closed");
        self.retire_tunnel(&session).await;
    }

    /// Seed the data tunnel's cipher with the presented token as IV and hand
    /// it to the session's multiplexer until it dies.
    async fn serve_data_tunnel(
        &self,
        mut conn: Conn,
        session: Arc<Session>,
        token: [u8; TKSZ],
        peer: String,
    ) {
        conn.set_cipher(session.cipher_factory.new_cipher(Some(&token)));
        session.tunnel_attached();

        let (reader, writer) = conn.split();
        let tun = Arc::new(Tunnel::new(peer.clone(), writer));
        let died = session.mux.add_tunnel(
            tun,
            reader,
            Duration::from_secs(DT_PING_INTERVAL as u64),
        );
        let _ = died.await;
        debug!(%peer, "data tunnel closed");
        self.retire_tunnel(&session).await;
    }

    /// The last departing tunnel tears the whole session down.
    async fn retire_tunnel(&self, session: &Arc<Session>) {
        if session.tunnel_detached() {
            info!(identity = %session.identity, "last tunnel gone, purging session");
            self.session_mgr.remove(session);
            session.mux.destroy().await;
        }
    }
}
