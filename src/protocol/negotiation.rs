//! Handshake state machines
//!
//! Client wire sequence, one TCP connection, 10-second deadline per step:
//!
//! ```text
//! C -> S  obf(256) | rsa_oaep(user\0pass)(128) | dhPubLen(2) | dhPub
//! S -> C  len(2) | server dhPub            (len==1: 0xff=auth, else invalid)
//!         ... both sides derive the shared secret, install the cipher ...
//! S -> C  len(2) | tun params(32) | tokens(n*20)        (encrypted)
//! C -> S  rHash(20)                                     (encrypted)
//! S -> C  rHash(20)                                     (encrypted)
//! ```
//!
//! Each side requires the peer's read-hash to equal its own write-hash over
//! the plaintext both observed, which pins the whole exchange against
//! tampering. The server classifies the first read by length: 22 bytes with
//! valid markers is a token joining an existing session, 384 bytes with a
//! valid marker is a full handshake, anything else is rejected.

use super::{
    d5_sub, d5_sum_valid, HashedConn, NegotiationError, TunParams, DMLEN1, DMLEN2,
    GENERAL_SO_TIMEOUT, GENERATE_TOKEN_NUM, PARALLEL_TUN_QTY, TKSZ, TUN_PARAMS_LEN,
};
use crate::auth::AuthProvider;
use crate::config::D5Params;
use crate::crypto::{random_bytes, rsa_decrypt, rsa_encrypt, CipherFactory, DhKeyPair, HASH_LEN};
use crate::protocol::{DT_PING_INTERVAL, ST_PING_INTERVAL};
use crate::session::{Session, SessionManager};
use crate::tunnel::Conn;
use crate::{version_string, version_word};
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

const OBF_LEN: usize = 256;
const RSA_BLOCK_LEN: usize = 128;
const AUTH_FAIL_SENTINEL: [u8; 3] = [0x00, 0x01, 0xff];

async fn deadline<T, F>(fut: F) -> Result<T, NegotiationError>
where
    F: std::future::Future<Output = Result<T, NegotiationError>>,
{
    timeout(GENERAL_SO_TIMEOUT, fut)
        .await
        .map_err(|_| NegotiationError::Timeout)?
}

/// Client side of the handshake.
pub struct ClientNegotiation<'a> {
    pub params: &'a D5Params,
    pub server_public: &'a RsaPublicKey,
}

impl ClientNegotiation<'_> {
    /// Run the full handshake and return the established signal-tunnel
    /// connection with the negotiated parameters.
    pub async fn negotiate(&self) -> Result<(Conn, TunParams), NegotiationError> {
        if !self.params.server_addr.contains(':') || self.params.user.is_empty() {
            return Err(NegotiationError::InvalidD5Params(format!(
                "addr={} user={}",
                self.params.server_addr, self.params.user
            )));
        }
        let stream = timeout(GENERAL_SO_TIMEOUT, TcpStream::connect(&self.params.server_addr))
            .await
            .map_err(|_| NegotiationError::ServerUnreachable(self.params.server_addr.clone()))?
            .map_err(|e| {
                NegotiationError::ServerUnreachable(format!("{}: {e}", self.params.server_addr))
            })?;
        stream.set_nodelay(true)?;

        let mut hconn = HashedConn::new(Conn::new(stream));
        let dh = DhKeyPair::generate();

        self.request_auth_and_dh_exchange(&mut hconn, &dh).await?;
        let factory = self.finish_dh_exchange(&mut hconn, &dh).await?;
        hconn.set_cipher(factory.new_cipher(None));
        let params = self.validate_and_get_tokens(&mut hconn, factory).await?;
        Ok((hconn.into_inner(), params))
    }

    /// Step 1: obfuscation block with the 0xd5 marker, the RSA identity
    /// block, and our DH public value, all in one write.
    async fn request_auth_and_dh_exchange(
        &self,
        hconn: &mut HashedConn,
        dh: &DhKeyPair,
    ) -> Result<(), NegotiationError> {
        let mut obf = [0u8; OBF_LEN];
        random_bytes(&mut obf);
        obf[0xff] = d5_sub(obf[0xd5]);

        let identity = format!("{}\x00{}", self.params.user, self.params.pass);
        let id_block = rsa_encrypt(identity.as_bytes(), self.server_public)?;

        let mut buf = Vec::with_capacity(OBF_LEN + RSA_BLOCK_LEN + 2 + dh.public.len());
        buf.extend_from_slice(&obf);
        buf.extend_from_slice(&id_block);
        buf.extend_from_slice(&dh.public_len);
        buf.extend_from_slice(&dh.public);
        deadline(async { Ok(hconn.write_all(&buf).await?) }).await
    }

    /// Step 2: the server's DH reply, or its one-byte error sentinel.
    async fn finish_dh_exchange(
        &self,
        hconn: &mut HashedConn,
        dh: &DhKeyPair,
    ) -> Result<CipherFactory, NegotiationError> {
        let reply = deadline(hconn.read_len_prefixed()).await?;
        if reply.len() == 1 {
            return Err(match reply[0] {
                0xff => NegotiationError::AuthFailed,
                _ => NegotiationError::ValidationFailed("identity"),
            });
        }
        let secret = dh.shared_secret(&reply);
        Ok(CipherFactory::new(&self.params.cipher_algo, &secret)?)
    }

    /// Steps 3-4: tunnel parameters with tokens, then the hash cross-check.
    async fn validate_and_get_tokens(
        &self,
        hconn: &mut HashedConn,
        factory: CipherFactory,
    ) -> Result<TunParams, NegotiationError> {
        let buf = deadline(hconn.read_len_prefixed()).await?;
        if buf.len() < TUN_PARAMS_LEN {
            return Err(NegotiationError::NegotiationFailed(format!(
                "short params block: {}",
                buf.len()
            )));
        }

        let remote_ver = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let local_ver = version_word();
        if remote_ver > local_ver {
            if remote_ver >> 24 == local_ver >> 24 {
                warn!(
                    "remote is v{}, consider upgrading from v{}",
                    version_string(remote_ver),
                    version_string(local_ver)
                );
            } else {
                return Err(NegotiationError::IncompatibleVersion(version_string(
                    remote_ver,
                )));
            }
        }

        let params = TunParams::parse(&buf, factory)?;
        info!(tokens = params.tokens.len(), "negotiated tunnel parameters");

        let r_hash = hconn.rhash_sum();
        let w_hash = hconn.whash_sum();
        deadline(async { Ok(hconn.write_all(&r_hash).await?) }).await?;

        let mut o_hash = [0u8; HASH_LEN];
        deadline(async { Ok(hconn.read_exact(&mut o_hash).await?) }).await?;
        if w_hash != o_hash {
            warn!("server read-hash does not match our write-hash");
            return Err(NegotiationError::InconsistentHash);
        }
        Ok(params)
    }
}

/// What the server side of a successful negotiation produced.
pub enum ServerOutcome {
    /// Full handshake: a fresh session whose signal tunnel is `conn`.
    Establish { conn: Conn, session: Arc<Session> },
    /// Token resumption: a data tunnel joining an existing session.
    Join {
        conn: Conn,
        session: Arc<Session>,
        token: [u8; TKSZ],
    },
}

/// Server side of the handshake. Classifies the first read, then either
/// resumes a session from a token or runs the full exchange.
pub async fn negotiate_server(
    mut hconn: HashedConn,
    rsa_private: &RsaPrivateKey,
    cipher_algo: &str,
    auth: &dyn AuthProvider,
    session_mgr: &SessionManager,
) -> Result<ServerOutcome, NegotiationError> {
    let peer = hconn
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());

    let mut buf = [0u8; DMLEN1];
    let nr = deadline(async { Ok(hconn.read_some(&mut buf).await?) }).await?;

    if nr == DMLEN2
        && d5_sum_valid(buf[TKSZ - 2], buf[TKSZ])
        && d5_sum_valid(buf[TKSZ - 1], buf[TKSZ + 1])
    {
        let mut token = [0u8; TKSZ];
        token.copy_from_slice(&buf[..TKSZ]);
        return match session_mgr.take(&token) {
            Some(session) => Ok(ServerOutcome::Join {
                conn: hconn.into_inner(),
                session,
                token,
            }),
            None => {
                warn!(%peer, "incorrect token");
                Err(NegotiationError::ValidationFailed("token"))
            }
        };
    }

    if nr == DMLEN1 && d5_sum_valid(buf[0xd5], buf[0xff]) {
        let (factory, identity) = verify_then_dh_exchange(
            &mut hconn,
            &buf[OBF_LEN..DMLEN1],
            rsa_private,
            cipher_algo,
            auth,
        )
        .await?;
        hconn.set_cipher(factory.new_cipher(None));
        let session = Session::new(factory, identity);
        respond_with_tokens(&mut hconn, &session, session_mgr).await?;
        return Ok(ServerOutcome::Establish {
            conn: hconn.into_inner(),
            session,
        });
    }

    warn!(%peer, len = nr, "unrecognized request");
    Err(NegotiationError::NegotiationFailed(format!(
        "unrecognized request from {peer}, len={nr}"
    )))
}

/// Decrypt and authenticate the identity block, then complete the DH
/// exchange. The client's DH public value is consumed before the auth verdict
/// is announced, preserving the wire order either way.
async fn verify_then_dh_exchange(
    hconn: &mut HashedConn,
    cred_block: &[u8],
    rsa_private: &RsaPrivateKey,
    cipher_algo: &str,
    auth: &dyn AuthProvider,
) -> Result<(CipherFactory, String), NegotiationError> {
    let identity = rsa_decrypt(cred_block, rsa_private)
        .map_err(|_| NegotiationError::ValidationFailed("identity block"))?;
    let identity = String::from_utf8(identity)
        .map_err(|_| NegotiationError::ValidationFailed("identity encoding"))?;
    let (user, pass) = identity
        .split_once('\x00')
        .ok_or(NegotiationError::ValidationFailed("identity format"))?;

    let allow = auth.authenticate(user, pass);
    let client_dh_pub = deadline(hconn.read_len_prefixed()).await?;
    if !allow {
        warn!(user, "authentication failed");
        deadline(async { Ok(hconn.write_all(&AUTH_FAIL_SENTINEL).await?) }).await?;
        return Err(NegotiationError::AuthFailed);
    }

    let dh = DhKeyPair::generate();
    let secret = dh.shared_secret(&client_dh_pub);

    let mut reply = Vec::with_capacity(2 + dh.public.len());
    reply.extend_from_slice(&dh.public_len);
    reply.extend_from_slice(&dh.public);
    deadline(async { Ok(hconn.write_all(&reply).await?) }).await?;

    let factory = CipherFactory::new(cipher_algo, &secret)?;
    Ok((factory, user.to_string()))
}

/// Send the parameter block plus freshly minted tokens, then run the hash
/// cross-check from the server's side: receive the client's hash first,
/// verify it against our write-hash, and only then reveal our read-hash.
async fn respond_with_tokens(
    hconn: &mut HashedConn,
    session: &Arc<Session>,
    session_mgr: &SessionManager,
) -> Result<(), NegotiationError> {
    let head_len = 2 + TUN_PARAMS_LEN;
    let mut head = vec![0u8; head_len];
    random_bytes(&mut head);
    let body_len = (TUN_PARAMS_LEN + GENERATE_TOKEN_NUM * TKSZ) as u16;
    head[0..2].copy_from_slice(&body_len.to_be_bytes());
    head[2..6].copy_from_slice(&version_word().to_be_bytes());
    head[6..8].copy_from_slice(&ST_PING_INTERVAL.to_be_bytes());
    head[8..10].copy_from_slice(&DT_PING_INTERVAL.to_be_bytes());
    head[10] = PARALLEL_TUN_QTY;

    deadline(async { Ok(hconn.write_all(&head).await?) }).await?;
    let tokens = session_mgr.create_tokens(session, GENERATE_TOKEN_NUM);
    deadline(async { Ok(hconn.write_all(&tokens).await?) }).await?;

    let r_hash = hconn.rhash_sum();
    let w_hash = hconn.whash_sum();
    let mut o_hash = [0u8; HASH_LEN];
    deadline(async { Ok(hconn.read_exact(&mut o_hash).await?) }).await?;
    if w_hash != o_hash {
        warn!("client read-hash does not match our write-hash");
        return Err(NegotiationError::InconsistentHash);
    }
    deadline(async { Ok(hconn.write_all(&r_hash).await?) }).await?;
    Ok(())
}

/// Wire prelude a data tunnel sends to join a session: the token followed by
/// two bytes that d5-sum-validate against the token's tail.
pub fn data_tunnel_prelude(token: &[u8; TKSZ]) -> [u8; DMLEN2] {
    let mut buf = [0u8; DMLEN2];
    buf[..TKSZ].copy_from_slice(token);
    buf[TKSZ] = d5_sub(token[TKSZ - 2]);
    buf[TKSZ + 1] = d5_sub(token[TKSZ - 1]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_tunnel_prelude_markers() {
        let mut token = [0u8; TKSZ];
        random_bytes(&mut token);
        let prelude = data_tunnel_prelude(&token);
        assert_eq!(&prelude[..TKSZ], &token);
        assert!(d5_sum_valid(prelude[TKSZ - 2], prelude[TKSZ]));
        assert!(d5_sum_valid(prelude[TKSZ - 1], prelude[TKSZ + 1]));
    }

    #[test]
    fn test_auth_fail_sentinel_is_len_prefixed_ff() {
        // length prefix 1, payload 0xff
        assert_eq!(AUTH_FAIL_SENTINEL, [0, 1, 0xff]);
    }
}
