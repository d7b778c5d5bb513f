//! Configuration management
//!
//! Two TOML-shaped files: a server config (`.d5s`) and a client config
//! (`.d5c`). The running role can be auto-detected from whichever shape a
//! given file parses as. Credential issuance produces a ready-to-run `.d5c`
//! for each user.

use crate::crypto::{CipherKind, RsaKeyPair};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Server configuration (`.d5s`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Cipher algorithm: RC4, AES128CFB, AES256CFB
    pub cipher_algo: String,
    /// Auth backend, e.g. `file://users.db`
    pub auth_backend: String,
    /// PKCS#8 PEM private key
    pub rsa_private_key: String,
    /// Log verbosity 0-5
    #[serde(default)]
    pub verbose: Option<u8>,
}

/// One upstream endpoint with its credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct D5Params {
    pub server_addr: String,
    pub user: String,
    pub pass: String,
    /// SPKI PEM public key of the server
    pub rsa_public_key: String,
    pub cipher_algo: String,
}

/// Client configuration (`.d5c`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local SOCKS5/HTTP listen address
    pub listen_addr: String,
    #[serde(default)]
    pub verbose: Option<u8>,
    /// Upstream endpoints, tried round-robin
    #[serde(rename = "d5p")]
    pub d5p_list: Vec<D5Params>,
}

/// Which role a config file describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

fn validate_common(cipher_algo: &str, addr: &str) -> crate::Result<()> {
    let kind = CipherKind::from_name(cipher_algo).map_err(crate::Error::Crypto)?;
    if kind == CipherKind::Rc4 {
        warn!("RC4 is cryptographically broken; prefer AES128CFB or AES256CFB");
    }
    if addr.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
        return Err(crate::Error::Config(format!("address needs host:port: {addr}")));
    }
    Ok(())
}

pub fn load_server<P: AsRef<Path>>(path: P) -> crate::Result<ServerConfig> {
    let content = std::fs::read_to_string(&path)
        .map_err(|e| crate::Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
    let config: ServerConfig = toml::from_str(&content)
        .map_err(|e| crate::Error::Config(format!("parse server config: {e}")))?;
    validate_common(&config.cipher_algo, &config.listen_addr)?;
    RsaKeyPair::private_from_pem(&config.rsa_private_key).map_err(crate::Error::Crypto)?;
    Ok(config)
}

pub fn load_client<P: AsRef<Path>>(path: P) -> crate::Result<ClientConfig> {
    let content = std::fs::read_to_string(&path)
        .map_err(|e| crate::Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
    let config: ClientConfig = toml::from_str(&content)
        .map_err(|e| crate::Error::Config(format!("parse client config: {e}")))?;
    if config.d5p_list.is_empty() {
        return Err(crate::Error::Config("no [[d5p]] endpoints configured".into()));
    }
    for params in &config.d5p_list {
        validate_common(&params.cipher_algo, &params.server_addr)?;
        RsaKeyPair::public_from_pem(&params.rsa_public_key).map_err(crate::Error::Crypto)?;
    }
    Ok(config)
}

/// Decide the role from the extension when it is telling, otherwise from
/// whichever shape the file parses as.
pub fn detect_role<P: AsRef<Path>>(path: P) -> crate::Result<Role> {
    let path = path.as_ref();
    match path.extension().and_then(|e| e.to_str()) {
        Some("d5s") => return Ok(Role::Server),
        Some("d5c") => return Ok(Role::Client),
        _ => {}
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| crate::Error::Config(format!("read {}: {e}", path.display())))?;
    if toml::from_str::<ServerConfig>(&content).is_ok() {
        Ok(Role::Server)
    } else if toml::from_str::<ClientConfig>(&content).is_ok() {
        Ok(Role::Client)
    } else {
        Err(crate::Error::Config(format!(
            "{} is neither a server nor a client config",
            path.display()
        )))
    }
}

/// Write a ready-to-run `.d5c` credential file for `user`, with a freshly
/// generated password. The operator appends the same `user:pass` pair to the
/// server's auth file. Returns the generated password and the file path.
pub fn create_client_credential(
    output_dir: &Path,
    server_config: &ServerConfig,
    public_addr: &str,
    user: &str,
) -> crate::Result<(String, PathBuf)> {
    let mut pass_bytes = [0u8; 12];
    crate::crypto::random_bytes(&mut pass_bytes);
    let pass: String = pass_bytes
        .iter()
        .map(|b| {
            const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            ALPHABET[(*b as usize) % ALPHABET.len()] as char
        })
        .collect();

    let private = RsaKeyPair::private_from_pem(&server_config.rsa_private_key)
        .map_err(crate::Error::Crypto)?;
    let keys = RsaKeyPair {
        public: rsa::RsaPublicKey::from(&private),
        private,
    };

    let client = ClientConfig {
        listen_addr: "127.0.0.1:1080".to_string(),
        verbose: None,
        d5p_list: vec![D5Params {
            server_addr: public_addr.to_string(),
            user: user.to_string(),
            pass: pass.clone(),
            rsa_public_key: keys.public_pem().map_err(crate::Error::Crypto)?,
            cipher_algo: server_config.cipher_algo.clone(),
        }],
    };

    let path = output_dir.join(format!("{user}.d5c"));
    let content = toml::to_string_pretty(&client)
        .map_err(|e| crate::Error::Config(format!("serialize credential: {e}")))?;
    std::fs::write(&path, content)?;
    Ok((pass, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RsaKeyPair;

    fn server_toml() -> String {
        let keys = RsaKeyPair::generate().unwrap();
        let pem = keys.private_pem().unwrap();
        format!(
            "listen_addr = \"0.0.0.0:9008\"\ncipher_algo = \"AES128CFB\"\n\
             auth_backend = \"file://users.db\"\nrsa_private_key = '''\n{pem}'''\n"
        )
    }

    #[test]
    fn test_load_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.d5s");
        std::fs::write(&path, server_toml()).unwrap();

        let config = load_server(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9008");
        assert_eq!(config.cipher_algo, "AES128CFB");
    }

    #[test]
    fn test_role_detection_by_extension_and_shape() {
        let dir = tempfile::tempdir().unwrap();
        let by_ext = dir.path().join("x.d5s");
        std::fs::write(&by_ext, "garbage").unwrap();
        assert_eq!(detect_role(&by_ext).unwrap(), Role::Server);

        let by_shape = dir.path().join("anything.conf");
        std::fs::write(&by_shape, server_toml()).unwrap();
        assert_eq!(detect_role(&by_shape).unwrap(), Role::Server);
    }

    #[test]
    fn test_credential_issuance_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let server_path = dir.path().join("server.d5s");
        std::fs::write(&server_path, server_toml()).unwrap();
        let server = load_server(&server_path).unwrap();

        let (pass, path) =
            create_client_credential(dir.path(), &server, "vps.example.net:9008", "alice").unwrap();
        assert!(path.ends_with("alice.d5c"));
        assert_eq!(pass.len(), 12);

        let client = load_client(&path).unwrap();
        assert_eq!(client.d5p_list.len(), 1);
        assert_eq!(client.d5p_list[0].user, "alice");
        assert_eq!(client.d5p_list[0].pass, pass);
        assert_eq!(client.d5p_list[0].server_addr, "vps.example.net:9008");
        assert_eq!(detect_role(&path).unwrap(), Role::Client);
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.d5s");
        std::fs::write(
            &path,
            server_toml().replace("AES128CFB", "DES"),
        )
        .unwrap();
        assert!(load_server(&path).is_err());
    }
}
