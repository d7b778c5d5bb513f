//! Authentication backends
//!
//! The server consults an `AuthProvider` with the decrypted identity from
//! the handshake. The stock backend is a flat file of `user:pass` lines;
//! the backend string in the server config selects and parameterizes it,
//! e.g. `file://users.db`.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unknown auth backend: {0}")]
    UnknownBackend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, user: &str, pass: &str) -> bool;
}

/// Flat-file user database: one `user:pass` per line, `#` comments allowed.
pub struct FileAuthProvider {
    users: HashMap<String, String>,
}

impl FileAuthProvider {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_lines(&content))
    }

    fn from_lines(content: &str) -> Self {
        let users = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| l.split_once(':'))
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .collect();
        FileAuthProvider { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl AuthProvider for FileAuthProvider {
    fn authenticate(&self, user: &str, pass: &str) -> bool {
        self.users.get(user).map(String::as_str) == Some(pass)
    }
}

/// Resolve a backend string from the server config.
pub fn from_backend(spec: &str) -> Result<Box<dyn AuthProvider>, AuthError> {
    match spec.split_once("://") {
        Some(("file", path)) => Ok(Box::new(FileAuthProvider::load(path)?)),
        _ => Err(AuthError::UnknownBackend(spec.to_string())),
    }
}
