//! Session passwords.
//!
//! Generated passwords are URL-safe random tokens. The hash handed to the
//! launcher (and kept in the registry as the display value) comes from a
//! pluggable [`PasswordHasher`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{KeeperError, KeeperResult};

/// `len_bytes` of OS randomness as unpadded URL-safe base64.
pub fn generate_password(len_bytes: usize) -> KeeperResult<String> {
    let mut buf = vec![0u8; len_bytes.max(1)];
    getrandom::getrandom(&mut buf)
        .map_err(|e| KeeperError::Hash(format!("no OS randomness: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(buf))
}

#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash(&self, password: &str) -> KeeperResult<String>;
}

/// Salted SHA-256 in the notebook server's `algorithm:salt:hexdigest` form,
/// where the digest covers `password || salt`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

const SALT_BYTES: usize = 6;

impl Sha256Hasher {
    pub fn hash_with_salt(password: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        format!("sha256:{salt}:{}", hex::encode(hasher.finalize()))
    }

    /// Check `password` against a `sha256:salt:digest` string.
    pub fn verify(password: &str, hashed: &str) -> bool {
        match hashed.split(':').collect::<Vec<_>>().as_slice() {
            ["sha256", salt, _] => Self::hash_with_salt(password, salt) == hashed,
            _ => false,
        }
    }
}

#[async_trait]
impl PasswordHasher for Sha256Hasher {
    async fn hash(&self, password: &str) -> KeeperResult<String> {
        let mut salt = [0u8; SALT_BYTES];
        getrandom::getrandom(&mut salt)
            .map_err(|e| KeeperError::Hash(format!("no OS randomness: {e}")))?;
        Ok(Self::hash_with_salt(password, &hex::encode(salt)))
    }
}

/// Delegates hashing to an external program: the plaintext is written to its
/// stdin and the first line of stdout is the hash.
#[derive(Debug, Clone)]
pub struct CommandHasher {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHasher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl PasswordHasher for CommandHasher {
    async fn hash(&self, password: &str) -> KeeperResult<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| KeeperError::Hash(format!("could not run {}: {e}", self.program.display())))?;

        // Dropping stdin after the write closes it. A program that exits
        // without reading gives EPIPE, which is judged by its exit status.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(password.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(KeeperError::Hash(format!("writing to hasher: {e}")));
                }
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| KeeperError::Hash("hasher timed out".into()))?
            .map_err(|e| KeeperError::Hash(format!("waiting for hasher: {e}")))?;

        if !output.status.success() {
            return Err(KeeperError::Hash(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| KeeperError::Hash("hasher printed nothing".into()))
    }
}
