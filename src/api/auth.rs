//! # Operator authentication.
//!
//! Two-step challenge/response as the operator application speaks it:
//!
//! 1. `{username, state: "initial"}` → `{challenge, state: "challenge"}`
//! 2. `{username, challenge, key}` → `{token}` where
//!    `key = MD5(username ":" shared_secret)` in lowercase hex.
//!
//! The derived verifier is the same digest computed server-side. This is
//! cryptographically weak (the challenge never enters the hash, MD5 is
//! MD5); the wire contract is preserved as-is, but verification sits
//! behind [`Authenticate`] so a real scheme can replace it without
//! touching the handlers. Secret rotation and a salted hash are the
//! required follow-up.

use dashmap::DashMap;
use rand::RngCore;

/// Pluggable credential verifier.
pub trait Authenticate: Send + Sync {
    /// Checks the operator-supplied key for the given username.
    fn verify(&self, username: &str, key: &str) -> bool;
}

/// The legacy digest verifier.
pub struct Md5Authenticator {
    username: String,
    verifier: String,
}

impl Md5Authenticator {
    pub fn new(username: &str, shared_secret: &str) -> Self {
        let digest = md5::compute(format!("{username}:{shared_secret}"));
        Self {
            username: username.to_string(),
            verifier: format!("{digest:x}"),
        }
    }
}

impl Authenticate for Md5Authenticator {
    fn verify(&self, username: &str, key: &str) -> bool {
        username == self.username && key.eq_ignore_ascii_case(&self.verifier)
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Issued challenges and minted session tokens.
pub struct SessionStore {
    challenges: DashMap<String, String>,
    tokens: DashMap<String, ()>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            challenges: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// Starts an auth round: stores and returns a fresh challenge for the
    /// username. A repeated initial request replaces the old challenge.
    pub fn issue_challenge(&self, username: &str) -> String {
        let challenge = random_hex(16);
        self.challenges
            .insert(username.to_string(), challenge.clone());
        challenge
    }

    /// Completes an auth round. The username must hold an outstanding
    /// challenge and the key must verify; on success the challenge is
    /// consumed and an opaque token is minted.
    pub fn redeem(
        &self,
        username: &str,
        key: &str,
        authenticator: &dyn Authenticate,
    ) -> Option<String> {
        self.challenges.remove(username)?;
        if !authenticator.verify(username, key) {
            return None;
        }
        let token = random_hex(16);
        self.tokens.insert(token.clone(), ());
        Some(token)
    }

    /// True if the token was minted by this store.
    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens.contains_key(token)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
