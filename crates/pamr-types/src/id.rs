//! Endpoint and router identities.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// Identifier of one endpoint within a router's namespace.
///
/// Ids below [`AgentId::MIN_DYNAMIC`] are reserved: they are only handed out
/// to endpoints that present the cookie declared for them in the router's
/// reserved-agents file. Everything above is assigned by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub u64);

impl AgentId {
    /// First id the router assigns dynamically.
    pub const MIN_DYNAMIC: u64 = 4096;

    /// Whether this id lives in the reserved range.
    pub fn is_reserved(&self) -> bool {
        self.0 < Self::MIN_DYNAMIC
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AgentId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(AgentId)
    }
}

impl From<u64> for AgentId {
    fn from(v: u64) -> Self {
        AgentId(v)
    }
}

/// Identifier of a router incarnation.
///
/// A fresh random non-zero id is drawn every time a router starts, so an
/// endpoint reconnecting after a router restart can be told apart from one
/// reconnecting to the same router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId(pub u64);

impl RouterId {
    /// Draw a random non-zero router id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        RouterId(rng.gen_range(1..=u64::MAX))
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Length of a magic cookie in bytes.
pub const COOKIE_LEN: usize = 32;

/// Shared secret authenticating an endpoint to the router.
///
/// Cookies travel as 32 raw bytes. In configuration files they are written
/// either as 64 hex characters or as an arbitrary passphrase, which is
/// hashed with SHA-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MagicCookie([u8; COOKIE_LEN]);

impl MagicCookie {
    pub fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        MagicCookie(bytes)
    }

    /// Generate a random cookie.
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LEN];
        rand::thread_rng().fill(&mut bytes);
        MagicCookie(bytes)
    }

    /// Derive a cookie from a passphrase.
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut bytes = [0u8; COOKIE_LEN];
        bytes.copy_from_slice(&digest);
        MagicCookie(bytes)
    }

    /// Parse a configured cookie: 64 hex characters are taken literally,
    /// anything else is treated as a passphrase.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if text.len() == COOKIE_LEN * 2 {
            if let Ok(raw) = hex::decode(text) {
                let mut bytes = [0u8; COOKIE_LEN];
                bytes.copy_from_slice(&raw);
                return MagicCookie(bytes);
            }
        }
        Self::from_secret(text)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison.
    pub fn verify(&self, other: &MagicCookie) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl fmt::Debug for MagicCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the full secret.
        write!(f, "MagicCookie({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for MagicCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for MagicCookie {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err("magic cookie must not be empty".to_string());
        }
        Ok(MagicCookie::parse(&value))
    }
}

impl From<MagicCookie> for String {
    fn from(cookie: MagicCookie) -> Self {
        cookie.to_hex()
    }
}
