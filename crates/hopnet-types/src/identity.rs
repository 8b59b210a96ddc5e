//! Router and tunnel identifiers.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Hash, Result, TypesError};

/// SHA-256-sized hash of a router's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouterHash(pub Hash);

impl RouterHash {
    /// Wrap raw hash bytes.
    pub fn from_bytes(bytes: Hash) -> Self {
        Self(bytes)
    }

    /// Derive a router hash from arbitrary identity bytes.
    pub fn of(identity: &[u8]) -> Self {
        Self(hopnet_crypto::sha256::hash(identity))
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

impl fmt::Display for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for RouterHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterHash({self})")
    }
}

/// A tunnel identifier. Positive 32-bit value, scoped to the router that
/// assigned it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelId(u32);

impl TunnelId {
    /// Create a tunnel id, rejecting zero.
    pub fn new(id: u32) -> Result<Self> {
        if id == 0 {
            return Err(TypesError::InvalidTunnelId(id));
        }
        Ok(Self(id))
    }

    /// Pick a random non-zero tunnel id.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..=u32::MAX))
    }

    /// Decode from 4 big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 4]) -> Result<Self> {
        Self::new(u32::from_be_bytes(bytes))
    }

    /// Encode as 4 big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// The raw value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_id_rejects_zero() {
        assert!(TunnelId::new(0).is_err());
        assert_eq!(TunnelId::new(7).expect("non-zero").get(), 7);
        assert!(TunnelId::from_be_bytes([0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_tunnel_id_bytes() {
        let id = TunnelId::new(0x0102_0304).expect("non-zero");
        assert_eq!(id.to_be_bytes(), [1, 2, 3, 4]);
        assert_eq!(TunnelId::from_be_bytes([1, 2, 3, 4]).expect("decode"), id);
    }

    #[test]
    fn test_random_tunnel_ids_nonzero() {
        for _ in 0..100 {
            assert_ne!(TunnelId::random().get(), 0);
        }
    }

    #[test]
    fn test_router_hash_display() {
        let hash = RouterHash::from_bytes([0xAB; 32]);
        assert_eq!(hash.to_string(), "abababababab");
        assert_ne!(RouterHash::of(b"alice"), RouterHash::of(b"bob"));
    }

    #[test]
    fn test_router_hash_json() {
        let hash = RouterHash::from_bytes([1; 32]);
        let json = serde_json::to_string(&hash).expect("serialize");
        let back: RouterHash = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(hash, back);
    }
}
