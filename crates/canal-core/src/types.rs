use serde::{Deserialize, Serialize};
use std::fmt;

/// Token amount. u128 leaves ample headroom above any realistic reserve.
pub type Amount = u128;

/// Signed delta component (on-chain or off-chain).
pub type SignedAmount = i128;

/// Unix timestamp in milliseconds (UTC). Always passed in by the host;
/// nothing in the core reads a wall clock.
pub type TimestampMs = i64;

/// Frame height (bilateral or entity layer).
pub type Height = u64;

/// Opaque token identifier. Sorted ascending at every hashing boundary.
pub type TokenId = u32;

/// 32-byte digest of a frame's canonical encoding.
pub type StateHash = [u8; 32];

// ── EntityId ─────────────────────────────────────────────────────────────────

/// 20-byte entity identifier. For signer-driven entities this is the last
/// 20 bytes of Keccak-256 of the root key's uncompressed public point.
/// The derived `Ord` gives the canonical pair order for bilateral accounts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub [u8; 20]);

impl EntityId {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The entity driven directly by `signer` (id == signer address).
    pub fn from_signer(signer: SignerId) -> Self {
        Self(signer.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}…)", &self.to_hex()[..8])
    }
}

// ── SignerId ─────────────────────────────────────────────────────────────────

/// 20-byte signer address: last 20 bytes of Keccak-256 of the uncompressed
/// secp256k1 public key coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignerId(pub [u8; 20]);

impl SignerId {
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({}…)", &self.to_hex()[..8])
    }
}

// ── LockId ───────────────────────────────────────────────────────────────────

/// 32-byte HTLC lock identifier, unique per account for the lock's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(pub [u8; 32]);

impl LockId {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockId({}…)", &self.to_hex()[..16])
    }
}

// ── Routing ──────────────────────────────────────────────────────────────────

/// The coordinator addresses a replica by `"entityId:signerId"` (hex).
pub fn routing_key(entity: &EntityId, signer: &SignerId) -> String {
    format!("{}:{}", entity.to_hex(), signer.to_hex())
}

/// Canonical pair order for a bilateral account: `(min, max)`.
pub fn canonical_pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_hex_roundtrip() {
        let id = EntityId::from_bytes([0xab; 20]);
        assert_eq!(EntityId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(EntityId::from_hex("abcd").is_err());
    }

    #[test]
    fn canonical_pair_is_ordered() {
        let a = EntityId::from_bytes([1; 20]);
        let b = EntityId::from_bytes([2; 20]);
        assert_eq!(canonical_pair(b, a), (a, b));
        assert_eq!(canonical_pair(a, b), (a, b));
    }
}
