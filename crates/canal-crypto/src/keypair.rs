use once_cell::sync::Lazy;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use canal_core::error::CanalError;
use canal_core::types::SignerId;

use crate::hash::{keccak256, sha256};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

// ── Signature ────────────────────────────────────────────────────────────────

/// Recoverable ECDSA signature over a 32-byte digest: one recovery-id byte
/// followed by the 64-byte compact form. Verification recovers the public
/// key and checks its derived address, so no key registry is needed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    fn to_recoverable(&self) -> Result<RecoverableSignature, CanalError> {
        if self.0.len() != 65 {
            return Err(CanalError::InvalidSignature);
        }
        let rec_id = RecoveryId::from_i32(i32::from(self.0[0]))
            .map_err(|_| CanalError::InvalidSignature)?;
        RecoverableSignature::from_compact(&self.0[1..], rec_id)
            .map_err(|_| CanalError::InvalidSignature)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({}…)", hex::encode(&self.0[..4.min(self.0.len())]))
    }
}

// ── Address derivation ───────────────────────────────────────────────────────

/// Address = last 20 bytes of Keccak-256 of the uncompressed public key's
/// coordinates (the leading 0x04 marker byte excluded).
pub fn address_of(public_key: &PublicKey) -> SignerId {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&digest[12..]);
    SignerId(addr)
}

// ── Keypair ──────────────────────────────────────────────────────────────────

/// A signer keypair with its derived address. The secret key never appears
/// in snapshots or messages; hosts re-register keys after recovery.
///
/// The secret scalar is held in a `Zeroizing<[u8; 32]>` to wipe memory on
/// drop.
pub struct Keypair {
    pub signer_id: SignerId,
    public_key: PublicKey,
    secret_key: Zeroizing<[u8; 32]>,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let (sk, pk) = SECP.generate_keypair(&mut rand::thread_rng());
        Self {
            signer_id: address_of(&pk),
            public_key: pk,
            secret_key: Zeroizing::new(sk.secret_bytes()),
        }
    }

    /// Derive a keypair from arbitrary seed bytes. Deterministic, so tests
    /// and demo fleets can name their signers.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut digest = Zeroizing::new(sha256(seed));
        loop {
            if let Ok(sk) = SecretKey::from_slice(&digest[..]) {
                let pk = PublicKey::from_secret_key(&SECP, &sk);
                return Self {
                    signer_id: address_of(&pk),
                    public_key: pk,
                    secret_key: digest,
                };
            }
            // Astronomically unlikely: digest fell outside the curve order.
            *digest = sha256(&digest[..]);
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Sign a 32-byte digest (deterministic per RFC 6979).
    pub fn sign(&self, digest: &[u8; 32]) -> Signature {
        let sk = SecretKey::from_slice(&self.secret_key[..])
            .expect("secret key bytes validated at construction");
        let msg = Message::from_slice(digest).expect("digest is exactly 32 bytes");
        let sig = SECP.sign_ecdsa_recoverable(&msg, &sk);
        let (rec_id, compact) = sig.serialize_compact();
        let mut bytes = Vec::with_capacity(65);
        bytes.push(rec_id.to_i32() as u8);
        bytes.extend_from_slice(&compact);
        Signature(bytes)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair {{ signer_id: {:?} }}", self.signer_id)
    }
}

// ── Verification ─────────────────────────────────────────────────────────────

/// Recover the signing address from a digest and signature.
pub fn recover_signer(digest: &[u8; 32], sig: &Signature) -> Result<SignerId, CanalError> {
    let msg = Message::from_slice(digest).map_err(|e| CanalError::Crypto(e.to_string()))?;
    let recoverable = sig.to_recoverable()?;
    let pk = SECP
        .recover_ecdsa(&msg, &recoverable)
        .map_err(|_| CanalError::InvalidSignature)?;
    Ok(address_of(&pk))
}

/// Verify that `sig` over `digest` was produced by `expected`.
pub fn verify(digest: &[u8; 32], sig: &Signature, expected: &SignerId) -> Result<(), CanalError> {
    let recovered = recover_signer(digest, sig)?;
    if recovered != *expected {
        return Err(CanalError::InvalidSignature);
    }
    Ok(())
}
