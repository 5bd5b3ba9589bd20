use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanalError {
    // ── Invariant violations (fatal to the operation, state unchanged) ───────
    #[error("solvency bound violated: delta {delta} outside [{floor}, {ceiling}]")]
    SolvencyViolation {
        delta: i128,
        floor: i128,
        ceiling: i128,
    },

    #[error("insufficient capacity: need {need}, have {have}")]
    InsufficientCapacity { need: u128, have: u128 },

    #[error("arithmetic overflow in amount computation")]
    AmountOverflow,

    #[error("settlement diff does not conserve value: {left} + {right} + {collateral} != 0")]
    ConservationViolation {
        left: i128,
        right: i128,
        collateral: i128,
    },

    #[error("frame hash chain mismatch: expected {expected}, got {got}")]
    HashChainMismatch { expected: String, got: String },

    #[error("frame state hash mismatch: expected {expected}, got {got}")]
    FrameMismatch { expected: String, got: String },

    #[error("frame height mismatch: expected {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("channel already open for token {0}")]
    ChannelExists(u32),

    #[error("duplicate lock: {0}")]
    DuplicateLock(String),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    // ── Replay / staleness (dropped silently by the caller) ──────────────────
    #[error("stale proposal at height {height}")]
    StaleProposal { height: u64 },

    #[error("cooperative nonce regression: have {have}, got {got}")]
    NonceRegression { have: u64, got: u64 },

    // ── Crypto failures (rejected per message) ───────────────────────────────
    #[error("invalid signature")]
    InvalidSignature,

    #[error("preimage does not match hashlock")]
    BadPreimage,

    #[error("unknown signer: {0}")]
    UnknownSigner(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    // ── Account / HTLC ───────────────────────────────────────────────────────
    #[error("unknown token: {0}")]
    UnknownToken(u32),

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("unknown lock: {0}")]
    UnknownLock(String),

    #[error("lock expired (timelock or reveal height passed)")]
    LockExpired,

    #[error("lock not yet expired; timeout resolution rejected")]
    LockNotExpired,

    #[error("cannot open an account with self")]
    SelfAccount,

    // ── Entity consensus ─────────────────────────────────────────────────────
    #[error("commit certificate below threshold: power {power} < {threshold}")]
    InsufficientQuorum { power: u64, threshold: u64 },

    // ── Jurisdiction adapter ─────────────────────────────────────────────────
    #[error("insufficient reserve: need {need}, have {have}")]
    InsufficientReserve { need: u128, have: u128 },

    #[error("entity not registered: {0}")]
    NotRegistered(String),

    #[error("entity pair not in canonical order")]
    NonCanonicalOrder,

    #[error("settlement rejected: {0}")]
    SettlementRejected(String),

    // ── Persistence (fatal at startup) ───────────────────────────────────────
    #[error("corrupted snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("corrupted log: {0}")]
    CorruptLog(String),

    // ── Serialization / storage ──────────────────────────────────────────────
    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CanalError {
    /// Errors in the replay/staleness class are dropped without poisoning
    /// any state; everything else is surfaced to the caller.
    pub fn is_replay(&self) -> bool {
        matches!(
            self,
            CanalError::StaleProposal { .. } | CanalError::NonceRegression { .. }
        )
    }
}

impl From<canal_codec::CodecError> for CanalError {
    fn from(e: canal_codec::CodecError) -> Self {
        CanalError::Codec(e.to_string())
    }
}
