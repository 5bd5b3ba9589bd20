use canal_core::constants::HTLC_MIN_DELTA_MS;
use canal_core::types::{Amount, Height, LockId, TimestampMs, TokenId};
use serde::{Deserialize, Serialize};

/// An in-flight hash-locked conditional transfer on one account.
///
/// Created by `AccountTx::HtlcLock`, resolved exactly once by
/// `AccountTx::HtlcResolve`. The locked amount sits in the sender side's
/// hold field, so the later resolution can never violate the solvency bound.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcLock {
    pub lock_id: LockId,
    pub hashlock: [u8; 32],
    /// Absolute expiry (Unix ms). Secrets are valid at or before this.
    pub timelock_ms: TimestampMs,
    /// Secrets are invalid once the account height passes this.
    pub reveal_before_height: Height,
    pub amount: Amount,
    pub token_id: TokenId,
    pub sender_is_left: bool,
    pub created_height: Height,
    pub created_timestamp: TimestampMs,
}

impl HtlcLock {
    /// True once neither clock accepts a secret any more.
    pub fn expired(&self, now: TimestampMs, height: Height) -> bool {
        now > self.timelock_ms || height > self.reveal_before_height
    }
}

/// Timelock for hop `index` of an `hop_count`-hop route with base timelock
/// `base_ms`: earlier hops expire sooner, the final hop holds the longest,
/// so an intermediary that refuses to forward cannot strand upstream locks.
pub fn hop_timelock(base_ms: TimestampMs, hop_count: usize, index: usize) -> TimestampMs {
    debug_assert!(index < hop_count);
    let remaining = (hop_count - index - 1) as i64;
    base_ms - remaining * HTLC_MIN_DELTA_MS
}
