//! Account- and entity-level transactions.
//!
//! Every state-changing operation is a tagged variant; the canonical
//! byte-list encodings here are the only form that ever feeds a digest.

use canal_codec::Value;
use serde::{Deserialize, Serialize};

use crate::types::{Amount, EntityId, Height, LockId, SignerId, TimestampMs, TokenId};

// ── Account layer ────────────────────────────────────────────────────────────

/// Resolution outcome for an HTLC lock. Additional subcontract shapes extend
/// this enum rather than the account machine itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtlcOutcome {
    /// Reveal the preimage of the hashlock, claiming the locked amount.
    Secret { preimage: Vec<u8> },
    /// Release the hold after the lock expired.
    Timeout,
}

/// A transaction on one bilateral account, agreed by both parties through
/// the propose/ack handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTx {
    /// Open one token's channel on the account with per-side credit limits.
    OpenChannel {
        token_id: TokenId,
        left_credit_limit: Amount,
        right_credit_limit: Amount,
    },

    /// Move `amount` off-chain from one side to the other.
    DirectPayment {
        token_id: TokenId,
        amount: Amount,
        from_left: bool,
    },

    /// Reserve `amount` of the sender side's capacity behind a hashlock.
    HtlcLock {
        lock_id: LockId,
        token_id: TokenId,
        amount: Amount,
        hashlock: [u8; 32],
        /// Absolute expiry (Unix ms); secrets are valid at or before it.
        timelock_ms: TimestampMs,
        /// Secrets are also invalid once the account height passes this.
        reveal_before_height: Height,
        sender_is_left: bool,
    },

    /// Resolve a lock exactly once, by secret or by timeout.
    HtlcResolve { lock_id: LockId, outcome: HtlcOutcome },
}

impl AccountTx {
    /// Token this transaction touches, if any.
    pub fn token_id(&self) -> Option<TokenId> {
        match self {
            AccountTx::OpenChannel { token_id, .. }
            | AccountTx::DirectPayment { token_id, .. }
            | AccountTx::HtlcLock { token_id, .. } => Some(*token_id),
            AccountTx::HtlcResolve { .. } => None,
        }
    }

    /// Canonical encoding: a tagged list.
    pub fn to_value(&self) -> Value {
        match self {
            AccountTx::OpenChannel {
                token_id,
                left_credit_limit,
                right_credit_limit,
            } => Value::list(vec![
                Value::uint(1),
                Value::uint(u128::from(*token_id)),
                Value::uint(*left_credit_limit),
                Value::uint(*right_credit_limit),
            ]),
            AccountTx::DirectPayment {
                token_id,
                amount,
                from_left,
            } => Value::list(vec![
                Value::uint(2),
                Value::uint(u128::from(*token_id)),
                Value::uint(*amount),
                Value::uint(u128::from(*from_left)),
            ]),
            AccountTx::HtlcLock {
                lock_id,
                token_id,
                amount,
                hashlock,
                timelock_ms,
                reveal_before_height,
                sender_is_left,
            } => Value::list(vec![
                Value::uint(3),
                Value::bytes(lock_id.0.to_vec()),
                Value::uint(u128::from(*token_id)),
                Value::uint(*amount),
                Value::bytes(hashlock.to_vec()),
                Value::sint(i128::from(*timelock_ms)),
                Value::uint(u128::from(*reveal_before_height)),
                Value::uint(u128::from(*sender_is_left)),
            ]),
            AccountTx::HtlcResolve { lock_id, outcome } => {
                let outcome = match outcome {
                    HtlcOutcome::Secret { preimage } => Value::list(vec![
                        Value::uint(1),
                        Value::bytes(preimage.clone()),
                    ]),
                    HtlcOutcome::Timeout => Value::list(vec![Value::uint(2)]),
                };
                Value::list(vec![
                    Value::uint(4),
                    Value::bytes(lock_id.0.to_vec()),
                    outcome,
                ])
            }
        }
    }
}

// ── Entity layer ─────────────────────────────────────────────────────────────

/// A transaction ordered by the entity's consensus and applied to its state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityTx {
    /// Append a chat line to the entity's bounded message ring.
    Chat { from: SignerId, message: String },

    /// Ensure a bilateral account with `peer` exists.
    OpenAccount { peer: EntityId },

    /// Enqueue account transactions into the account's mempool; the
    /// bilateral handshake picks them up on the next flush.
    SubmitAccountTx {
        peer: EntityId,
        txs: Vec<AccountTx>,
    },
}

impl EntityTx {
    /// Canonical encoding: a tagged list.
    pub fn to_value(&self) -> Value {
        match self {
            EntityTx::Chat { from, message } => Value::list(vec![
                Value::uint(1),
                Value::bytes(from.0.to_vec()),
                Value::bytes(message.as_bytes().to_vec()),
            ]),
            EntityTx::OpenAccount { peer } => Value::list(vec![
                Value::uint(2),
                Value::bytes(peer.0.to_vec()),
            ]),
            EntityTx::SubmitAccountTx { peer, txs } => Value::list(vec![
                Value::uint(3),
                Value::bytes(peer.0.to_vec()),
                Value::list(txs.iter().map(AccountTx::to_value).collect()),
            ]),
        }
    }
}
