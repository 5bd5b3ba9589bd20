use canal_codec::Value;
use canal_core::tx::AccountTx;
use canal_core::types::{Height, SignedAmount, StateHash, TimestampMs, TokenId};
use canal_crypto::sha256;
use serde::{Deserialize, Serialize};

/// A committed unit of bilateral state transition.
///
/// Frames chain by `previous_frame_hash == prior.state_hash`; the state hash
/// is SHA-256 of the frame's canonical encoding with token ids ascending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFrame {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub previous_frame_hash: StateHash,
    pub state_hash: StateHash,
    /// Sorted unique token ids touched by this frame's transactions.
    pub token_ids: Vec<TokenId>,
    /// Combined per-token positions after application, same order as
    /// `token_ids`.
    pub deltas: Vec<SignedAmount>,
    pub account_txs: Vec<AccountTx>,
}

impl AccountFrame {
    /// The empty height-zero frame both sides start from.
    pub fn genesis() -> Self {
        let mut frame = Self {
            height: 0,
            timestamp: 0,
            previous_frame_hash: [0; 32],
            state_hash: [0; 32],
            token_ids: Vec::new(),
            deltas: Vec::new(),
            account_txs: Vec::new(),
        };
        frame.state_hash = frame.compute_state_hash();
        frame
    }

    /// Canonical encoding per the wire format:
    /// `[height, timestamp, previousFrameHash, [tokenIds], [deltas], [txs]]`.
    /// The `state_hash` field itself is excluded from its own preimage.
    fn encode_for_hash(&self) -> Vec<u8> {
        Value::list(vec![
            Value::uint(u128::from(self.height)),
            Value::uint(self.timestamp as u128),
            Value::bytes(self.previous_frame_hash.to_vec()),
            Value::list(
                self.token_ids
                    .iter()
                    .map(|t| Value::uint(u128::from(*t)))
                    .collect(),
            ),
            Value::list(self.deltas.iter().map(|d| Value::sint(*d)).collect()),
            Value::list(self.account_txs.iter().map(AccountTx::to_value).collect()),
        ])
        .encode()
    }

    pub fn compute_state_hash(&self) -> StateHash {
        sha256(&self.encode_for_hash())
    }

    /// Fill in the state hash from the canonical encoding.
    pub fn seal(mut self) -> Self {
        self.state_hash = self.compute_state_hash();
        self
    }
}
