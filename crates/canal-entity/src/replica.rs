use std::collections::{BTreeMap, VecDeque};

use canal_account::AccountMachine;
use canal_codec::Value;
use canal_core::constants::MAX_ENTITY_MESSAGES;
use canal_core::error::CanalError;
use canal_core::tx::EntityTx;
use canal_core::types::{
    Amount, EntityId, Height, SignerId, StateHash, TimestampMs, TokenId,
};
use canal_crypto::{keccak256, sha256};
use serde::{Deserialize, Serialize};

// ── Config ───────────────────────────────────────────────────────────────────

/// How an entity reaches agreement. Only the proposer-based mode exists;
/// the enum keeps the config wire shape open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMode {
    ProposerBased,
}

/// Consensus parameters for one entity: its validator list (first entry is
/// the designated proposer), per-signer share weights and the precommit
/// power threshold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub mode: ConsensusMode,
    pub threshold: u64,
    pub validators: Vec<SignerId>,
    pub shares: BTreeMap<SignerId, u64>,
}

impl EntityConfig {
    /// Single-signer entity: one validator holding one share, threshold 1.
    pub fn single(signer: SignerId) -> Self {
        Self {
            mode: ConsensusMode::ProposerBased,
            threshold: 1,
            validators: vec![signer],
            shares: BTreeMap::from([(signer, 1)]),
        }
    }

    /// Equal-share BFT board with threshold `ceil(2n/3)`.
    pub fn board(validators: Vec<SignerId>) -> Self {
        let n = validators.len() as u64;
        let shares = validators.iter().map(|v| (*v, 1)).collect();
        Self {
            mode: ConsensusMode::ProposerBased,
            threshold: (2 * n + 2) / 3,
            validators,
            shares,
        }
    }

    pub fn proposer(&self) -> Option<&SignerId> {
        self.validators.first()
    }

    /// Share-weighted power of `signers`, counting validators only.
    pub fn power<'a>(&self, signers: impl IntoIterator<Item = &'a SignerId>) -> u64 {
        signers
            .into_iter()
            .filter(|s| self.validators.contains(s))
            .map(|s| self.shares.get(s).copied().unwrap_or(0))
            .sum()
    }

    /// Opaque commitment to the board handed to the jurisdiction layer.
    pub fn board_digest(&self) -> [u8; 32] {
        let encoded = Value::list(vec![
            Value::uint(u128::from(self.threshold)),
            Value::list(
                self.validators
                    .iter()
                    .map(|v| Value::bytes(v.0.to_vec()))
                    .collect(),
            ),
            Value::list(
                self.shares
                    .iter()
                    .map(|(s, w)| {
                        Value::list(vec![
                            Value::bytes(s.0.to_vec()),
                            Value::uint(u128::from(*w)),
                        ])
                    })
                    .collect(),
            ),
        ])
        .encode();
        keccak256(&encoded)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// An entity frame: the ordered transactions of one committed height plus
/// the digest of the post-execution state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedFrame {
    pub height: Height,
    pub timestamp: TimestampMs,
    pub previous_frame_hash: StateHash,
    pub txs: Vec<EntityTx>,
    pub state_hash: StateHash,
}

impl ProposedFrame {
    /// Digest of the frame's canonical encoding; the next frame chains on
    /// this value.
    pub fn frame_hash(&self) -> StateHash {
        let encoded = Value::list(vec![
            Value::uint(u128::from(self.height)),
            Value::uint(self.timestamp as u128),
            Value::bytes(self.previous_frame_hash.to_vec()),
            Value::list(self.txs.iter().map(EntityTx::to_value).collect()),
            Value::bytes(self.state_hash.to_vec()),
        ])
        .encode();
        sha256(&encoded)
    }
}

// ── State ────────────────────────────────────────────────────────────────────

/// The replicated state of one entity. Every map is ordered so that state
/// hashing is deterministic by construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub height: Height,
    pub timestamp: TimestampMs,
    pub previous_frame_hash: StateHash,
    pub reserves: BTreeMap<TokenId, Amount>,
    pub accounts: BTreeMap<EntityId, AccountMachine>,
    pub config: EntityConfig,
    /// Chat lines, oldest first, bounded by `MAX_ENTITY_MESSAGES`.
    pub messages: VecDeque<String>,
}

impl EntityState {
    pub fn new(entity_id: EntityId, config: EntityConfig) -> Self {
        Self {
            entity_id,
            height: 0,
            timestamp: 0,
            previous_frame_hash: [0; 32],
            reserves: BTreeMap::new(),
            accounts: BTreeMap::new(),
            config,
            messages: VecDeque::new(),
        }
    }

    /// Apply one ordered transaction. Used only on cloned state; a failure
    /// aborts the clone, never the replica.
    pub fn apply_tx(&mut self, tx: &EntityTx) -> Result<(), CanalError> {
        match tx {
            EntityTx::Chat { from, message } => {
                self.messages.push_back(format!("{from}: {message}"));
                while self.messages.len() > MAX_ENTITY_MESSAGES {
                    self.messages.pop_front();
                }
                Ok(())
            }
            EntityTx::OpenAccount { peer } => {
                if *peer == self.entity_id {
                    return Err(CanalError::SelfAccount);
                }
                let entity_id = self.entity_id;
                self.accounts
                    .entry(*peer)
                    .or_insert_with(|| AccountMachine::new(entity_id, *peer));
                Ok(())
            }
            EntityTx::SubmitAccountTx { peer, txs } => {
                if *peer == self.entity_id {
                    return Err(CanalError::SelfAccount);
                }
                let entity_id = self.entity_id;
                let machine = self
                    .accounts
                    .entry(*peer)
                    .or_insert_with(|| AccountMachine::new(entity_id, *peer));
                for tx in txs {
                    machine.submit(tx.clone());
                }
                Ok(())
            }
        }
    }

    /// Digest of the canonical state encoding. Map-valued fields are
    /// iterated in ascending key order; bilateral accounts are represented
    /// by their committed frame hash and cooperative nonce.
    pub fn state_hash(&self) -> StateHash {
        let reserves = self
            .reserves
            .iter()
            .map(|(token, amount)| {
                Value::list(vec![
                    Value::uint(u128::from(*token)),
                    Value::uint(*amount),
                ])
            })
            .collect();
        let accounts = self
            .accounts
            .iter()
            .map(|(peer, machine)| {
                Value::list(vec![
                    Value::bytes(peer.0.to_vec()),
                    Value::bytes(machine.current_frame.state_hash.to_vec()),
                    Value::uint(u128::from(machine.cooperative_nonce)),
                ])
            })
            .collect();
        let messages = self
            .messages
            .iter()
            .map(|m| Value::bytes(m.as_bytes().to_vec()))
            .collect();
        let encoded = Value::list(vec![
            Value::bytes(self.entity_id.0.to_vec()),
            Value::uint(u128::from(self.height)),
            Value::uint(self.timestamp as u128),
            Value::bytes(self.previous_frame_hash.to_vec()),
            Value::list(reserves),
            Value::list(accounts),
            Value::list(messages),
            Value::bytes(self.config.board_digest().to_vec()),
        ])
        .encode();
        sha256(&encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(n: u8) -> SignerId {
        SignerId([n; 20])
    }

    #[test]
    fn board_threshold_is_two_thirds() {
        assert_eq!(EntityConfig::board(vec![signer(1)]).threshold, 1);
        assert_eq!(
            EntityConfig::board(vec![signer(1), signer(2), signer(3)]).threshold,
            2
        );
        assert_eq!(
            EntityConfig::board((1u8..=9).map(signer).collect()).threshold,
            6
        );
    }

    #[test]
    fn power_counts_validators_only() {
        let config = EntityConfig::board(vec![signer(1), signer(2), signer(3)]);
        let outsider = signer(9);
        assert_eq!(config.power([&signer(1), &signer(2)]), 2);
        assert_eq!(config.power([&signer(1), &outsider]), 1);
    }

    #[test]
    fn state_hash_is_insertion_order_independent() {
        let config = EntityConfig::single(signer(1));
        let mut a = EntityState::new(EntityId::from_bytes([7; 20]), config.clone());
        let mut b = EntityState::new(EntityId::from_bytes([7; 20]), config);
        a.reserves.insert(1, 100);
        a.reserves.insert(2, 200);
        b.reserves.insert(2, 200);
        b.reserves.insert(1, 100);
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn state_hash_covers_messages_and_height() {
        let config = EntityConfig::single(signer(1));
        let mut s = EntityState::new(EntityId::from_bytes([7; 20]), config);
        let before = s.state_hash();
        s.apply_tx(&EntityTx::Chat {
            from: signer(1),
            message: "hello".into(),
        })
        .unwrap();
        assert_ne!(before, s.state_hash());
    }

    #[test]
    fn message_ring_is_bounded() {
        let config = EntityConfig::single(signer(1));
        let mut s = EntityState::new(EntityId::from_bytes([7; 20]), config);
        for i in 0..(MAX_ENTITY_MESSAGES + 10) {
            s.apply_tx(&EntityTx::Chat {
                from: signer(1),
                message: format!("m{i}"),
            })
            .unwrap();
        }
        assert_eq!(s.messages.len(), MAX_ENTITY_MESSAGES);
    }

    #[test]
    fn self_account_rejected() {
        let id = EntityId::from_bytes([7; 20]);
        let mut s = EntityState::new(id, EntityConfig::single(signer(1)));
        assert!(matches!(
            s.apply_tx(&EntityTx::OpenAccount { peer: id }),
            Err(CanalError::SelfAccount)
        ));
    }
}
