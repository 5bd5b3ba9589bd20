use std::collections::{BTreeMap, VecDeque};

use canal_account::{AccountMachine, AccountMsg};
use canal_core::constants::MAX_FRAME_HISTORY;
use canal_core::error::CanalError;
use canal_core::tx::EntityTx;
use canal_core::types::{routing_key, EntityId, SignerId, StateHash, TimestampMs};
use canal_crypto::{verify, Keypair, Signature};
use canal_settle::SettlementDiff;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::replica::{EntityState, ProposedFrame};

// ── Inputs and outputs ───────────────────────────────────────────────────────

/// Everything a replica can be fed by the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntityInput {
    /// A client or fellow validator hands over a transaction.
    AddTx(EntityTx),

    /// The proposer broadcast a frame for this height.
    Proposal { frame: ProposedFrame, sig: Signature },

    /// A validator endorses a proposed frame's hash.
    Precommit {
        signer: SignerId,
        frame_hash: StateHash,
        sig: Signature,
    },

    /// The proposer reached quorum; non-proposers advance on this.
    Committed {
        frame: ProposedFrame,
        precommits: Vec<(SignerId, Signature)>,
    },

    /// A bilateral account message from a counterparty entity.
    AccountMessage {
        from_entity: EntityId,
        msg: AccountMsg,
    },

    /// The jurisdiction layer applied these diffs for our account with
    /// `peer`; mirror them into the local delta.
    SettlementApplied {
        peer: EntityId,
        diffs: Vec<SettlementDiff>,
    },
}

/// A replica-produced message addressed to another replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Outbound {
    pub entity: EntityId,
    pub signer: SignerId,
    pub input: EntityInput,
}

impl Outbound {
    pub fn key(&self) -> String {
        routing_key(&self.entity, &self.signer)
    }
}

// ── Replica ──────────────────────────────────────────────────────────────────

/// The proposer's in-flight frame with collected precommit signatures and
/// the already-executed clone it will swap in at commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Proposal {
    pub frame: ProposedFrame,
    staged: EntityState,
    pub precommits: BTreeMap<SignerId, Signature>,
}

/// A validator's safety lock: once precommitted, it will not endorse a
/// different frame at the same height.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockedFrame {
    pub frame: ProposedFrame,
    staged: EntityState,
}

/// One `(entity, signer)` replica of the entity state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityReplica {
    pub entity_id: EntityId,
    pub signer_id: SignerId,
    pub state: EntityState,
    pub mempool: Vec<EntityTx>,
    pub proposal: Option<Proposal>,
    pub locked: Option<LockedFrame>,
    /// Committed frames, newest last, bounded by `MAX_FRAME_HISTORY`.
    pub frames: VecDeque<ProposedFrame>,
}

impl EntityReplica {
    pub fn new(entity_id: EntityId, signer_id: SignerId, state: EntityState) -> Self {
        Self {
            entity_id,
            signer_id,
            state,
            mempool: Vec::new(),
            proposal: None,
            locked: None,
            frames: VecDeque::new(),
        }
    }

    pub fn is_proposer(&self) -> bool {
        self.state.config.proposer() == Some(&self.signer_id)
    }

    /// Whether this replica drives the entity's bilateral accounts: true
    /// for entities whose id is their root signer's address.
    pub fn drives_accounts(&self) -> bool {
        self.signer_id.0 == self.entity_id.0
    }

    // ── Input handling ───────────────────────────────────────────────────────

    /// Feed one routed input through the replica. Replay and staleness are
    /// dropped silently; recoverable failures return an error without
    /// touching the replica's state.
    pub fn handle(
        &mut self,
        input: EntityInput,
        keypair: &Keypair,
    ) -> Result<Vec<Outbound>, CanalError> {
        match input {
            EntityInput::AddTx(tx) => {
                self.mempool.push(tx);
                Ok(Vec::new())
            }
            EntityInput::Proposal { frame, sig } => self.on_proposal(frame, sig, keypair),
            EntityInput::Precommit {
                signer,
                frame_hash,
                sig,
            } => self.on_precommit(signer, frame_hash, sig),
            EntityInput::Committed { frame, precommits } => self.on_committed(frame, precommits),
            EntityInput::AccountMessage { from_entity, msg } => {
                self.on_account_message(from_entity, msg, keypair)
            }
            EntityInput::SettlementApplied { peer, diffs } => {
                self.on_settlement(peer, &diffs)?;
                Ok(Vec::new())
            }
        }
    }

    /// Generate outputs that are due regardless of inbound traffic:
    /// forwarding mempool entries, proposing a frame, flushing bilateral
    /// account proposals. Called by the coordinator until quiescent.
    pub fn flush(&mut self, now: TimestampMs, keypair: &Keypair) -> Result<Vec<Outbound>, CanalError> {
        let mut out = Vec::new();

        if !self.is_proposer() {
            // Mempool entries travel to the designated proposer.
            if let Some(proposer) = self.state.config.proposer().copied() {
                for tx in self.mempool.drain(..) {
                    out.push(Outbound {
                        entity: self.entity_id,
                        signer: proposer,
                        input: EntityInput::AddTx(tx),
                    });
                }
            }
        } else if self.proposal.is_none() && !self.mempool.is_empty() {
            out.extend(self.propose(now, keypair)?);
        }

        if self.drives_accounts() {
            out.extend(self.flush_accounts(now, keypair));
        }
        Ok(out)
    }

    // ── Proposing ────────────────────────────────────────────────────────────

    fn propose(
        &mut self,
        now: TimestampMs,
        keypair: &Keypair,
    ) -> Result<Vec<Outbound>, CanalError> {
        // Execute against a clone, dropping transactions that fail; the
        // frame carries the accepted set only.
        let mut staged = self.state.clone();
        let mut accepted = Vec::new();
        for tx in self.mempool.drain(..) {
            let mut attempt = staged.clone();
            match attempt.apply_tx(&tx) {
                Ok(()) => {
                    staged = attempt;
                    accepted.push(tx);
                }
                Err(e) => warn!(error = %e, "transaction rejected during proposal"),
            }
        }
        if accepted.is_empty() {
            return Ok(Vec::new());
        }

        staged.height = self.state.height + 1;
        staged.timestamp = now;
        let frame = ProposedFrame {
            height: staged.height,
            timestamp: now,
            previous_frame_hash: self.state.previous_frame_hash,
            txs: accepted,
            state_hash: staged.state_hash(),
        };
        let frame_hash = frame.frame_hash();

        // Fast path: a lone signer whose share satisfies the threshold
        // validates and commits in one step.
        if self.state.config.validators.len() == 1
            && self.state.config.power([&self.signer_id]) >= self.state.config.threshold
        {
            info!(height = frame.height, "fast-path commit");
            self.commit(frame, staged);
            return Ok(Vec::new());
        }

        let mut precommits = BTreeMap::new();
        precommits.insert(self.signer_id, keypair.sign(&frame_hash));
        let out = self
            .state
            .config
            .validators
            .iter()
            .filter(|v| **v != self.signer_id)
            .map(|v| Outbound {
                entity: self.entity_id,
                signer: *v,
                input: EntityInput::Proposal {
                    frame: frame.clone(),
                    sig: keypair.sign(&frame_hash),
                },
            })
            .collect();
        debug!(height = frame.height, "frame proposed to validators");
        self.proposal = Some(Proposal {
            frame,
            staged,
            precommits,
        });
        Ok(out)
    }

    fn flush_accounts(&mut self, now: TimestampMs, keypair: &Keypair) -> Vec<Outbound> {
        let our_entity = self.entity_id;
        let mut out = Vec::new();
        for (peer, machine) in self.state.accounts.iter_mut() {
            match machine.propose(now, keypair) {
                Ok(Some(msg)) => out.push(Outbound {
                    entity: *peer,
                    signer: SignerId(peer.0),
                    input: EntityInput::AccountMessage {
                        from_entity: our_entity,
                        msg,
                    },
                }),
                Ok(None) => {}
                // A failing bilateral proposal stays in its mempool; the
                // host decides whether to retry or evict.
                Err(e) => warn!(peer = %peer, error = %e, "account proposal failed"),
            }
        }
        out
    }

    // ── Validator path ───────────────────────────────────────────────────────

    fn on_proposal(
        &mut self,
        frame: ProposedFrame,
        sig: Signature,
        keypair: &Keypair,
    ) -> Result<Vec<Outbound>, CanalError> {
        let proposer = *self
            .state
            .config
            .proposer()
            .ok_or(CanalError::UnknownSigner("no proposer configured".into()))?;
        if frame.height <= self.state.height {
            debug!(height = frame.height, "stale proposal dropped");
            return Ok(Vec::new());
        }
        if frame.height > self.state.height + 1 {
            warn!(
                height = frame.height,
                local = self.state.height,
                "proposal ahead of local height; awaiting replay"
            );
            return Ok(Vec::new());
        }
        let frame_hash = frame.frame_hash();
        verify(&frame_hash, &sig, &proposer)?;
        if frame.previous_frame_hash != self.state.previous_frame_hash {
            return Err(CanalError::HashChainMismatch {
                expected: hex::encode(self.state.previous_frame_hash),
                got: hex::encode(frame.previous_frame_hash),
            });
        }

        // Safety lock: once precommitted at a height, never endorse a
        // different frame there.
        if let Some(locked) = &self.locked {
            if locked.frame.height == frame.height {
                if locked.frame.frame_hash() == frame_hash {
                    return Ok(vec![self.precommit_output(frame_hash, keypair, proposer)]);
                }
                warn!(height = frame.height, "conflicting proposal at locked height");
                return Ok(Vec::new());
            }
        }

        // Deterministic re-execution on a deep clone must reproduce the
        // proposer's state hash.
        let mut staged = self.state.clone();
        for tx in &frame.txs {
            staged.apply_tx(tx)?;
        }
        staged.height = frame.height;
        staged.timestamp = frame.timestamp;
        let local_hash = staged.state_hash();
        if local_hash != frame.state_hash {
            return Err(CanalError::FrameMismatch {
                expected: hex::encode(local_hash),
                got: hex::encode(frame.state_hash),
            });
        }

        self.locked = Some(LockedFrame { frame, staged });
        debug!(signer = %self.signer_id, "validator locked on frame");
        Ok(vec![self.precommit_output(frame_hash, keypair, proposer)])
    }

    fn precommit_output(
        &self,
        frame_hash: StateHash,
        keypair: &Keypair,
        proposer: SignerId,
    ) -> Outbound {
        Outbound {
            entity: self.entity_id,
            signer: proposer,
            input: EntityInput::Precommit {
                signer: self.signer_id,
                frame_hash,
                sig: keypair.sign(&frame_hash),
            },
        }
    }

    // ── Proposer collection ──────────────────────────────────────────────────

    fn on_precommit(
        &mut self,
        signer: SignerId,
        frame_hash: StateHash,
        sig: Signature,
    ) -> Result<Vec<Outbound>, CanalError> {
        let Some(proposal) = &mut self.proposal else {
            debug!("precommit without open proposal dropped");
            return Ok(Vec::new());
        };
        if proposal.frame.frame_hash() != frame_hash {
            debug!("precommit for a different frame dropped");
            return Ok(Vec::new());
        }
        if !self.state.config.validators.contains(&signer) {
            warn!(signer = %signer, "precommit from non-validator ignored");
            return Ok(Vec::new());
        }
        verify(&frame_hash, &sig, &signer)?;
        proposal.precommits.insert(signer, sig);

        let power = self.state.config.power(proposal.precommits.keys());
        if power < self.state.config.threshold {
            debug!(power, threshold = self.state.config.threshold, "quorum pending");
            return Ok(Vec::new());
        }

        let Some(proposal) = self.proposal.take() else {
            return Ok(Vec::new());
        };
        let precommits: Vec<(SignerId, Signature)> = proposal
            .precommits
            .iter()
            .map(|(s, sig)| (*s, sig.clone()))
            .collect();
        let frame = proposal.frame.clone();
        info!(height = frame.height, power, "quorum reached; committing");
        self.commit(proposal.frame, proposal.staged);

        let out = self
            .state
            .config
            .validators
            .clone()
            .into_iter()
            .filter(|v| *v != self.signer_id)
            .map(|v| Outbound {
                entity: self.entity_id,
                signer: v,
                input: EntityInput::Committed {
                    frame: frame.clone(),
                    precommits: precommits.clone(),
                },
            })
            .collect();
        Ok(out)
    }

    // ── Commit notification ──────────────────────────────────────────────────

    fn on_committed(
        &mut self,
        frame: ProposedFrame,
        precommits: Vec<(SignerId, Signature)>,
    ) -> Result<Vec<Outbound>, CanalError> {
        if frame.height <= self.state.height {
            debug!(height = frame.height, "stale commit dropped");
            return Ok(Vec::new());
        }
        if frame.height > self.state.height + 1 {
            warn!(
                height = frame.height,
                local = self.state.height,
                "commit ahead of local height; awaiting replay"
            );
            return Ok(Vec::new());
        }
        if frame.previous_frame_hash != self.state.previous_frame_hash {
            return Err(CanalError::HashChainMismatch {
                expected: hex::encode(self.state.previous_frame_hash),
                got: hex::encode(frame.previous_frame_hash),
            });
        }

        // Verify the commit certificate carries threshold power.
        let frame_hash = frame.frame_hash();
        let mut verified = Vec::new();
        for (signer, sig) in &precommits {
            verify(&frame_hash, sig, signer)?;
            if !verified.contains(signer) {
                verified.push(*signer);
            }
        }
        let power = self.state.config.power(verified.iter());
        if power < self.state.config.threshold {
            return Err(CanalError::InsufficientQuorum {
                power,
                threshold: self.state.config.threshold,
            });
        }

        // Reuse the locked execution when it matches, otherwise re-execute.
        let staged = match self.locked.take() {
            Some(locked) if locked.frame.frame_hash() == frame_hash => locked.staged,
            other => {
                self.locked = other;
                let mut staged = self.state.clone();
                for tx in &frame.txs {
                    staged.apply_tx(tx)?;
                }
                staged.height = frame.height;
                staged.timestamp = frame.timestamp;
                if staged.state_hash() != frame.state_hash {
                    return Err(CanalError::FrameMismatch {
                        expected: hex::encode(staged.state_hash()),
                        got: hex::encode(frame.state_hash),
                    });
                }
                staged
            }
        };
        self.commit(frame, staged);
        Ok(Vec::new())
    }

    fn commit(&mut self, frame: ProposedFrame, mut staged: EntityState) {
        staged.previous_frame_hash = frame.frame_hash();
        info!(
            entity = %self.entity_id,
            signer = %self.signer_id,
            height = frame.height,
            "entity frame committed"
        );
        self.frames.push_back(frame);
        while self.frames.len() > MAX_FRAME_HISTORY {
            self.frames.pop_front();
        }
        self.state = staged;
        self.proposal = None;
        self.locked = None;
    }

    // ── Bilateral account plumbing ───────────────────────────────────────────

    fn on_account_message(
        &mut self,
        from_entity: EntityId,
        msg: AccountMsg,
        keypair: &Keypair,
    ) -> Result<Vec<Outbound>, CanalError> {
        if from_entity == self.entity_id {
            return Err(CanalError::SelfAccount);
        }
        let our_entity = self.entity_id;
        let machine = self
            .state
            .accounts
            .entry(from_entity)
            .or_insert_with(|| AccountMachine::new(our_entity, from_entity));
        let reply = match machine.receive(msg, keypair) {
            Ok(reply) => reply,
            Err(e) if e.is_replay() => {
                debug!(peer = %from_entity, error = %e, "replayed account message dropped");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(reply
            .map(|msg| Outbound {
                entity: from_entity,
                signer: SignerId(from_entity.0),
                input: EntityInput::AccountMessage {
                    from_entity: our_entity,
                    msg,
                },
            })
            .into_iter()
            .collect())
    }

    fn on_settlement(&mut self, peer: EntityId, diffs: &[SettlementDiff]) -> Result<(), CanalError> {
        if peer == self.entity_id {
            return Err(CanalError::SelfAccount);
        }
        let our_entity = self.entity_id;
        let machine = self
            .state
            .accounts
            .entry(peer)
            .or_insert_with(|| AccountMachine::new(our_entity, peer));
        let is_left = machine.is_left();
        for diff in diffs {
            diff.check_conservation()?;
            machine.apply_settlement(diff.token_id, diff.collateral_diff, diff.ondelta_diff)?;
            let our_diff = if is_left {
                diff.left_diff
            } else {
                diff.right_diff
            };
            let reserve = self.state.reserves.entry(diff.token_id).or_default();
            *reserve = if our_diff >= 0 {
                reserve
                    .checked_add(our_diff.unsigned_abs())
                    .ok_or(CanalError::AmountOverflow)?
            } else {
                reserve
                    .checked_sub(our_diff.unsigned_abs())
                    .ok_or(CanalError::InsufficientReserve {
                        need: our_diff.unsigned_abs(),
                        have: *reserve,
                    })?
            };
        }
        debug!(peer = %peer, diffs = diffs.len(), "settlement mirrored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::EntityConfig;

    fn board() -> (Vec<EntityReplica>, Vec<Keypair>, EntityId) {
        let keys: Vec<Keypair> = [b"val-a".as_ref(), b"val-b".as_ref(), b"val-c".as_ref()]
            .iter()
            .map(|seed| Keypair::from_seed(seed))
            .collect();
        let validators: Vec<SignerId> = keys.iter().map(|k| k.signer_id).collect();
        let config = EntityConfig::board(validators);
        let entity = EntityId::from_bytes([0x42; 20]);
        let replicas = keys
            .iter()
            .map(|k| {
                EntityReplica::new(entity, k.signer_id, EntityState::new(entity, config.clone()))
            })
            .collect();
        (replicas, keys, entity)
    }

    fn chat(from: SignerId) -> EntityTx {
        EntityTx::Chat {
            from,
            message: "gm".into(),
        }
    }

    #[test]
    fn fast_path_single_signer_commits_directly() {
        let kp = Keypair::from_seed(b"solo");
        let entity = EntityId::from_signer(kp.signer_id);
        let config = EntityConfig::single(kp.signer_id);
        let mut replica =
            EntityReplica::new(entity, kp.signer_id, EntityState::new(entity, config));

        replica
            .handle(EntityInput::AddTx(chat(kp.signer_id)), &kp)
            .unwrap();
        let out = replica.flush(1_000, &kp).unwrap();
        assert!(out.is_empty());
        assert_eq!(replica.state.height, 1);
        assert_eq!(replica.state.messages.len(), 1);
        assert_ne!(replica.state.previous_frame_hash, [0; 32]);
    }

    #[test]
    fn quorum_commits_with_one_validator_offline() {
        let (mut replicas, keys, _) = board();

        // Proposer (index 0) takes a transaction; validator 2 stays offline.
        replicas[0]
            .handle(EntityInput::AddTx(chat(keys[0].signer_id)), &keys[0])
            .unwrap();
        let proposals = replicas[0].flush(1_000, &keys[0]).unwrap();
        assert_eq!(proposals.len(), 2, "proposal goes to both other validators");

        // Only validator 1 answers.
        let to_b = proposals
            .iter()
            .find(|o| o.signer == keys[1].signer_id)
            .expect("proposal for validator b");
        let precommits = replicas[1].handle(to_b.input.clone(), &keys[1]).unwrap();
        assert_eq!(precommits.len(), 1);

        let commits = replicas[0]
            .handle(precommits[0].input.clone(), &keys[0])
            .unwrap();
        assert_eq!(replicas[0].state.height, 1, "proposer commits at quorum 2/3");

        // The commit notification advances validator 1 to the same state.
        let to_b = commits
            .iter()
            .find(|o| o.signer == keys[1].signer_id)
            .expect("commit for validator b");
        replicas[1].handle(to_b.input.clone(), &keys[1]).unwrap();
        assert_eq!(replicas[1].state.height, 1);
        assert_eq!(
            replicas[0].state.previous_frame_hash,
            replicas[1].state.previous_frame_hash
        );
        assert_eq!(
            replicas[0].state.state_hash(),
            replicas[1].state.state_hash()
        );

        // Offline validator 2 is still at genesis until it replays.
        assert_eq!(replicas[2].state.height, 0);
        let to_c = commits
            .iter()
            .find(|o| o.signer == keys[2].signer_id)
            .expect("commit for validator c");
        replicas[2].handle(to_c.input.clone(), &keys[2]).unwrap();
        assert_eq!(replicas[2].state.height, 1);
        assert_eq!(
            replicas[2].state.state_hash(),
            replicas[0].state.state_hash()
        );
    }

    #[test]
    fn no_quorum_leaves_state_unchanged() {
        let (mut replicas, keys, _) = board();
        replicas[0]
            .handle(EntityInput::AddTx(chat(keys[0].signer_id)), &keys[0])
            .unwrap();
        let out = replicas[0].flush(1_000, &keys[0]).unwrap();
        assert_eq!(out.len(), 2);
        // Nobody answers: the proposal stays pending, nothing commits.
        assert_eq!(replicas[0].state.height, 0);
        assert!(replicas[0].proposal.is_some());
        // A later flush does not double-propose.
        assert!(replicas[0].flush(2_000, &keys[0]).unwrap().is_empty());
    }

    #[test]
    fn locked_validator_rejects_conflicting_frame() {
        let (mut replicas, keys, _) = board();
        replicas[0]
            .handle(EntityInput::AddTx(chat(keys[0].signer_id)), &keys[0])
            .unwrap();
        let proposals = replicas[0].flush(1_000, &keys[0]).unwrap();
        let to_b = proposals
            .iter()
            .find(|o| o.signer == keys[1].signer_id)
            .unwrap();
        replicas[1].handle(to_b.input.clone(), &keys[1]).unwrap();
        let locked_hash = replicas[1].locked.as_ref().unwrap().frame.frame_hash();

        // A conflicting frame at the same height from the proposer.
        let mut conflicting = match &to_b.input {
            EntityInput::Proposal { frame, .. } => frame.clone(),
            _ => unreachable!(),
        };
        conflicting.timestamp += 1;
        let sig = keys[0].sign(&conflicting.frame_hash());
        let out = replicas[1]
            .handle(
                EntityInput::Proposal {
                    frame: conflicting,
                    sig,
                },
                &keys[1],
            )
            .unwrap();
        assert!(out.is_empty(), "no precommit for a conflicting frame");
        assert_eq!(
            replicas[1].locked.as_ref().unwrap().frame.frame_hash(),
            locked_hash
        );
    }

    #[test]
    fn non_proposer_forwards_mempool() {
        let (mut replicas, keys, entity) = board();
        replicas[1]
            .handle(EntityInput::AddTx(chat(keys[1].signer_id)), &keys[1])
            .unwrap();
        let out = replicas[1].flush(1_000, &keys[1]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entity, entity);
        assert_eq!(out[0].signer, keys[0].signer_id);
        assert!(matches!(out[0].input, EntityInput::AddTx(_)));
        assert!(replicas[1].mempool.is_empty());
    }

    #[test]
    fn settlement_mirrors_into_delta_and_reserves() {
        let kp = Keypair::from_seed(b"solo");
        let entity = EntityId::from_signer(kp.signer_id);
        let peer = EntityId::from_bytes([0xee; 20]);
        let config = EntityConfig::single(kp.signer_id);
        let mut replica =
            EntityReplica::new(entity, kp.signer_id, EntityState::new(entity, config));
        replica.state.reserves.insert(1, 1_000);

        let is_left = entity < peer;
        let diff = SettlementDiff::deposit(1, is_left, 400).unwrap();
        replica
            .handle(
                EntityInput::SettlementApplied {
                    peer,
                    diffs: vec![diff],
                },
                &kp,
            )
            .unwrap();

        assert_eq!(replica.state.reserves[&1], 600);
        let machine = &replica.state.accounts[&peer];
        let delta = machine.delta(1).unwrap();
        assert_eq!(delta.collateral, 400);
        let expected_ondelta = if is_left { 400 } else { 0 };
        assert_eq!(delta.ondelta, expected_ondelta);
        delta.validate().unwrap();
    }
}
