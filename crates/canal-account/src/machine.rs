use std::collections::{BTreeMap, BTreeSet, VecDeque};

use canal_core::constants::MAX_FRAME_HISTORY;
use canal_core::delta::{Capacity, Delta, Side};
use canal_core::error::CanalError;
use canal_core::tx::{AccountTx, HtlcOutcome};
use canal_core::types::{canonical_pair, EntityId, Height, LockId, SignerId, StateHash, TimestampMs, TokenId};
use canal_crypto::{sha256, verify, Keypair, Signature};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::AccountFrame;
use crate::htlc::HtlcLock;

// ── Messages ─────────────────────────────────────────────────────────────────

/// Messages exchanged between the two sides of an account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AccountMsg {
    /// A new frame at `height + 1`, signed by the proposer.
    Propose {
        frame: AccountFrame,
        cooperative_nonce: u64,
        sig: Signature,
    },
    /// The counterparty validated and locked the frame.
    Ack { state_hash: StateHash, sig: Signature },
    /// The proposer finalised; the ack sender may commit too.
    Commit { state_hash: StateHash, sig: Signature },
}

// ── Machine state ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Idle,
    /// We proposed and are waiting for the counterparty's ack.
    PendingOutbound,
    /// We acked an inbound frame and are waiting for the commit.
    PendingInbound,
}

/// Deltas and locks staged by tentative transaction execution; swapped in
/// whole at commit so a rejected frame leaves the machine untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct StagedState {
    deltas: BTreeMap<TokenId, Delta>,
    locks: BTreeMap<LockId, HtlcLock>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingProposal {
    pub frame: AccountFrame,
    staged: StagedState,
    cooperative_nonce: u64,
    sig: Signature,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundProposal {
    pub frame: AccountFrame,
    staged: StagedState,
    cooperative_nonce: u64,
}

/// One side's copy of a bilateral account.
///
/// Both entities hold mirrored, eventually-convergent instances; nothing is
/// shared. The canonical pair order fixes the sign convention: the "left"
/// entity is the smaller id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountMachine {
    pub left_entity: EntityId,
    pub right_entity: EntityId,
    pub our_entity: EntityId,
    pub deltas: BTreeMap<TokenId, Delta>,
    pub locks: BTreeMap<LockId, HtlcLock>,
    pub mempool: Vec<AccountTx>,
    pub current_frame: AccountFrame,
    pub cooperative_nonce: u64,
    pub status: AccountStatus,
    pub pending: Option<PendingProposal>,
    pub inbound: Option<InboundProposal>,
    /// Committed frames, newest last, bounded by `MAX_FRAME_HISTORY`.
    pub history: VecDeque<AccountFrame>,
}

impl AccountMachine {
    pub fn new(our_entity: EntityId, peer: EntityId) -> Self {
        let (left_entity, right_entity) = canonical_pair(our_entity, peer);
        Self {
            left_entity,
            right_entity,
            our_entity,
            deltas: BTreeMap::new(),
            locks: BTreeMap::new(),
            mempool: Vec::new(),
            current_frame: AccountFrame::genesis(),
            cooperative_nonce: 0,
            status: AccountStatus::Idle,
            pending: None,
            inbound: None,
            history: VecDeque::new(),
        }
    }

    pub fn is_left(&self) -> bool {
        self.our_entity == self.left_entity
    }

    pub fn our_side(&self) -> Side {
        Side::from_is_left(self.is_left())
    }

    pub fn peer(&self) -> EntityId {
        if self.is_left() {
            self.right_entity
        } else {
            self.left_entity
        }
    }

    fn peer_signer(&self) -> SignerId {
        SignerId(self.peer().0)
    }

    /// Queue a transaction for the next proposal.
    pub fn submit(&mut self, tx: AccountTx) {
        self.mempool.push(tx);
    }

    /// Capacity of `token` from our side's perspective.
    pub fn capacity(&self, token: TokenId) -> Result<Capacity, CanalError> {
        let delta = self
            .deltas
            .get(&token)
            .ok_or(CanalError::UnknownToken(token))?;
        delta.capacity(self.our_side())
    }

    pub fn delta(&self, token: TokenId) -> Option<&Delta> {
        self.deltas.get(&token)
    }

    // ── Proposing ────────────────────────────────────────────────────────────

    /// Drain the mempool into a signed frame proposal. No-op when the
    /// mempool is empty or a handshake is already in flight. If any
    /// transaction fails tentative application the whole proposal aborts
    /// and the mempool is left intact for the host to retry or evict.
    pub fn propose(
        &mut self,
        now: TimestampMs,
        keypair: &Keypair,
    ) -> Result<Option<AccountMsg>, CanalError> {
        if self.status != AccountStatus::Idle || self.mempool.is_empty() {
            return Ok(None);
        }
        let height = self.current_frame.height + 1;
        let (staged, token_ids) = self.execute(&self.mempool, height, now)?;
        let frame = self.build_frame(height, now, &self.mempool, &staged, token_ids)?;

        let sig = keypair.sign(&frame.state_hash);
        let cooperative_nonce = self.cooperative_nonce + 1;
        self.pending = Some(PendingProposal {
            frame: frame.clone(),
            staged,
            cooperative_nonce,
            sig: sig.clone(),
        });
        self.mempool.clear();
        self.status = AccountStatus::PendingOutbound;
        debug!(height, nonce = cooperative_nonce, "account frame proposed");
        Ok(Some(AccountMsg::Propose {
            frame,
            cooperative_nonce,
            sig,
        }))
    }

    /// Abandon an outbound proposal, returning its transactions to the
    /// mempool. Host-driven; the machine never times out by itself.
    pub fn cancel_proposal(&mut self) {
        if let Some(p) = self.pending.take() {
            let mut mempool = p.frame.account_txs;
            mempool.append(&mut self.mempool);
            self.mempool = mempool;
            self.status = AccountStatus::Idle;
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Feed a counterparty message through the state machine. Replay and
    /// staleness come back as errors in the replay class (the routing
    /// layer drops those without further effect); every failure leaves
    /// the machine exactly as it was.
    pub fn receive(
        &mut self,
        msg: AccountMsg,
        keypair: &Keypair,
    ) -> Result<Option<AccountMsg>, CanalError> {
        match msg {
            AccountMsg::Propose {
                frame,
                cooperative_nonce,
                sig,
            } => self.receive_propose(frame, cooperative_nonce, sig, keypair),
            AccountMsg::Ack { state_hash, sig } => self.receive_ack(state_hash, sig),
            AccountMsg::Commit { state_hash, sig } => self.receive_commit(state_hash, sig),
        }
    }

    fn receive_propose(
        &mut self,
        frame: AccountFrame,
        cooperative_nonce: u64,
        sig: Signature,
        keypair: &Keypair,
    ) -> Result<Option<AccountMsg>, CanalError> {
        match self.status {
            AccountStatus::PendingOutbound => {
                // Simultaneous proposals: left wins. As left we ignore the
                // inbound frame (the right side will discard its own and ack
                // ours); as right we discard ours and validate theirs.
                if self.is_left() {
                    debug!("simultaneous proposal: left side keeps its own");
                    return Ok(None);
                }
                debug!("simultaneous proposal: right side defers to left");
                self.cancel_proposal();
            }
            AccountStatus::PendingInbound => {
                let locked = self
                    .inbound
                    .as_ref()
                    .map(|i| i.frame.state_hash == frame.state_hash)
                    .unwrap_or(false);
                if locked {
                    // Duplicate delivery of a frame we already locked on.
                    let sig = keypair.sign(&frame.state_hash);
                    return Ok(Some(AccountMsg::Ack {
                        state_hash: frame.state_hash,
                        sig,
                    }));
                }
                return Err(CanalError::FrameMismatch {
                    expected: hex::encode(
                        self.inbound
                            .as_ref()
                            .map(|i| i.frame.state_hash)
                            .unwrap_or_default(),
                    ),
                    got: hex::encode(frame.state_hash),
                });
            }
            AccountStatus::Idle => {}
        }

        if frame.height <= self.current_frame.height {
            return Err(CanalError::StaleProposal {
                height: frame.height,
            });
        }
        if frame.height != self.current_frame.height + 1 {
            return Err(CanalError::HeightMismatch {
                expected: self.current_frame.height + 1,
                got: frame.height,
            });
        }
        if cooperative_nonce <= self.cooperative_nonce {
            return Err(CanalError::NonceRegression {
                have: self.cooperative_nonce,
                got: cooperative_nonce,
            });
        }
        if frame.previous_frame_hash != self.current_frame.state_hash {
            return Err(CanalError::HashChainMismatch {
                expected: hex::encode(self.current_frame.state_hash),
                got: hex::encode(frame.previous_frame_hash),
            });
        }
        verify(&frame.state_hash, &sig, &self.peer_signer())?;

        // Deterministic re-run against our own state must reproduce the
        // proposer's hash exactly; solvency is enforced inside execution.
        let (staged, token_ids) =
            self.execute(&frame.account_txs, frame.height, frame.timestamp)?;
        let check = self.build_frame(
            frame.height,
            frame.timestamp,
            &frame.account_txs,
            &staged,
            token_ids,
        )?;
        if check.state_hash != frame.state_hash {
            return Err(CanalError::FrameMismatch {
                expected: hex::encode(check.state_hash),
                got: hex::encode(frame.state_hash),
            });
        }

        let state_hash = frame.state_hash;
        self.inbound = Some(InboundProposal {
            frame,
            staged,
            cooperative_nonce,
        });
        self.status = AccountStatus::PendingInbound;
        let sig = keypair.sign(&state_hash);
        Ok(Some(AccountMsg::Ack { state_hash, sig }))
    }

    fn receive_ack(
        &mut self,
        state_hash: StateHash,
        sig: Signature,
    ) -> Result<Option<AccountMsg>, CanalError> {
        if self.status != AccountStatus::PendingOutbound {
            debug!("ack without outbound proposal dropped");
            return Ok(None);
        }
        let matches = self
            .pending
            .as_ref()
            .map(|p| p.frame.state_hash == state_hash)
            .unwrap_or(false);
        if !matches {
            return Err(CanalError::FrameMismatch {
                expected: hex::encode(
                    self.pending
                        .as_ref()
                        .map(|p| p.frame.state_hash)
                        .unwrap_or_default(),
                ),
                got: hex::encode(state_hash),
            });
        }
        verify(&state_hash, &sig, &self.peer_signer())?;

        let Some(p) = self.pending.take() else {
            return Ok(None);
        };
        let our_sig = p.sig.clone();
        self.commit(p.frame, p.staged, p.cooperative_nonce);
        Ok(Some(AccountMsg::Commit {
            state_hash,
            sig: our_sig,
        }))
    }

    fn receive_commit(
        &mut self,
        state_hash: StateHash,
        sig: Signature,
    ) -> Result<Option<AccountMsg>, CanalError> {
        if self.status != AccountStatus::PendingInbound {
            debug!("commit without locked frame dropped");
            return Ok(None);
        }
        let matches = self
            .inbound
            .as_ref()
            .map(|i| i.frame.state_hash == state_hash)
            .unwrap_or(false);
        if !matches {
            return Err(CanalError::FrameMismatch {
                expected: hex::encode(
                    self.inbound
                        .as_ref()
                        .map(|i| i.frame.state_hash)
                        .unwrap_or_default(),
                ),
                got: hex::encode(state_hash),
            });
        }
        verify(&state_hash, &sig, &self.peer_signer())?;

        let Some(i) = self.inbound.take() else {
            return Ok(None);
        };
        self.commit(i.frame, i.staged, i.cooperative_nonce);
        Ok(None)
    }

    fn commit(&mut self, frame: AccountFrame, staged: StagedState, cooperative_nonce: u64) {
        self.deltas = staged.deltas;
        self.locks = staged.locks;
        self.cooperative_nonce = cooperative_nonce;
        self.history.push_back(frame.clone());
        while self.history.len() > MAX_FRAME_HISTORY {
            self.history.pop_front();
        }
        info!(
            height = frame.height,
            nonce = cooperative_nonce,
            "account frame committed"
        );
        self.current_frame = frame;
        self.status = AccountStatus::Idle;
        self.pending = None;
        self.inbound = None;
    }

    // ── Settlement ───────────────────────────────────────────────────────────

    /// Apply one committed settlement component to a token's delta. Called
    /// with identical arguments on both sides once the jurisdiction layer
    /// has processed the diff.
    pub fn apply_settlement(
        &mut self,
        token: TokenId,
        collateral_diff: i128,
        ondelta_diff: i128,
    ) -> Result<(), CanalError> {
        let delta = self.deltas.entry(token).or_default();
        delta.apply_settlement(collateral_diff, ondelta_diff)
    }

    // ── Execution ────────────────────────────────────────────────────────────

    fn execute(
        &self,
        txs: &[AccountTx],
        height: Height,
        now: TimestampMs,
    ) -> Result<(StagedState, Vec<TokenId>), CanalError> {
        let mut staged = StagedState {
            deltas: self.deltas.clone(),
            locks: self.locks.clone(),
        };
        let mut touched = BTreeSet::new();
        for tx in txs {
            touched.insert(apply_tx(&mut staged, tx, height, now)?);
        }
        Ok((staged, touched.into_iter().collect()))
    }

    fn build_frame(
        &self,
        height: Height,
        timestamp: TimestampMs,
        txs: &[AccountTx],
        staged: &StagedState,
        token_ids: Vec<TokenId>,
    ) -> Result<AccountFrame, CanalError> {
        let mut deltas = Vec::with_capacity(token_ids.len());
        for token in &token_ids {
            let delta = staged
                .deltas
                .get(token)
                .ok_or(CanalError::UnknownToken(*token))?;
            deltas.push(delta.total()?);
        }
        Ok(AccountFrame {
            height,
            timestamp,
            previous_frame_hash: self.current_frame.state_hash,
            state_hash: [0; 32],
            token_ids,
            deltas,
            account_txs: txs.to_vec(),
        }
        .seal())
    }
}

// ── Transaction application ──────────────────────────────────────────────────

fn apply_tx(
    staged: &mut StagedState,
    tx: &AccountTx,
    height: Height,
    now: TimestampMs,
) -> Result<TokenId, CanalError> {
    match tx {
        AccountTx::OpenChannel {
            token_id,
            left_credit_limit,
            right_credit_limit,
        } => {
            if staged.deltas.contains_key(token_id) {
                return Err(CanalError::ChannelExists(*token_id));
            }
            staged
                .deltas
                .insert(*token_id, Delta::new(*left_credit_limit, *right_credit_limit));
            Ok(*token_id)
        }

        AccountTx::DirectPayment {
            token_id,
            amount,
            from_left,
        } => {
            let delta = staged
                .deltas
                .get_mut(token_id)
                .ok_or(CanalError::UnknownToken(*token_id))?;
            delta.apply(Side::from_is_left(*from_left), *amount)?;
            Ok(*token_id)
        }

        AccountTx::HtlcLock {
            lock_id,
            token_id,
            amount,
            hashlock,
            timelock_ms,
            reveal_before_height,
            sender_is_left,
        } => {
            if *amount == 0 {
                return Err(CanalError::ZeroAmount);
            }
            if staged.locks.contains_key(lock_id) {
                return Err(CanalError::DuplicateLock(lock_id.to_hex()));
            }
            let delta = staged
                .deltas
                .get_mut(token_id)
                .ok_or(CanalError::UnknownToken(*token_id))?;
            delta.add_hold(Side::from_is_left(*sender_is_left), *amount)?;
            staged.locks.insert(
                *lock_id,
                HtlcLock {
                    lock_id: *lock_id,
                    hashlock: *hashlock,
                    timelock_ms: *timelock_ms,
                    reveal_before_height: *reveal_before_height,
                    amount: *amount,
                    token_id: *token_id,
                    sender_is_left: *sender_is_left,
                    created_height: height,
                    created_timestamp: now,
                },
            );
            Ok(*token_id)
        }

        AccountTx::HtlcResolve { lock_id, outcome } => {
            // Removal doubles as the one-outcome guard: a second resolve
            // finds no lock.
            let lock = staged
                .locks
                .remove(lock_id)
                .ok_or_else(|| CanalError::UnknownLock(lock_id.to_hex()))?;
            let side = Side::from_is_left(lock.sender_is_left);
            let delta = staged
                .deltas
                .get_mut(&lock.token_id)
                .ok_or(CanalError::UnknownToken(lock.token_id))?;
            match outcome {
                HtlcOutcome::Secret { preimage } => {
                    if sha256(preimage) != lock.hashlock {
                        return Err(CanalError::BadPreimage);
                    }
                    if lock.expired(now, height) {
                        return Err(CanalError::LockExpired);
                    }
                    delta.release_hold(side, lock.amount)?;
                    delta.apply(side, lock.amount)?;
                }
                HtlcOutcome::Timeout => {
                    if !lock.expired(now, height) {
                        return Err(CanalError::LockNotExpired);
                    }
                    delta.release_hold(side, lock.amount)?;
                    warn!(lock = %lock.lock_id, "htlc timed out; hold released");
                }
            }
            Ok(lock.token_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canal_core::types::LockId;

    const USD: TokenId = 1;

    struct Pair {
        a: AccountMachine,
        b: AccountMachine,
        kp_a: Keypair,
        kp_b: Keypair,
    }

    /// Two machines for the same canonical account, entity ids derived from
    /// the signing keys so signature verification works both ways.
    fn pair() -> Pair {
        let kp_a = Keypair::from_seed(b"alice");
        let kp_b = Keypair::from_seed(b"bob");
        let ea = EntityId::from_signer(kp_a.signer_id);
        let eb = EntityId::from_signer(kp_b.signer_id);
        Pair {
            a: AccountMachine::new(ea, eb),
            b: AccountMachine::new(eb, ea),
            kp_a,
            kp_b,
        }
    }

    /// Drive one full propose → ack → commit cycle from `a`'s side.
    fn settle_round(p: &mut Pair, now: TimestampMs) {
        let propose = p.a.propose(now, &p.kp_a).unwrap().expect("proposal");
        let ack = p.b.receive(propose, &p.kp_b).unwrap().expect("ack");
        let commit = p.a.receive(ack, &p.kp_a).unwrap().expect("commit");
        assert!(p.b.receive(commit, &p.kp_b).unwrap().is_none());
    }

    fn open_channel(p: &mut Pair, limit: u128) {
        p.a.submit(AccountTx::OpenChannel {
            token_id: USD,
            left_credit_limit: limit,
            right_credit_limit: limit,
        });
        settle_round(p, 1_000);
    }

    #[test]
    fn payment_cycle_converges_both_sides() {
        let mut p = pair();
        open_channel(&mut p, 10_000);

        // `a` pays 100 regardless of which canonical side it is.
        p.a.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 100,
            from_left: p.a.is_left(),
        });
        settle_round(&mut p, 2_000);

        assert_eq!(p.a.current_frame.state_hash, p.b.current_frame.state_hash);
        assert_eq!(p.a.cooperative_nonce, p.b.cooperative_nonce);
        assert_eq!(p.a.deltas, p.b.deltas);
        assert_eq!(p.a.current_frame.height, 2);

        let expected_offdelta = if p.a.is_left() { -100 } else { 100 };
        assert_eq!(p.a.delta(USD).unwrap().offdelta, expected_offdelta);
        assert_eq!(p.a.capacity(USD).unwrap().max_send, 9_900);
        assert_eq!(p.b.capacity(USD).unwrap().max_send, 10_100);

        // An equal payment back restores the balance.
        p.b.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 100,
            from_left: p.b.is_left(),
        });
        let propose = p.b.propose(3_000, &p.kp_b).unwrap().expect("proposal");
        let ack = p.a.receive(propose, &p.kp_a).unwrap().expect("ack");
        let commit = p.b.receive(ack, &p.kp_b).unwrap().expect("commit");
        assert!(p.a.receive(commit, &p.kp_a).unwrap().is_none());
        assert_eq!(p.a.delta(USD).unwrap().offdelta, 0);
        assert_eq!(p.a.capacity(USD).unwrap().max_send, 10_000);
    }

    #[test]
    fn overspend_aborts_proposal_and_keeps_mempool() {
        let mut p = pair();
        open_channel(&mut p, 1_000);
        p.a.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 5_000,
            from_left: p.a.is_left(),
        });
        let err = p.a.propose(2_000, &p.kp_a).unwrap_err();
        assert!(matches!(err, CanalError::SolvencyViolation { .. }));
        assert_eq!(p.a.mempool.len(), 1, "failed tx must survive in mempool");
        assert_eq!(p.a.status, AccountStatus::Idle);
        assert_eq!(p.a.current_frame.height, 1);
    }

    #[test]
    fn simultaneous_proposals_left_wins() {
        let mut p = pair();
        open_channel(&mut p, 10_000);

        p.a.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 10,
            from_left: p.a.is_left(),
        });
        p.b.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 20,
            from_left: p.b.is_left(),
        });

        let prop_a = p.a.propose(2_000, &p.kp_a).unwrap().expect("a proposes");
        let prop_b = p.b.propose(2_000, &p.kp_b).unwrap().expect("b proposes");

        let (left, right, kp_left, kp_right, left_prop, right_prop) = if p.a.is_left() {
            (&mut p.a, &mut p.b, &p.kp_a, &p.kp_b, prop_a, prop_b)
        } else {
            (&mut p.b, &mut p.a, &p.kp_b, &p.kp_a, prop_b, prop_a)
        };

        // Left ignores right's frame; right defers and acks left's.
        assert!(left.receive(right_prop, kp_left).unwrap().is_none());
        let ack = right.receive(left_prop, kp_right).unwrap().expect("ack");
        let commit = left.receive(ack, kp_left).unwrap().expect("commit");
        assert!(right.receive(commit, kp_right).unwrap().is_none());

        assert_eq!(left.current_frame.height, 2);
        assert_eq!(left.current_frame.state_hash, right.current_frame.state_hash);
        // Right's discarded payment is requeued, not lost.
        assert_eq!(right.mempool.len(), 1);
    }

    #[test]
    fn tampered_frame_is_rejected_and_state_unchanged() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 100,
            from_left: p.a.is_left(),
        });
        let msg = p.a.propose(2_000, &p.kp_a).unwrap().expect("proposal");
        let AccountMsg::Propose {
            mut frame,
            cooperative_nonce,
            sig,
        } = msg
        else {
            panic!("expected proposal");
        };
        frame.deltas[0] += 1;
        let before_nonce = p.b.cooperative_nonce;
        let err = p
            .b
            .receive(
                AccountMsg::Propose {
                    frame,
                    cooperative_nonce,
                    sig,
                },
                &p.kp_b,
            )
            .unwrap_err();
        assert!(matches!(err, CanalError::FrameMismatch { .. }));
        assert_eq!(p.b.status, AccountStatus::Idle);
        assert_eq!(p.b.cooperative_nonce, before_nonce);
    }

    #[test]
    fn stale_and_replayed_proposals_are_dropped_silently() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(AccountTx::DirectPayment {
            token_id: USD,
            amount: 100,
            from_left: p.a.is_left(),
        });
        let propose = p.a.propose(2_000, &p.kp_a).unwrap().expect("proposal");
        let ack = p.b.receive(propose.clone(), &p.kp_b).unwrap().expect("ack");
        let commit = p.a.receive(ack, &p.kp_a).unwrap().expect("commit");
        assert!(p.b.receive(commit, &p.kp_b).unwrap().is_none());

        // Replaying the already-committed proposal is rejected as stale
        // (the routing layer drops this class without logging an error)
        // and leaves the committed state untouched.
        let err = p.b.receive(propose, &p.kp_b).unwrap_err();
        assert!(err.is_replay());
        assert_eq!(p.b.current_frame.height, 2);
        assert_eq!(p.b.status, AccountStatus::Idle);
    }

    // ── HTLC ─────────────────────────────────────────────────────────────────

    fn lock_tx(p: &Pair, preimage: &[u8], timelock_ms: TimestampMs) -> AccountTx {
        AccountTx::HtlcLock {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            token_id: USD,
            amount: 100,
            hashlock: sha256(preimage),
            timelock_ms,
            reveal_before_height: 100,
            sender_is_left: p.a.is_left(),
        }
    }

    #[test]
    fn htlc_secret_resolution_transfers_the_amount() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(lock_tx(&p, b"secret", 1_000_000));
        settle_round(&mut p, 2_000);

        assert_eq!(p.a.locks.len(), 1);
        let sender_cap = p.a.capacity(USD).unwrap();
        assert_eq!(sender_cap.max_send, 9_900, "hold reserves the amount");

        p.a.submit(AccountTx::HtlcResolve {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            outcome: HtlcOutcome::Secret {
                preimage: b"secret".to_vec(),
            },
        });
        settle_round(&mut p, 3_000);

        assert!(p.a.locks.is_empty());
        assert_eq!(p.a.deltas, p.b.deltas);
        let expected = if p.a.is_left() { -100 } else { 100 };
        assert_eq!(p.a.delta(USD).unwrap().offdelta, expected);
        assert_eq!(p.a.capacity(USD).unwrap().max_send, 9_900);
        assert_eq!(p.b.capacity(USD).unwrap().max_send, 10_100);
    }

    #[test]
    fn htlc_timeout_refunds_the_hold() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(lock_tx(&p, b"secret", 2_500));
        settle_round(&mut p, 2_000);

        // Too early: timeout resolution must be rejected.
        p.a.submit(AccountTx::HtlcResolve {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            outcome: HtlcOutcome::Timeout,
        });
        let err = p.a.propose(2_400, &p.kp_a).unwrap_err();
        assert!(matches!(err, CanalError::LockNotExpired));
        assert_eq!(p.a.mempool.len(), 1);

        // Past the timelock the hold comes back without a transfer.
        let propose = p.a.propose(3_000, &p.kp_a).unwrap().expect("proposal");
        let ack = p.b.receive(propose, &p.kp_b).unwrap().expect("ack");
        let commit = p.a.receive(ack, &p.kp_a).unwrap().expect("commit");
        assert!(p.b.receive(commit, &p.kp_b).unwrap().is_none());

        assert!(p.a.locks.is_empty());
        assert_eq!(p.a.delta(USD).unwrap().offdelta, 0);
        assert_eq!(p.a.capacity(USD).unwrap().max_send, 10_000);
    }

    #[test]
    fn htlc_wrong_preimage_and_double_resolve_rejected() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(lock_tx(&p, b"secret", 1_000_000));
        settle_round(&mut p, 2_000);

        // Wrong preimage.
        p.a.submit(AccountTx::HtlcResolve {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            outcome: HtlcOutcome::Secret {
                preimage: b"wrong".to_vec(),
            },
        });
        let err = p.a.propose(3_000, &p.kp_a).unwrap_err();
        assert!(matches!(err, CanalError::BadPreimage));
        p.a.mempool.clear();

        // Correct claim commits.
        p.a.submit(AccountTx::HtlcResolve {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            outcome: HtlcOutcome::Secret {
                preimage: b"secret".to_vec(),
            },
        });
        settle_round(&mut p, 4_000);

        // A second resolve finds no lock.
        p.a.submit(AccountTx::HtlcResolve {
            lock_id: LockId::from_bytes(sha256(b"lock-1")),
            outcome: HtlcOutcome::Timeout,
        });
        let err = p.a.propose(5_000, &p.kp_a).unwrap_err();
        assert!(matches!(err, CanalError::UnknownLock(_)));
    }

    #[test]
    fn duplicate_lock_id_rejected() {
        let mut p = pair();
        open_channel(&mut p, 10_000);
        p.a.submit(lock_tx(&p, b"one", 1_000_000));
        settle_round(&mut p, 2_000);
        p.a.submit(lock_tx(&p, b"two", 1_000_000));
        let err = p.a.propose(3_000, &p.kp_a).unwrap_err();
        assert!(matches!(err, CanalError::DuplicateLock(_)));
    }
}
