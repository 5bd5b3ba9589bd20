use std::collections::BTreeMap;

use canal_core::error::CanalError;
use canal_core::types::{Amount, EntityId, TokenId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::diff::SettlementDiff;
use crate::Jurisdiction;

/// In-memory settlement layer for tests and simulation.
///
/// Tracks reserves per (entity, token) and collateral per canonical pair
/// and token. Settlement batches apply all-or-nothing: every diff is
/// validated against staged balances before anything is written back.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MockJurisdiction {
    next_ordinal: u64,
    entities: BTreeMap<EntityId, (u64, [u8; 32])>,
    reserves: BTreeMap<(EntityId, TokenId), Amount>,
    collateral: BTreeMap<(EntityId, EntityId, TokenId), Amount>,
}

impl MockJurisdiction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a reserve directly (genesis / faucet path, not a settlement).
    pub fn fund(&mut self, entity: EntityId, token: TokenId, amount: Amount) {
        *self.reserves.entry((entity, token)).or_default() += amount;
    }

    pub fn collateral(&self, left: &EntityId, right: &EntityId, token: TokenId) -> Amount {
        self.collateral
            .get(&(*left, *right, token))
            .copied()
            .unwrap_or(0)
    }

    fn apply_signed(
        balance: Amount,
        delta: i128,
    ) -> Result<Amount, CanalError> {
        if delta >= 0 {
            balance
                .checked_add(delta.unsigned_abs())
                .ok_or(CanalError::AmountOverflow)
        } else {
            let need = delta.unsigned_abs();
            balance
                .checked_sub(need)
                .ok_or(CanalError::InsufficientReserve { need, have: balance })
        }
    }
}

impl Jurisdiction for MockJurisdiction {
    fn register_entity(
        &mut self,
        entity: EntityId,
        board_digest: [u8; 32],
    ) -> Result<u64, CanalError> {
        if let Some((ordinal, _)) = self.entities.get(&entity) {
            return Ok(*ordinal);
        }
        self.next_ordinal += 1;
        let ordinal = self.next_ordinal;
        self.entities.insert(entity, (ordinal, board_digest));
        info!(%entity, ordinal, "entity registered");
        Ok(ordinal)
    }

    fn get_reserve(&self, entity: &EntityId, token: TokenId) -> Amount {
        self.reserves.get(&(*entity, token)).copied().unwrap_or(0)
    }

    fn update_reserve(
        &mut self,
        entity: &EntityId,
        token: TokenId,
        delta: i128,
    ) -> Result<(), CanalError> {
        let balance = self.get_reserve(entity, token);
        let next = Self::apply_signed(balance, delta)?;
        self.reserves.insert((*entity, token), next);
        Ok(())
    }

    fn process_settlement(
        &mut self,
        left: &EntityId,
        right: &EntityId,
        diffs: &[SettlementDiff],
    ) -> Result<(), CanalError> {
        if left >= right {
            return Err(CanalError::NonCanonicalOrder);
        }
        for entity in [left, right] {
            if !self.entities.contains_key(entity) {
                return Err(CanalError::NotRegistered(entity.to_hex()));
            }
        }

        // Stage everything first so a failing diff leaves nothing applied.
        let mut staged_reserves: BTreeMap<(EntityId, TokenId), Amount> = BTreeMap::new();
        let mut staged_collateral: BTreeMap<(EntityId, EntityId, TokenId), Amount> =
            BTreeMap::new();

        for diff in diffs {
            diff.check_conservation()?;

            let lkey = (*left, diff.token_id);
            let lbal = *staged_reserves
                .entry(lkey)
                .or_insert_with(|| self.get_reserve(left, diff.token_id));
            staged_reserves.insert(lkey, Self::apply_signed(lbal, diff.left_diff)?);

            let rkey = (*right, diff.token_id);
            let rbal = *staged_reserves
                .entry(rkey)
                .or_insert_with(|| self.get_reserve(right, diff.token_id));
            staged_reserves.insert(rkey, Self::apply_signed(rbal, diff.right_diff)?);

            let ckey = (*left, *right, diff.token_id);
            let cbal = *staged_collateral
                .entry(ckey)
                .or_insert_with(|| self.collateral(left, right, diff.token_id));
            staged_collateral.insert(
                ckey,
                Self::apply_signed(cbal, diff.collateral_diff).map_err(|_| {
                    CanalError::SettlementRejected("collateral underflow".into())
                })?,
            );
        }

        for (key, value) in staged_reserves {
            self.reserves.insert(key, value);
        }
        for (key, value) in staged_collateral {
            self.collateral.insert(key, value);
        }
        debug!(%left, %right, diffs = diffs.len(), "settlement processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (EntityId, EntityId) {
        (EntityId::from_bytes([1; 20]), EntityId::from_bytes([2; 20]))
    }

    fn registered(l: EntityId, r: EntityId) -> MockJurisdiction {
        let mut j = MockJurisdiction::new();
        j.register_entity(l, [0; 32]).unwrap();
        j.register_entity(r, [0; 32]).unwrap();
        j
    }

    #[test]
    fn deposit_moves_reserve_into_collateral() {
        let (l, r) = pair();
        let mut j = registered(l, r);
        j.fund(l, 1, 1_000);

        let diff = SettlementDiff::deposit(1, true, 400).unwrap();
        j.process_settlement(&l, &r, &[diff]).unwrap();

        assert_eq!(j.get_reserve(&l, 1), 600);
        assert_eq!(j.get_reserve(&r, 1), 0);
        assert_eq!(j.collateral(&l, &r, 1), 400);
    }

    #[test]
    fn unregistered_pair_is_rejected() {
        let (l, r) = pair();
        let mut j = MockJurisdiction::new();
        j.fund(l, 1, 1_000);
        let diff = SettlementDiff::deposit(1, true, 1).unwrap();
        assert!(matches!(
            j.process_settlement(&l, &r, &[diff]),
            Err(CanalError::NotRegistered(_))
        ));
    }

    #[test]
    fn insufficient_reserve_rejects_the_whole_batch() {
        let (l, r) = pair();
        let mut j = registered(l, r);
        j.fund(l, 1, 100);

        let ok = SettlementDiff::deposit(1, true, 80).unwrap();
        let too_big = SettlementDiff::deposit(1, true, 50).unwrap();
        let err = j.process_settlement(&l, &r, &[ok, too_big]).unwrap_err();
        assert!(matches!(err, CanalError::InsufficientReserve { .. }));
        // Nothing applied.
        assert_eq!(j.get_reserve(&l, 1), 100);
        assert_eq!(j.collateral(&l, &r, 1), 0);
    }

    #[test]
    fn non_canonical_order_rejected() {
        let (l, r) = pair();
        let mut j = MockJurisdiction::new();
        let diff = SettlementDiff::deposit(1, true, 1).unwrap();
        assert!(matches!(
            j.process_settlement(&r, &l, &[diff]),
            Err(CanalError::NonCanonicalOrder)
        ));
    }

    #[test]
    fn registration_is_idempotent_per_entity() {
        let (l, r) = pair();
        let mut j = MockJurisdiction::new();
        let a = j.register_entity(l, [0; 32]).unwrap();
        let b = j.register_entity(r, [0; 32]).unwrap();
        assert_ne!(a, b);
        assert_eq!(j.register_entity(l, [0; 32]).unwrap(), a);
    }

    #[test]
    fn update_reserve_rejects_overdraft() {
        let (l, _) = pair();
        let mut j = MockJurisdiction::new();
        j.fund(l, 1, 10);
        j.update_reserve(&l, 1, -10).unwrap();
        assert!(j.update_reserve(&l, 1, -1).is_err());
        assert_eq!(j.get_reserve(&l, 1), 0);
    }
}
