//! Per-token bilateral account state and its solvency invariant.
//!
//! A [`Delta`] tracks one token on one bilateral account. The combined
//! position `Δ = ondelta + offdelta` must satisfy
//! `-left_credit_limit <= Δ <= collateral + right_credit_limit` after every
//! mutation. Mutations that would leave the bound are rejected and leave the
//! delta untouched; nothing is ever clamped.

use serde::{Deserialize, Serialize};

use crate::error::CanalError;
use crate::types::{Amount, SignedAmount};

/// Which party of the canonical pair an operation acts for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn from_is_left(is_left: bool) -> Side {
        if is_left {
            Side::Left
        } else {
            Side::Right
        }
    }
}

/// Spendable/receivable projection for one side of a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub max_send: Amount,
    pub max_receive: Amount,
}

/// One token's state on a bilateral account.
///
/// `ondelta` moves only through settlement; `offdelta` moves through signed
/// account frames. The hold fields reserve capacity for in-flight HTLCs so
/// that a later secret resolution can never violate the solvency bound.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub collateral: Amount,
    pub ondelta: SignedAmount,
    pub offdelta: SignedAmount,
    pub left_credit_limit: Amount,
    pub right_credit_limit: Amount,
    pub left_allowance: Amount,
    pub right_allowance: Amount,
    pub left_hold: Amount,
    pub right_hold: Amount,
}

fn to_i128(a: Amount) -> Result<i128, CanalError> {
    i128::try_from(a).map_err(|_| CanalError::AmountOverflow)
}

impl Delta {
    pub fn new(left_credit_limit: Amount, right_credit_limit: Amount) -> Self {
        Self {
            left_credit_limit,
            right_credit_limit,
            ..Self::default()
        }
    }

    /// Combined position `Δ = ondelta + offdelta`.
    pub fn total(&self) -> Result<SignedAmount, CanalError> {
        self.ondelta
            .checked_add(self.offdelta)
            .ok_or(CanalError::AmountOverflow)
    }

    fn floor(&self) -> Result<i128, CanalError> {
        Ok(-to_i128(self.left_credit_limit)?)
    }

    fn ceiling(&self) -> Result<i128, CanalError> {
        to_i128(self.collateral)?
            .checked_add(to_i128(self.right_credit_limit)?)
            .ok_or(CanalError::AmountOverflow)
    }

    /// The solvency invariant: `-Lₗ <= Δ <= C + Lᵣ`.
    pub fn validate(&self) -> Result<(), CanalError> {
        let total = self.total()?;
        let floor = self.floor()?;
        let ceiling = self.ceiling()?;
        if total < floor || total > ceiling {
            return Err(CanalError::SolvencyViolation {
                delta: total,
                floor,
                ceiling,
            });
        }
        Ok(())
    }

    /// Bounds tightened by outstanding holds: the holder's future secret
    /// resolutions must still fit.
    fn hold_bounds(&self) -> Result<(i128, i128), CanalError> {
        let floor = self
            .floor()?
            .checked_add(to_i128(self.left_hold)?)
            .ok_or(CanalError::AmountOverflow)?;
        let ceiling = self
            .ceiling()?
            .checked_sub(to_i128(self.right_hold)?)
            .ok_or(CanalError::AmountOverflow)?;
        Ok((floor, ceiling))
    }

    /// Move `amount` off-chain from `side` to its counterparty. Rejected
    /// (with `self` untouched) if the new position would leave the bound.
    pub fn apply(&mut self, side: Side, amount: Amount) -> Result<(), CanalError> {
        if amount == 0 {
            return Err(CanalError::ZeroAmount);
        }
        let a = to_i128(amount)?;
        let total = self.total()?;
        let tentative = match side {
            Side::Left => total.checked_sub(a),
            Side::Right => total.checked_add(a),
        }
        .ok_or(CanalError::AmountOverflow)?;

        let (floor, ceiling) = self.hold_bounds()?;
        if tentative < floor || tentative > ceiling {
            return Err(CanalError::SolvencyViolation {
                delta: tentative,
                floor,
                ceiling,
            });
        }

        self.offdelta = match side {
            Side::Left => self.offdelta.checked_sub(a),
            Side::Right => self.offdelta.checked_add(a),
        }
        .ok_or(CanalError::AmountOverflow)?;
        Ok(())
    }

    /// Capacity projection from `side`'s perspective. Sending moves the
    /// position toward that side's credit bound, so for the left side
    /// `max_send = Δ + Lₗ - left_hold` and `max_receive = C + Lᵣ - Δ -
    /// right_hold`; mirrored for the right.
    pub fn capacity(&self, side: Side) -> Result<Capacity, CanalError> {
        let total = self.total()?;
        let (floor, ceiling) = self.hold_bounds()?;
        let down = total.saturating_sub(floor).max(0) as u128;
        let up = ceiling.saturating_sub(total).max(0) as u128;
        Ok(match side {
            Side::Left => Capacity {
                max_send: down,
                max_receive: up,
            },
            Side::Right => Capacity {
                max_send: up,
                max_receive: down,
            },
        })
    }

    /// Reserve `amount` of `side`'s send capacity for an in-flight HTLC.
    pub fn add_hold(&mut self, side: Side, amount: Amount) -> Result<(), CanalError> {
        let cap = self.capacity(side)?;
        if cap.max_send < amount {
            return Err(CanalError::InsufficientCapacity {
                need: amount,
                have: cap.max_send,
            });
        }
        let hold = match side {
            Side::Left => &mut self.left_hold,
            Side::Right => &mut self.right_hold,
        };
        *hold = hold.checked_add(amount).ok_or(CanalError::AmountOverflow)?;
        Ok(())
    }

    /// Release a previously reserved hold.
    pub fn release_hold(&mut self, side: Side, amount: Amount) -> Result<(), CanalError> {
        let hold = match side {
            Side::Left => &mut self.left_hold,
            Side::Right => &mut self.right_hold,
        };
        *hold = hold.checked_sub(amount).ok_or(CanalError::AmountOverflow)?;
        Ok(())
    }

    /// Apply a settlement's collateral and on-chain components. The whole
    /// diff is rejected if the resulting position would violate the bound.
    pub fn apply_settlement(
        &mut self,
        collateral_diff: i128,
        ondelta_diff: i128,
    ) -> Result<(), CanalError> {
        let collateral = to_i128(self.collateral)?
            .checked_add(collateral_diff)
            .ok_or(CanalError::AmountOverflow)?;
        let collateral =
            u128::try_from(collateral).map_err(|_| CanalError::AmountOverflow)?;
        let ondelta = self
            .ondelta
            .checked_add(ondelta_diff)
            .ok_or(CanalError::AmountOverflow)?;

        let mut next = self.clone();
        next.collateral = collateral;
        next.ondelta = ondelta;
        next.validate()?;
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(limit: u128) -> Delta {
        Delta::new(limit, limit)
    }

    #[test]
    fn apply_moves_offdelta_within_bounds() {
        let mut d = delta(10_000);
        d.apply(Side::Left, 100).unwrap();
        assert_eq!(d.offdelta, -100);
        d.apply(Side::Right, 100).unwrap();
        assert_eq!(d.offdelta, 0);
        d.validate().unwrap();
    }

    #[test]
    fn violating_apply_is_rejected_not_clamped() {
        let mut d = delta(10_000);
        d.apply(Side::Left, 10_000).unwrap();
        let before = d.clone();
        let err = d.apply(Side::Left, 1).unwrap_err();
        assert!(matches!(err, CanalError::SolvencyViolation { .. }));
        assert_eq!(d, before, "rejected mutation must leave state unchanged");
    }

    #[test]
    fn capacity_matches_worked_example() {
        // collateral 0, both limits 10_000, left has sent 100.
        let mut d = delta(10_000);
        d.apply(Side::Left, 100).unwrap();
        let left = d.capacity(Side::Left).unwrap();
        let right = d.capacity(Side::Right).unwrap();
        assert_eq!(left.max_send, 9_900);
        assert_eq!(left.max_receive, 10_100);
        assert_eq!(right.max_send, 10_100);
        assert_eq!(right.max_receive, 9_900);
    }

    #[test]
    fn collateral_raises_the_ceiling() {
        let mut d = Delta::new(100, 0);
        d.collateral = 500;
        // Right may push the position up to collateral + its (zero) limit.
        d.apply(Side::Right, 500).unwrap();
        assert!(d.apply(Side::Right, 1).is_err());
        // Left may still borrow against its credit limit.
        d.apply(Side::Left, 600).unwrap();
        assert_eq!(d.total().unwrap(), -100);
    }

    #[test]
    fn holds_tighten_send_capacity() {
        let mut d = delta(1_000);
        d.add_hold(Side::Left, 600).unwrap();
        assert_eq!(d.capacity(Side::Left).unwrap().max_send, 400);
        // The reserved portion is not spendable.
        assert!(d.apply(Side::Left, 500).is_err());
        d.apply(Side::Left, 400).unwrap();
        // Releasing the hold and applying the shift mirrors a secret claim.
        d.release_hold(Side::Left, 600).unwrap();
        d.apply(Side::Left, 600).unwrap();
        assert_eq!(d.total().unwrap(), -1_000);
        d.validate().unwrap();
    }

    #[test]
    fn oversized_hold_is_rejected() {
        let mut d = delta(1_000);
        let err = d.add_hold(Side::Left, 1_001).unwrap_err();
        assert!(matches!(err, CanalError::InsufficientCapacity { .. }));
        assert_eq!(d.left_hold, 0);
    }

    #[test]
    fn settlement_respects_bound() {
        let mut d = Delta::new(0, 0);
        d.apply_settlement(100, 100).unwrap();
        assert_eq!(d.collateral, 100);
        assert_eq!(d.ondelta, 100);
        // Withdrawing collateral the position depends on must fail whole.
        let before = d.clone();
        assert!(d.apply_settlement(-100, 0).is_err());
        assert_eq!(d, before);
    }

    #[test]
    fn zero_amount_rejected() {
        let mut d = delta(10);
        assert!(matches!(
            d.apply(Side::Left, 0),
            Err(CanalError::ZeroAmount)
        ));
    }
}
