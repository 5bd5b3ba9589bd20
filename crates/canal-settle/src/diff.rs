use canal_core::error::CanalError;
use canal_core::types::{Amount, TokenId};
use serde::{Deserialize, Serialize};

/// One token's settlement movement between a pair's reserves and their
/// shared collateral. Constructed only through [`SettlementDiff::new`],
/// which enforces the conservation law
/// `left_diff + right_diff + collateral_diff == 0`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementDiff {
    pub token_id: TokenId,
    pub left_diff: i128,
    pub right_diff: i128,
    pub collateral_diff: i128,
    pub ondelta_diff: i128,
}

impl SettlementDiff {
    pub fn new(
        token_id: TokenId,
        left_diff: i128,
        right_diff: i128,
        collateral_diff: i128,
        ondelta_diff: i128,
    ) -> Result<Self, CanalError> {
        let diff = Self {
            token_id,
            left_diff,
            right_diff,
            collateral_diff,
            ondelta_diff,
        };
        diff.check_conservation()?;
        Ok(diff)
    }

    pub fn conserves(&self) -> bool {
        self.left_diff
            .checked_add(self.right_diff)
            .and_then(|s| s.checked_add(self.collateral_diff))
            == Some(0)
    }

    pub fn check_conservation(&self) -> Result<(), CanalError> {
        if !self.conserves() {
            return Err(CanalError::ConservationViolation {
                left: self.left_diff,
                right: self.right_diff,
                collateral: self.collateral_diff,
            });
        }
        Ok(())
    }

    /// Move `amount` from one side's reserve into the pair's collateral.
    /// The funding side's on-chain position grows with its deposit.
    pub fn deposit(token_id: TokenId, from_left: bool, amount: Amount) -> Result<Self, CanalError> {
        let a = i128::try_from(amount).map_err(|_| CanalError::AmountOverflow)?;
        let (left, right, ondelta) = if from_left {
            (-a, 0, a)
        } else {
            (0, -a, 0)
        };
        Self::new(token_id, left, right, a, ondelta)
    }

    /// Return `amount` of collateral to one side's reserve, shrinking that
    /// side's on-chain position accordingly.
    pub fn withdraw(token_id: TokenId, to_left: bool, amount: Amount) -> Result<Self, CanalError> {
        let a = i128::try_from(amount).map_err(|_| CanalError::AmountOverflow)?;
        let (left, right, ondelta) = if to_left {
            (a, 0, -a)
        } else {
            (0, a, 0)
        };
        Self::new(token_id, left, right, -a, ondelta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_rejects_non_conserving_diffs() {
        assert!(SettlementDiff::new(1, -100, 0, 99, 0).is_err());
        assert!(SettlementDiff::new(1, -100, 0, 100, 0).is_ok());
        assert!(SettlementDiff::new(1, -50, -50, 100, -50).is_ok());
    }

    #[test]
    fn deposit_and_withdraw_conserve() {
        for from_left in [true, false] {
            let d = SettlementDiff::deposit(1, from_left, 500).unwrap();
            assert!(d.conserves());
            assert_eq!(d.collateral_diff, 500);
            let w = SettlementDiff::withdraw(1, from_left, 500).unwrap();
            assert!(w.conserves());
            assert_eq!(w.collateral_diff, -500);
        }
    }
}
