//! canal-settle
//!
//! The jurisdiction boundary: committed bilateral deltas become
//! conservation-preserving on-chain diffs, handed to an opaque adapter.
//! The core never blocks inside frame execution on this layer; hosts call
//! the adapter between ticks and feed the applied diffs back in.

pub mod diff;
pub mod mock;

pub use diff::SettlementDiff;
pub use mock::MockJurisdiction;

use canal_core::error::CanalError;
use canal_core::types::{Amount, EntityId, TokenId};

/// The only interface the core requires of the settlement layer.
///
/// `process_settlement` applies a batch of per-token diffs atomically or
/// fails without effect; retry is the caller's concern.
pub trait Jurisdiction {
    /// Register an entity under an opaque board digest; returns its ordinal.
    fn register_entity(
        &mut self,
        entity: EntityId,
        board_digest: [u8; 32],
    ) -> Result<u64, CanalError>;

    fn get_reserve(&self, entity: &EntityId, token: TokenId) -> Amount;

    /// Credit or debit an entity's reserve. Debits beyond the balance are
    /// rejected, not saturated.
    fn update_reserve(
        &mut self,
        entity: &EntityId,
        token: TokenId,
        delta: i128,
    ) -> Result<(), CanalError>;

    /// Apply settlement diffs for the canonically-ordered pair
    /// `(left, right)`.
    fn process_settlement(
        &mut self,
        left: &EntityId,
        right: &EntityId,
        diffs: &[SettlementDiff],
    ) -> Result<(), CanalError>;
}
