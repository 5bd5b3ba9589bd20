//! canal-core
//!
//! Fundamental data types for the canal payment-channel network:
//! - [`types`] — opaque identifiers, amounts, timestamps
//! - [`delta`] — the per-token bilateral [`delta::Delta`] with its solvency
//!   invariant and capacity projection
//! - [`tx`] — account- and entity-level transaction enums with their
//!   canonical encodings
//! - [`error`] — the workspace-wide error enum
//! - [`constants`] — protocol constants

pub mod constants;
pub mod delta;
pub mod error;
pub mod tx;
pub mod types;

pub use delta::{Capacity, Delta, Side};
pub use error::CanalError;
pub use tx::{AccountTx, EntityTx, HtlcOutcome};
pub use types::{
    routing_key, Amount, EntityId, Height, LockId, SignedAmount, SignerId, StateHash, TimestampMs,
    TokenId,
};
