//! canal-entity
//!
//! The multi-signer entity layer: each `(entity, signer)` pair runs a
//! replica of a proposer-based BFT state machine. Ordered transactions
//! commit into a chained frame history once precommit power reaches the
//! configured share-weighted threshold.

pub mod consensus;
pub mod replica;

pub use consensus::{EntityInput, EntityReplica, Outbound};
pub use replica::{ConsensusMode, EntityConfig, EntityState, ProposedFrame};
