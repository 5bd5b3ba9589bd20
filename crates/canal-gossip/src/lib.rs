//! canal-gossip
//!
//! Eventually-consistent profile registry: a last-write-wins map keyed by
//! entity id. Updates with a strictly greater timestamp supersede; equal
//! timestamps break ties on the lexicographic order of the canonical
//! encodings so every replica converges on the same winner.

pub mod profile;
pub mod registry;

pub use profile::{AccountCapacity, Profile};
pub use registry::Registry;
