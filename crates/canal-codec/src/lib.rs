//! canal-codec
//!
//! Canonical recursive byte-list codec used for every surface that feeds a
//! digest: frame hashing, gossip wire profiles, snapshot and log framing.
//! A [`Value`] is either a byte string or a list of values; integers are
//! big-endian without leading zeros and signed integers are encoded as a
//! `[sign, abs]` pair. Every value has exactly one encoding and decoding
//! rejects anything non-canonical.

pub mod value;

pub use value::{CodecError, Value};
