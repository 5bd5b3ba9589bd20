//! canal-account
//!
//! The bilateral account layer: a 2-of-2 state machine per canonical entity
//! pair, advanced by a propose/acknowledge handshake over hash-chained
//! frames, with an HTLC subcontract for multi-hop atomic payments.

pub mod frame;
pub mod htlc;
pub mod machine;

pub use frame::AccountFrame;
pub use htlc::{hop_timelock, HtlcLock};
pub use machine::{AccountMachine, AccountMsg, AccountStatus};
