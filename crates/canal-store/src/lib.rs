//! canal-store
//!
//! Crash-safe persistence: an append-only, hash-chained input log plus
//! whole-server binary snapshots carrying a tree-commitment state root.
//! Recovery loads the latest snapshot (verifying its root) and replays the
//! log records past the snapshot height; because every transition is
//! deterministic and state iteration is ordered, replay is bit-exact.

pub mod snapshot;
pub mod store;
pub mod wal;

pub use snapshot::{load_snapshot, write_snapshot};
pub use store::NodeStore;
pub use wal::{Wal, WalRecord};
