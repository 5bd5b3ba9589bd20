use std::path::{Path, PathBuf};

use canal_core::error::CanalError;
use canal_core::types::TimestampMs;
use canal_crypto::Keypair;
use canal_server::{RoutedInput, Server};
use tracing::info;

use crate::snapshot::{load_snapshot, write_snapshot};
use crate::wal::{Wal, WalRecord};

const WAL_FILE: &str = "inputs.log";

/// A server's on-disk home: the verified input log plus the snapshot pair.
///
/// The host drives the loop: `log_tick` before handing inputs to the
/// server, `checkpoint` whenever a snapshot is due, `recover` on startup.
pub struct NodeStore {
    dir: PathBuf,
    pub wal: Wal,
    records: Vec<WalRecord>,
}

impl NodeStore {
    /// Open the store directory, creating it if needed and verifying the
    /// log's hash chain end-to-end.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CanalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CanalError::Storage(e.to_string()))?;
        let (wal, records) = Wal::open(&dir.join(WAL_FILE))?;
        Ok(Self { dir, wal, records })
    }

    /// Record one tick's inputs under the server height they produce.
    pub fn log_tick(
        &mut self,
        seq: u64,
        now: TimestampMs,
        inputs: &[RoutedInput],
    ) -> Result<(), CanalError> {
        let payload =
            bincode::serialize(inputs).map_err(|e| CanalError::Serialization(e.to_string()))?;
        self.wal.append(seq, now, &payload)?;
        Ok(())
    }

    /// Write a snapshot of the current server state.
    pub fn checkpoint(&self, server: &Server) -> Result<(), CanalError> {
        write_snapshot(&self.dir, server)
    }

    /// Rebuild the server: load the latest verified snapshot, re-register
    /// the signing keys (never persisted) and replay every log record past
    /// the snapshot height. When no snapshot exists the caller gets an
    /// empty fleet back; seed it and use [`NodeStore::replay_onto`].
    pub fn recover(&self, signers: Vec<Keypair>) -> Result<Server, CanalError> {
        let mut server = match load_snapshot(&self.dir)? {
            Some((height, timestamp, replicas)) => Server::from_parts(height, timestamp, replicas),
            None => Server::new(),
        };
        for keypair in signers {
            server.register_signer(keypair);
        }
        let snapshot_height = server.height;
        let replayed = self.replay_onto(&mut server)?;
        info!(
            snapshot_height,
            replayed,
            final_height = server.height,
            "recovery complete"
        );
        Ok(server)
    }

    /// Replay every verified log record past the server's current height.
    /// Returns the number of ticks replayed.
    pub fn replay_onto(&self, server: &mut Server) -> Result<usize, CanalError> {
        let mut replayed = 0usize;
        for record in &self.records {
            if record.seq <= server.height {
                continue;
            }
            let inputs: Vec<RoutedInput> = bincode::deserialize(&record.payload)
                .map_err(|e| CanalError::CorruptLog(e.to_string()))?;
            server.tick(record.timestamp, inputs);
            replayed += 1;
        }
        Ok(replayed)
    }
}
