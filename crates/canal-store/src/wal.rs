use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use canal_codec::Value;
use canal_core::error::CanalError;
use canal_core::types::TimestampMs;
use canal_crypto::sha256;
use tracing::{debug, info};

const ZERO_DIGEST: [u8; 32] = [0; 32];

/// One verified log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub timestamp: TimestampMs,
    pub payload: Vec<u8>,
    pub digest: [u8; 32],
}

/// Append-only input log. Records are length-prefixed byte-list values
/// `[seq, timestamp, payload, digest]` where each digest chains over the
/// previous one, so any truncation or edit breaks verification on open.
#[derive(Debug)]
pub struct Wal {
    file: File,
    pub head_digest: [u8; 32],
    pub last_seq: u64,
}

fn record_digest(
    seq: u64,
    timestamp: TimestampMs,
    payload: &[u8],
    prev: &[u8; 32],
) -> [u8; 32] {
    let mut data = Value::list(vec![
        Value::uint(u128::from(seq)),
        Value::uint(timestamp as u128),
        Value::bytes(payload.to_vec()),
    ])
    .encode();
    data.extend_from_slice(prev);
    sha256(&data)
}

impl Wal {
    /// Open (or create) the log at `path`, verifying the whole hash chain.
    /// Any malformed record or chain break is fatal.
    pub fn open(path: &Path) -> Result<(Self, Vec<WalRecord>), CanalError> {
        let bytes = if path.exists() {
            std::fs::read(path).map_err(|e| CanalError::Storage(e.to_string()))?
        } else {
            Vec::new()
        };

        let mut records = Vec::new();
        let mut prev = ZERO_DIGEST;
        let mut pos = 0usize;
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(CanalError::CorruptLog("truncated length prefix".into()));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[pos..pos + 4]);
            let len = u32::from_be_bytes(len_bytes) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(CanalError::CorruptLog("truncated record".into()));
            }
            let record = parse_record(&bytes[pos..pos + len])
                .map_err(|e| CanalError::CorruptLog(e.to_string()))?;
            let expected = record_digest(record.seq, record.timestamp, &record.payload, &prev);
            if expected != record.digest {
                return Err(CanalError::CorruptLog(format!(
                    "hash chain break at seq {}",
                    record.seq
                )));
            }
            prev = record.digest;
            pos += len;
            records.push(record);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CanalError::Storage(e.to_string()))?;
        let last_seq = records.last().map(|r| r.seq).unwrap_or(0);
        info!(records = records.len(), last_seq, "log opened and verified");
        Ok((
            Self {
                file,
                head_digest: prev,
                last_seq,
            },
            records,
        ))
    }

    /// Append one record; `seq` is the server height the logged inputs
    /// produce, so recovery replays exactly the records past a snapshot.
    pub fn append(
        &mut self,
        seq: u64,
        timestamp: TimestampMs,
        payload: &[u8],
    ) -> Result<[u8; 32], CanalError> {
        let digest = record_digest(seq, timestamp, payload, &self.head_digest);
        let record = Value::list(vec![
            Value::uint(u128::from(seq)),
            Value::uint(timestamp as u128),
            Value::bytes(payload.to_vec()),
            Value::bytes(digest.to_vec()),
        ])
        .encode();

        let mut framed = (record.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&record);
        self.file
            .write_all(&framed)
            .and_then(|_| self.file.flush())
            .map_err(|e| CanalError::Storage(e.to_string()))?;

        self.head_digest = digest;
        self.last_seq = seq;
        debug!(seq, bytes = framed.len(), "record appended");
        Ok(digest)
    }
}

fn parse_record(bytes: &[u8]) -> Result<WalRecord, CanalError> {
    let value = Value::decode(bytes)?;
    let fields = value.as_list().map_err(CanalError::from)?;
    if fields.len() != 4 {
        return Err(CanalError::CorruptLog(format!(
            "record must have 4 fields, got {}",
            fields.len()
        )));
    }
    let seq = u64::try_from(fields[0].as_uint().map_err(CanalError::from)?)
        .map_err(|_| CanalError::CorruptLog("seq range".into()))?;
    let timestamp = i64::try_from(fields[1].as_uint().map_err(CanalError::from)?)
        .map_err(|_| CanalError::CorruptLog("timestamp range".into()))?;
    let payload = fields[2].as_bytes().map_err(CanalError::from)?.to_vec();
    let digest_bytes = fields[3].as_bytes().map_err(CanalError::from)?;
    if digest_bytes.len() != 32 {
        return Err(CanalError::CorruptLog("digest must be 32 bytes".into()));
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(digest_bytes);
    Ok(WalRecord {
        seq,
        timestamp,
        payload,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("canal_wal_{name}_{}.log", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn append_reopen_verifies_chain() {
        let path = temp_log("roundtrip");
        {
            let (mut wal, records) = Wal::open(&path).unwrap();
            assert!(records.is_empty());
            wal.append(1, 10, b"first").unwrap();
            wal.append(2, 20, b"second").unwrap();
        }
        let (wal, records) = Wal::open(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, b"first");
        assert_eq!(records[1].seq, 2);
        assert_eq!(wal.last_seq, 2);
        assert_eq!(records[1].digest, wal.head_digest);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tampered_payload_breaks_the_chain() {
        let path = temp_log("tamper");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(1, 10, b"payload-A").unwrap();
            wal.append(2, 20, b"payload-B").unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip one byte inside the first record's payload.
        let hit = bytes
            .windows(9)
            .position(|w| w == b"payload-A")
            .expect("payload present");
        bytes[hit] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = Wal::open(&path).unwrap_err();
        assert!(matches!(err, CanalError::CorruptLog(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_tail_is_fatal() {
        let path = temp_log("truncate");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(1, 10, b"payload").unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            Wal::open(&path),
            Err(CanalError::CorruptLog(_))
        ));
        let _ = std::fs::remove_file(&path);
    }
}
