use std::path::Path;

use canal_codec::Value;
use canal_core::error::CanalError;
use canal_core::types::{Height, TimestampMs};
use canal_crypto::{merkle_root, sha256};
use canal_entity::EntityReplica;
use canal_server::Server;
use tracing::info;

pub const SNAPSHOT_FILE: &str = "snapshot.bin";
pub const SNAPSHOT_SIBLING: &str = "snapshot.json";

/// Write a whole-server snapshot: the byte-list encoding of
/// `[height, timestamp, [(routingKey, replicaBlob), …]]` in ascending
/// routing-key order, followed by the 32-byte state root (the tree
/// commitment over the per-replica blob digests). The write goes to a
/// temp file first and is renamed into place; a torn write is detected as
/// a root mismatch on load. A pretty JSON sibling is written for
/// diagnostics; only the binary file is authoritative.
pub fn write_snapshot(dir: &Path, server: &Server) -> Result<(), CanalError> {
    let mut pairs = Vec::with_capacity(server.replicas.len());
    let mut digests = Vec::with_capacity(server.replicas.len());
    let mut sibling_replicas = Vec::with_capacity(server.replicas.len());

    for (key, replica) in &server.replicas {
        let blob =
            bincode::serialize(replica).map_err(|e| CanalError::Serialization(e.to_string()))?;
        let digest = sha256(&blob);
        sibling_replicas.push(serde_json::json!({
            "routing_key": key,
            "entity_height": replica.state.height,
            "digest": hex::encode(digest),
        }));
        digests.push(digest);
        pairs.push(Value::list(vec![
            Value::bytes(key.as_bytes().to_vec()),
            Value::bytes(blob),
        ]));
    }

    let root = merkle_root(&digests);
    let mut out = Value::list(vec![
        Value::uint(u128::from(server.height)),
        Value::uint(server.timestamp as u128),
        Value::list(pairs),
    ])
    .encode();
    out.extend_from_slice(&root);

    let path = dir.join(SNAPSHOT_FILE);
    let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
    std::fs::write(&tmp, &out).map_err(|e| CanalError::Storage(e.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|e| CanalError::Storage(e.to_string()))?;

    let sibling = serde_json::json!({
        "height": server.height,
        "timestamp": server.timestamp,
        "time_utc": chrono::DateTime::<chrono::Utc>::from_timestamp_millis(server.timestamp)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        "state_root": hex::encode(root),
        "replicas": sibling_replicas,
    });
    std::fs::write(
        dir.join(SNAPSHOT_SIBLING),
        serde_json::to_string_pretty(&sibling)
            .map_err(|e| CanalError::Serialization(e.to_string()))?,
    )
    .map_err(|e| CanalError::Storage(e.to_string()))?;

    info!(
        height = server.height,
        replicas = server.replicas.len(),
        root = %hex::encode(root),
        "snapshot written"
    );
    Ok(())
}

/// Load the snapshot in `dir`, recomputing and verifying the state root.
/// Returns `None` when no snapshot exists yet; any mismatch or malformed
/// content is fatal.
pub fn load_snapshot(
    dir: &Path,
) -> Result<Option<(Height, TimestampMs, Vec<(String, EntityReplica)>)>, CanalError> {
    let path = dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).map_err(|e| CanalError::Storage(e.to_string()))?;
    if bytes.len() < 32 {
        return Err(CanalError::CorruptSnapshot("shorter than a state root".into()));
    }
    let (body, root_bytes) = bytes.split_at(bytes.len() - 32);

    let value =
        Value::decode(body).map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
    let fields = value
        .as_list()
        .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
    if fields.len() != 3 {
        return Err(CanalError::CorruptSnapshot(format!(
            "snapshot must have 3 fields, got {}",
            fields.len()
        )));
    }
    let height = u64::try_from(
        fields[0]
            .as_uint()
            .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?,
    )
    .map_err(|_| CanalError::CorruptSnapshot("height range".into()))?;
    let timestamp = i64::try_from(
        fields[1]
            .as_uint()
            .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?,
    )
    .map_err(|_| CanalError::CorruptSnapshot("timestamp range".into()))?;

    let mut replicas = Vec::new();
    let mut digests = Vec::new();
    for pair in fields[2]
        .as_list()
        .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?
    {
        let pair = pair
            .as_list()
            .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
        if pair.len() != 2 {
            return Err(CanalError::CorruptSnapshot("pair must have 2 fields".into()));
        }
        let key = String::from_utf8(
            pair[0]
                .as_bytes()
                .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?
                .to_vec(),
        )
        .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
        let blob = pair[1]
            .as_bytes()
            .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
        digests.push(sha256(blob));
        let replica: EntityReplica = bincode::deserialize(blob)
            .map_err(|e| CanalError::CorruptSnapshot(e.to_string()))?;
        replicas.push((key, replica));
    }

    let recomputed = merkle_root(&digests);
    if recomputed.as_slice() != root_bytes {
        return Err(CanalError::CorruptSnapshot(format!(
            "state root mismatch: stored {}, recomputed {}",
            hex::encode(root_bytes),
            hex::encode(recomputed)
        )));
    }
    info!(height, replicas = replicas.len(), "snapshot verified");
    Ok(Some((height, timestamp, replicas)))
}
