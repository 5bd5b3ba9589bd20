use canal_codec::Value;
use canal_core::error::CanalError;
use canal_core::types::{Amount, EntityId, TimestampMs, TokenId};
use canal_entity::EntityState;
use serde::{Deserialize, Serialize};

/// One announced outbound capacity: what the announcing entity can send to
/// `peer` for `token_id`, plus its forwarding fee policy and how loaded the
/// edge currently is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub peer: EntityId,
    pub token_id: TokenId,
    pub capacity: Amount,
    pub fee_base: Amount,
    pub fee_ppm: u32,
    pub utilization_ppm: u32,
}

/// A gossiped entity profile, keyed by `entity_id` and superseded by
/// strictly greater timestamps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub entity_id: EntityId,
    pub capabilities: Vec<String>,
    pub hubs: Vec<EntityId>,
    pub metadata: Vec<u8>,
    pub account_capacities: Vec<AccountCapacity>,
    pub timestamp: TimestampMs,
}

impl Profile {
    /// Derive a profile from an entity's current account capacities, with a
    /// flat fee policy applied to every edge.
    pub fn from_entity_state(
        state: &EntityState,
        fee_base: Amount,
        fee_ppm: u32,
        now: TimestampMs,
    ) -> Result<Self, CanalError> {
        let mut account_capacities = Vec::new();
        for (peer, machine) in &state.accounts {
            for (token_id, delta) in &machine.deltas {
                let cap = delta.capacity(machine.our_side())?;
                let total = cap.max_send.saturating_add(cap.max_receive);
                let utilization_ppm = if total == 0 {
                    1_000_000
                } else {
                    (1_000_000u128.saturating_sub(cap.max_send.saturating_mul(1_000_000) / total))
                        as u32
                };
                account_capacities.push(AccountCapacity {
                    peer: *peer,
                    token_id: *token_id,
                    capacity: cap.max_send,
                    fee_base,
                    fee_ppm,
                    utilization_ppm,
                });
            }
        }
        Ok(Self {
            entity_id: state.entity_id,
            capabilities: Vec::new(),
            hubs: Vec::new(),
            metadata: Vec::new(),
            account_capacities,
            timestamp: now,
        })
    }

    /// Canonical wire encoding:
    /// `[entityId, [capabilities], [hubs], metadata, [capacities], timestamp]`.
    pub fn encode(&self) -> Vec<u8> {
        Value::list(vec![
            Value::bytes(self.entity_id.0.to_vec()),
            Value::list(
                self.capabilities
                    .iter()
                    .map(|c| Value::bytes(c.as_bytes().to_vec()))
                    .collect(),
            ),
            Value::list(
                self.hubs
                    .iter()
                    .map(|h| Value::bytes(h.0.to_vec()))
                    .collect(),
            ),
            Value::bytes(self.metadata.clone()),
            Value::list(
                self.account_capacities
                    .iter()
                    .map(|c| {
                        Value::list(vec![
                            Value::bytes(c.peer.0.to_vec()),
                            Value::uint(u128::from(c.token_id)),
                            Value::uint(c.capacity),
                            Value::uint(c.fee_base),
                            Value::uint(u128::from(c.fee_ppm)),
                            Value::uint(u128::from(c.utilization_ppm)),
                        ])
                    })
                    .collect(),
            ),
            Value::uint(self.timestamp as u128),
        ])
        .encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CanalError> {
        let value = Value::decode(bytes)?;
        let fields = value.as_list().map_err(CanalError::from)?;
        if fields.len() != 6 {
            return Err(CanalError::Codec(format!(
                "profile must have 6 fields, got {}",
                fields.len()
            )));
        }
        let entity_id = decode_entity(&fields[0])?;
        let capabilities = fields[1]
            .as_list()
            .map_err(CanalError::from)?
            .iter()
            .map(|c| {
                let bytes = c.as_bytes().map_err(CanalError::from)?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| CanalError::Codec(e.to_string()))
            })
            .collect::<Result<_, CanalError>>()?;
        let hubs = fields[2]
            .as_list()
            .map_err(CanalError::from)?
            .iter()
            .map(decode_entity)
            .collect::<Result<_, CanalError>>()?;
        let metadata = fields[3].as_bytes().map_err(CanalError::from)?.to_vec();
        let account_capacities = fields[4]
            .as_list()
            .map_err(CanalError::from)?
            .iter()
            .map(decode_capacity)
            .collect::<Result<_, CanalError>>()?;
        let timestamp = fields[5].as_uint().map_err(CanalError::from)?;
        let timestamp =
            i64::try_from(timestamp).map_err(|_| CanalError::Codec("timestamp range".into()))?;
        Ok(Self {
            entity_id,
            capabilities,
            hubs,
            metadata,
            account_capacities,
            timestamp,
        })
    }
}

fn decode_entity(v: &Value) -> Result<EntityId, CanalError> {
    let bytes = v.as_bytes().map_err(CanalError::from)?;
    if bytes.len() != 20 {
        return Err(CanalError::Codec("entity id must be 20 bytes".into()));
    }
    let mut arr = [0u8; 20];
    arr.copy_from_slice(bytes);
    Ok(EntityId::from_bytes(arr))
}

fn decode_capacity(v: &Value) -> Result<AccountCapacity, CanalError> {
    let fields = v.as_list().map_err(CanalError::from)?;
    if fields.len() != 6 {
        return Err(CanalError::Codec("capacity entry must have 6 fields".into()));
    }
    let narrow = |v: &Value| -> Result<u32, CanalError> {
        let n = v.as_uint().map_err(CanalError::from)?;
        u32::try_from(n).map_err(|_| CanalError::Codec("u32 range".into()))
    };
    Ok(AccountCapacity {
        peer: decode_entity(&fields[0])?,
        token_id: narrow(&fields[1])?,
        capacity: fields[2].as_uint().map_err(CanalError::from)?,
        fee_base: fields[3].as_uint().map_err(CanalError::from)?,
        fee_ppm: narrow(&fields[4])?,
        utilization_ppm: narrow(&fields[5])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(ts: TimestampMs) -> Profile {
        Profile {
            entity_id: EntityId::from_bytes([1; 20]),
            capabilities: vec!["hub".into()],
            hubs: vec![EntityId::from_bytes([2; 20])],
            metadata: b"meta".to_vec(),
            account_capacities: vec![AccountCapacity {
                peer: EntityId::from_bytes([2; 20]),
                token_id: 1,
                capacity: 10_000,
                fee_base: 1,
                fee_ppm: 500,
                utilization_ppm: 250_000,
            }],
            timestamp: ts,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let p = profile(42);
        assert_eq!(Profile::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn decode_rejects_short_entity_ids() {
        let mut p = profile(42);
        p.metadata.clear();
        let mut bytes = p.encode();
        // Corrupt by truncation.
        bytes.pop();
        assert!(Profile::decode(&bytes).is_err());
    }
}
