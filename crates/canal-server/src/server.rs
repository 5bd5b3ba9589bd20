use std::collections::{BTreeMap, VecDeque};

use canal_core::error::CanalError;
use canal_core::types::{routing_key, Amount, EntityId, Height, SignerId, TimestampMs, TokenId};
use canal_crypto::Keypair;
use canal_entity::{EntityConfig, EntityInput, EntityReplica, EntityState, Outbound};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// An input addressed to a replica by routing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedInput {
    pub key: String,
    pub input: EntityInput,
}

impl RoutedInput {
    pub fn new(entity: &EntityId, signer: &SignerId, input: EntityInput) -> Self {
        Self {
            key: routing_key(entity, signer),
            input,
        }
    }
}

impl From<Outbound> for RoutedInput {
    fn from(o: Outbound) -> Self {
        Self {
            key: o.key(),
            input: o.input,
        }
    }
}

/// The replica fleet of one host process.
///
/// Replicas are owned exclusively by the coordinator for the duration of a
/// tick; external readers observe state between ticks. Signing keys live
/// beside the replicas, never inside them, so snapshots stay key-free.
pub struct Server {
    pub replicas: BTreeMap<String, EntityReplica>,
    signers: BTreeMap<SignerId, Keypair>,
    pub height: Height,
    pub timestamp: TimestampMs,
}

impl Server {
    pub fn new() -> Self {
        Self {
            replicas: BTreeMap::new(),
            signers: BTreeMap::new(),
            height: 0,
            timestamp: 0,
        }
    }

    /// Rebuild a server from snapshot parts; the host re-registers signers.
    pub fn from_parts(
        height: Height,
        timestamp: TimestampMs,
        replicas: Vec<(String, EntityReplica)>,
    ) -> Self {
        Self {
            replicas: replicas.into_iter().collect(),
            signers: BTreeMap::new(),
            height,
            timestamp,
        }
    }

    pub fn register_signer(&mut self, keypair: Keypair) {
        self.signers.insert(keypair.signer_id, keypair);
    }

    /// Create one replica per validator of `config` whose signing key is
    /// registered locally, seeding each with the same initial reserves.
    pub fn add_entity(
        &mut self,
        entity: EntityId,
        config: EntityConfig,
        reserves: &[(TokenId, Amount)],
    ) {
        for validator in config.validators.clone() {
            if !self.signers.contains_key(&validator) {
                continue;
            }
            let mut state = EntityState::new(entity, config.clone());
            for (token, amount) in reserves {
                state.reserves.insert(*token, *amount);
            }
            let key = routing_key(&entity, &validator);
            info!(%entity, signer = %validator, "replica added");
            self.replicas
                .insert(key, EntityReplica::new(entity, validator, state));
        }
    }

    pub fn replica(&self, entity: &EntityId, signer: &SignerId) -> Option<&EntityReplica> {
        self.replicas.get(&routing_key(entity, signer))
    }

    /// One cooperative step: merge `inputs` by routing key, run every routed
    /// input and replica flush to quiescence, and return the outputs whose
    /// target does not live on this server. Advances server height and
    /// timestamp; never blocks.
    pub fn tick(&mut self, now: TimestampMs, inputs: Vec<RoutedInput>) -> Vec<RoutedInput> {
        // Merge inputs by routing key, preserving arrival order per key.
        let mut merged: BTreeMap<String, Vec<EntityInput>> = BTreeMap::new();
        for ri in inputs {
            merged.entry(ri.key).or_default().push(ri.input);
        }
        let mut queue: VecDeque<RoutedInput> = merged
            .into_iter()
            .flat_map(|(key, inputs)| {
                inputs
                    .into_iter()
                    .map(move |input| RoutedInput {
                        key: key.clone(),
                        input,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut remote = Vec::new();
        loop {
            while let Some(ri) = queue.pop_front() {
                if !self.replicas.contains_key(&ri.key) {
                    debug!(key = %ri.key, "output for remote replica enqueued");
                    remote.push(ri);
                    continue;
                }
                for out in self.dispatch(ri) {
                    queue.push_back(out);
                }
            }

            // Flush every replica; new outputs feed back into this tick.
            let keys: Vec<String> = self.replicas.keys().cloned().collect();
            let mut produced = false;
            for key in keys {
                for out in self.flush_one(&key, now) {
                    produced = true;
                    queue.push_back(out);
                }
            }
            if !produced {
                break;
            }
        }

        self.height += 1;
        self.timestamp = now;
        remote
    }

    fn dispatch(&mut self, ri: RoutedInput) -> Vec<RoutedInput> {
        let Some(replica) = self.replicas.get_mut(&ri.key) else {
            return vec![ri];
        };
        let Some(keypair) = self.signers.get(&replica.signer_id) else {
            warn!(key = %ri.key, "no signing key registered; input dropped");
            return Vec::new();
        };
        match replica.handle(ri.input, keypair) {
            Ok(outs) => outs.into_iter().map(RoutedInput::from).collect(),
            Err(e) if e.is_replay() => {
                debug!(key = %ri.key, error = %e, "replay input dropped");
                Vec::new()
            }
            Err(e) => {
                // Recoverable per-message failure: the replica is unchanged
                // and other replicas are unaffected.
                warn!(key = %ri.key, error = %e, "input rejected");
                Vec::new()
            }
        }
    }

    fn flush_one(&mut self, key: &str, now: TimestampMs) -> Vec<RoutedInput> {
        let Some(replica) = self.replicas.get_mut(key) else {
            return Vec::new();
        };
        let Some(keypair) = self.signers.get(&replica.signer_id) else {
            return Vec::new();
        };
        match replica.flush(now, keypair) {
            Ok(outs) => outs.into_iter().map(RoutedInput::from).collect(),
            Err(e) => {
                warn!(key = %key, error = %e, "flush failed");
                Vec::new()
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
