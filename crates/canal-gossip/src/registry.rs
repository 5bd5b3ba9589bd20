use std::collections::BTreeMap;

use canal_core::types::EntityId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::profile::Profile;

/// Last-write-wins profile registry. `announce` accepts a profile only if
/// its timestamp is strictly greater than the stored one; identical
/// timestamps fall back to the lexicographic order of the canonical
/// encodings, so two registries fed the same announcements in any order
/// converge on the same state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Registry {
    profiles: BTreeMap<EntityId, Profile>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the profile was accepted.
    pub fn announce(&mut self, profile: Profile) -> bool {
        match self.profiles.get(&profile.entity_id) {
            None => {
                self.profiles.insert(profile.entity_id, profile);
                true
            }
            Some(stored) => {
                let accept = profile.timestamp > stored.timestamp
                    || (profile.timestamp == stored.timestamp
                        && profile.encode() > stored.encode());
                if accept {
                    self.profiles.insert(profile.entity_id, profile);
                } else {
                    debug!(entity = %profile.entity_id, "stale profile dropped");
                }
                accept
            }
        }
    }

    pub fn get(&self, entity: &EntityId) -> Option<&Profile> {
        self.profiles.get(entity)
    }

    pub fn all(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
