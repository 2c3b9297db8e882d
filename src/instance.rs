//! Physical instances and their shard ownership.

use crate::shard::{ShardSet, ShardState};

/// A physical instance that owns zero or more shards.
///
/// An instance is identified by its string id. Its rack names the failure
/// domain used for replica anti-affinity, and its weight is its share of the
/// rack's capacity when load is balanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    id: String,
    rack: String,
    zone: String,
    weight: u32,
    shards: ShardSet,
}

impl Instance {
    /// Create a new instance with the given id, no shards and weight 1.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rack: String::new(),
            zone: String::new(),
            weight: 1,
            shards: ShardSet::new(),
        }
    }

    /// Set the rack (failure domain).
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = rack.into();
        self
    }

    /// Set the zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    /// Set the weight (capacity share within the rack).
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the shard set.
    pub fn with_shards(mut self, shards: ShardSet) -> Self {
        self.shards = shards;
        self
    }

    /// Get the instance id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the rack.
    pub fn rack(&self) -> &str {
        &self.rack
    }

    /// Get the zone.
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Get the weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Get the shard set.
    pub fn shards(&self) -> &ShardSet {
        &self.shards
    }

    /// Get the shard set for mutation.
    pub fn shards_mut(&mut self) -> &mut ShardSet {
        &mut self.shards
    }

    /// Check whether every shard on this instance is leaving.
    ///
    /// An instance with no shards is not leaving; it is eligible to receive.
    pub fn is_leaving(&self) -> bool {
        !self.shards.is_empty()
            && self.shards.count_in_state(ShardState::Leaving) == self.shards.len()
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[id={}, rack={}, zone={}, weight={}]",
            self.id, self.rack, self.zone, self.weight
        )
    }
}
