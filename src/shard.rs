//! Per-shard handoff state and indexed shard collections.
//!
//! A shard is a unit of data-partition identity. Every instance that owns a
//! shard holds its own copy of the shard's handoff state: a shard being moved
//! between two instances exists twice, as `Leaving` on the old owner and
//! `Initializing` on the new owner, linked by the new copy's source id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identifier for a shard.
pub type ShardId = u32;

/// Handoff state of a shard on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardState {
    /// The shard was just assigned and has not been committed to a placement.
    Unknown,
    /// The shard is bootstrapping on its new owner.
    Initializing,
    /// The shard is serving traffic on this owner.
    Available,
    /// The shard is being handed off away from this owner.
    Leaving,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Unknown => write!(f, "unknown"),
            ShardState::Initializing => write!(f, "initializing"),
            ShardState::Available => write!(f, "available"),
            ShardState::Leaving => write!(f, "leaving"),
        }
    }
}

/// One instance's copy of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Shard id, unique within an instance's shard set.
    id: ShardId,
    /// Current handoff state.
    state: ShardState,
    /// Instance this shard is being handed off from, if any.
    source_id: Option<String>,
    /// Time after which traffic may be served from this copy.
    cutover_nanos: i64,
    /// Time after which traffic must stop being served from this copy.
    cutoff_nanos: i64,
}

impl Shard {
    /// Create a new shard in the `Unknown` state with no source.
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            state: ShardState::Unknown,
            source_id: None,
            cutover_nanos: 0,
            cutoff_nanos: 0,
        }
    }

    /// Get the shard id.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Get the handoff state.
    pub fn state(&self) -> ShardState {
        self.state
    }

    /// Get the source instance id, if this shard is part of a handoff.
    pub fn source_id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    /// Get the cutover time in nanoseconds.
    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    /// Get the cutoff time in nanoseconds.
    pub fn cutoff_nanos(&self) -> i64 {
        self.cutoff_nanos
    }

    /// Set the handoff state.
    pub fn with_state(mut self, state: ShardState) -> Self {
        self.state = state;
        self
    }

    /// Set the source instance id.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Set the cutover time.
    pub fn with_cutover_nanos(mut self, nanos: i64) -> Self {
        self.cutover_nanos = nanos;
        self
    }

    /// Set the cutoff time.
    pub fn with_cutoff_nanos(mut self, nanos: i64) -> Self {
        self.cutoff_nanos = nanos;
        self
    }

    /// Update the handoff state in place.
    pub fn set_state(&mut self, state: ShardState) {
        self.state = state;
    }

    /// Update the cutoff time in place.
    pub fn set_cutoff_nanos(&mut self, nanos: i64) {
        self.cutoff_nanos = nanos;
    }

    /// Drop the source link, aborting the handoff this shard was part of.
    pub fn clear_source_id(&mut self) {
        self.source_id = None;
    }
}

/// The set of shards owned by one instance, indexed by shard id.
///
/// Shard ids are unique within a set; adding a shard with an id already
/// present replaces the previous copy. Enumeration is ordered by shard id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSet {
    shards: BTreeMap<ShardId, Shard>,
}

impl ShardSet {
    /// Create an empty shard set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shard set from a list of shards.
    ///
    /// Later shards replace earlier ones with the same id.
    pub fn from_shards(shards: impl IntoIterator<Item = Shard>) -> Self {
        let mut set = Self::new();
        for shard in shards {
            set.add(shard);
        }
        set
    }

    /// Add a shard, replacing any existing shard with the same id.
    pub fn add(&mut self, shard: Shard) {
        self.shards.insert(shard.id(), shard);
    }

    /// Remove a shard by id, returning it if present.
    pub fn remove(&mut self, id: ShardId) -> Option<Shard> {
        self.shards.remove(&id)
    }

    /// Look up a shard by id.
    pub fn get(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(&id)
    }

    /// Look up a shard by id for mutation.
    pub fn get_mut(&mut self, id: ShardId) -> Option<&mut Shard> {
        self.shards.get_mut(&id)
    }

    /// Check whether a shard id is in the set.
    pub fn contains(&self, id: ShardId) -> bool {
        self.shards.contains_key(&id)
    }

    /// Enumerate all shards, ordered by id.
    pub fn all(&self) -> impl Iterator<Item = &Shard> {
        self.shards.values()
    }

    /// Enumerate the shards in a given state, ordered by id.
    pub fn by_state(&self, state: ShardState) -> impl Iterator<Item = &Shard> {
        self.shards.values().filter(move |s| s.state() == state)
    }

    /// Get all shard ids in the set, ordered.
    pub fn ids(&self) -> Vec<ShardId> {
        self.shards.keys().copied().collect()
    }

    /// Get the number of shards in the set.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Check whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Count the shards in a given state.
    pub fn count_in_state(&self, state: ShardState) -> usize {
        self.shards.values().filter(|s| s.state() == state).count()
    }
}

impl FromIterator<Shard> for ShardSet {
    fn from_iter<T: IntoIterator<Item = Shard>>(iter: T) -> Self {
        Self::from_shards(iter)
    }
}
