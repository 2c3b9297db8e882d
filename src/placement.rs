//! The placement value object: a committed assignment of shards to instances.
//!
//! A placement is logically immutable. Operations in [`crate::algo`] take a
//! placement by reference and return a new one; callers that hand a placement
//! to multiple readers never need coordination. The serialized form is a JSON
//! document keyed by instance id, validated on load so corrupted storage
//! surfaces as a specific invariant violation.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::shard::{Shard, ShardId, ShardSet, ShardState};

/// An assignment of every shard in a fixed universe to replica-factor many
/// instances, subject to rack diversity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    instances: BTreeMap<String, Instance>,
    shards: Vec<ShardId>,
    replica_factor: usize,
    is_sharded: bool,
    is_mirrored: bool,
    cutover_nanos: i64,
}

impl Placement {
    /// Create an empty placement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instances. Later instances replace earlier ones with the same id.
    pub fn with_instances(mut self, instances: Vec<Instance>) -> Self {
        self.instances = instances
            .into_iter()
            .map(|i| (i.id().to_string(), i))
            .collect();
        self
    }

    /// Set the universe of shard ids. The list is kept sorted.
    pub fn with_shards(mut self, mut shards: Vec<ShardId>) -> Self {
        shards.sort_unstable();
        self.shards = shards;
        self
    }

    /// Set the replica factor.
    pub fn with_replica_factor(mut self, replica_factor: usize) -> Self {
        self.replica_factor = replica_factor;
        self
    }

    /// Set whether this placement assigns shards at all.
    pub fn with_sharded(mut self, is_sharded: bool) -> Self {
        self.is_sharded = is_sharded;
        self
    }

    /// Set whether this placement is mirrored.
    pub fn with_mirrored(mut self, is_mirrored: bool) -> Self {
        self.is_mirrored = is_mirrored;
        self
    }

    /// Set the placement-level cutover time.
    pub fn with_cutover_nanos(mut self, nanos: i64) -> Self {
        self.cutover_nanos = nanos;
        self
    }

    /// Enumerate the instances, ordered by id.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    /// Look up an instance by id.
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Get the number of instances.
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// Get the universe of shard ids, ordered.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Get the number of shard ids in the universe.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Get the replica factor.
    pub fn replica_factor(&self) -> usize {
        self.replica_factor
    }

    /// Whether this placement assigns shards.
    pub fn is_sharded(&self) -> bool {
        self.is_sharded
    }

    /// Whether this placement is mirrored.
    pub fn is_mirrored(&self) -> bool {
        self.is_mirrored
    }

    /// Get the placement-level cutover time.
    pub fn cutover_nanos(&self) -> i64 {
        self.cutover_nanos
    }

    pub(crate) fn insert_instance(&mut self, instance: Instance) {
        self.instances.insert(instance.id().to_string(), instance);
    }

    pub(crate) fn take_instance(&mut self, id: &str) -> Option<Instance> {
        self.instances.remove(id)
    }

    pub(crate) fn instance_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    /// Check the placement invariants.
    ///
    /// For a sharded placement: the shard universe has no duplicates, every
    /// owned shard id belongs to the universe, every shard id is owned by
    /// exactly replica-factor instances in a non-leaving state, and every
    /// initializing shard with a source either pairs with a leaving copy on
    /// that source or the source instance is gone.
    pub fn validate(&self) -> Result<()> {
        let mut universe = HashSet::with_capacity(self.shards.len());
        for &id in &self.shards {
            if !universe.insert(id) {
                return Err(Error::DuplicateShardIds);
            }
        }

        if !self.is_sharded {
            return Ok(());
        }

        let mut total = 0usize;
        let mut replicas: HashMap<ShardId, usize> = HashMap::with_capacity(self.shards.len());
        for instance in self.instances.values() {
            for shard in instance.shards().all() {
                if !universe.contains(&shard.id()) {
                    return Err(Error::UnexpectedShard {
                        instance: instance.id().to_string(),
                        shard: shard.id(),
                    });
                }
                if shard.state() != ShardState::Leaving {
                    total += 1;
                    *replicas.entry(shard.id()).or_insert(0) += 1;
                }
                if shard.state() == ShardState::Initializing {
                    if let Some(source) = shard.source_id() {
                        // A missing source instance means it was already
                        // forgotten; only a present source must still hold
                        // the paired leaving copy.
                        if let Some(source_instance) = self.instances.get(source) {
                            let paired = source_instance
                                .shards()
                                .get(shard.id())
                                .map(|s| s.state() == ShardState::Leaving)
                                .unwrap_or(false);
                            if !paired {
                                return Err(Error::ShardNotLeaving {
                                    instance: source.to_string(),
                                    shard: shard.id(),
                                });
                            }
                        }
                    }
                }
            }
        }

        let expected = self.shards.len() * self.replica_factor;
        if total != expected {
            return Err(Error::TotalShardsMismatch {
                expected,
                actual: total,
            });
        }

        for &id in &self.shards {
            let actual = replicas.get(&id).copied().unwrap_or(0);
            if actual != self.replica_factor {
                return Err(Error::ShardReplicaMismatch {
                    shard: id,
                    expected: self.replica_factor,
                    actual,
                });
            }
        }

        Ok(())
    }

    /// Serialize this placement to JSON.
    pub fn to_json(&self) -> Result<String> {
        let instances = self
            .instances
            .values()
            .map(|i| {
                (
                    i.id().to_string(),
                    InstanceRecord {
                        id: i.id().to_string(),
                        rack: i.rack().to_string(),
                        zone: i.zone().to_string(),
                        weight: i.weight(),
                        shards: i.shards().all().cloned().collect(),
                    },
                )
            })
            .collect();

        let record = PlacementRecord {
            instances,
            shards: self.shards.clone(),
            replica_factor: self.replica_factor,
            is_sharded: self.is_sharded,
            is_mirrored: self.is_mirrored,
            cutover_nanos: self.cutover_nanos,
        };
        Ok(serde_json::to_string(&record)?)
    }

    /// Deserialize a placement from JSON, validating all invariants.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let record: PlacementRecord = serde_json::from_slice(data)?;

        let mut instances = Vec::with_capacity(record.instances.len());
        for (key, rec) in record.instances {
            if key != rec.id {
                return Err(Error::InstanceIdMismatch { key, id: rec.id });
            }
            let mut shards = ShardSet::new();
            for shard in rec.shards {
                if shards.contains(shard.id()) {
                    return Err(Error::DuplicateInstanceShards(rec.id));
                }
                shards.add(shard);
            }
            instances.push(
                Instance::new(rec.id)
                    .with_rack(rec.rack)
                    .with_zone(rec.zone)
                    .with_weight(rec.weight)
                    .with_shards(shards),
            );
        }

        let placement = Placement::new()
            .with_instances(instances)
            .with_shards(record.shards)
            .with_replica_factor(record.replica_factor)
            .with_sharded(record.is_sharded)
            .with_mirrored(record.is_mirrored)
            .with_cutover_nanos(record.cutover_nanos);
        placement.validate()?;
        Ok(placement)
    }
}

/// Serialized form of one instance and its shards.
#[derive(Serialize, Deserialize)]
struct InstanceRecord {
    id: String,
    rack: String,
    zone: String,
    weight: u32,
    shards: Vec<Shard>,
}

/// Serialized form of a placement, keyed by instance id.
#[derive(Serialize, Deserialize)]
struct PlacementRecord {
    instances: BTreeMap<String, InstanceRecord>,
    shards: Vec<ShardId>,
    replica_factor: usize,
    is_sharded: bool,
    is_mirrored: bool,
    cutover_nanos: i64,
}
