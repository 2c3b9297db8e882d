//! Working state for a single placement mutation.
//!
//! A helper is seeded from a placement, owns mutable working copies of its
//! instances plus the indices the assignment primitives need, and is consumed
//! by [`PlacementHelper::generate_placement`]. All changes accumulate in the
//! helper; nothing is visible to callers until a new placement is generated,
//! so a failed operation leaves the input placement untouched.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use tracing::warn;

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::shard::{Shard, ShardId, ShardState};

/// How aggressively [`PlacementHelper::optimize`] may move shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeMode {
    /// Only move shards that have not begun bootstrapping, preserving
    /// minimal shard movement.
    Safe,
    /// Move any movable shard to reach the tightest distribution, at the
    /// cost of extra data motion.
    Unsafe,
}

/// Mutable working state for one placement operation.
pub struct PlacementHelper {
    /// Working copies of all instances, including departing ones.
    instances: HashMap<String, Instance>,
    /// Instances dropped from the placement by the current operation. They
    /// stay addressable so their shards can be handed off, but receive no
    /// target load and are excluded from candidates.
    departing: HashSet<String>,
    /// Per-instance target count of non-leaving shards.
    target_load: HashMap<String, usize>,
    /// Non-leaving ownerships of each shard id.
    shard_to_instances: HashMap<ShardId, HashSet<String>>,
    /// All instances per rack.
    rack_to_instances: HashMap<String, HashSet<String>>,
    /// Summed weight of the non-leaving instances per rack.
    rack_weights: HashMap<String, u64>,
    total_weight: u64,
    /// Replica factor targeted by this operation; may differ from the input
    /// placement's.
    rf: usize,
    unique_shards: Vec<ShardId>,
    opts: Options,
}

impl PlacementHelper {
    /// Create a helper targeting the placement's own replica factor.
    pub fn new(placement: &Placement, opts: Options) -> Self {
        Self::with_target_rf(placement, placement.replica_factor(), opts)
    }

    /// Create a helper targeting a different replica factor than the
    /// placement's, e.g. one higher when adding a replica.
    pub fn with_target_rf(placement: &Placement, rf: usize, opts: Options) -> Self {
        let mut helper = Self {
            instances: placement
                .instances()
                .map(|i| (i.id().to_string(), i.clone()))
                .collect(),
            departing: HashSet::new(),
            target_load: HashMap::new(),
            shard_to_instances: HashMap::new(),
            rack_to_instances: HashMap::new(),
            rack_weights: HashMap::new(),
            total_weight: 0,
            rf,
            unique_shards: placement.shards().to_vec(),
            opts,
        };
        helper.scan_current_load();
        helper.build_target_load();
        helper
    }

    fn scan_current_load(&mut self) {
        let mut rack_to_instances: HashMap<String, HashSet<String>> = HashMap::new();
        let mut rack_weights: HashMap<String, u64> = HashMap::new();
        let mut shard_to_instances: HashMap<ShardId, HashSet<String>> =
            HashMap::with_capacity(self.unique_shards.len());
        let mut total_weight = 0u64;

        for (id, instance) in &self.instances {
            rack_to_instances
                .entry(instance.rack().to_string())
                .or_default()
                .insert(id.clone());

            if instance.is_leaving() {
                // Leaving instances contribute no usable capacity.
                continue;
            }

            *rack_weights.entry(instance.rack().to_string()).or_default() +=
                u64::from(instance.weight());
            total_weight += u64::from(instance.weight());

            for shard in instance.shards().all() {
                if shard.state() == ShardState::Leaving {
                    continue;
                }
                shard_to_instances
                    .entry(shard.id())
                    .or_default()
                    .insert(id.clone());
            }
        }

        self.rack_to_instances = rack_to_instances;
        self.rack_weights = rack_weights;
        self.shard_to_instances = shard_to_instances;
        self.total_weight = total_weight;
    }

    fn build_target_load(&mut self) {
        let mut overweight_racks = 0usize;
        let mut overweight = 0u64;
        for &weight in self.rack_weights.values() {
            if is_rack_overweight(weight, self.total_weight, self.rf) {
                overweight_racks += 1;
                overweight += weight;
            }
        }

        let num_shards = self.unique_shards.len();
        let mut target_load = HashMap::with_capacity(self.instances.len());
        for (id, instance) in &self.instances {
            if instance.is_leaving() {
                continue;
            }
            let rack_weight = self.rack_weights.get(instance.rack()).copied().unwrap_or(0);
            let target = if is_rack_overweight(rack_weight, self.total_weight, self.rf) {
                // An overweight rack cannot take more than its diversity cap
                // of shards/rf; its instances split that cap by weight.
                (num_shards as f64 * f64::from(instance.weight()) / rack_weight as f64).ceil()
                    as usize
            } else {
                // Shards the overweight racks cannot hold are spread over the
                // normal racks in proportion to instance weight.
                let remaining_weight = self.total_weight - overweight;
                if remaining_weight == 0 {
                    0
                } else {
                    num_shards * self.rf.saturating_sub(overweight_racks)
                        * instance.weight() as usize
                        / remaining_weight as usize
                }
            };
            target_load.insert(id.clone(), target);
        }
        self.target_load = target_load;
    }

    /// Ids of the instances managed by this helper, excluding departing ones.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .keys()
            .filter(|id| !self.departing.contains(*id))
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a working instance by id.
    pub fn instance(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Number of distinct racks across all instances.
    pub fn num_racks(&self) -> usize {
        self.rack_to_instances.len()
    }

    /// The target count of non-leaving shards for an instance.
    pub fn target_load(&self, id: &str) -> usize {
        self.target_load.get(id).copied().unwrap_or(0)
    }

    /// All shards currently on an instance, cloned.
    pub fn shards_of(&self, id: &str) -> Vec<Shard> {
        self.instances
            .get(id)
            .map(|i| i.shards().all().cloned().collect())
            .unwrap_or_default()
    }

    /// Register an instance that the current operation dropped from the
    /// placement. Its shards stay addressable for handoff but it receives no
    /// load and is no candidate.
    pub(crate) fn add_departing(&mut self, instance: Instance) {
        let id = instance.id().to_string();
        self.departing.insert(id.clone());
        self.instances.insert(id, instance);
    }

    fn current_load(&self, id: &str) -> usize {
        self.instances
            .get(id)
            .map(|i| i.shards().len() - i.shards().count_in_state(ShardState::Leaving))
            .unwrap_or(0)
    }

    fn remaining_load(&self, id: &str) -> i64 {
        self.target_load(id) as i64 - self.current_load(id) as i64
    }

    /// Check whether moving the shard to the target rack would violate rack
    /// anti-affinity.
    pub fn has_rack_conflict(&self, shard_id: ShardId, from: Option<&str>, to_rack: &str) -> bool {
        if let Some(from_id) = from {
            // Swapping within a rack cannot introduce a new conflict.
            if let Some(from_instance) = self.instances.get(from_id) {
                if from_instance.rack() == to_rack {
                    return false;
                }
            }
        }
        self.shard_to_instances
            .get(&shard_id)
            .map(|owners| {
                owners.iter().any(|id| {
                    self.instances
                        .get(id)
                        .map(|i| i.rack() == to_rack)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn can_assign(&self, shard_id: ShardId, from: Option<&str>, to: &str) -> bool {
        let to_instance = match self.instances.get(to) {
            Some(i) => i,
            None => return false,
        };
        if let Some(shard) = to_instance.shards().get(shard_id) {
            // A leaving copy does not count toward the target's load, so the
            // target may take ownership back.
            if shard.state() != ShardState::Leaving {
                return false;
            }
        }
        self.opts.loose_rack_check()
            || !self.has_rack_conflict(shard_id, from, to_instance.rack())
    }

    /// Move one copy of a shard onto `to`, updating both shard sets and the
    /// ownership index. Returns false if the move is not allowed.
    fn move_shard(&mut self, candidate: Shard, from: Option<&str>, to: &str) -> bool {
        let shard_id = candidate.id();
        if !self.can_assign(shard_id, from, to) {
            return false;
        }
        if candidate.state() == ShardState::Leaving {
            // A leaving shard is never moved; it disappears when its
            // initializing pair is marked available.
            return false;
        }

        let mut new_shard = Shard::new(shard_id);

        if let Some(from_id) = from {
            match candidate.state() {
                ShardState::Unknown | ShardState::Initializing => {
                    // Not yet bootstrapped on the old owner: relocate the
                    // copy and keep whatever handoff it was part of.
                    if let Some(from_instance) = self.instances.get_mut(from_id) {
                        from_instance.shards_mut().remove(shard_id);
                    }
                    if let Some(source) = candidate.source_id() {
                        new_shard = new_shard.with_source_id(source);
                    }
                }
                ShardState::Available => {
                    // Begin a handoff: the old owner keeps serving as leaving
                    // until the new copy is marked available.
                    let cutoff = self.opts.shard_cutoff_nanos();
                    if let Some(from_instance) = self.instances.get_mut(from_id) {
                        if let Some(shard) = from_instance.shards_mut().get_mut(shard_id) {
                            shard.set_state(ShardState::Leaving);
                            shard.set_cutoff_nanos(cutoff);
                        }
                    }
                    new_shard = new_shard.with_source_id(from_id);
                }
                ShardState::Leaving => {}
            }
            if let Some(owners) = self.shard_to_instances.get_mut(&shard_id) {
                owners.remove(from_id);
            }
        }

        let reclaiming = self
            .instances
            .get(to)
            .and_then(|i| i.shards().get(shard_id))
            .map(|s| s.state() == ShardState::Leaving)
            .unwrap_or(false);
        if reclaiming {
            // The target still owns this shard in the leaving state: take
            // ownership back directly and abort the in-flight handoff that
            // pointed at it.
            new_shard = Shard::new(shard_id).with_state(ShardState::Available);
            let owners: Vec<String> = self
                .shard_to_instances
                .get(&shard_id)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();
            for owner in owners {
                if let Some(instance) = self.instances.get_mut(&owner) {
                    if let Some(shard) = instance.shards_mut().get_mut(shard_id) {
                        if shard.source_id() == Some(to) {
                            shard.clear_source_id();
                        }
                    }
                }
            }
        }

        self.assign_shard(new_shard, to);
        true
    }

    fn assign_shard(&mut self, shard: Shard, to: &str) {
        self.shard_to_instances
            .entry(shard.id())
            .or_default()
            .insert(to.to_string());
        if let Some(instance) = self.instances.get_mut(to) {
            instance.shards_mut().add(shard);
        }
    }

    fn move_one_shard(&mut self, from: &str, to: &str) -> bool {
        // Unknown shards were never committed and initializing shards have
        // not finished bootstrapping, so both are cheaper to relocate than
        // available shards.
        self.move_one_shard_in_state(from, to, ShardState::Unknown)
            || self.move_one_shard_in_state(from, to, ShardState::Initializing)
            || self.move_one_shard_in_state(from, to, ShardState::Available)
    }

    fn move_one_shard_in_state(&mut self, from: &str, to: &str, state: ShardState) -> bool {
        let candidates: Vec<Shard> = match self.instances.get(from) {
            Some(i) => i.shards().by_state(state).cloned().collect(),
            None => return false,
        };
        for shard in candidates {
            if self.move_shard(shard, Some(from), to) {
                return true;
            }
        }
        false
    }

    /// Distribute shards to candidate instances, aware of where they come
    /// from.
    ///
    /// Initializing shards whose source is among the candidates are returned
    /// to their source first; the rest are placed by repeatedly offering each
    /// shard to the emptiest candidate. Fails with
    /// [`Error::NotEnoughRacks`] when a shard fits on no candidate.
    pub fn place_shards(
        &mut self,
        shards: Vec<Shard>,
        from: Option<&str>,
        candidates: &[String],
    ) -> Result<()> {
        let mut shard_map: BTreeMap<ShardId, Shard> =
            shards.into_iter().map(|s| (s.id(), s)).collect();
        if let Some(from_id) = from {
            // An instance pulled out before bootstrapping finished returns
            // its in-flight shards to the original owners, saving redundant
            // bootstrap work.
            self.return_shards_to_sources(&mut shard_map, from_id, candidates);
        }

        let mut heap = self.build_heap(self.non_leaving(candidates), true);
        let mut tried = Vec::new();
        for (_, shard) in shard_map {
            if shard.state() == ShardState::Leaving {
                continue;
            }
            let mut placed = false;
            while let Some(to) = heap.pop() {
                let moved = self.move_shard(shard.clone(), from, &to);
                tried.push(to);
                if moved {
                    placed = true;
                    break;
                }
            }
            if !placed {
                return Err(Error::NotEnoughRacks);
            }
            for id in tried.drain(..) {
                self.push_entry(&mut heap, id);
            }
        }
        Ok(())
    }

    /// Return all initializing shards on the instance to their original
    /// owners.
    pub fn return_initializing_shards(&mut self, instance_id: &str) {
        let shards = self.shards_of(instance_id);
        let mut shard_map: BTreeMap<ShardId, Shard> =
            shards.into_iter().map(|s| (s.id(), s)).collect();
        let candidates = self.instance_ids();
        self.return_shards_to_sources(&mut shard_map, instance_id, &candidates);
    }

    fn return_shards_to_sources(
        &mut self,
        shard_map: &mut BTreeMap<ShardId, Shard>,
        from: &str,
        candidates: &[String],
    ) {
        let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let shard_ids: Vec<ShardId> = shard_map.keys().copied().collect();
        for id in shard_ids {
            let shard = match shard_map.get(&id) {
                Some(s) => s.clone(),
                None => continue,
            };
            if shard.state() != ShardState::Initializing {
                continue;
            }
            let source = match shard.source_id() {
                Some(s) => s.to_string(),
                None => continue,
            };
            // Candidates are not necessarily all instances in the placement,
            // and a leaving source cannot take its shard back.
            if !candidate_set.contains(source.as_str()) {
                continue;
            }
            let source_leaving = self
                .instances
                .get(&source)
                .map(|i| i.is_leaving())
                .unwrap_or(true);
            if source_leaving {
                continue;
            }
            if self.move_shard(shard, Some(from), &source) {
                shard_map.remove(&id);
            }
        }
    }

    /// Reclaim the leaving shards on the instance by pulling the paired
    /// initializing copies back from the rest of the cluster.
    pub fn reclaim_leaving_shards(&mut self, instance_id: &str) {
        let leaving = match self.instances.get(instance_id) {
            Some(i) => i.shards().count_in_state(ShardState::Leaving),
            None => return,
        };
        if leaving == 0 {
            return;
        }

        let other_ids: Vec<String> = self
            .instances
            .keys()
            .filter(|id| id.as_str() != instance_id)
            .cloned()
            .collect();
        for other in other_ids {
            let shards: Vec<Shard> = self
                .instances
                .get(&other)
                .map(|i| {
                    i.shards()
                        .by_state(ShardState::Initializing)
                        .filter(|s| s.source_id() == Some(instance_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for shard in shards {
                // Reclaim can fail when the rack topology changed while the
                // instance was out; the remaining load is filled from
                // elsewhere afterwards.
                if !self.move_shard(shard.clone(), Some(&other), instance_id) {
                    warn!(
                        shard = shard.id(),
                        instance = instance_id,
                        "failed to reclaim leaving shard"
                    );
                }
            }
        }
    }

    /// Add load to a (typically new) instance: reclaim its leaving shards,
    /// then fill it to its target load from the most loaded instances.
    pub fn add_instance(&mut self, instance_id: &str) {
        self.reclaim_leaving_shards(instance_id);
        self.assign_load_unsafe(instance_id);
    }

    /// Rebalance the load distribution.
    ///
    /// Repeatedly fills the most under-loaded instance from the most loaded
    /// ones; each instance is visited at most once per call, so a second call
    /// on an already balanced placement changes nothing.
    pub fn optimize(&mut self, mode: OptimizeMode) {
        let mut visited = HashSet::new();
        while let Some(id) = self.most_under_loaded() {
            if !visited.insert(id.clone()) {
                return;
            }
            match mode {
                OptimizeMode::Safe => self.assign_load_safe(&id),
                OptimizeMode::Unsafe => self.assign_load_unsafe(&id),
            }
        }
    }

    fn most_under_loaded(&self) -> Option<String> {
        let mut best: Option<(i64, &str)> = None;
        for id in self.instances.keys() {
            if self.departing.contains(id) {
                continue;
            }
            let gap = self.remaining_load(id);
            if gap <= 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_gap, best_id)) => {
                    gap > best_gap || (gap == best_gap && id.as_str() < best_id)
                }
            };
            if better {
                best = Some((gap, id));
            }
        }
        best.map(|(_, id)| id.to_string())
    }

    fn assign_load_safe(&mut self, target: &str) {
        self.assign_target_load(target, |helper, from, to| {
            helper.move_one_shard_in_state(from, to, ShardState::Unknown)
        });
    }

    fn assign_load_unsafe(&mut self, target: &str) {
        self.assign_target_load(target, |helper, from, to| helper.move_one_shard(from, to));
    }

    fn assign_target_load<F>(&mut self, target: &str, mut move_one: F)
    where
        F: FnMut(&mut Self, &str, &str) -> bool,
    {
        let target_load = self.target_load(target);
        let candidates = self.non_leaving(&self.instance_ids());
        let mut heap = self.build_heap(candidates, false);
        while self.current_load(target) < target_load {
            let from = match heap.pop() {
                Some(id) => id,
                None => return,
            };
            if move_one(self, &from, target) {
                self.push_entry(&mut heap, from);
            }
        }
    }

    /// Produce the resulting placement, consuming the helper.
    ///
    /// Instances that ended up with no shards are dropped; every unknown
    /// shard is promoted to initializing with a fresh cutover stamp.
    pub fn generate_placement(self) -> Placement {
        let Self {
            instances,
            unique_shards,
            rf,
            opts,
            ..
        } = self;

        let mut kept: Vec<Instance> = instances
            .into_values()
            .filter(|i| !i.shards().is_empty())
            .collect();

        for instance in &mut kept {
            let unknown: Vec<Shard> = instance
                .shards()
                .by_state(ShardState::Unknown)
                .cloned()
                .collect();
            for shard in unknown {
                let mut promoted = Shard::new(shard.id())
                    .with_state(ShardState::Initializing)
                    .with_cutover_nanos(opts.shard_cutover_nanos());
                if let Some(source) = shard.source_id() {
                    promoted = promoted.with_source_id(source);
                }
                instance.shards_mut().add(promoted);
            }
        }

        Placement::new()
            .with_instances(kept)
            .with_shards(unique_shards)
            .with_replica_factor(rf)
            .with_sharded(true)
            .with_mirrored(opts.is_mirrored())
            .with_cutover_nanos(opts.placement_cutover_nanos())
    }

    fn non_leaving(&self, candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|id| {
                self.instances
                    .get(id.as_str())
                    .map(|i| !i.is_leaving())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn build_heap(&self, ids: Vec<String>, ascending: bool) -> InstanceHeap {
        let mut heap = InstanceHeap::new(ascending);
        for id in ids {
            self.push_entry(&mut heap, id);
        }
        heap
    }

    fn push_entry(&self, heap: &mut InstanceHeap, id: String) {
        let remaining = self.remaining_load(&id);
        let rack_weight = self
            .instances
            .get(&id)
            .and_then(|i| self.rack_weights.get(i.rack()))
            .copied()
            .unwrap_or(0);
        heap.push(id, remaining, rack_weight);
    }
}

fn is_rack_overweight(rack_weight: u64, total_weight: u64, rf: usize) -> bool {
    total_weight > 0 && rack_weight * rf as u64 >= total_weight
}

/// Priority queue of candidate instances.
///
/// Ascending order pops the instance furthest below its target first, for
/// placing; descending order pops the most loaded instance first, for
/// stealing. Among instances that are still below target, the one on the
/// heavier rack comes first since heavier racks are more constrained and
/// fill less readily.
struct InstanceHeap {
    ascending: bool,
    entries: BinaryHeap<HeapEntry>,
}

impl InstanceHeap {
    fn new(ascending: bool) -> Self {
        Self {
            ascending,
            entries: BinaryHeap::new(),
        }
    }

    fn push(&mut self, id: String, remaining: i64, rack_weight: u64) {
        let score = if self.ascending { remaining } else { -remaining };
        self.entries.push(HeapEntry {
            score,
            below_target: remaining > 0,
            rack_weight,
            id,
        });
    }

    fn pop(&mut self) -> Option<String> {
        self.entries.pop().map(|e| e.id)
    }
}

struct HeapEntry {
    score: i64,
    below_target: bool,
    rack_weight: u64,
    id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.below_target && other.below_target && self.rack_weight != other.rack_weight {
            return self.rack_weight.cmp(&other.rack_weight);
        }
        self.score
            .cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}
