//! Placement operations.
//!
//! Each operation is a pure function from a placement plus arguments to a new
//! placement. An operation seeds a [`PlacementHelper`] from its input, drives
//! the helper's assignment primitives, and generates the result; the helper's
//! working state is the only thing mutated, so a failed operation leaves the
//! caller's placement untouched. Callers serialize concurrent mutations
//! themselves, typically with a compare-and-set against stored placements.

mod helper;

pub use helper::{OptimizeMode, PlacementHelper};

use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::options::Options;
use crate::placement::Placement;
use crate::shard::{Shard, ShardId, ShardState};

/// The sharded placement algorithm: computes placements under replication,
/// rack-diversity and weighted load-balance constraints while driving the
/// per-shard handoff state machine.
pub struct ShardedAlgorithm {
    opts: Options,
}

impl ShardedAlgorithm {
    /// Create the algorithm with the given options.
    pub fn new(opts: Options) -> Self {
        Self { opts }
    }

    /// Create the algorithm with default options.
    pub fn with_defaults() -> Self {
        Self::new(Options::default())
    }

    /// Compute an initial placement of the shard universe over the given
    /// instances at the requested replica factor.
    ///
    /// Replicas are added one at a time: every pass places one copy of every
    /// shard, so each pass sees the previous passes' assignments when
    /// balancing load and enforcing rack diversity.
    pub fn initial_placement(
        &self,
        instances: Vec<Instance>,
        shard_ids: Vec<ShardId>,
        rf: usize,
    ) -> Result<Placement> {
        let mut seen = HashSet::with_capacity(shard_ids.len());
        for &id in &shard_ids {
            if !seen.insert(id) {
                return Err(Error::DuplicateShardIds);
            }
        }

        if !self.opts.loose_rack_check() {
            let racks: HashSet<&str> = instances.iter().map(|i| i.rack()).collect();
            if racks.len() < rf {
                return Err(Error::NotEnoughRacks);
            }
        }

        let num_instances = instances.len();
        let mut placement = Placement::new()
            .with_instances(instances)
            .with_shards(shard_ids)
            .with_replica_factor(0)
            .with_sharded(true)
            .with_cutover_nanos(self.opts.placement_cutover_nanos());

        for _ in 0..rf {
            placement = self.add_replica(&placement)?;
        }

        info!(
            instances = num_instances,
            shards = placement.num_shards(),
            rf,
            "computed initial placement"
        );
        Ok(placement)
    }

    /// Add one more replica of every shard to the placement.
    pub fn add_replica(&self, p: &Placement) -> Result<Placement> {
        self.check_sharded(p)?;
        let target_rf = p.replica_factor() + 1;
        let mut helper = PlacementHelper::with_target_rf(p, target_rf, self.opts.clone());

        if !self.opts.loose_rack_check() && helper.num_racks() < target_rf {
            return Err(Error::NotEnoughRacks);
        }

        let shards: Vec<Shard> = p.shards().iter().map(|&id| Shard::new(id)).collect();
        let candidates = helper.instance_ids();
        helper.place_shards(shards, None, &candidates)?;
        Ok(helper.generate_placement())
    }

    /// Add an instance to the placement and move load onto it.
    ///
    /// If the instance id is already present it must be fully leaving, in
    /// which case the in-placement copy is revived: its leaving shards are
    /// reclaimed from the rest of the cluster before any new load is
    /// assigned.
    pub fn add_instance(&self, p: &Placement, instance: Instance) -> Result<Placement> {
        self.check_sharded(p)?;
        let mut working = p.clone();
        let instance_id = instance.id().to_string();

        let is_new = match working.instance(&instance_id) {
            Some(existing) => {
                if !existing.is_leaving() {
                    if existing.shards().count_in_state(ShardState::Initializing) > 0 {
                        return Err(Error::InstanceContainsInitializingShards(instance_id));
                    }
                    return Err(Error::InstanceContainsNonLeavingShards(instance_id));
                }
                false
            }
            None => true,
        };
        if is_new {
            working.insert_instance(instance);
        }

        let mut helper = PlacementHelper::new(&working, self.opts.clone());
        helper.add_instance(&instance_id);
        let placement = helper.generate_placement();
        info!(instance = %instance_id, "added instance to placement");
        Ok(placement)
    }

    /// Remove an instance from the placement, redistributing its shards.
    ///
    /// In-flight handoffs onto the removed instance are returned to their
    /// original owners first; its remaining shards are spread over the rest
    /// of the cluster. The removed instance stays in the output, fully
    /// leaving, until every handoff away from it completes.
    pub fn remove_instance(&self, p: &Placement, instance_id: &str) -> Result<Placement> {
        self.check_sharded(p)?;
        let mut working = p.clone();
        let leaving = working
            .take_instance(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;

        let mut helper = PlacementHelper::new(&working, self.opts.clone());
        helper.add_departing(leaving);
        helper.return_initializing_shards(instance_id);

        let remaining = helper.shards_of(instance_id);
        let candidates = helper.instance_ids();
        helper.place_shards(remaining, Some(instance_id), &candidates)?;

        let placement = helper.generate_placement();
        info!(instance = %instance_id, "removed instance from placement");
        Ok(placement)
    }

    /// Replace instances with new ones, handing the leavers' shards to the
    /// replacements.
    ///
    /// Shards go to the replacement instances only, unless partial replace
    /// is allowed: then shards the replacements cannot take (for lack of
    /// racks) spill onto the rest of the cluster and the load is rebalanced
    /// afterwards.
    pub fn replace_instance(
        &self,
        p: &Placement,
        leaving_ids: &[&str],
        adding: Vec<Instance>,
    ) -> Result<Placement> {
        self.check_sharded(p)?;
        let mut working = p.clone();

        let mut leavers = Vec::with_capacity(leaving_ids.len());
        for &id in leaving_ids {
            let instance = working
                .take_instance(id)
                .ok_or_else(|| Error::InstanceNotFound(id.to_string()))?;
            leavers.push(instance);
        }

        let mut adding_ids = Vec::with_capacity(adding.len());
        for instance in adding {
            if working.instance(instance.id()).is_some() {
                return Err(Error::InstanceAlreadyExists(instance.id().to_string()));
            }
            adding_ids.push(instance.id().to_string());
            working.insert_instance(instance);
        }

        let mut helper = PlacementHelper::new(&working, self.opts.clone());
        for leaver in leavers {
            helper.add_departing(leaver);
        }

        let all_candidates = helper.instance_ids();
        let mut spilled = false;
        for &leaving_id in leaving_ids {
            let shards = helper.shards_of(leaving_id);
            match helper.place_shards(shards, Some(leaving_id), &adding_ids) {
                Ok(()) => {}
                Err(Error::NotEnoughRacks) if self.opts.allow_partial_replace() => {
                    warn!(
                        instance = leaving_id,
                        "replacement instances cannot take all shards, spilling onto the cluster"
                    );
                    let rest = helper.shards_of(leaving_id);
                    helper.place_shards(rest, Some(leaving_id), &all_candidates)?;
                    spilled = true;
                }
                Err(e) => return Err(e),
            }
        }
        if spilled {
            helper.optimize(OptimizeMode::Unsafe);
        }

        let placement = helper.generate_placement();
        info!(
            leaving = ?leaving_ids,
            adding = ?adding_ids,
            "replaced instances in placement"
        );
        Ok(placement)
    }

    /// Mark an initializing shard as available on its new owner, completing
    /// the handoff: the paired leaving copy on the source is removed, and a
    /// source left with no shards is dropped from the placement.
    pub fn mark_shard_available(
        &self,
        p: &Placement,
        instance_id: &str,
        shard_id: ShardId,
    ) -> Result<Placement> {
        self.check_sharded(p)?;
        let mut placement = p.clone();
        self.mark_shard_available_in_place(&mut placement, instance_id, shard_id)?;
        Ok(placement)
    }

    /// Mark every initializing shard in the placement as available.
    pub fn mark_all_shards_available(&self, p: &Placement) -> Result<Placement> {
        self.check_sharded(p)?;
        let mut placement = p.clone();
        let pending: Vec<(String, ShardId)> = placement
            .instances()
            .flat_map(|i| {
                i.shards()
                    .by_state(ShardState::Initializing)
                    .map(move |s| (i.id().to_string(), s.id()))
            })
            .collect();
        for (instance_id, shard_id) in pending {
            self.mark_shard_available_in_place(&mut placement, &instance_id, shard_id)?;
        }
        Ok(placement)
    }

    fn mark_shard_available_in_place(
        &self,
        p: &mut Placement,
        instance_id: &str,
        shard_id: ShardId,
    ) -> Result<()> {
        let instance = p
            .instance(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        let shard = instance.shards().get(shard_id).ok_or_else(|| Error::ShardNotFound {
            instance: instance_id.to_string(),
            shard: shard_id,
        })?;
        if shard.state() != ShardState::Initializing {
            return Err(Error::ShardNotInitializing {
                instance: instance_id.to_string(),
                shard: shard_id,
            });
        }
        if let Some(gate) = self.opts.is_shard_cutover_fn() {
            gate(shard)?;
        }
        let source = shard.source_id().map(|s| s.to_string());

        if let Some(instance) = p.instance_mut(instance_id) {
            instance
                .shards_mut()
                .add(Shard::new(shard_id).with_state(ShardState::Available));
        }

        // Shards placed without a handoff, e.g. by an initial placement,
        // have no source half to complete.
        let source_id = match source {
            Some(id) => id,
            None => return Ok(()),
        };

        let source_instance = p.instance(&source_id).ok_or_else(|| Error::SourceInstanceNotFound {
            source_instance: source_id.clone(),
            shard: shard_id,
        })?;
        let leaving = source_instance
            .shards()
            .get(shard_id)
            .ok_or_else(|| Error::ShardNotFound {
                instance: source_id.clone(),
                shard: shard_id,
            })?;
        if leaving.state() != ShardState::Leaving {
            return Err(Error::ShardNotLeaving {
                instance: source_id.clone(),
                shard: shard_id,
            });
        }
        if let Some(gate) = self.opts.is_shard_cutoff_fn() {
            gate(leaving)?;
        }

        let source_empty = match p.instance_mut(&source_id) {
            Some(instance) => {
                instance.shards_mut().remove(shard_id);
                instance.shards().is_empty()
            }
            None => false,
        };
        if source_empty {
            p.take_instance(&source_id);
        }
        Ok(())
    }

    fn check_sharded(&self, p: &Placement) -> Result<()> {
        if !p.is_sharded() {
            return Err(Error::PlacementNotSharded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn instance(id: &str, rack: &str, weight: u32) -> Instance {
        Instance::new(id).with_rack(rack).with_zone("z1").with_weight(weight)
    }

    fn test_algorithm() -> ShardedAlgorithm {
        ShardedAlgorithm::new(
            Options::new()
                .with_placement_cutover_nanos_fn(Arc::new(|| 1))
                .with_shard_cutover_nanos_fn(Arc::new(|| 2))
                .with_shard_cutoff_nanos_fn(Arc::new(|| 3)),
        )
    }

    /// Three single-instance racks, six shards, two replicas.
    fn initial_three(algo: &ShardedAlgorithm) -> Placement {
        algo.initial_placement(
            vec![
                instance("r1h1", "r1", 1),
                instance("r2h2", "r2", 1),
                instance("r3h3", "r3", 1),
            ],
            (0..6).collect(),
            2,
        )
        .unwrap()
    }

    fn assert_rack_diversity(p: &Placement) {
        for &shard_id in p.shards() {
            let mut racks = HashSet::new();
            for i in p.instances() {
                if let Some(s) = i.shards().get(shard_id) {
                    if s.state() != ShardState::Leaving {
                        assert!(
                            racks.insert(i.rack().to_string()),
                            "shard {} has two replicas on rack {}",
                            shard_id,
                            i.rack()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_initial_placement() {
        let algo = test_algorithm();
        let p = initial_three(&algo);

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);
        assert_eq!(p.replica_factor(), 2);
        assert_eq!(p.num_instances(), 3);
        assert_eq!(p.cutover_nanos(), 1);

        for i in p.instances() {
            assert_eq!(i.shards().len(), 4, "instance {}", i.id());
            for s in i.shards().all() {
                assert_eq!(s.state(), ShardState::Initializing);
                assert_eq!(s.source_id(), None);
                assert_eq!(s.cutover_nanos(), 2);
            }
        }
    }

    #[test]
    fn test_initial_placement_rejects_duplicate_shard_ids() {
        let algo = test_algorithm();
        let result = algo.initial_placement(
            vec![instance("r1h1", "r1", 1)],
            vec![0, 1, 1],
            1,
        );
        assert_eq!(result, Err(Error::DuplicateShardIds));
    }

    #[test]
    fn test_mark_all_shards_available() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        assert!(p.validate().is_ok());
        for i in p.instances() {
            for s in i.shards().all() {
                assert_eq!(s.state(), ShardState::Available);
            }
        }
    }

    #[test]
    fn test_add_instance() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo.add_instance(&p, instance("r4h4", "r4", 1)).unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);
        assert_eq!(p.num_instances(), 4);

        // Twelve ownerships over four even instances put the target at three.
        let added = p.instance("r4h4").unwrap();
        assert_eq!(added.shards().len(), 3);
        for s in added.shards().all() {
            assert_eq!(s.state(), ShardState::Initializing);
            let source = s.source_id().expect("moved shard keeps its source");
            let paired = p.instance(source).unwrap().shards().get(s.id()).unwrap();
            assert_eq!(paired.state(), ShardState::Leaving);
            assert_eq!(paired.cutoff_nanos(), 3);
        }
    }

    #[test]
    fn test_add_instance_rejects_existing_with_available_shards() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        assert_eq!(
            algo.add_instance(&p, instance("r1h1", "r1", 1)),
            Err(Error::InstanceContainsNonLeavingShards("r1h1".to_string()))
        );
    }

    #[test]
    fn test_add_instance_rejects_existing_with_initializing_shards() {
        let algo = test_algorithm();
        let p = initial_three(&algo);

        assert_eq!(
            algo.add_instance(&p, instance("r1h1", "r1", 1)),
            Err(Error::InstanceContainsInitializingShards("r1h1".to_string()))
        );
    }

    #[test]
    fn test_remove_instance() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo.remove_instance(&p, "r3h3").unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);

        // The removed instance stays, fully leaving, until handoffs complete.
        let removed = p.instance("r3h3").unwrap();
        assert!(removed.is_leaving());
        assert_eq!(removed.shards().len(), 4);
        for s in removed.shards().all() {
            assert_eq!(s.cutoff_nanos(), 3);
        }

        // Every leaving shard pairs with an initializing copy elsewhere.
        for s in removed.shards().all() {
            let new_owner = p
                .instances()
                .find(|i| {
                    i.id() != "r3h3"
                        && i.shards()
                            .get(s.id())
                            .map(|c| c.state() == ShardState::Initializing)
                            .unwrap_or(false)
                })
                .expect("shard has a new owner");
            let copy = new_owner.shards().get(s.id()).unwrap();
            assert_eq!(copy.source_id(), Some("r3h3"));
        }
    }

    #[test]
    fn test_remove_instance_then_mark_available_drops_it() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo.remove_instance(&p, "r3h3").unwrap();
        let p = algo.mark_all_shards_available(&p).unwrap();

        assert!(p.validate().is_ok());
        assert!(p.instance("r3h3").is_none());
        assert_eq!(p.num_instances(), 2);
    }

    #[test]
    fn test_remove_unknown_instance() {
        let algo = test_algorithm();
        let p = initial_three(&algo);

        assert_eq!(
            algo.remove_instance(&p, "nope"),
            Err(Error::InstanceNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_replace_instance_same_rack() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo
            .replace_instance(&p, &["r1h1"], vec![instance("r1h1b", "r1", 1)])
            .unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);

        let old = p.instance("r1h1").unwrap();
        assert!(old.is_leaving());
        assert_eq!(old.shards().len(), 4);

        let new = p.instance("r1h1b").unwrap();
        assert_eq!(new.shards().len(), 4);
        for s in new.shards().all() {
            assert_eq!(s.state(), ShardState::Initializing);
            assert_eq!(s.source_id(), Some("r1h1"));
        }
    }

    #[test]
    fn test_replace_instance_rejects_existing_replacement() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        assert_eq!(
            algo.replace_instance(&p, &["r1h1"], vec![instance("r2h2", "r2", 1)]),
            Err(Error::InstanceAlreadyExists("r2h2".to_string()))
        );
    }

    #[test]
    fn test_replace_instance_conflicting_rack_requires_partial() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        // A replacement on r2 cannot take the shards whose other replica
        // already sits on r2h2.
        assert_eq!(
            algo.replace_instance(&p, &["r1h1"], vec![instance("r2h9", "r2", 1)]),
            Err(Error::NotEnoughRacks)
        );
    }

    #[test]
    fn test_replace_instance_partial_spills_onto_cluster() {
        let algo = ShardedAlgorithm::new(
            Options::new()
                .with_placement_cutover_nanos_fn(Arc::new(|| 1))
                .with_shard_cutover_nanos_fn(Arc::new(|| 2))
                .with_shard_cutoff_nanos_fn(Arc::new(|| 3))
                .with_allow_partial_replace(true),
        );
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo
            .replace_instance(&p, &["r1h1"], vec![instance("r2h9", "r2", 1)])
            .unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);
        assert!(p.instance("r1h1").unwrap().is_leaving());

        // The replacement took what it could; the rest spilled elsewhere.
        let spilled: usize = p
            .instances()
            .filter(|i| i.id() != "r2h9")
            .map(|i| {
                i.shards()
                    .all()
                    .filter(|s| s.source_id() == Some("r1h1"))
                    .count()
            })
            .sum();
        let taken = p
            .instance("r2h9")
            .unwrap()
            .shards()
            .all()
            .filter(|s| s.source_id() == Some("r1h1"))
            .count();
        assert_eq!(spilled + taken, 4);
        assert!(spilled > 0);
    }

    #[test]
    fn test_add_replica() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo.add_replica(&p).unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);
        assert_eq!(p.replica_factor(), 3);
        for i in p.instances() {
            assert_eq!(i.shards().len(), 6, "instance {}", i.id());
            assert_eq!(i.shards().count_in_state(ShardState::Initializing), 2);
        }
    }

    #[test]
    fn test_not_enough_racks() {
        let algo = test_algorithm();
        let result = algo.initial_placement(
            vec![
                instance("r1h1", "r1", 1),
                instance("r1h2", "r1", 1),
                instance("r2h3", "r2", 1),
            ],
            (0..6).collect(),
            3,
        );
        assert_eq!(result, Err(Error::NotEnoughRacks));
    }

    #[test]
    fn test_loose_rack_check_allows_colocated_replicas() {
        let algo = ShardedAlgorithm::new(
            Options::new()
                .with_placement_cutover_nanos_fn(Arc::new(|| 1))
                .with_shard_cutover_nanos_fn(Arc::new(|| 2))
                .with_shard_cutoff_nanos_fn(Arc::new(|| 3))
                .with_loose_rack_check(true),
        );
        let p = algo
            .initial_placement(
                vec![
                    instance("r1h1", "r1", 1),
                    instance("r1h2", "r1", 1),
                    instance("r2h3", "r2", 1),
                ],
                (0..6).collect(),
                3,
            )
            .unwrap();

        assert!(p.validate().is_ok());
        assert_eq!(p.replica_factor(), 3);
    }

    #[test]
    fn test_reclaim_on_remove_before_bootstrap() {
        // Adding an instance and removing it before any handoff completes
        // must return the in-flight shards to their sources untouched.
        let algo = test_algorithm();
        let stable = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        let grown = algo.add_instance(&stable, instance("r4h4", "r4", 1)).unwrap();
        let shrunk = algo.remove_instance(&grown, "r4h4").unwrap();

        assert_eq!(shrunk, stable);
    }

    #[test]
    fn test_add_instance_reclaims_leaving_shards() {
        // Removing an instance and re-adding it before any handoff completes
        // restores its shards without new data motion.
        let algo = test_algorithm();
        let stable = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        let shrunk = algo.remove_instance(&stable, "r3h3").unwrap();
        let regrown = algo.add_instance(&shrunk, instance("r3h3", "r3", 1)).unwrap();

        assert_eq!(regrown, stable);
    }

    #[test]
    fn test_mark_shard_available() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();
        let p = algo.remove_instance(&p, "r3h3").unwrap();

        let (owner, shard_id) = p
            .instances()
            .flat_map(|i| {
                i.shards()
                    .by_state(ShardState::Initializing)
                    .map(move |s| (i.id().to_string(), s.id()))
            })
            .next()
            .unwrap();

        let marked = algo.mark_shard_available(&p, &owner, shard_id).unwrap();

        let copy = marked.instance(&owner).unwrap().shards().get(shard_id).unwrap();
        assert_eq!(copy.state(), ShardState::Available);
        assert_eq!(copy.source_id(), None);
        assert!(!marked.instance("r3h3").unwrap().shards().contains(shard_id));

        // The input placement is untouched.
        assert_eq!(
            p.instance(&owner).unwrap().shards().get(shard_id).unwrap().state(),
            ShardState::Initializing
        );
    }

    #[test]
    fn test_mark_shard_available_preconditions() {
        let algo = test_algorithm();
        let p = algo.mark_all_shards_available(&initial_three(&algo)).unwrap();

        assert_eq!(
            algo.mark_shard_available(&p, "nope", 0),
            Err(Error::InstanceNotFound("nope".to_string()))
        );
        assert_eq!(
            algo.mark_shard_available(&p, "r1h1", 99),
            Err(Error::ShardNotFound {
                instance: "r1h1".to_string(),
                shard: 99
            })
        );
        // All shards are available already.
        let shard_id = p.instance("r1h1").unwrap().shards().ids()[0];
        assert_eq!(
            algo.mark_shard_available(&p, "r1h1", shard_id),
            Err(Error::ShardNotInitializing {
                instance: "r1h1".to_string(),
                shard: shard_id
            })
        );
    }

    #[test]
    fn test_mark_shard_available_cutover_gate() {
        let base = test_algorithm();
        let p = base.mark_all_shards_available(&initial_three(&base)).unwrap();
        let p = base.remove_instance(&p, "r3h3").unwrap();

        let gated = ShardedAlgorithm::new(
            Options::new().with_is_shard_cutover_fn(Arc::new(|s| {
                Err(Error::GateRejected {
                    shard: s.id(),
                    reason: "not yet cut over".to_string(),
                })
            })),
        );

        let (owner, shard_id) = p
            .instances()
            .flat_map(|i| {
                i.shards()
                    .by_state(ShardState::Initializing)
                    .map(move |s| (i.id().to_string(), s.id()))
            })
            .next()
            .unwrap();

        assert_eq!(
            gated.mark_shard_available(&p, &owner, shard_id),
            Err(Error::GateRejected {
                shard: shard_id,
                reason: "not yet cut over".to_string()
            })
        );
    }

    #[test]
    fn test_mark_shard_available_cutoff_gate() {
        let base = test_algorithm();
        let p = base.mark_all_shards_available(&initial_three(&base)).unwrap();
        let p = base.remove_instance(&p, "r3h3").unwrap();

        let gated = ShardedAlgorithm::new(
            Options::new().with_is_shard_cutoff_fn(Arc::new(|s| {
                Err(Error::GateRejected {
                    shard: s.id(),
                    reason: "still serving".to_string(),
                })
            })),
        );

        let (owner, shard_id) = p
            .instances()
            .flat_map(|i| {
                i.shards()
                    .by_state(ShardState::Initializing)
                    .map(move |s| (i.id().to_string(), s.id()))
            })
            .next()
            .unwrap();

        assert_eq!(
            gated.mark_shard_available(&p, &owner, shard_id),
            Err(Error::GateRejected {
                shard: shard_id,
                reason: "still serving".to_string()
            })
        );
    }

    #[test]
    fn test_operations_require_sharded_placement() {
        let algo = test_algorithm();
        let p = Placement::new().with_instances(vec![instance("r1h1", "r1", 1)]);

        assert_eq!(algo.add_replica(&p), Err(Error::PlacementNotSharded));
        assert_eq!(
            algo.add_instance(&p, instance("r2h2", "r2", 1)),
            Err(Error::PlacementNotSharded)
        );
        assert_eq!(
            algo.remove_instance(&p, "r1h1"),
            Err(Error::PlacementNotSharded)
        );
        assert_eq!(
            algo.mark_all_shards_available(&p),
            Err(Error::PlacementNotSharded)
        );
    }

    #[test]
    fn test_mirrored_flag_propagates() {
        let algo = ShardedAlgorithm::new(
            Options::new()
                .with_placement_cutover_nanos_fn(Arc::new(|| 1))
                .with_shard_cutover_nanos_fn(Arc::new(|| 2))
                .with_shard_cutoff_nanos_fn(Arc::new(|| 3))
                .with_is_mirrored(true),
        );
        let p = initial_three(&algo);
        assert!(p.is_mirrored());
    }

    #[test]
    fn test_weighted_initial_placement() {
        let algo = test_algorithm();
        let p = algo
            .initial_placement(
                vec![
                    instance("r1h1", "r1", 1),
                    instance("r2h2", "r2", 2),
                    instance("r3h3", "r3", 1),
                ],
                (0..8).collect(),
                2,
            )
            .unwrap();

        assert!(p.validate().is_ok());
        assert_rack_diversity(&p);

        // r2h2 carries twice the weight of the others; r2 meets the 1/rf
        // threshold so it is capped at the full shard count.
        let heavy = p.instance("r2h2").unwrap().shards().len();
        let light1 = p.instance("r1h1").unwrap().shards().len();
        let light2 = p.instance("r3h3").unwrap().shards().len();
        assert_eq!(heavy + light1 + light2, 16);
        assert!(heavy >= light1 && heavy >= light2);
    }
}
