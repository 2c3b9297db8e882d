//! Shard placement engine for cluster management.
//!
//! This crate computes and mutates *placements*: assignments of a fixed
//! universe of logical shards to a fluid set of physical instances, subject
//! to replication, rack-diversity and weighted load-balance constraints.
//! Every shard copy carries a handoff state so live systems can move data
//! safely: a copy bootstraps as `Initializing` on its new owner while the old
//! owner keeps serving it as `Leaving`, until the caller marks the new copy
//! `Available`.
//!
//! # Features
//!
//! - Rack-aware replica placement: no two replicas of a shard share a
//!   failure domain unless explicitly relaxed
//! - Weighted load balancing via per-instance target loads and heap-driven
//!   assignment
//! - A per-shard handoff state machine with pluggable cutover/cutoff clocks
//!   and gates
//! - Immutable placement values: every operation returns a new placement and
//!   leaves its input untouched, even on failure
//! - Deterministic JSON serialization with full invariant validation on load
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera::{Instance, Options, ShardedAlgorithm};
//!
//! fn main() -> Result<(), tessera::Error> {
//!     let algo = ShardedAlgorithm::new(Options::new());
//!
//!     // Place 16 shards over two racks with two replicas each.
//!     let placement = algo.initial_placement(
//!         vec![
//!             Instance::new("host1").with_rack("rack1").with_weight(1),
//!             Instance::new("host2").with_rack("rack2").with_weight(1),
//!         ],
//!         (0..16).collect(),
//!         2,
//!     )?;
//!
//!     // Shards start initializing; mark them available once bootstrapped.
//!     let placement = algo.mark_all_shards_available(&placement)?;
//!
//!     // Grow the cluster; shards move over as new handoffs.
//!     let placement = algo.add_instance(
//!         &placement,
//!         Instance::new("host3").with_rack("rack3").with_weight(1),
//!     )?;
//!
//!     println!("{}", placement.to_json()?);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            ShardedAlgorithm                 │
//! │  initial_placement / add_replica            │
//! │  add_instance / remove_instance / replace   │
//! │  mark_shard_available / mark_all            │
//! └─────────────────────────────────────────────┘
//!                     │ seeds
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │            PlacementHelper                  │
//! │  target loads · rack index · shard index    │
//! │  place_shards · optimize · reclaim          │
//! └─────────────────────────────────────────────┘
//!                     │ generates
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │     Placement ── Instance ── ShardSet       │
//! │        immutable value objects              │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! The engine is single-threaded per operation and performs no locking.
//! Placements are immutable values, safe to read from any number of threads;
//! callers serialize mutations themselves, typically with a compare-and-set
//! against a stored placement version.

pub mod algo;
pub mod error;
pub mod instance;
pub mod options;
pub mod placement;
pub mod shard;

pub use algo::{OptimizeMode, PlacementHelper, ShardedAlgorithm};
pub use error::{Error, Result};
pub use instance::Instance;
pub use options::{Options, ShardGateFn, TimeNanosFn};
pub use placement::Placement;
pub use shard::{Shard, ShardId, ShardSet, ShardState};
