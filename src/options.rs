//! Behavioral knobs and caller-supplied callbacks for placement operations.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::shard::Shard;

/// Callback supplying a timestamp in nanoseconds.
pub type TimeNanosFn = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Callback gating a shard state transition.
///
/// Returning an error rejects the transition; the error is surfaced to the
/// caller verbatim and the triggering operation leaves the placement
/// unchanged.
pub type ShardGateFn = Arc<dyn Fn(&Shard) -> Result<()> + Send + Sync>;

/// Options controlling placement operations.
///
/// The timestamp callbacks default to the system clock; tests inject
/// deterministic clocks instead. The cutover and cutoff gates default to
/// none, which allows every transition.
#[derive(Clone)]
pub struct Options {
    loose_rack_check: bool,
    allow_partial_replace: bool,
    is_mirrored: bool,
    placement_cutover_nanos_fn: TimeNanosFn,
    shard_cutover_nanos_fn: TimeNanosFn,
    shard_cutoff_nanos_fn: TimeNanosFn,
    is_shard_cutover_fn: Option<ShardGateFn>,
    is_shard_cutoff_fn: Option<ShardGateFn>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            loose_rack_check: false,
            allow_partial_replace: false,
            is_mirrored: false,
            placement_cutover_nanos_fn: Arc::new(system_time_nanos),
            shard_cutover_nanos_fn: Arc::new(system_time_nanos),
            shard_cutoff_nanos_fn: Arc::new(system_time_nanos),
            is_shard_cutover_fn: None,
            is_shard_cutoff_fn: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("loose_rack_check", &self.loose_rack_check)
            .field("allow_partial_replace", &self.allow_partial_replace)
            .field("is_mirrored", &self.is_mirrored)
            .field("is_shard_cutover_fn", &self.is_shard_cutover_fn.is_some())
            .field("is_shard_cutoff_fn", &self.is_shard_cutoff_fn.is_some())
            .finish()
    }
}

impl Options {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit placing a replica on a rack that already holds one.
    pub fn with_loose_rack_check(mut self, loose: bool) -> Self {
        self.loose_rack_check = loose;
        self
    }

    /// Allow replace to spill shards onto the rest of the cluster when the
    /// replacement instances cannot take them all.
    pub fn with_allow_partial_replace(mut self, allow: bool) -> Self {
        self.allow_partial_replace = allow;
        self
    }

    /// Mark generated placements as mirrored.
    pub fn with_is_mirrored(mut self, mirrored: bool) -> Self {
        self.is_mirrored = mirrored;
        self
    }

    /// Set the placement-level cutover timestamp source.
    pub fn with_placement_cutover_nanos_fn(mut self, f: TimeNanosFn) -> Self {
        self.placement_cutover_nanos_fn = f;
        self
    }

    /// Set the timestamp source for shards entering the initializing state.
    pub fn with_shard_cutover_nanos_fn(mut self, f: TimeNanosFn) -> Self {
        self.shard_cutover_nanos_fn = f;
        self
    }

    /// Set the timestamp source for shards entering the leaving state.
    pub fn with_shard_cutoff_nanos_fn(mut self, f: TimeNanosFn) -> Self {
        self.shard_cutoff_nanos_fn = f;
        self
    }

    /// Set the gate checked before a shard is marked available.
    pub fn with_is_shard_cutover_fn(mut self, f: ShardGateFn) -> Self {
        self.is_shard_cutover_fn = Some(f);
        self
    }

    /// Set the gate checked before a leaving shard is removed.
    pub fn with_is_shard_cutoff_fn(mut self, f: ShardGateFn) -> Self {
        self.is_shard_cutoff_fn = Some(f);
        self
    }

    /// Whether the rack anti-affinity check is relaxed.
    pub fn loose_rack_check(&self) -> bool {
        self.loose_rack_check
    }

    /// Whether replace may spill onto the rest of the cluster.
    pub fn allow_partial_replace(&self) -> bool {
        self.allow_partial_replace
    }

    /// Whether generated placements are marked mirrored.
    pub fn is_mirrored(&self) -> bool {
        self.is_mirrored
    }

    /// Get a placement-level cutover timestamp.
    pub fn placement_cutover_nanos(&self) -> i64 {
        (self.placement_cutover_nanos_fn)()
    }

    /// Get a cutover timestamp for a shard entering the initializing state.
    pub fn shard_cutover_nanos(&self) -> i64 {
        (self.shard_cutover_nanos_fn)()
    }

    /// Get a cutoff timestamp for a shard entering the leaving state.
    pub fn shard_cutoff_nanos(&self) -> i64 {
        (self.shard_cutoff_nanos_fn)()
    }

    /// Get the cutover gate, if any.
    pub fn is_shard_cutover_fn(&self) -> Option<&ShardGateFn> {
        self.is_shard_cutover_fn.as_ref()
    }

    /// Get the cutoff gate, if any.
    pub fn is_shard_cutoff_fn(&self) -> Option<&ShardGateFn> {
        self.is_shard_cutoff_fn.as_ref()
    }
}

fn system_time_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
