//! Error types for the placement engine.

use thiserror::Error;

use crate::shard::ShardId;

/// Result type alias for placement operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the placement engine.
///
/// Errors fall into four groups: precondition errors (caller bugs, fail-fast
/// with the input placement unchanged), feasibility errors (the topology
/// cannot satisfy the request), validation errors (a stored placement
/// violates an invariant), and gate errors (a caller-supplied cutover or
/// cutoff check rejected a transition).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// There are not enough distinct racks to satisfy the replica factor.
    #[error("not enough racks to place shards")]
    NotEnoughRacks,

    /// The adding instance is already in the placement.
    #[error("instance {0} already exists in the placement")]
    InstanceAlreadyExists(String),

    /// The named instance is not in the placement.
    #[error("instance {0} does not exist in the placement")]
    InstanceNotFound(String),

    /// The adding instance still owns available or unknown shards.
    #[error("instance {0} contains non-leaving shards")]
    InstanceContainsNonLeavingShards(String),

    /// The adding instance still owns initializing shards.
    #[error("instance {0} contains initializing shards")]
    InstanceContainsInitializingShards(String),

    /// The shard is not owned by the named instance.
    #[error("shard {shard} does not exist on instance {instance}")]
    ShardNotFound { instance: String, shard: ShardId },

    /// The shard is not in the initializing state.
    #[error("shard {shard} on instance {instance} is not initializing")]
    ShardNotInitializing { instance: String, shard: ShardId },

    /// The source copy of a shard is not in the leaving state.
    #[error("shard {shard} is not leaving instance {instance}")]
    ShardNotLeaving { instance: String, shard: ShardId },

    /// An initializing shard names a source instance that is not in the placement.
    #[error("source instance {source_instance} for shard {shard} does not exist in the placement")]
    SourceInstanceNotFound { source_instance: String, shard: ShardId },

    /// The operation requires a sharded placement.
    #[error("placement is not sharded")]
    PlacementNotSharded,

    /// The shard id universe contains duplicate ids.
    #[error("shard ids contain duplicates")]
    DuplicateShardIds,

    /// A single instance owns the same shard id more than once.
    #[error("instance {0} contains duplicate shard ids")]
    DuplicateInstanceShards(String),

    /// An instance owns a shard id outside the placement's universe.
    #[error("instance {instance} owns unexpected shard {shard}")]
    UnexpectedShard { instance: String, shard: ShardId },

    /// The total number of owned shards does not match shards x replica factor.
    #[error("expected {expected} total shards, found {actual}")]
    TotalShardsMismatch { expected: usize, actual: usize },

    /// A shard id is not replicated exactly replica-factor times.
    #[error("shard {shard} expected {expected} replicas, found {actual}")]
    ShardReplicaMismatch {
        shard: ShardId,
        expected: usize,
        actual: usize,
    },

    /// A serialized instance record's id does not match its map key.
    #[error("instance record {id} stored under mismatching key {key}")]
    InstanceIdMismatch { key: String, id: String },

    /// A caller-supplied cutover or cutoff gate rejected a shard transition.
    #[error("shard {shard} gate rejected: {reason}")]
    GateRejected { shard: ShardId, reason: String },

    /// Serialization or deserialization of a placement blob failed.
    #[error("placement serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
