//! Error type for the particle store.
//!
//! Every fallible operation of [`ParticleData`](super::ParticleData) reports
//! through [`Error`]. Collective operations agree on failure: when one rank
//! detects a problem, the others return [`Error::PeerFailure`] instead of
//! blocking on a message that will never come.

use crate::comm::CommError;
use crate::model::snapshot::SnapshotError;
use crate::model::types::{Tag, Vec3};
use thiserror::Error;

/// Errors that can occur while building, mutating or querying the store.
#[derive(Debug, Error)]
pub enum Error {
    /// A store needs at least one particle type.
    #[error("the number of particle types must be positive")]
    ZeroTypes,

    /// Arrays cannot be allocated with zero capacity.
    #[error("cannot allocate particle arrays with zero capacity")]
    ZeroAllocation,

    /// The supplied snapshot is structurally invalid.
    #[error("invalid particle snapshot: {0}")]
    InvalidSnapshot(#[from] SnapshotError),

    /// A snapshot particle lies outside the global box.
    #[error("particle {index} at {position:?} lies outside the global box")]
    OutsideBox {
        /// Index of the record in the snapshot.
        index: usize,
        /// Offending position.
        position: Vec3,
    },

    /// Domain decomposition requires a box periodic along every axis.
    #[error("domain decomposition requires a fully periodic box, got periodicity {periodic:?}")]
    NonPeriodicBox {
        /// Per-axis periodicity flags of the rejected box.
        periodic: [bool; 3],
    },

    /// A processor grid has a zero dimension.
    #[error("invalid processor grid {grid:?}: every dimension must be positive")]
    InvalidGrid {
        /// Rejected grid dimensions.
        grid: [u32; 3],
    },

    /// The processor grid does not match the number of ranks.
    #[error("processor grid holds {grid_ranks} ranks but the communicator has {comm_ranks}")]
    RankCountMismatch {
        /// Ranks covered by the grid.
        grid_ranks: u32,
        /// Ranks in the communicator.
        comm_ranks: u32,
    },

    /// Failed to parse a store configuration.
    #[error("failed to parse store configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A store configuration parsed but holds unusable values.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// A particle position maps to no rank of the processor grid.
    #[error(
        "particle {tag} at {position:?} (fractional {fraction:?}) falls outside the processor grid"
    )]
    Placement {
        /// Tag or snapshot index of the particle.
        tag: Tag,
        /// Cartesian position.
        position: Vec3,
        /// Position in fractional global-box coordinates.
        fraction: Vec3,
    },

    /// No rank holds the requested particle.
    #[error("particle {tag} does not exist")]
    ParticleNotFound {
        /// Requested tag.
        tag: Tag,
    },

    /// More than one rank claims the same particle.
    #[error("particle {tag} is owned by {count} ranks")]
    MultipleOwners {
        /// Contested tag.
        tag: Tag,
        /// Number of claiming ranks.
        count: u64,
    },

    /// A pack or exchange produced a different number of records than the
    /// protocol calls for.
    #[error("expected {expected} particle records, found {found}")]
    UnexpectedRecordCount {
        /// Records the protocol calls for.
        expected: usize,
        /// Records actually produced.
        found: usize,
    },

    /// An active tag was not held by any rank when taking a snapshot.
    #[error("active particle {tag} is missing from every rank")]
    MissingFromSnapshot {
        /// Missing tag.
        tag: Tag,
    },

    /// Removal was requested from an empty system.
    #[error("cannot remove a particle from an empty system")]
    NoParticles,

    /// The tag was never issued.
    #[error("tag {tag} was never issued (maximum tag is {maximum:?})")]
    UnknownTag {
        /// Requested tag.
        tag: Tag,
        /// Largest tag issued so far, if any.
        maximum: Option<Tag>,
    },

    /// The tag was issued but the particle has already been removed.
    #[error("particle {tag} has already been removed")]
    AlreadyRemoved {
        /// Requested tag.
        tag: Tag,
    },

    /// A type id outside the type table.
    #[error("type id {type_id} is out of range for {n_types} types")]
    UnknownType {
        /// Requested type id.
        type_id: u32,
        /// Size of the type table.
        n_types: usize,
    },

    /// A type name not present in the type table.
    #[error("type name '{name}' is not defined")]
    UnknownTypeName {
        /// Requested name.
        name: String,
    },

    /// Requested the n-th active tag for `n >= n_global`.
    #[error("active particle index {index} is out of range for {n_global} particles")]
    ParticleIndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Global particle count.
        n_global: usize,
    },

    /// Another rank failed a collective operation this rank took part in.
    #[error("another rank failed during {operation}")]
    PeerFailure {
        /// Name of the collective operation.
        operation: &'static str,
    },

    /// The message-passing layer failed.
    #[error(transparent)]
    Comm(#[from] CommError),
}

impl Error {
    /// Creates a [`Placement`](Error::Placement) error.
    ///
    /// # Arguments
    ///
    /// * `tag` — Tag or snapshot index of the particle
    /// * `position` — Cartesian position that could not be placed
    /// * `fraction` — Same position in fractional box coordinates
    pub fn placement(tag: Tag, position: Vec3, fraction: Vec3) -> Self {
        Error::Placement {
            tag,
            position,
            fraction,
        }
    }

    /// Creates an [`InvalidConfig`](Error::InvalidConfig) error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Error::InvalidConfig(detail.into())
    }
}
