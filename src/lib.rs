//! Distributed, structure-of-arrays storage for the particles of a
//! molecular dynamics simulation.
//!
//! Every particle carries a stable integer *tag* for its whole life, while
//! its data lives in whatever local slot the owning rank currently assigns
//! it. The store keeps the tag-to-slot index consistent through insertion,
//! removal, compaction and migration between ranks of a spatial domain
//! decomposition.
//!
//! # Features
//!
//! - **Amortized SoA arrays** — Per-particle fields in parallel arrays that
//!   grow geometrically and compact in place with a double buffer
//! - **Stable tags** — Reverse tag lookup, an ordered active-tag set and
//!   last-in-first-out reuse of retired tags
//! - **Domain decomposition** — A regular processor grid over a periodic box,
//!   with bulk migration and single-particle relocation
//! - **Snapshots** — Tag-ordered global copies gathered on rank 0, and bulk
//!   loads distributed from them
//! - **Change signals** — Synchronous notifications for collaborators that
//!   cache particle-derived state
//!
//! # Quick Start
//!
//! ```
//! use particle_store::{BoxDim, ParticleData, SerialCommunicator, StoreError};
//!
//! // Four default particles of one type in a 10 x 10 x 10 periodic box
//! let mut pdata = ParticleData::new(4, BoxDim::cube(10.0), 1, SerialCommunicator::new(), None)?;
//! assert_eq!(pdata.n_global(), 4);
//! assert_eq!(pdata.mass(2)?, 1.0);
//!
//! // Positions are wrapped into the box; the image counter records the crossing
//! pdata.set_position(2, [6.0, 0.0, 0.0], true)?;
//! assert_eq!(pdata.position(2)?, [-4.0, 0.0, 0.0]);
//! assert_eq!(pdata.image(2)?, [1, 0, 0]);
//!
//! // Retired tags are handed out again
//! pdata.remove_particle(1)?;
//! assert_eq!(pdata.add_particle(0)?, 1);
//!
//! // Rank 0 receives a snapshot in ascending tag order
//! let taken = pdata.take_snapshot()?.expect("rank 0 holds the snapshot");
//! assert_eq!(taken.snapshot.size, 4);
//! assert_eq!(taken.snapshot.pos[2], [-4.0, 0.0, 0.0]);
//! # Ok::<(), StoreError>(())
//! ```
//!
//! # Module Organization
//!
//! - [`comm`] — Rank-to-rank messaging: the [`Communicator`] trait, a serial
//!   transport and an in-process thread cluster
//! - [`ParticleData`] — The store itself
//! - [`StoreConfig`] — Declarative setup loaded from TOML
//!
//! # Data Types
//!
//! - [`BoxDim`] — Simulation box with per-axis periodicity
//! - [`SnapshotParticleData`] — Global per-particle data plus type names
//! - [`PackedParticle`] — Fixed-size migration record
//! - [`PositionType`], [`VelocityMass`] — Paired per-particle fields
//! - [`DomainDecomposition`] — Processor grid and particle placement
//! - [`ParticleSignals`] — Subscriber lists for every store notification

mod model;
mod pdata;

pub mod comm;

pub use comm::{Communicator, CommunicatorExt, LocalCluster, SerialCommunicator};

pub use model::boxdim::BoxDim;
pub use model::packed::PackedParticle;
pub use model::snapshot::{SnapshotError, SnapshotParticleData};
pub use model::types::{
    IDENTITY_ORIENTATION, Image, NO_BODY, NO_DESTINATION, NOT_LOCAL, PositionType, Quat, Tag,
    Vec3, VelocityMass,
};

pub use pdata::{
    ArrayStore, DEFAULT_RESIZE_FACTOR, DomainDecomposition, MigrationSummary, ParticleArrays,
    ParticleData, ParticleMove, ParticleSignals, Signal, SlotId, StoreConfig, TagIndex,
    TakenSnapshot, default_type_names, get_default_config, load_config,
};

pub use pdata::Error as StoreError;
