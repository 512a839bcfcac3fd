//! The distributed particle store.
//!
//! [`ParticleData`] owns the per-particle arrays of one rank, the tag
//! bookkeeping, the type table and the change-notification hub. It is the
//! single context object the rest of a simulation talks to:
//!
//! - tag-addressed accessors that resolve ownership across ranks
//! - single-particle insert and remove with tag recycling
//! - bulk migration of particles that left the local domain
//! - global snapshots in ascending tag order, and bulk loads from them
//!
//! Operations documented as *collective* must be called by every rank in
//! the same order.

mod arrays;
mod codec;
mod config;
mod decomposition;
mod error;
mod migrate;
mod signals;
mod tags;

pub use arrays::{ArrayStore, ParticleArrays};
pub use codec::TakenSnapshot;
pub use config::{
    DEFAULT_RESIZE_FACTOR, StoreConfig, default_type_names, get_default_config, load_config,
};
pub use decomposition::DomainDecomposition;
pub use error::Error;
pub use migrate::MigrationSummary;
pub use signals::{ParticleMove, ParticleSignals, Signal, SlotId};
pub use tags::TagIndex;

use crate::comm::{Communicator, CommunicatorExt};
use crate::model::boxdim::BoxDim;
use crate::model::packed::PackedParticle;
use crate::model::snapshot::SnapshotParticleData;
use crate::model::types::{Image, NO_DESTINATION, PositionType, Quat, Tag, Vec3};
use bytemuck::Pod;
use log::info;

/// Rank that assembles snapshots and seeds bulk loads.
pub(crate) const ROOT: u32 = 0;

/// Particle data of one rank, plus the replicated global bookkeeping.
pub struct ParticleData<C: Communicator> {
    comm: C,
    decomposition: Option<DomainDecomposition>,
    global_box: BoxDim,
    local_box: BoxDim,
    arrays: ArrayStore,
    tags: TagIndex,
    type_mapping: Vec<String>,
    n_global: usize,
    signals: ParticleSignals,
}

impl<C: Communicator> ParticleData<C> {
    /// Creates `n_global` default particles of type 0 at the origin, with
    /// `n_types` types named `A`, `B`, ...
    ///
    /// Collective.
    pub fn new(
        n_global: usize,
        global_box: BoxDim,
        n_types: usize,
        comm: C,
        decomposition: Option<DomainDecomposition>,
    ) -> Result<Self, Error> {
        if n_types == 0 {
            return Err(Error::ZeroTypes);
        }
        let mut pdata = Self::empty(global_box, comm, decomposition, DEFAULT_RESIZE_FACTOR)?;
        let mut snapshot = SnapshotParticleData::new(pdata.root_only(n_global));
        snapshot.type_mapping = default_type_names(n_types);
        pdata.initialize_from_snapshot(&snapshot, false)?;
        Ok(pdata)
    }

    /// Creates a store holding the particles of `snapshot`.
    ///
    /// Only the snapshot passed on rank 0 is read. Collective.
    pub fn from_snapshot(
        snapshot: &SnapshotParticleData,
        global_box: BoxDim,
        comm: C,
        decomposition: Option<DomainDecomposition>,
    ) -> Result<Self, Error> {
        let mut pdata = Self::empty(global_box, comm, decomposition, DEFAULT_RESIZE_FACTOR)?;
        pdata.initialize_from_snapshot(snapshot, false)?;
        Ok(pdata)
    }

    /// Creates a store as described by `config`. Collective.
    pub fn from_config(config: &StoreConfig, comm: C) -> Result<Self, Error> {
        config.validate()?;
        let mut pdata = Self::empty(
            config.global_box(),
            comm,
            config.decomposition()?,
            config.resize_factor,
        )?;
        let mut snapshot = SnapshotParticleData::new(pdata.root_only(config.n_particles));
        snapshot.type_mapping = config.type_mapping();
        pdata.initialize_from_snapshot(&snapshot, false)?;
        Ok(pdata)
    }

    fn empty(
        global_box: BoxDim,
        comm: C,
        decomposition: Option<DomainDecomposition>,
        resize_factor: f64,
    ) -> Result<Self, Error> {
        let local_box = match decomposition {
            Some(d) => {
                if !global_box.is_fully_periodic() {
                    return Err(Error::NonPeriodicBox {
                        periodic: global_box.periodic(),
                    });
                }
                if d.n_ranks() != comm.size() {
                    return Err(Error::RankCountMismatch {
                        grid_ranks: d.n_ranks(),
                        comm_ranks: comm.size(),
                    });
                }
                d.local_box(&global_box, comm.rank())
            }
            None if comm.size() != 1 => {
                return Err(Error::RankCountMismatch {
                    grid_ranks: 1,
                    comm_ranks: comm.size(),
                });
            }
            None => global_box,
        };
        info!(
            "rank {} of {}: particle store over box {:?} (local {:?})",
            comm.rank(),
            comm.size(),
            global_box.lengths(),
            local_box.lengths()
        );
        Ok(Self {
            comm,
            decomposition,
            global_box,
            local_box,
            arrays: ArrayStore::new(resize_factor),
            tags: TagIndex::new(),
            type_mapping: Vec::new(),
            n_global: 0,
            signals: ParticleSignals::default(),
        })
    }

    fn root_only(&self, n: usize) -> usize {
        if self.comm.rank() == ROOT { n } else { 0 }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> u32 {
        self.comm.rank()
    }

    pub fn decomposition(&self) -> Option<&DomainDecomposition> {
        self.decomposition.as_ref()
    }

    pub fn signals(&self) -> &ParticleSignals {
        &self.signals
    }

    pub fn signals_mut(&mut self) -> &mut ParticleSignals {
        &mut self.signals
    }

    pub fn n_global(&self) -> usize {
        self.n_global
    }

    pub fn n_local(&self) -> usize {
        self.arrays.n_local()
    }

    pub fn n_ghosts(&self) -> usize {
        self.arrays.n_ghost()
    }

    pub fn n_types(&self) -> usize {
        self.type_mapping.len()
    }

    pub fn capacity(&self) -> usize {
        self.arrays.capacity()
    }

    /// Number of times the local arrays have been reallocated.
    pub fn reallocation_count(&self) -> usize {
        self.arrays.reallocation_count()
    }

    /// Largest tag ever issued.
    pub fn maximum_tag(&self) -> Option<Tag> {
        self.tags.maximum_tag()
    }

    pub fn global_box(&self) -> &BoxDim {
        &self.global_box
    }

    pub fn local_box(&self) -> &BoxDim {
        &self.local_box
    }

    /// Replaces the global box and recomputes the local sub-box.
    ///
    /// With a decomposition, rank 0's box is used everywhere. Collective.
    pub fn set_global_box(&mut self, global_box: BoxDim) -> Result<(), Error> {
        let global_box = match self.decomposition {
            Some(d) => {
                let global_box = self.comm.broadcast_value(ROOT, &global_box)?;
                if !global_box.is_fully_periodic() {
                    return Err(Error::NonPeriodicBox {
                        periodic: global_box.periodic(),
                    });
                }
                self.local_box = d.local_box(&global_box, self.comm.rank());
                global_box
            }
            None => {
                self.local_box = global_box;
                global_box
            }
        };
        self.global_box = global_box;
        self.signals.box_changed.emit(&global_box);
        Ok(())
    }

    /// Live per-particle arrays. Slots `0..n_local()` are local particles,
    /// followed by `n_ghosts()` ghosts.
    pub fn arrays(&self) -> &ParticleArrays {
        self.arrays.front()
    }

    pub fn arrays_mut(&mut self) -> &mut ParticleArrays {
        self.arrays.front_mut()
    }

    /// Per-slot destination ranks for the next
    /// [`remove_particles`](Self::remove_particles).
    pub fn comm_flags_mut(&mut self) -> &mut [u32] {
        let n = self.arrays.n_local();
        &mut self.arrays.comm_flags_mut()[..n]
    }

    /// Reverse lookup from tag to local slot.
    pub fn rtags(&self) -> &[u32] {
        self.tags.rtags()
    }

    /// Grows the arrays to at least `capacity` slots.
    pub fn reserve(&mut self, capacity: usize) {
        if let Some(capacity) = self.arrays.reserve(capacity) {
            self.signals.capacity_changed.emit(&capacity);
        }
    }

    fn resize_local(&mut self, n_local: usize) {
        if let Some(capacity) = self.arrays.resize(n_local) {
            self.signals.capacity_changed.emit(&capacity);
        }
    }

    /// Makes room for `n` ghost particles after the current ghosts.
    pub fn add_ghost_particles(&mut self, n: usize) {
        if let Some(capacity) = self.arrays.add_ghosts(n) {
            self.signals.capacity_changed.emit(&capacity);
        }
    }

    /// Discards all ghosts. Subscribers are notified first, and only if
    /// there were any.
    pub fn remove_all_ghost_particles(&mut self) {
        let n_ghost = self.arrays.n_ghost();
        if n_ghost > 0 {
            self.signals.ghosts_removed.emit(&n_ghost);
            self.arrays.remove_all_ghosts();
        }
    }

    /// Local slot of `tag`, or `None` if another rank holds it.
    fn lookup(&self, tag: Tag) -> Result<Option<usize>, Error> {
        if !self.tags.is_issued(tag) {
            return Err(Error::UnknownTag {
                tag,
                maximum: self.tags.maximum_tag(),
            });
        }
        Ok(self
            .tags
            .slot_of(tag)
            .filter(|&slot| slot < self.arrays.n_local()))
    }

    /// True if the particle is resident on this rank.
    pub fn is_local(&self, tag: Tag) -> bool {
        matches!(self.lookup(tag), Ok(Some(_)))
    }

    /// Rank holding `tag`. Collective when decomposed.
    pub fn owner_rank(&self, tag: Tag) -> Result<u32, Error> {
        let slot = self.lookup(tag)?;
        if self.decomposition.is_none() {
            return slot.map(|_| ROOT).ok_or(Error::ParticleNotFound { tag });
        }
        let found = self.comm.all_reduce_sum(slot.is_some() as u64)?;
        match found {
            0 => return Err(Error::ParticleNotFound { tag }),
            1 => {}
            count => return Err(Error::MultipleOwners { tag, count }),
        }
        let claim = slot.map_or(-1, |_| self.comm.rank() as i64);
        Ok(self.comm.all_reduce_max(claim)? as u32)
    }

    fn read_field<T: Pod>(
        &self,
        tag: Tag,
        read: impl FnOnce(&ParticleArrays, usize) -> T,
    ) -> Result<T, Error> {
        let local = self.lookup(tag)?.map(|idx| read(self.arrays.front(), idx));
        if self.decomposition.is_none() {
            return local.ok_or(Error::ParticleNotFound { tag });
        }
        let owner = self.owner_rank(tag)?;
        Ok(self
            .comm
            .broadcast_pod(owner, local.unwrap_or_else(T::zeroed))?)
    }

    /// Applies `write` on the owning rank. Returns whether this rank owns
    /// the particle.
    fn write_field(
        &mut self,
        tag: Tag,
        write: impl FnOnce(&mut ParticleArrays, usize),
    ) -> Result<bool, Error> {
        let slot = self.lookup(tag)?;
        if self.decomposition.is_some() {
            self.owner_rank(tag)?;
        } else if slot.is_none() {
            return Err(Error::ParticleNotFound { tag });
        }
        if let Some(idx) = slot {
            write(self.arrays.front_mut(), idx);
        }
        Ok(slot.is_some())
    }

    pub fn position(&self, tag: Tag) -> Result<Vec3, Error> {
        self.read_field(tag, |a, i| a.pos[i].position)
    }

    pub fn velocity(&self, tag: Tag) -> Result<Vec3, Error> {
        self.read_field(tag, |a, i| a.vel[i].velocity)
    }

    pub fn acceleration(&self, tag: Tag) -> Result<Vec3, Error> {
        self.read_field(tag, |a, i| a.accel[i])
    }

    pub fn image(&self, tag: Tag) -> Result<Image, Error> {
        self.read_field(tag, |a, i| a.image[i])
    }

    pub fn charge(&self, tag: Tag) -> Result<f64, Error> {
        self.read_field(tag, |a, i| a.charge[i])
    }

    pub fn mass(&self, tag: Tag) -> Result<f64, Error> {
        self.read_field(tag, |a, i| a.vel[i].mass)
    }

    pub fn diameter(&self, tag: Tag) -> Result<f64, Error> {
        self.read_field(tag, |a, i| a.diameter[i])
    }

    pub fn body(&self, tag: Tag) -> Result<u32, Error> {
        self.read_field(tag, |a, i| a.body[i])
    }

    pub fn type_id(&self, tag: Tag) -> Result<u32, Error> {
        self.read_field(tag, |a, i| a.pos[i].type_id)
    }

    pub fn orientation(&self, tag: Tag) -> Result<Quat, Error> {
        self.read_field(tag, |a, i| a.orientation[i])
    }

    pub fn angular_momentum(&self, tag: Tag) -> Result<Quat, Error> {
        self.read_field(tag, |a, i| a.angmom[i])
    }

    pub fn moment_of_inertia(&self, tag: Tag) -> Result<Vec3, Error> {
        self.read_field(tag, |a, i| a.inertia[i])
    }

    /// Net force `(x, y, z)` and potential energy.
    pub fn net_force(&self, tag: Tag) -> Result<[f64; 4], Error> {
        self.read_field(tag, |a, i| a.net_force[i])
    }

    pub fn net_torque(&self, tag: Tag) -> Result<[f64; 4], Error> {
        self.read_field(tag, |a, i| a.net_torque[i])
    }

    pub fn net_virial(&self, tag: Tag) -> Result<[f64; 6], Error> {
        self.read_field(tag, |a, i| a.net_virial[i])
    }

    pub fn set_velocity(&mut self, tag: Tag, velocity: Vec3) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.vel[i].velocity = velocity)?;
        Ok(())
    }

    pub fn set_image(&mut self, tag: Tag, image: Image) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.image[i] = image)?;
        Ok(())
    }

    pub fn set_charge(&mut self, tag: Tag, charge: f64) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.charge[i] = charge)?;
        Ok(())
    }

    pub fn set_mass(&mut self, tag: Tag, mass: f64) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.vel[i].mass = mass)?;
        Ok(())
    }

    pub fn set_diameter(&mut self, tag: Tag, diameter: f64) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.diameter[i] = diameter)?;
        Ok(())
    }

    pub fn set_body(&mut self, tag: Tag, body: u32) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.body[i] = body)?;
        Ok(())
    }

    /// Changes a particle's type. Notifies `particle_sort` on every rank.
    pub fn set_type(&mut self, tag: Tag, type_id: u32) -> Result<(), Error> {
        self.check_type(type_id)?;
        self.write_field(tag, |a, i| a.pos[i].type_id = type_id)?;
        self.signals.particle_sort.emit(&());
        Ok(())
    }

    pub fn set_orientation(&mut self, tag: Tag, orientation: Quat) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.orientation[i] = orientation)?;
        Ok(())
    }

    pub fn set_angular_momentum(&mut self, tag: Tag, angmom: Quat) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.angmom[i] = angmom)?;
        Ok(())
    }

    pub fn set_moment_of_inertia(&mut self, tag: Tag, inertia: Vec3) -> Result<(), Error> {
        self.write_field(tag, |a, i| a.inertia[i] = inertia)?;
        Ok(())
    }

    /// Adds a default particle of `type_id` and returns its tag.
    ///
    /// The particle is placed at the origin on rank 0; a later
    /// [`migrate`](Self::migrate) moves it to its home rank. Collective.
    pub fn add_particle(&mut self, type_id: u32) -> Result<Tag, Error> {
        self.check_type(type_id)?;
        self.remove_all_ghost_particles();

        let tag = self.tags.allocate_tag();
        if self.comm.rank() == ROOT {
            let idx = self.arrays.n_local();
            self.resize_local(idx + 1);
            let mut record = PackedParticle::new(tag);
            record.pos = PositionType::new([0.0; 3], type_id);
            let (arrays, flags) = self.arrays.front_and_flags_mut();
            arrays.unpack(idx, &record);
            flags[idx] = NO_DESTINATION;
            self.tags.set_slot(tag, idx);
        }

        self.n_global += 1;
        self.signals.global_count_changed.emit(&self.n_global);
        self.signals.particle_sort.emit(&());
        Ok(tag)
    }

    /// Removes the particle with `tag` and retires the tag for reuse.
    ///
    /// The last local particle takes over the freed slot. Collective.
    pub fn remove_particle(&mut self, tag: Tag) -> Result<(), Error> {
        if self.n_global == 0 {
            return Err(Error::NoParticles);
        }
        self.remove_all_ghost_particles();

        let slot = self.lookup(tag)?;
        let holders = if self.decomposition.is_some() {
            self.comm.all_reduce_sum(slot.is_some() as u64)?
        } else {
            slot.is_some() as u64
        };
        match holders {
            0 => return Err(Error::AlreadyRemoved { tag }),
            1 => {}
            count => return Err(Error::MultipleOwners { tag, count }),
        }

        if let Some(idx) = slot {
            let last = self.arrays.n_local() - 1;
            let (arrays, flags) = self.arrays.front_and_flags_mut();
            if idx != last {
                arrays.copy_slot(idx, last);
                flags[idx] = flags[last];
                let moved = arrays.tag[idx];
                self.tags.set_slot(moved, idx);
            }
            flags[last] = NO_DESTINATION;
            self.resize_local(last);
        }
        self.tags.release_tag(tag);

        self.n_global -= 1;
        self.signals.global_count_changed.emit(&self.n_global);
        self.signals.particle_sort.emit(&());
        Ok(())
    }

    /// The `n`-th smallest active tag.
    pub fn nth_tag(&mut self, n: usize) -> Result<Tag, Error> {
        if n >= self.n_global {
            return Err(Error::ParticleIndexOutOfRange {
                index: n,
                n_global: self.n_global,
            });
        }
        self.tags
            .nth_tag(n)
            .ok_or(Error::ParticleIndexOutOfRange {
                index: n,
                n_global: self.n_global,
            })
    }

    /// Active tags in ascending order.
    pub fn active_tags(&mut self) -> &[Tag] {
        self.tags.active_tags()
    }

    pub fn type_mapping(&self) -> &[String] {
        &self.type_mapping
    }

    /// Appends a type and returns its id.
    pub fn add_type(&mut self, name: impl Into<String>) -> u32 {
        self.type_mapping.push(name.into());
        self.signals.num_types_changed.emit(&self.type_mapping.len());
        (self.type_mapping.len() - 1) as u32
    }

    pub fn set_type_name(&mut self, type_id: u32, name: impl Into<String>) -> Result<(), Error> {
        self.check_type(type_id)?;
        self.type_mapping[type_id as usize] = name.into();
        Ok(())
    }

    pub fn type_by_name(&self, name: &str) -> Result<u32, Error> {
        self.type_mapping
            .iter()
            .position(|n| n == name)
            .map(|id| id as u32)
            .ok_or_else(|| Error::UnknownTypeName {
                name: name.to_string(),
            })
    }

    pub fn name_by_type(&self, type_id: u32) -> Result<&str, Error> {
        self.type_mapping
            .get(type_id as usize)
            .map(String::as_str)
            .ok_or(Error::UnknownType {
                type_id,
                n_types: self.type_mapping.len(),
            })
    }

    fn check_type(&self, type_id: u32) -> Result<(), Error> {
        if (type_id as usize) < self.type_mapping.len() {
            Ok(())
        } else {
            Err(Error::UnknownType {
                type_id,
                n_types: self.type_mapping.len(),
            })
        }
    }

    /// Combines a per-rank outcome so that every rank fails if any does.
    ///
    /// Collective.
    pub(crate) fn agree<T>(&self, local: Result<T, Error>, operation: &'static str) -> Result<T, Error> {
        let failed = self.comm.all_reduce_sum(local.is_err() as u64)?;
        match local {
            Err(e) => Err(e),
            Ok(_) if failed > 0 => Err(Error::PeerFailure { operation }),
            ok => ok,
        }
    }
}

impl<C: Communicator> std::fmt::Debug for ParticleData<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleData")
            .field("rank", &self.comm.rank())
            .field("n_global", &self.n_global)
            .field("n_local", &self.arrays.n_local())
            .field("n_ghost", &self.arrays.n_ghost())
            .field("capacity", &self.arrays.capacity())
            .field("type_mapping", &self.type_mapping)
            .finish()
    }
}
