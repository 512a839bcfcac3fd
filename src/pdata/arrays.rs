//! Structure-of-arrays storage with amortized growth.
//!
//! [`ArrayStore`] owns two complete sets of per-particle arrays. The front
//! set holds the live data: local particles in slots `0..n_local`, ghosts in
//! `n_local..n_local + n_ghost`, and unused room up to the capacity. The
//! alternate set is scratch space for compaction: survivors are copied into
//! it in order and the two sets then trade places in O(1).

use super::error::Error;
use crate::model::packed::PackedParticle;
use crate::model::types::{
    Image, NO_DESTINATION, PositionType, Quat, Tag, Vec3, VelocityMass,
};
use log::debug;

macro_rules! particle_arrays {
    ($($(#[$meta:meta])* $field:ident: $ty:ty),* $(,)?) => {
        /// One complete set of per-particle arrays, indexed by local slot.
        ///
        /// Every array always has the same length, equal to the store
        /// capacity.
        #[derive(Debug, Clone, Default)]
        pub struct ParticleArrays {
            $($(#[$meta])* pub $field: Vec<$ty>,)*
        }

        impl ParticleArrays {
            fn resize_all(&mut self, len: usize) {
                $(self.$field.resize(len, <$ty>::default());)*
            }

            /// Copies every field of slot `src` into slot `dst`.
            pub fn copy_slot(&mut self, dst: usize, src: usize) {
                $(self.$field[dst] = self.$field[src];)*
            }

            /// Copies every field of `other[src]` into `self[dst]`.
            pub fn copy_from(&mut self, dst: usize, other: &ParticleArrays, src: usize) {
                $(self.$field[dst] = other.$field[src];)*
            }
        }
    };
}

particle_arrays! {
    /// Position and type id.
    pos: PositionType,
    /// Velocity and mass.
    vel: VelocityMass,
    accel: Vec3,
    charge: f64,
    diameter: f64,
    image: Image,
    body: u32,
    orientation: Quat,
    angmom: Quat,
    /// Principal moments of inertia.
    inertia: Vec3,
    tag: Tag,
    /// Net force (x, y, z) and potential energy.
    net_force: [f64; 4],
    /// Upper triangle of the net virial tensor.
    net_virial: [f64; 6],
    net_torque: [f64; 4],
}

impl ParticleArrays {
    pub fn len(&self) -> usize {
        self.tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tag.is_empty()
    }

    /// Builds the migration record for slot `idx`.
    pub fn pack(&self, idx: usize) -> PackedParticle {
        let mut record = PackedParticle::new(self.tag[idx]);
        record.pos = self.pos[idx];
        record.vel = self.vel[idx];
        record.accel = self.accel[idx];
        record.charge = self.charge[idx];
        record.diameter = self.diameter[idx];
        record.orientation = self.orientation[idx];
        record.angmom = self.angmom[idx];
        record.inertia = self.inertia[idx];
        record.image = self.image[idx];
        record.body = self.body[idx];
        record
    }

    /// Writes a migration record into slot `idx`. Net force, virial and
    /// torque are cleared.
    pub fn unpack(&mut self, idx: usize, record: &PackedParticle) {
        self.pos[idx] = record.pos;
        self.vel[idx] = record.vel;
        self.accel[idx] = record.accel;
        self.charge[idx] = record.charge;
        self.diameter[idx] = record.diameter;
        self.orientation[idx] = record.orientation;
        self.angmom[idx] = record.angmom;
        self.inertia[idx] = record.inertia;
        self.image[idx] = record.image;
        self.body[idx] = record.body;
        self.tag[idx] = record.tag;
        self.net_force[idx] = [0.0; 4];
        self.net_virial[idx] = [0.0; 6];
        self.net_torque[idx] = [0.0; 4];
    }
}

/// Double-buffered particle arrays with amortized O(1) growth.
#[derive(Debug)]
pub struct ArrayStore {
    arenas: [ParticleArrays; 2],
    front: usize,
    alternate_allocated: bool,
    comm_flags: Vec<u32>,
    n_local: usize,
    n_ghost: usize,
    capacity: usize,
    resize_factor: f64,
    reallocations: usize,
}

impl ArrayStore {
    /// Creates an unallocated store. `resize_factor` must exceed 1.
    pub fn new(resize_factor: f64) -> Self {
        Self {
            arenas: Default::default(),
            front: 0,
            alternate_allocated: false,
            comm_flags: Vec::new(),
            n_local: 0,
            n_ghost: 0,
            capacity: 0,
            resize_factor,
            reallocations: 0,
        }
    }

    /// Discards all data and allocates `capacity` empty slots.
    pub fn allocate(&mut self, capacity: usize) -> Result<(), Error> {
        if capacity == 0 {
            return Err(Error::ZeroAllocation);
        }
        self.arenas = Default::default();
        self.front = 0;
        self.arenas[0].resize_all(capacity);
        self.arenas[1].resize_all(capacity);
        self.alternate_allocated = true;
        self.comm_flags = vec![NO_DESTINATION; capacity];
        self.n_local = 0;
        self.n_ghost = 0;
        self.capacity = capacity;
        debug!("allocated particle arrays with capacity {capacity}");
        Ok(())
    }

    /// Sets the local particle count, growing the arrays geometrically if
    /// needed. Shrinking never releases memory.
    ///
    /// Ghosts must have been removed first. Returns the new capacity if the
    /// arrays were reallocated.
    pub fn resize(&mut self, n_local: usize) -> Option<usize> {
        debug_assert_eq!(self.n_ghost, 0, "resize with ghosts present");
        let grown = self.grow_to_fit(n_local);
        self.n_local = n_local;
        grown
    }

    /// Grows the arrays to exactly `capacity` slots if they are smaller.
    pub fn reserve(&mut self, capacity: usize) -> Option<usize> {
        if capacity <= self.capacity {
            return None;
        }
        self.reallocate(capacity);
        Some(capacity)
    }

    /// Appends room for `n` ghosts after the current local and ghost slots.
    pub fn add_ghosts(&mut self, n: usize) -> Option<usize> {
        let grown = self.grow_to_fit(self.n_local + self.n_ghost + n);
        self.n_ghost += n;
        grown
    }

    /// Forgets all ghosts and returns how many there were.
    pub fn remove_all_ghosts(&mut self) -> usize {
        std::mem::take(&mut self.n_ghost)
    }

    fn grow_to_fit(&mut self, required: usize) -> Option<usize> {
        if required <= self.capacity {
            return None;
        }
        let mut capacity = self.capacity;
        while capacity < required {
            capacity = (capacity as f64 * self.resize_factor) as usize + 1;
        }
        self.reallocate(capacity);
        Some(capacity)
    }

    fn reallocate(&mut self, capacity: usize) {
        self.arenas[self.front].resize_all(capacity);
        if self.alternate_allocated {
            self.arenas[1 - self.front].resize_all(capacity);
        }
        self.comm_flags.resize(capacity, NO_DESTINATION);
        self.capacity = capacity;
        self.reallocations += 1;
        debug!(
            "reallocated particle arrays to capacity {capacity} ({} so far)",
            self.reallocations
        );
    }

    pub fn front(&self) -> &ParticleArrays {
        &self.arenas[self.front]
    }

    pub fn front_mut(&mut self) -> &mut ParticleArrays {
        &mut self.arenas[self.front]
    }

    /// Live arrays together with the per-slot communication flags.
    pub fn front_and_flags_mut(&mut self) -> (&mut ParticleArrays, &mut [u32]) {
        (&mut self.arenas[self.front], &mut self.comm_flags)
    }

    /// Live arrays, the alternate arrays and the communication flags, for a
    /// compaction pass.
    pub(crate) fn compaction_buffers(
        &mut self,
    ) -> (&ParticleArrays, &mut ParticleArrays, &mut [u32]) {
        if !self.alternate_allocated {
            self.arenas[1 - self.front].resize_all(self.capacity);
            self.alternate_allocated = true;
        }
        let [first, second] = &mut self.arenas;
        let (live, scratch) = if self.front == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        };
        (live, scratch, &mut self.comm_flags)
    }

    /// Makes the alternate arrays live. O(1).
    pub(crate) fn swap_buffers(&mut self) {
        self.front = 1 - self.front;
    }

    pub fn comm_flags(&self) -> &[u32] {
        &self.comm_flags
    }

    pub fn comm_flags_mut(&mut self) -> &mut [u32] {
        &mut self.comm_flags
    }

    pub fn n_local(&self) -> usize {
        self.n_local
    }

    pub fn n_ghost(&self) -> usize {
        self.n_ghost
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resize_factor(&self) -> f64 {
        self.resize_factor
    }

    /// Number of reallocations since construction.
    pub fn reallocation_count(&self) -> usize {
        self.reallocations
    }

    pub fn alternate_allocated(&self) -> bool {
        self.alternate_allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdata::config::DEFAULT_RESIZE_FACTOR;

    fn store(capacity: usize) -> ArrayStore {
        let mut store = ArrayStore::new(DEFAULT_RESIZE_FACTOR);
        store.allocate(capacity).unwrap();
        store
    }

    #[test]
    fn allocate_zero_is_rejected() {
        let mut store = ArrayStore::new(DEFAULT_RESIZE_FACTOR);
        assert!(matches!(store.allocate(0), Err(Error::ZeroAllocation)));
    }

    #[test]
    fn allocate_sizes_every_array() {
        let store = store(5);
        let a = store.front();
        assert_eq!(store.capacity(), 5);
        assert_eq!(store.n_local(), 0);
        assert_eq!(a.len(), 5);
        assert_eq!(a.pos.len(), 5);
        assert_eq!(a.net_virial.len(), 5);
        assert_eq!(store.comm_flags(), &[NO_DESTINATION; 5]);
        assert!(store.alternate_allocated());
    }

    #[test]
    fn growth_follows_resize_factor() {
        let mut store = store(8);
        assert_eq!(store.resize(8), None);
        // 8 * 9/8 + 1
        assert_eq!(store.resize(9), Some(10));
        assert_eq!(store.capacity(), 10);
        assert_eq!(store.n_local(), 9);
        assert_eq!(store.reallocation_count(), 1);
    }

    #[test]
    fn shrinking_keeps_capacity() {
        let mut store = store(16);
        store.resize(12);
        assert_eq!(store.resize(3), None);
        assert_eq!(store.capacity(), 16);
        assert_eq!(store.n_local(), 3);
        assert_eq!(store.reallocation_count(), 0);
    }

    #[test]
    fn one_at_a_time_growth_is_amortized() {
        let mut store = store(1);
        for n in 1..=10_000 {
            store.resize(n);
        }
        assert!(store.capacity() >= 10_000);
        assert!(store.capacity() <= 10_000 * 9 / 8 + 2);
        assert!(
            store.reallocation_count() < 100,
            "{} reallocations",
            store.reallocation_count()
        );
    }

    #[test]
    fn growth_preserves_existing_contents() {
        let mut store = store(2);
        store.resize(2);
        store.front_mut().charge[1] = 0.25;
        store.front_mut().tag[1] = 7;
        store.resize(50);
        assert_eq!(store.front().charge[1], 0.25);
        assert_eq!(store.front().tag[1], 7);
        assert_eq!(store.front().len(), store.capacity());
    }

    #[test]
    fn reserve_grows_exactly() {
        let mut store = store(4);
        assert_eq!(store.reserve(3), None);
        assert_eq!(store.reserve(100), Some(100));
        assert_eq!(store.capacity(), 100);
        assert_eq!(store.comm_flags().len(), 100);
    }

    #[test]
    fn ghosts_live_after_locals() {
        let mut store = store(4);
        store.resize(3);
        assert!(store.add_ghosts(4).is_some());
        assert_eq!(store.n_ghost(), 4);
        assert!(store.capacity() >= 7);
        assert_eq!(store.remove_all_ghosts(), 4);
        assert_eq!(store.n_ghost(), 0);
        assert_eq!(store.n_local(), 3);
    }

    #[test]
    fn alternate_arrays_resize_in_lockstep() {
        let mut store = store(4);
        store.resize(2);
        {
            let (_, scratch, _) = store.compaction_buffers();
            assert_eq!(scratch.len(), 4);
        }
        assert!(store.alternate_allocated());
        store.resize(40);
        store.swap_buffers();
        assert_eq!(store.front().len(), store.capacity());
    }

    #[test]
    fn swap_buffers_exchanges_live_and_scratch() {
        let mut store = store(2);
        store.resize(1);
        store.front_mut().tag[0] = 11;
        {
            let (live, scratch, _) = store.compaction_buffers();
            scratch.copy_from(0, live, 0);
            scratch.tag[0] = 12;
        }
        store.swap_buffers();
        assert_eq!(store.front().tag[0], 12);
        store.swap_buffers();
        assert_eq!(store.front().tag[0], 11);
    }

    #[test]
    fn pack_and_unpack_carry_migrating_fields() {
        let mut store = store(2);
        store.resize(2);
        let a = store.front_mut();
        a.pos[0] = PositionType::new([1.0, 2.0, 3.0], 1);
        a.vel[0] = VelocityMass::new([0.1, 0.2, 0.3], 2.0);
        a.image[0] = [1, 0, -1];
        a.tag[0] = 4;
        a.net_force[1] = [1.0; 4];

        let record = a.pack(0);
        a.unpack(1, &record);
        assert_eq!(a.pos[1], a.pos[0]);
        assert_eq!(a.vel[1], a.vel[0]);
        assert_eq!(a.image[1], [1, 0, -1]);
        assert_eq!(a.tag[1], 4);
        assert_eq!(a.net_force[1], [0.0; 4]);
    }
}
