//! Global, tag-ordered copy of every particle in the system.
//!
//! A [`SnapshotParticleData`] is the canonical interchange form between the
//! distributed particle store and anything outside it. Record `i` of every
//! per-particle field belongs to the same particle, and records appear in
//! ascending tag order when the snapshot was taken from a live store.

use super::boxdim::BoxDim;
use super::types::{IDENTITY_ORIENTATION, Image, NO_BODY, Quat, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a snapshot fails structural validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    /// The snapshot names no particle types.
    #[error("snapshot type mapping is empty: at least one type name is required")]
    EmptyTypeMapping,

    /// A per-particle field does not hold exactly `size` records.
    #[error("snapshot field '{field}' holds {len} records, expected {expected}")]
    FieldLength {
        /// Name of the offending field.
        field: &'static str,
        /// Number of records present.
        len: usize,
        /// Declared snapshot size.
        expected: usize,
    },
}

/// Per-particle data for every particle in the system, plus the type table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotParticleData {
    pub pos: Vec<Vec3>,
    pub vel: Vec<Vec3>,
    pub accel: Vec<Vec3>,
    pub type_id: Vec<u32>,
    pub mass: Vec<f64>,
    pub charge: Vec<f64>,
    pub diameter: Vec<f64>,
    pub image: Vec<Image>,
    pub body: Vec<u32>,
    pub orientation: Vec<Quat>,
    pub angmom: Vec<Quat>,
    pub inertia: Vec<Vec3>,
    /// Ordered type names; type ids index into this table.
    pub type_mapping: Vec<String>,
    pub size: usize,
}

impl SnapshotParticleData {
    /// Creates a snapshot of `n` default-valued particles and no type names.
    pub fn new(n: usize) -> Self {
        let mut snapshot = Self::default();
        snapshot.resize(n);
        snapshot
    }

    /// Grows or shrinks every field to `n` records.
    ///
    /// New records take the default values: zero kinematics, unit mass and
    /// diameter, no body, identity orientation.
    pub fn resize(&mut self, n: usize) {
        self.pos.resize(n, [0.0; 3]);
        self.vel.resize(n, [0.0; 3]);
        self.accel.resize(n, [0.0; 3]);
        self.type_id.resize(n, 0);
        self.mass.resize(n, 1.0);
        self.charge.resize(n, 0.0);
        self.diameter.resize(n, 1.0);
        self.image.resize(n, [0; 3]);
        self.body.resize(n, NO_BODY);
        self.orientation.resize(n, IDENTITY_ORIENTATION);
        self.angmom.resize(n, [0.0; 4]);
        self.inertia.resize(n, [0.0; 3]);
        self.size = n;
    }

    /// Inserts `n` default-valued records before index `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i > self.size`.
    pub fn insert(&mut self, i: usize, n: usize) {
        fn splice<T: Clone>(v: &mut Vec<T>, i: usize, n: usize, value: T) {
            v.splice(i..i, std::iter::repeat_n(value, n));
        }
        splice(&mut self.pos, i, n, [0.0; 3]);
        splice(&mut self.vel, i, n, [0.0; 3]);
        splice(&mut self.accel, i, n, [0.0; 3]);
        splice(&mut self.type_id, i, n, 0);
        splice(&mut self.mass, i, n, 1.0);
        splice(&mut self.charge, i, n, 0.0);
        splice(&mut self.diameter, i, n, 1.0);
        splice(&mut self.image, i, n, [0; 3]);
        splice(&mut self.body, i, n, NO_BODY);
        splice(&mut self.orientation, i, n, IDENTITY_ORIENTATION);
        splice(&mut self.angmom, i, n, [0.0; 4]);
        splice(&mut self.inertia, i, n, [0.0; 3]);
        self.size += n;
    }

    /// Checks that the type table is non-empty and every field holds
    /// exactly `size` records.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.type_mapping.is_empty() {
            return Err(SnapshotError::EmptyTypeMapping);
        }
        let lengths = [
            ("pos", self.pos.len()),
            ("vel", self.vel.len()),
            ("accel", self.accel.len()),
            ("type_id", self.type_id.len()),
            ("mass", self.mass.len()),
            ("charge", self.charge.len()),
            ("diameter", self.diameter.len()),
            ("image", self.image.len()),
            ("body", self.body.len()),
            ("orientation", self.orientation.len()),
            ("angmom", self.angmom.len()),
            ("inertia", self.inertia.len()),
        ];
        for (field, len) in lengths {
            if len != self.size {
                return Err(SnapshotError::FieldLength {
                    field,
                    len,
                    expected: self.size,
                });
            }
        }
        Ok(())
    }

    /// Tiles the snapshot `nx * ny * nz` times into `new_box`.
    ///
    /// Copy `j` of particle `i` lands at index `j * old_size + i`. Positions
    /// are unwrapped in `old_box`, scaled into the matching sub-cell of
    /// `new_box` and rewrapped there. Body ids are offset so each copy keeps
    /// its own rigid bodies.
    pub fn replicate(&mut self, nx: u32, ny: u32, nz: u32, old_box: &BoxDim, new_box: &BoxDim) {
        let old_size = self.size;
        let counts = [nx as f64, ny as f64, nz as f64];
        self.resize(old_size * (nx * ny * nz) as usize);

        for i in 0..old_size {
            let unwrapped = old_box.shift(self.pos[i], self.image[i]);
            let f = old_box.make_fraction(unwrapped);
            let body = self.body[i];

            let mut j = 0;
            for l in 0..nx {
                for m in 0..ny {
                    for n in 0..nz {
                        let cell = [l as f64, m as f64, n as f64];
                        let f_new: Vec3 =
                            std::array::from_fn(|d| f[d] / counts[d] + cell[d] / counts[d]);
                        let k = j * old_size + i;

                        let mut q = new_box.make_coordinates(f_new);
                        let mut img = new_box.image_of(q);
                        q = new_box.shift(q, [-img[0], -img[1], -img[2]]);
                        new_box.wrap(&mut q, &mut img);

                        self.pos[k] = q;
                        self.image[k] = img;
                        self.vel[k] = self.vel[i];
                        self.accel[k] = self.accel[i];
                        self.type_id[k] = self.type_id[i];
                        self.mass[k] = self.mass[i];
                        self.charge[k] = self.charge[i];
                        self.diameter[k] = self.diameter[i];
                        self.body[k] = if body != NO_BODY {
                            (j * old_size) as u32 + body
                        } else {
                            NO_BODY
                        };
                        self.orientation[k] = self.orientation[i];
                        self.angmom[k] = self.angmom[i];
                        self.inertia[k] = self.inertia[i];
                        j += 1;
                    }
                }
            }
        }
    }
}
