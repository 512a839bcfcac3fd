use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Stable, externally visible particle identifier.
pub type Tag = u32;

/// Cartesian vector in simulation units.
pub type Vec3 = [f64; 3];

/// Quaternion stored as `(s, x, y, z)`.
pub type Quat = [f64; 4];

/// Per-axis periodic image counters.
pub type Image = [i32; 3];

/// Reverse-lookup entry for a tag that is not resident on this rank.
///
/// This value is part of the in-memory format: every slot of the reverse
/// lookup table that does not name a local particle holds exactly
/// `u32::MAX`.
pub const NOT_LOCAL: u32 = u32::MAX;

/// Body id of a particle that is not part of a rigid body.
pub const NO_BODY: u32 = u32::MAX;

/// Communication flag of a particle that stays on its current rank.
pub const NO_DESTINATION: u32 = u32::MAX;

/// Identity rotation.
pub const IDENTITY_ORIENTATION: Quat = [1.0, 0.0, 0.0, 0.0];

/// Position packed together with the particle type id.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct PositionType {
    pub position: Vec3,
    pub type_id: u32,
    #[serde(skip)]
    padding: u32,
}

impl PositionType {
    pub fn new(position: Vec3, type_id: u32) -> Self {
        Self {
            position,
            type_id,
            padding: 0,
        }
    }
}

/// Velocity packed together with the particle mass.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct VelocityMass {
    pub velocity: Vec3,
    pub mass: f64,
}

impl VelocityMass {
    pub fn new(velocity: Vec3, mass: f64) -> Self {
        Self { velocity, mass }
    }
}
