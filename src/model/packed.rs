use super::types::{
    IDENTITY_ORIENTATION, Image, NO_BODY, NOT_LOCAL, PositionType, Quat, Tag, Vec3, VelocityMass,
};
use bytemuck::{Pod, Zeroable};

/// Self-contained record of one particle as it travels between ranks.
///
/// The record carries every migrating per-particle field. Net force, net
/// virial and net torque are derived quantities and are recomputed by the
/// receiver, so they are not part of the record.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedParticle {
    pub pos: PositionType,
    pub vel: VelocityMass,
    pub accel: Vec3,
    pub charge: f64,
    pub diameter: f64,
    pub orientation: Quat,
    pub angmom: Quat,
    pub inertia: Vec3,
    pub image: Image,
    pub body: u32,
    pub tag: Tag,
    padding: u32,
}

impl PackedParticle {
    /// Size of one record on the wire, in bytes.
    pub const WIRE_SIZE: usize = std::mem::size_of::<Self>();

    /// Creates a record with default field values for the given tag.
    pub fn new(tag: Tag) -> Self {
        Self {
            pos: PositionType::new([0.0; 3], 0),
            vel: VelocityMass::new([0.0; 3], 1.0),
            accel: [0.0; 3],
            charge: 0.0,
            diameter: 1.0,
            orientation: IDENTITY_ORIENTATION,
            angmom: [0.0; 4],
            inertia: [0.0; 3],
            image: [0; 3],
            body: NO_BODY,
            tag,
            padding: 0,
        }
    }
}

impl Default for PackedParticle {
    fn default() -> Self {
        Self::new(NOT_LOCAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_is_stable() {
        assert_eq!(PackedParticle::WIRE_SIZE, 216);
        assert_eq!(std::mem::align_of::<PackedParticle>(), 8);
    }

    #[test]
    fn new_record_uses_default_field_values() {
        let p = PackedParticle::new(12);
        assert_eq!(p.tag, 12);
        assert_eq!(p.vel.mass, 1.0);
        assert_eq!(p.diameter, 1.0);
        assert_eq!(p.body, NO_BODY);
        assert_eq!(p.orientation, IDENTITY_ORIENTATION);
        assert_eq!(p.image, [0, 0, 0]);
    }

    #[test]
    fn records_survive_unaligned_byte_copies() {
        let mut a = PackedParticle::new(3);
        a.pos = PositionType::new([1.0, 2.0, 3.0], 2);
        a.charge = -0.5;
        a.image = [1, -2, 0];
        let records = [a, PackedParticle::new(4)];

        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::cast_slice(&records));
        let decoded: Vec<PackedParticle> = bytes[1..]
            .chunks_exact(PackedParticle::WIRE_SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(decoded, records);
    }
}
