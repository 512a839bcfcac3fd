use super::types::{Image, Vec3};
use serde::{Deserialize, Serialize};

/// Orthorhombic simulation box with per-axis periodicity.
///
/// The box spans the half-open interval `[lo, hi)` along each axis.
/// Fractional coordinates map `lo` to `0.0` and `hi` to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxDim {
    lo: Vec3,
    hi: Vec3,
    periodic: [bool; 3],
}

impl BoxDim {
    /// Creates a fully periodic box with the given edge lengths, centered on
    /// the origin.
    pub fn new(lengths: Vec3) -> Self {
        let lo = [-lengths[0] / 2.0, -lengths[1] / 2.0, -lengths[2] / 2.0];
        let hi = [lengths[0] / 2.0, lengths[1] / 2.0, lengths[2] / 2.0];
        Self::from_bounds(lo, hi)
    }

    /// Creates a fully periodic cubic box centered on the origin.
    pub fn cube(length: f64) -> Self {
        Self::new([length; 3])
    }

    /// Creates a fully periodic box from explicit corners.
    pub fn from_bounds(lo: Vec3, hi: Vec3) -> Self {
        Self {
            lo,
            hi,
            periodic: [true; 3],
        }
    }

    pub fn with_periodic(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn lo(&self) -> Vec3 {
        self.lo
    }

    pub fn hi(&self) -> Vec3 {
        self.hi
    }

    pub fn lengths(&self) -> Vec3 {
        [
            self.hi[0] - self.lo[0],
            self.hi[1] - self.lo[1],
            self.hi[2] - self.lo[2],
        ]
    }

    pub fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    pub fn is_fully_periodic(&self) -> bool {
        self.periodic.iter().all(|&p| p)
    }

    pub fn volume(&self) -> f64 {
        self.lengths().iter().product()
    }

    /// Converts a Cartesian position into fractional box coordinates.
    pub fn make_fraction(&self, pos: Vec3) -> Vec3 {
        let l = self.lengths();
        std::array::from_fn(|d| (pos[d] - self.lo[d]) / l[d])
    }

    /// Converts fractional box coordinates back into a Cartesian position.
    pub fn make_coordinates(&self, fraction: Vec3) -> Vec3 {
        let l = self.lengths();
        std::array::from_fn(|d| self.lo[d] + fraction[d] * l[d])
    }

    /// Applies an image shift: `pos + image * L`.
    pub fn shift(&self, pos: Vec3, image: Image) -> Vec3 {
        let l = self.lengths();
        std::array::from_fn(|d| pos[d] + image[d] as f64 * l[d])
    }

    /// Returns the periodic image that contains `pos`.
    ///
    /// Positions inside `[lo, hi)` are in image zero.
    pub fn image_of(&self, pos: Vec3) -> Image {
        let f = self.make_fraction(pos);
        std::array::from_fn(|d| f[d].floor() as i32)
    }

    /// Wraps `pos` back into the box along every periodic axis and records
    /// the crossings in `image`.
    pub fn wrap(&self, pos: &mut Vec3, image: &mut Image) {
        self.wrap_axes(pos, image, self.periodic);
    }

    /// Wraps only along the selected axes, regardless of the box's own
    /// periodicity flags.
    pub fn wrap_axes(&self, pos: &mut Vec3, image: &mut Image, axes: [bool; 3]) {
        let l = self.lengths();
        for d in 0..3 {
            if !axes[d] || !pos[d].is_finite() {
                continue;
            }
            let shift = ((pos[d] - self.lo[d]) / l[d]).floor();
            if shift != 0.0 {
                pos[d] -= shift * l[d];
                image[d] += shift as i32;
            }
            // floor() can leave a value exactly on hi through rounding
            if pos[d] >= self.hi[d] {
                pos[d] -= l[d];
                image[d] += 1;
            } else if pos[d] < self.lo[d] {
                pos[d] += l[d];
                image[d] -= 1;
            }
        }
    }

    /// Checks that `pos` lies inside the box, allowing a relative slack of
    /// `tolerance` in fractional coordinates on every side.
    pub fn contains(&self, pos: Vec3, tolerance: f64) -> bool {
        self.make_fraction(pos)
            .iter()
            .all(|&f| f >= -tolerance && f <= 1.0 + tolerance)
    }
}

impl Default for BoxDim {
    fn default() -> Self {
        Self::cube(1.0)
    }
}
