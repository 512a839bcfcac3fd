use super::error::Error;
use crate::model::boxdim::BoxDim;
use crate::model::types::{Image, Vec3};

/// Regular `W x H x D` processor grid over a periodic global box.
///
/// Rank `i + W * (j + H * k)` owns grid cell `(i, j, k)`, the sub-box
/// spanning fractions `[i / W, (i + 1) / W)` along x and likewise along y
/// and z.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainDecomposition {
    grid: [u32; 3],
}

impl DomainDecomposition {
    pub fn new(grid: [u32; 3]) -> Result<Self, Error> {
        if grid.contains(&0) {
            return Err(Error::InvalidGrid { grid });
        }
        Ok(Self { grid })
    }

    pub fn grid(&self) -> [u32; 3] {
        self.grid
    }

    pub fn n_ranks(&self) -> u32 {
        self.grid.iter().product()
    }

    pub fn rank_of_cell(&self, cell: [u32; 3]) -> u32 {
        let [w, h, _] = self.grid;
        cell[0] + w * (cell[1] + h * cell[2])
    }

    pub fn cell_of_rank(&self, rank: u32) -> [u32; 3] {
        let [w, h, _] = self.grid;
        [rank % w, (rank / w) % h, rank / (w * h)]
    }

    /// Sub-box owned by `rank`.
    ///
    /// An axis of the local box is periodic only if the global box is
    /// periodic along it and the grid has a single cell there.
    pub fn local_box(&self, global: &BoxDim, rank: u32) -> BoxDim {
        let cell = self.cell_of_rank(rank);
        let lo = global.make_coordinates(std::array::from_fn(|d| {
            cell[d] as f64 / self.grid[d] as f64
        }));
        let hi = global.make_coordinates(std::array::from_fn(|d| {
            (cell[d] + 1) as f64 / self.grid[d] as f64
        }));
        let global_periodic = global.periodic();
        BoxDim::from_bounds(lo, hi)
            .with_periodic(std::array::from_fn(|d| global_periodic[d] && self.grid[d] == 1))
    }

    /// Rank whose sub-box contains `pos`, or `None` when the position lies
    /// outside the grid.
    pub fn place_particle(&self, global: &BoxDim, pos: Vec3) -> Option<u32> {
        let f = global.make_fraction(pos);
        let cell = [
            cell_index(f[0], self.grid[0])?,
            cell_index(f[1], self.grid[1])?,
            cell_index(f[2], self.grid[2])?,
        ];
        Some(self.rank_of_cell(cell))
    }

    /// Places `pos` like [`place_particle`](Self::place_particle), first
    /// wrapping any axis whose cell index rounds up to the grid size back to
    /// cell zero.
    ///
    /// The wrapped position and updated image are written back.
    pub fn place_and_wrap(&self, global: &BoxDim, pos: &mut Vec3, image: &mut Image) -> Option<u32> {
        let f = global.make_fraction(*pos);
        let on_upper_edge: [bool; 3] =
            std::array::from_fn(|d| (f[d] * self.grid[d] as f64) as i64 == self.grid[d] as i64);
        if on_upper_edge.iter().any(|&e| e) {
            global.wrap_axes(pos, image, on_upper_edge);
        }
        self.place_particle(global, *pos)
    }
}

fn cell_index(fraction: f64, cells: u32) -> Option<u32> {
    if !fraction.is_finite() {
        return None;
    }
    // truncation toward zero keeps tiny negative fractions in cell 0
    let cell = (fraction * cells as f64) as i64;
    (0..cells as i64).contains(&cell).then_some(cell as u32)
}
