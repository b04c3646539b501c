//! Declination-ring tessellation of the sky.
//!
//! The sky above a declination floor is cut into rings of constant
//! declination range. Each ring is divided into `band_count` equal
//! right-ascension bands; each band is one projection cell with its own
//! tangent point. A projection cell image is split into a 10x10 grid of
//! sub-cells, each stored as a separate padded sub-image.
//!
//! The table may end in a single-band polar cap, which overlaps the ring
//! below it and needs the disambiguation done in [`crate::resolver`].

pub mod builder;
pub mod store;

use std::f64::consts::TAU;

use crate::error::{Result, SkycellError};

/// Sub-cells per side of a projection cell.
pub const SUBCELLS_PER_SIDE: u32 = 10;

/// Border pad (pixels) around each survey sub-image.
pub const DEFAULT_PAD_PX: u32 = 480;

/// One declination band of the tessellation. Angles in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RingDescriptor {
    pub dec_min: f64,
    pub dec_max: f64,
    pub dec_center: f64,
    /// Number of right-ascension bands (projection cells) in this ring.
    pub band_count: u32,
    /// Cell id of band 0.
    pub base_cell_id: u32,
    /// Sub-image width including the pad.
    pub cell_width_px: u32,
    /// Sub-image height including the pad.
    pub cell_height_px: u32,
    pub ref_pixel_x: f64,
    pub ref_pixel_y: f64,
}

impl RingDescriptor {
    /// Right ascension of the tangent point of band `k`.
    pub fn band_center_ra(&self, k: u32) -> f64 {
        k as f64 * TAU / self.band_count as f64
    }

    /// Whether `cell_id` is one of this ring's cells.
    pub fn contains_cell(&self, cell_id: u32) -> bool {
        cell_id >= self.base_cell_id && cell_id - self.base_cell_id < self.band_count
    }
}

/// Immutable ring table, sorted by increasing declination.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryTable {
    rings: Vec<RingDescriptor>,
    pad: u32,
    dec_floor: f64,
}

impl GeometryTable {
    /// Validate and wrap a ring list.
    pub fn new(rings: Vec<RingDescriptor>, pad: u32) -> Result<Self> {
        if rings.is_empty() {
            return Err(SkycellError::invalid_grid("table has no rings"));
        }

        for (i, ring) in rings.iter().enumerate() {
            if ring.band_count == 0 {
                return Err(SkycellError::invalid_grid(format!("ring {i} has no bands")));
            }
            if !(ring.dec_min < ring.dec_max) {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {i} has dec_min {} >= dec_max {}",
                    ring.dec_min, ring.dec_max
                )));
            }
            if ring.base_cell_id == 0 {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {i} uses reserved cell id 0"
                )));
            }
            if ring.base_cell_id.checked_add(ring.band_count).is_none() {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {i} cell ids {} + {} overflow u32",
                    ring.base_cell_id, ring.band_count
                )));
            }
            if ring.cell_width_px <= pad || ring.cell_height_px <= pad {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {i} cells ({}x{}) are not larger than the pad {pad}",
                    ring.cell_width_px, ring.cell_height_px
                )));
            }
        }

        for (i, pair) in rings.windows(2).enumerate() {
            let (lo, hi) = (&pair[0], &pair[1]);
            if !(lo.dec_max < hi.dec_max) {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {} dec_max is not above ring {i}",
                    i + 1
                )));
            }
            // End ids were checked for overflow above.
            if hi.base_cell_id < lo.base_cell_id + lo.band_count {
                return Err(SkycellError::invalid_grid(format!(
                    "ring {} cell ids overlap ring {i}",
                    i + 1
                )));
            }
        }

        let dec_floor = rings
            .iter()
            .map(|r| r.dec_min)
            .fold(f64::INFINITY, f64::min);
        Ok(Self {
            rings,
            pad,
            dec_floor,
        })
    }

    pub fn rings(&self) -> &[RingDescriptor] {
        &self.rings
    }

    pub fn ring(&self, index: usize) -> &RingDescriptor {
        &self.rings[index]
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn pad(&self) -> u32 {
        self.pad
    }

    /// Lowest declination covered by the table.
    pub fn dec_floor(&self) -> f64 {
        self.dec_floor
    }

    /// One past the largest cell id.
    pub fn cell_id_end(&self) -> u32 {
        let last = &self.rings[self.rings.len() - 1];
        last.base_cell_id.saturating_add(last.band_count)
    }

    /// Index of the ring with `dec_min <= dec < dec_max`.
    ///
    /// Returns `None` below the coverage floor (or for NaN). Declinations at
    /// or above the top ring's `dec_max` clamp to the top ring.
    pub fn ring_index_for_dec(&self, dec: f64) -> Option<usize> {
        if !(dec >= self.dec_floor) {
            return None;
        }
        let idx = self.rings.partition_point(|r| r.dec_max <= dec);
        Some(idx.min(self.rings.len() - 1))
    }

    /// Index of the ring owning `cell_id`, clamped to the table for ids
    /// outside the numbered range.
    pub fn ring_index_for_cell(&self, cell_id: u32) -> usize {
        self.rings
            .partition_point(|r| r.base_cell_id <= cell_id)
            .saturating_sub(1)
    }

    /// Index of the single-band polar cap, if the table ends in one.
    pub fn polar_cap(&self) -> Option<usize> {
        let n = self.rings.len();
        (n >= 2 && self.rings[n - 1].band_count == 1).then_some(n - 1)
    }

    /// Unpadded sub-cell size `(px, py)` of a ring.
    pub fn subcell_size(&self, ring: &RingDescriptor) -> (f64, f64) {
        (
            (ring.cell_width_px - self.pad) as f64,
            (ring.cell_height_px - self.pad) as f64,
        )
    }

    /// Full projection-cell image size `(nx, ny)`: the 10x10 sub-cell grid
    /// plus one pad.
    pub fn projection_extent(&self, ring: &RingDescriptor) -> (f64, f64) {
        let (px, py) = self.subcell_size(ring);
        let n = SUBCELLS_PER_SIDE as f64;
        (n * px + self.pad as f64, n * py + self.pad as f64)
    }
}
