//! Sky position to skycell resolution.
//!
//! A point is binned into a declination ring, then into the nearest
//! right-ascension band of that ring (its projection cell), projected onto
//! the cell's tangent plane and quantized into one of the 10x10 sub-cells.
//! The pixel coordinate returned is relative to that sub-cell's padded image.
//!
//! Near the pole the single-cell polar cap overlaps the ring below it, so
//! both are tried and the one that puts the point further from an image edge
//! wins.

use std::f64::consts::TAU;

use crate::error::{Result, SkycellError};
use crate::geom::sphere::normalize_ra;
use crate::geom::tan::Projector;
use crate::grid::{GeometryTable, RingDescriptor, SUBCELLS_PER_SIDE};

/// Resolution of one sky position.
///
/// A `cell_id` of 0 means the position is not covered; every other field is
/// then zero as well and must not be used.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolvedPoint {
    pub cell_id: u32,
    /// `10 * row + col` within the projection cell, 0..=99.
    pub subcell_id: u8,
    /// Tangent point `[ra, dec]` of the projection cell (radians).
    pub ref_sky: [f64; 2],
    /// Pixel of the sub-image that the tangent point maps to.
    pub ref_pixel: [f64; 2],
    pub pixel_x: i64,
    pub pixel_y: i64,
}

impl ResolvedPoint {
    pub fn is_covered(&self) -> bool {
        self.cell_id != 0
    }
}

/// Projection cell chosen for a point, before sub-cell quantization.
#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    ring: &'a RingDescriptor,
    cell_id: u32,
    reference: (f64, f64),
    /// Offset from the tangent point in projection-cell pixels.
    offset: (f64, f64),
}

#[derive(Debug, Clone)]
pub struct SkycellResolver {
    table: GeometryTable,
    projector: Projector,
}

impl SkycellResolver {
    pub fn new(table: GeometryTable) -> Self {
        Self::with_projector(table, Projector::default())
    }

    pub fn with_projector(table: GeometryTable, projector: Projector) -> Self {
        Self { table, projector }
    }

    pub fn table(&self) -> &GeometryTable {
        &self.table
    }

    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    /// Resolve paired `ra`/`dec` slices (radians).
    ///
    /// RA may be given in any turn; it is wrapped on a copy. Points below the
    /// table's declination floor, and non-finite inputs, come back zeroed.
    pub fn resolve(&self, ra: &[f64], dec: &[f64]) -> Result<Vec<ResolvedPoint>> {
        if ra.len() != dec.len() {
            return Err(SkycellError::shape_mismatch(&[ra.len()], &[dec.len()]));
        }
        Ok(ra
            .iter()
            .zip(dec)
            .map(|(&ra, &dec)| self.resolve_one(ra, dec))
            .collect())
    }

    /// Resolve a single position.
    pub fn resolve_one(&self, ra: f64, dec: f64) -> ResolvedPoint {
        if !(ra.is_finite() && dec.is_finite()) {
            return ResolvedPoint::default();
        }
        let Some(ring_index) = self.table.ring_index_for_dec(dec) else {
            return ResolvedPoint::default();
        };
        let ra = normalize_ra(ra);

        let candidate = match self.table.polar_cap() {
            Some(cap) if ring_index + 1 >= cap => {
                // Start from the ring below the cap, never the cap itself.
                let below = self.candidate_in_ring(self.table.ring(cap - 1), ra, dec);
                let polar = self.candidate_in_ring(self.table.ring(cap), ra, dec);
                if prefer_cap(self.edge_distance(&below), self.edge_distance(&polar)) {
                    polar
                } else {
                    below
                }
            }
            _ => self.candidate_in_ring(self.table.ring(ring_index), ra, dec),
        };

        self.finish(&candidate)
    }

    fn candidate_in_ring<'a>(&self, ring: &'a RingDescriptor, ra: f64, dec: f64) -> Candidate<'a> {
        let n = ring.band_count;
        let k = (ra * n as f64 / TAU).round() as u32 % n;
        let reference = (ring.band_center_ra(k), ring.dec_center);
        Candidate {
            ring,
            // k < band_count, and the table checked base + band_count.
            cell_id: ring.base_cell_id + k,
            reference,
            offset: self.projector.project(ra, dec, reference),
        }
    }

    /// Smallest distance from the candidate offset to an edge of its full
    /// projection-cell image; negative when outside it.
    fn edge_distance(&self, candidate: &Candidate<'_>) -> f64 {
        let (nx, ny) = self.table.projection_extent(candidate.ring);
        let (x, y) = candidate.offset;
        (x + nx / 2.0)
            .min(nx / 2.0 - 1.0 - x)
            .min(y + ny / 2.0)
            .min(ny / 2.0 - 1.0 - y)
    }

    fn finish(&self, candidate: &Candidate<'_>) -> ResolvedPoint {
        let (px, py) = self.table.subcell_size(candidate.ring);
        let (x, y) = candidate.offset;
        let col = subcell_index(x, px);
        let row = subcell_index(y, py);
        let ref_pixel = subcell_ref_pixel(candidate.ring, px, py, col, row);

        ResolvedPoint {
            cell_id: candidate.cell_id,
            subcell_id: (row * SUBCELLS_PER_SIDE + col) as u8,
            ref_sky: [candidate.reference.0, candidate.reference.1],
            ref_pixel,
            pixel_x: (x + ref_pixel[0]).round() as i64,
            pixel_y: (y + ref_pixel[1]).round() as i64,
        }
    }

    /// Sky position `(ra, dec)` of the centre of a sub-cell image.
    ///
    /// Cell ids outside the table are clamped to the nearest ring and band
    /// rather than rejected.
    pub fn cell_center(&self, cell_id: u32, subcell_id: u8) -> (f64, f64) {
        let ring = self.table.ring(self.table.ring_index_for_cell(cell_id));
        let k = cell_id
            .saturating_sub(ring.base_cell_id)
            .min(ring.band_count - 1);
        let reference = (ring.band_center_ra(k), ring.dec_center);

        let subcell = subcell_id as u32;
        let col = subcell % SUBCELLS_PER_SIDE;
        let row = (subcell / SUBCELLS_PER_SIDE) % SUBCELLS_PER_SIDE;

        let (px, py) = self.table.subcell_size(ring);
        let pad = self.table.pad() as f64;
        let center = ((px + pad - 1.0) / 2.0, (py + pad - 1.0) / 2.0);
        let ref_pixel = subcell_ref_pixel(ring, px, py, col, row);

        self.projector
            .unproject(center.0 - ref_pixel[0], center.1 - ref_pixel[1], reference)
    }

    /// Centres of many sub-cells at once.
    pub fn cell_centers(&self, cell_ids: &[u32], subcell_ids: &[u8]) -> Result<Vec<(f64, f64)>> {
        if cell_ids.len() != subcell_ids.len() {
            return Err(SkycellError::shape_mismatch(
                &[cell_ids.len()],
                &[subcell_ids.len()],
            ));
        }
        Ok(cell_ids
            .iter()
            .zip(subcell_ids)
            .map(|(&cell, &sub)| self.cell_center(cell, sub))
            .collect())
    }

    /// Sky position of a resolved pixel, `None` for uncovered points.
    pub fn pixel_to_sky(&self, point: &ResolvedPoint) -> Option<(f64, f64)> {
        point.is_covered().then(|| {
            self.projector.unproject(
                point.pixel_x as f64 - point.ref_pixel[0],
                point.pixel_y as f64 - point.ref_pixel[1],
                (point.ref_sky[0], point.ref_sky[1]),
            )
        })
    }
}

/// Sub-cell column (or row) for an offset along one axis.
fn subcell_index(offset: f64, size: f64) -> u32 {
    let last = (SUBCELLS_PER_SIDE - 1) as f64;
    (4.5 + offset / size).round().clamp(0.0, last) as u32
}

fn subcell_ref_pixel(ring: &RingDescriptor, px: f64, py: f64, col: u32, row: u32) -> [f64; 2] {
    let half = (SUBCELLS_PER_SIDE / 2) as f64;
    [
        ring.ref_pixel_x + px * (half - col as f64),
        ring.ref_pixel_y + py * (half - row as f64),
    ]
}

/// Ties, including two off-image candidates, go to the ring below the cap.
fn prefer_cap(below_distance: f64, cap_distance: f64) -> bool {
    cap_distance > below_distance
}
