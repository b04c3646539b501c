use std::f64::consts::{FRAC_PI_2, TAU};

use crate::error::{Result, SkycellError};
use crate::geom::tan::{PIXEL_SCALE_ARCSEC, Projector};

use super::{DEFAULT_PAD_PX, GeometryTable, RingDescriptor, SUBCELLS_PER_SIDE};

/// Boundary samples per footprint edge when sizing cells.
const EDGE_SAMPLES: usize = 16;

/// Configuration for generating a ring tessellation.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Declination height of each ring (radians). The polar cap is half this.
    pub ring_height: f64,
    /// Lowest declination to cover (radians). Rounded down to a ring edge.
    pub dec_floor: f64,
    /// Border pad around each sub-image (pixels).
    pub pad_px: u32,
    /// Id of the first cell in the lowest ring. Must be nonzero.
    pub first_cell_id: u32,
    /// Plate scale in arcseconds per pixel.
    pub pixel_scale_arcsec: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            ring_height: 4.0_f64.to_radians(),
            dec_floor: (-30.0_f64).to_radians(),
            pad_px: DEFAULT_PAD_PX,
            first_cell_id: 1,
            pixel_scale_arcsec: PIXEL_SCALE_ARCSEC,
        }
    }
}

/// Number of RA bands for a ring spanning `[dec_min, dec_max]`, sized from
/// the ring edge nearest the equator.
fn band_count(dec_min: f64, dec_max: f64, ring_height: f64) -> u32 {
    let widest = if dec_min >= 0.0 {
        dec_min
    } else if dec_max <= 0.0 {
        dec_max
    } else {
        0.0
    };
    // Shave rounding noise so an exact fit (e.g. 360/4) does not gain a band.
    ((TAU * widest.cos() / ring_height - 1e-9).ceil() as u32).max(1)
}

/// Largest `|x|`, `|y|` pixel offset of a band footprint on its tangent plane.
///
/// The footprint is `[-pi/n, pi/n]` in RA around the tangent point and
/// `[dec_min, dec_max]` in Dec; its boundary is sampled because the edges
/// curve on the plane.
fn footprint_half_size(
    projector: &Projector,
    dec_min: f64,
    dec_max: f64,
    dec_center: f64,
    n: u32,
) -> (f64, f64) {
    let half_width = TAU / n as f64 / 2.0;
    let reference = (0.0, dec_center);
    let mut max_x = 0.0_f64;
    let mut max_y = 0.0_f64;

    for i in 0..=EDGE_SAMPLES {
        let t = i as f64 / EDGE_SAMPLES as f64;
        let ra = -half_width + 2.0 * half_width * t;
        let dec = dec_min + (dec_max - dec_min) * t;
        for (ra, dec) in [(ra, dec_min), (ra, dec_max), (-half_width, dec), (half_width, dec)] {
            let (x, y) = projector.project(ra, dec, reference);
            max_x = max_x.max(x.abs());
            max_y = max_y.max(y.abs());
        }
    }

    (max_x, max_y)
}

fn make_ring(
    projector: &Projector,
    config: &GridConfig,
    dec_min: f64,
    dec_max: f64,
    dec_center: f64,
    n: u32,
    base_cell_id: u32,
) -> RingDescriptor {
    let (half_x, half_y) = footprint_half_size(projector, dec_min, dec_max, dec_center, n);
    let per_side = SUBCELLS_PER_SIDE as f64;
    let px = (2.0 * half_x / per_side).ceil() as u32 + 1;
    let py = (2.0 * half_y / per_side).ceil() as u32 + 1;
    let half_pad = config.pad_px as f64 / 2.0;

    RingDescriptor {
        dec_min,
        dec_max,
        dec_center,
        band_count: n,
        base_cell_id,
        cell_width_px: px + config.pad_px,
        cell_height_px: py + config.pad_px,
        ref_pixel_x: half_pad,
        ref_pixel_y: half_pad,
    }
}

/// Build a tessellation from the north pole down to `config.dec_floor`.
///
/// The top of the table is a single-band cap of half-height
/// `ring_height / 2` centred on the pole; regular rings are stacked below it.
pub fn build_grid(config: &GridConfig) -> Result<GeometryTable> {
    if !(config.ring_height > 0.0 && config.ring_height < FRAC_PI_2) {
        return Err(SkycellError::invalid_grid(format!(
            "ring height {} rad is out of range",
            config.ring_height
        )));
    }
    if !(config.dec_floor >= -FRAC_PI_2 && config.dec_floor < FRAC_PI_2) {
        return Err(SkycellError::invalid_grid(format!(
            "declination floor {} rad is out of range",
            config.dec_floor
        )));
    }
    if config.first_cell_id == 0 {
        return Err(SkycellError::invalid_grid("cell id 0 is reserved"));
    }
    if !(config.pixel_scale_arcsec > 0.0) {
        return Err(SkycellError::invalid_grid("pixel scale must be positive"));
    }

    let projector = Projector::with_scale(config.pixel_scale_arcsec);
    let h = config.ring_height;
    let cap_min = FRAC_PI_2 - h / 2.0;

    let num_rings = ((cap_min - config.dec_floor) / h).ceil().max(0.0) as usize;
    // Rings below -90 would wrap; keep only rings with a real lower edge.
    let num_rings = num_rings.min(((cap_min + FRAC_PI_2) / h).floor() as usize);

    let mut rings = Vec::with_capacity(num_rings + 1);
    let mut next_id = config.first_cell_id;
    for i in (0..num_rings).rev() {
        let dec_max = cap_min - i as f64 * h;
        let dec_min = dec_max - h;
        let n = band_count(dec_min, dec_max, h);
        let center = 0.5 * (dec_min + dec_max);
        rings.push(make_ring(&projector, config, dec_min, dec_max, center, n, next_id));
        next_id = next_id.checked_add(n).ok_or_else(|| {
            SkycellError::invalid_grid(format!(
                "first cell id {} leaves no room for the grid's cells",
                config.first_cell_id
            ))
        })?;
    }

    rings.push(make_ring(
        &projector,
        config,
        cap_min,
        FRAC_PI_2,
        FRAC_PI_2,
        1,
        next_id,
    ));

    GeometryTable::new(rings, config.pad_px)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deg(d: f64) -> f64 {
        d.to_radians()
    }

    #[test]
    fn default_grid_layout() {
        let table = build_grid(&GridConfig::default()).unwrap();
        // 30 rings of 4 degrees from -32 to 88 plus the cap.
        assert_eq!(table.len(), 31);
        assert!((table.dec_floor() - deg(-32.0)).abs() < 1e-12);
        assert_eq!(table.polar_cap(), Some(30));

        let cap = table.ring(30);
        assert!((cap.dec_min - deg(88.0)).abs() < 1e-12);
        assert!((cap.dec_center - FRAC_PI_2).abs() < 1e-15);
    }

    #[test]
    fn rings_are_contiguous_and_numbered() {
        let table = build_grid(&GridConfig::default()).unwrap();
        let rings = table.rings();
        assert_eq!(rings[0].base_cell_id, 1);
        for pair in rings.windows(2) {
            assert!((pair[0].dec_max - pair[1].dec_min).abs() < 1e-12);
            assert_eq!(pair[1].base_cell_id, pair[0].base_cell_id + pair[0].band_count);
        }
    }

    #[test]
    fn equator_ring_is_widest() {
        let table = build_grid(&GridConfig::default()).unwrap();
        let max_bands = table.rings().iter().map(|r| r.band_count).max().unwrap();
        let equatorial = table
            .rings()
            .iter()
            .find(|r| r.dec_min <= 0.0 && r.dec_max > 0.0)
            .unwrap();
        assert_eq!(equatorial.band_count, max_bands);
        assert_eq!(max_bands, 90);
    }

    #[test]
    fn cells_cover_their_footprint() {
        let config = GridConfig::default();
        let table = build_grid(&config).unwrap();
        let projector = Projector::default();
        for ring in table.rings() {
            let (nx, ny) = table.projection_extent(ring);
            let half_width = TAU / ring.band_count as f64 / 2.0;
            for &(ra, dec) in &[
                (-half_width, ring.dec_min),
                (half_width, ring.dec_min),
                (-half_width, ring.dec_max),
                (half_width, ring.dec_max),
                (0.0, ring.dec_min),
            ] {
                let (x, y) = projector.project(ra, dec, (0.0, ring.dec_center));
                let pad = config.pad_px as f64;
                assert!(x.abs() <= (nx - pad) / 2.0, "x={x} outside ring {ring:?}");
                assert!(y.abs() <= (ny - pad) / 2.0, "y={y} outside ring {ring:?}");
            }
        }
    }

    #[test]
    fn reference_pixel_is_half_pad() {
        let table = build_grid(&GridConfig::default()).unwrap();
        for ring in table.rings() {
            assert_eq!(ring.ref_pixel_x, 240.0);
            assert_eq!(ring.ref_pixel_y, 240.0);
        }
    }

    #[test]
    fn custom_floor_and_height() {
        let config = GridConfig {
            ring_height: deg(10.0),
            dec_floor: deg(60.0),
            first_cell_id: 500,
            ..GridConfig::default()
        };
        let table = build_grid(&config).unwrap();
        // Rings [55,65], [65,75], [75,85] and the cap [85,90].
        assert_eq!(table.len(), 4);
        assert!((table.dec_floor() - deg(55.0)).abs() < 1e-12);
        assert_eq!(table.ring(0).base_cell_id, 500);
    }

    #[test]
    fn whole_sky_floor_stops_at_south_pole() {
        let config = GridConfig {
            dec_floor: -FRAC_PI_2,
            ..GridConfig::default()
        };
        let table = build_grid(&config).unwrap();
        assert!(table.dec_floor() >= -FRAC_PI_2 - 1e-12);
    }

    #[test]
    fn rejects_bad_config() {
        let bad_height = GridConfig {
            ring_height: 0.0,
            ..GridConfig::default()
        };
        assert!(build_grid(&bad_height).is_err());

        let bad_id = GridConfig {
            first_cell_id: 0,
            ..GridConfig::default()
        };
        assert!(build_grid(&bad_id).is_err());

        let bad_floor = GridConfig {
            dec_floor: 2.0,
            ..GridConfig::default()
        };
        assert!(build_grid(&bad_floor).is_err());
    }

    #[test]
    fn first_cell_id_near_u32_max_is_an_error() {
        let config = GridConfig {
            first_cell_id: u32::MAX - 5,
            ..GridConfig::default()
        };
        let err = build_grid(&config).unwrap_err();
        assert!(matches!(err, SkycellError::InvalidGrid { .. }));
    }
}
