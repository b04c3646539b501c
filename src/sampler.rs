//! Stitching survey images into tiles.
//!
//! A tile is a 2-D grid of sky positions. Every position is resolved to a
//! sub-cell pixel, the sub-cell is looked up in a [`CellFileTable`], and the
//! pixel value is read from the cached, normalized image. Positions that are
//! uncovered, have no registered file, whose file failed to load, or whose
//! pixel falls outside the image keep [`NO_DATA`].

use std::collections::BTreeMap;

use ndarray::Array2;
use tracing::{debug, warn};

use crate::cache::ImageCache;
use crate::error::{Result, SkycellError};
use crate::filemap::CellFileTable;
use crate::loader::{FileImageLoader, ImageLoader};
use crate::resolver::SkycellResolver;
use crate::stretch::MAX_LEVEL;

/// Tile value where no source contributes.
pub const NO_DATA: u8 = 0;

/// Tile value for a non-finite sample inside a loaded image.
pub const MISSING: u8 = 255;

pub struct TileSampler<L = FileImageLoader> {
    resolver: SkycellResolver,
    files: CellFileTable,
    cache: ImageCache<L>,
}

impl<L: ImageLoader> TileSampler<L> {
    pub fn new(resolver: SkycellResolver, files: CellFileTable, cache: ImageCache<L>) -> Self {
        Self {
            resolver,
            files,
            cache,
        }
    }

    pub fn resolver(&self) -> &SkycellResolver {
        &self.resolver
    }

    pub fn files(&self) -> &CellFileTable {
        &self.files
    }

    pub fn cache(&self) -> &ImageCache<L> {
        &self.cache
    }

    /// Sample the sky at paired `ra`/`dec` grids (radians).
    ///
    /// Returns `Ok(None)` when no position maps to a registered file, so a
    /// caller can skip writing the tile; a tile whose files all failed to
    /// load is still returned, filled with [`NO_DATA`].
    pub fn sample(&mut self, ra: &Array2<f64>, dec: &Array2<f64>) -> Result<Option<Array2<u8>>> {
        if ra.shape() != dec.shape() {
            return Err(SkycellError::shape_mismatch(ra.shape(), dec.shape()));
        }

        let ra_flat: Vec<f64> = ra.iter().copied().collect();
        let dec_flat: Vec<f64> = dec.iter().copied().collect();
        let points = self.resolver.resolve(&ra_flat, &dec_flat)?;

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, p) in points.iter().enumerate() {
            if let Some(source) = self.files.lookup(p.cell_id, p.subcell_id) {
                groups.entry(source).or_default().push(i);
            }
        }
        if groups.is_empty() {
            debug!(points = points.len(), "no registered source covers the tile");
            return Ok(None);
        }

        let mut tile = Array2::from_elem(ra.raw_dim(), NO_DATA);
        let width = tile.ncols();
        let mut filled = 0usize;

        for (source, indices) in groups {
            let path = self.files.path(source);
            let image = match self.cache.get(path) {
                Ok(image) => image,
                Err(failure) => {
                    debug!(%failure, points = indices.len(), "source skipped");
                    continue;
                }
            };
            let (height_px, width_px) = image.dim();

            let mut out_of_bounds = 0usize;
            for i in indices {
                let p = &points[i];
                let (Ok(x), Ok(y)) = (usize::try_from(p.pixel_x), usize::try_from(p.pixel_y)) else {
                    out_of_bounds += 1;
                    continue;
                };
                if x >= width_px || y >= height_px {
                    out_of_bounds += 1;
                    continue;
                }
                tile[[i / width, i % width]] = to_level(image[[y, x]]);
                filled += 1;
            }

            if out_of_bounds > 0 {
                warn!(
                    source = %path.display(),
                    out_of_bounds,
                    width = width_px,
                    height = height_px,
                    "resolved pixels outside source image"
                );
            }
        }

        debug!(points = points.len(), filled, "sampled tile");
        Ok(Some(tile))
    }
}

/// Quantize a normalized sample into the tile range.
fn to_level(value: f32) -> u8 {
    if value.is_finite() {
        value.round().clamp(0.0, MAX_LEVEL) as u8
    } else {
        MISSING
    }
}
