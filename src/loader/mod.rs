//! Decoding survey images from disk into `Array2<f32>`.
//!
//! Arrays are indexed `[[y, x]]` with row 0 at the bottom of the image, the
//! FITS convention the skycell pixel coordinates use.

#[cfg(feature = "fits")]
mod rice;
#[cfg(feature = "fits")]
mod tiled;

use std::path::Path;

use ndarray::{Array2, s};
use tracing::debug;

use crate::error::Result;

/// Source of raw pixel arrays for the image cache.
pub trait ImageLoader {
    fn load(&self, path: &Path) -> Result<Array2<f32>>;
}

impl<F> ImageLoader for F
where
    F: Fn(&Path) -> Result<Array2<f32>>,
{
    fn load(&self, path: &Path) -> Result<Array2<f32>> {
        self(path)
    }
}

/// Loads FITS files (with the `fits` feature) and PNG rasters by file
/// extension.
///
/// FITS images may be plain arrays, in the primary HDU or an `IMAGE`
/// extension, or tile-compressed binary tables (`RICE_1`, `GZIP_1`,
/// `GZIP_2`, `NOCOMPRESS`), quantized or not.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileImageLoader;

impl ImageLoader for FileImageLoader {
    fn load(&self, path: &Path) -> Result<Array2<f32>> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            #[cfg(feature = "fits")]
            Some("fits" | "fit" | "fts") => load_fits(path),
            #[cfg(not(feature = "fits"))]
            Some("fits" | "fit" | "fts") => Err(crate::error::SkycellError::fits(
                path,
                "FITS support not enabled; build with --features fits",
            )),
            _ => load_raster(path),
        }
    }
}

#[cfg(feature = "fits")]
fn load_fits(path: &Path) -> Result<Array2<f32>> {
    use crate::error::SkycellError;
    use fitsrs::Fits;
    use fitsrs::card::Value;
    use fitsrs::hdu::HDU;
    use fitsrs::hdu::data::image::Pixels;
    use std::fs::File;
    use std::io::{BufReader, Seek};
    use self::tiled::ImageHdu;

    let mut reader = BufReader::new(File::open(path)?);
    let located =
        tiled::locate_image(&mut reader).map_err(|e| SkycellError::fits(path, e.to_string()))?;
    match located {
        None => return Err(SkycellError::fits(path, "no image HDU with data")),
        Some(ImageHdu::TileCompressed { header, data_start }) => {
            let image = tiled::read_tile_compressed(&mut reader, &header, data_start)
                .map_err(|e| SkycellError::fits(path, e.to_string()))?;
            debug!(
                path = %path.display(),
                width = image.ncols(),
                height = image.nrows(),
                "decoded tile-compressed FITS image"
            );
            return Ok(image);
        }
        Some(ImageHdu::Plain) => reader.rewind()?,
    }
    let mut hdu_list = Fits::from_reader(reader);

    // Stack products keep the image in an extension behind an empty primary.
    let hdu = loop {
        match hdu_list.next() {
            Some(Ok(HDU::Primary(hdu))) | Some(Ok(HDU::XImage(hdu))) => {
                let naxis = hdu.get_header().get_xtension().get_naxis();
                if naxis >= 2 {
                    break hdu;
                }
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(SkycellError::fits(path, e.to_string())),
            None => return Err(SkycellError::fits(path, "no image HDU with data")),
        }
    };

    let xtension = hdu.get_header().get_xtension();
    let width = xtension.get_naxisn(1).copied().unwrap_or(0) as usize;
    let height = xtension.get_naxisn(2).copied().unwrap_or(0) as usize;

    let header = hdu.get_header();
    let bzero: f64 = match header.get("BZERO") {
        Some(Value::Float { value, .. }) => *value,
        Some(Value::Integer { value, .. }) => *value as f64,
        _ => 0.0,
    };
    let bscale: f64 = match header.get("BSCALE") {
        Some(Value::Float { value, .. }) => *value,
        Some(Value::Integer { value, .. }) => *value as f64,
        _ => 1.0,
    };

    let image_data = hdu_list.get_data(&hdu);
    let raw: Vec<f32> = match image_data.pixels() {
        Pixels::U8(it) => it.map(|v| (v as f64 * bscale + bzero) as f32).collect(),
        Pixels::I16(it) => it.map(|v| (v as f64 * bscale + bzero) as f32).collect(),
        Pixels::I32(it) => it.map(|v| (v as f64 * bscale + bzero) as f32).collect(),
        Pixels::I64(it) => it.map(|v| (v as f64 * bscale + bzero) as f32).collect(),
        Pixels::F32(it) => it.map(|v| (v as f64 * bscale + bzero) as f32).collect(),
        Pixels::F64(it) => it.map(|v| (v * bscale + bzero) as f32).collect(),
    };

    if raw.len() != width * height {
        return Err(SkycellError::fits(
            path,
            format!(
                "pixel count mismatch: expected {} ({width}x{height}), got {}",
                width * height,
                raw.len()
            ),
        ));
    }

    debug!(path = %path.display(), width, height, bscale, bzero, "decoded FITS image");
    // NAXIS1 varies fastest, so rows are FITS y in storage order.
    Ok(Array2::from_shape_vec((height, width), raw)?)
}

fn load_raster(path: &Path) -> Result<Array2<f32>> {
    let gray = image::open(path)?.to_luma32f();
    let (width, height) = gray.dimensions();
    let raw: Vec<f32> = gray.into_raw();
    let arr = Array2::from_shape_vec((height as usize, width as usize), raw)?;
    debug!(path = %path.display(), width, height, "decoded raster image");
    // Raster formats store the top row first.
    Ok(arr.slice(s![..;-1, ..]).to_owned())
}
