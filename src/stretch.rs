//! Brightness normalization applied to survey images before sampling.
//!
//! Raw stack images have a long bright tail and NaN holes. Each image is
//! clipped between asymmetric percentile bounds around its mean and mapped
//! through a sinh stretch into the display range `0..=MAX_LEVEL`.

use ndarray::Array2;

/// Brightest normalized level. 255 is left free for the missing-sample marker.
pub const MAX_LEVEL: f32 = 254.0;

/// Constants of the percentile clip and sinh stretch.
#[derive(Debug, Clone)]
pub struct StretchConfig {
    /// Percentile of the samples at or above the mean used for the upper bound.
    pub high_percentile: f64,
    /// Added to the high percentile before halving.
    pub high_offset: f64,
    /// Percentile of the samples at or below the mean used for the lower bound.
    pub low_percentile: f64,
    /// Subtracted from the low percentile before halving.
    pub low_offset: f64,
    /// Softening `a` of `sinh(t / a) / sinh(1 / a)`; smaller is harsher.
    pub softening: f64,
    /// Paint NaN samples at the upper bound. When off they stay NaN.
    pub fill_nan: bool,
}

impl Default for StretchConfig {
    fn default() -> Self {
        Self {
            high_percentile: 99.5,
            high_offset: 4.3,
            low_percentile: 0.5,
            low_offset: 1.3,
            softening: 1.0 / 3.0,
            fill_nan: true,
        }
    }
}

/// Mean of the finite samples, or `None` if there are none.
pub fn finite_mean(image: &Array2<f32>) -> Option<f64> {
    let (sum, count) = image
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0_f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Percentile `q` (0–100) of sorted values, interpolating linearly between
/// closest ranks.
pub fn percentile(sorted: &[f32], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - lo as f64;
    let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
    Some(a + (b - a) * frac)
}

/// Clip bounds `(vmin, vmax)` for an image, or `None` if it has no finite
/// samples.
pub fn stretch_bounds(image: &Array2<f32>, config: &StretchConfig) -> Option<(f64, f64)> {
    let mean = finite_mean(image)?;

    let mut finite: Vec<f32> = image.iter().copied().filter(|v| v.is_finite()).collect();
    finite.sort_by(|a, b| a.total_cmp(b));

    let split_hi = finite.partition_point(|&v| (v as f64) < mean);
    let split_lo = finite.partition_point(|&v| (v as f64) <= mean);
    let upper = &finite[split_hi..];
    let lower = &finite[..split_lo];

    let vmax = (percentile(upper, config.high_percentile)? + config.high_offset) / 2.0;
    let vmin = (percentile(lower, config.low_percentile)? - config.low_offset) / 2.0;
    Some((vmin, vmax))
}

/// `sinh(t / a) / sinh(1 / a)` for `t` in `[0, 1]`.
pub fn sinh_stretch(t: f64, softening: f64) -> f64 {
    (t / softening).sinh() / (1.0 / softening).sinh()
}

/// Normalize an image into `0..=MAX_LEVEL`.
///
/// With `fill_nan`, NaN samples are replaced by the upper bound before
/// stretching, so they come out at full brightness. Returns `None` if the
/// image has no finite samples.
pub fn normalize(mut image: Array2<f32>, config: &StretchConfig) -> Option<Array2<f32>> {
    let (vmin, vmax) = stretch_bounds(&image, config)?;
    let span = vmax - vmin;

    image.mapv_inplace(|v| {
        if v.is_nan() && !config.fill_nan {
            return f32::NAN;
        }
        let v = if v.is_nan() { vmax } else { v as f64 };
        if !(span > 0.0) {
            return 0.0;
        }
        let t = ((v - vmin) / span).clamp(0.0, 1.0);
        (sinh_stretch(t, config.softening) * MAX_LEVEL as f64).round() as f32
    });
    Some(image)
}
