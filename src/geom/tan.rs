use super::sphere::{normalize_ra, wrap_ra_difference};

/// Survey plate scale in arcseconds per pixel.
pub const PIXEL_SCALE_ARCSEC: f64 = 0.25;

/// Gnomonic (TAN) projection with a fixed, rotation-free plate scale.
///
/// Maps between (RA, Dec) in radians and pixel offsets on the plane tangent
/// to a reference direction. `x` grows toward decreasing RA (east is left,
/// as on the sky) and `y` grows toward increasing Dec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projector {
    /// CD matrix mapping pixel offsets to intermediate world coordinates (radians).
    /// `cd[0] = [cd1_1, cd1_2]`, `cd[1] = [cd2_1, cd2_2]`.
    pub cd: [[f64; 2]; 2],
}

impl Default for Projector {
    fn default() -> Self {
        Self::with_scale(PIXEL_SCALE_ARCSEC)
    }
}

impl Projector {
    /// Projector for a plate scale given in arcseconds per pixel.
    pub fn with_scale(arcsec_per_pixel: f64) -> Self {
        let s = (arcsec_per_pixel / 3600.0).to_radians();
        Self {
            cd: [[-s, 0.0], [0.0, s]],
        }
    }

    /// Pixel scale in radians per pixel from the CD matrix determinant.
    pub fn scale(&self) -> f64 {
        self.determinant().abs().sqrt()
    }

    fn determinant(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// Project `(ra, dec)` onto the tangent plane at `reference`, in pixels.
    pub fn project(&self, ra: f64, dec: f64, reference: (f64, f64)) -> (f64, f64) {
        self.project_with_offset(ra, dec, reference, [0.0, 0.0])
    }

    /// Like [`Projector::project`], with `crpix` added to the result.
    ///
    /// Points 90 degrees or more from `reference` (`h <= 0`) are outside the
    /// domain; on the horizon the division by `h` yields huge or non-finite
    /// offsets.
    pub fn project_with_offset(
        &self,
        ra: f64,
        dec: f64,
        reference: (f64, f64),
        crpix: [f64; 2],
    ) -> (f64, f64) {
        let (ra0, dec0) = reference;
        let (sin_dec0, cos_dec0) = dec0.sin_cos();
        let (sin_dec, cos_dec) = dec.sin_cos();
        let (sin_radif, cos_radif) = wrap_ra_difference(ra - ra0).sin_cos();

        let h = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_radif;
        let xsi = cos_dec * sin_radif / h;
        let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_radif) / h;

        let inv_det = 1.0 / self.determinant();
        let u = inv_det * (self.cd[1][1] * xsi - self.cd[0][1] * eta);
        let v = inv_det * (-self.cd[1][0] * xsi + self.cd[0][0] * eta);

        (u + crpix[0], v + crpix[1])
    }

    /// Inverse of [`Projector::project`]. RA is returned in `[0, 2*pi)`,
    /// Dec in `[-pi/2, pi/2]`.
    pub fn unproject(&self, x: f64, y: f64, reference: (f64, f64)) -> (f64, f64) {
        self.unproject_with_offset(x, y, reference, [0.0, 0.0])
    }

    /// Inverse of [`Projector::project_with_offset`].
    pub fn unproject_with_offset(
        &self,
        x: f64,
        y: f64,
        reference: (f64, f64),
        crpix: [f64; 2],
    ) -> (f64, f64) {
        let (ra0, dec0) = reference;
        let (sin_dec0, cos_dec0) = dec0.sin_cos();

        let u = x - crpix[0];
        let v = y - crpix[1];
        let xsi = self.cd[0][0] * u + self.cd[0][1] * v;
        let eta = self.cd[1][0] * u + self.cd[1][1] * v;

        let beta = cos_dec0 - eta * sin_dec0;
        let ra = normalize_ra(f64::atan2(xsi, beta) + ra0);
        let gamma = xsi.hypot(beta);
        let dec = f64::atan2(eta * cos_dec0 + sin_dec0, gamma);
        (ra, dec)
    }
}
