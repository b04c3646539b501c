use std::f64::consts::{PI, TAU};

/// Wrap a right ascension into `[0, 2*pi)`.
pub fn normalize_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs.
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// Wrap a right ascension difference into `(-pi, pi]`.
pub fn wrap_ra_difference(delta: f64) -> f64 {
    let wrapped = normalize_ra(delta);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Convert (RA, Dec) in radians to a unit vector `[x, y, z]`.
pub fn radec_to_xyz(ra: f64, dec: f64) -> [f64; 3] {
    let cos_dec = dec.cos();
    [cos_dec * ra.cos(), cos_dec * ra.sin(), dec.sin()]
}

/// Great-circle angular distance between two unit vectors, in radians.
pub fn angular_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    dot.clamp(-1.0, 1.0).acos()
}

/// Great-circle distance between two (RA, Dec) positions in radians.
pub fn radec_distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    angular_distance(radec_to_xyz(a.0, a.1), radec_to_xyz(b.0, b.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    const EPS: f64 = 1e-12;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() < tol,
            "expected {a} ~= {b} (diff = {})",
            (a - b).abs()
        );
    }

    #[test]
    fn normalize_ra_wraps_both_directions() {
        assert_close(normalize_ra(-0.5), TAU - 0.5, EPS);
        assert_close(normalize_ra(TAU + 0.25), 0.25, EPS);
        assert_close(normalize_ra(3.0 * TAU - 1.0), TAU - 1.0, 1e-9);
        assert_eq!(normalize_ra(0.0), 0.0);
        assert_eq!(normalize_ra(TAU), 0.0);
    }

    #[test]
    fn normalize_ra_tiny_negative_stays_in_range() {
        let ra = normalize_ra(-1e-18);
        assert!((0.0..TAU).contains(&ra));
    }

    #[test]
    fn ra_difference_half_open_interval() {
        assert_close(wrap_ra_difference(PI), PI, EPS);
        assert_close(wrap_ra_difference(-PI), PI, EPS);
        assert_close(wrap_ra_difference(TAU - 0.1), -0.1, EPS);
        assert_close(wrap_ra_difference(0.1 - TAU), 0.1, EPS);
    }

    #[test]
    fn known_positions() {
        let v = radec_to_xyz(FRAC_PI_2, 0.0);
        assert_close(v[0], 0.0, EPS);
        assert_close(v[1], 1.0, EPS);
        assert_close(v[2], 0.0, EPS);
        let p = radec_to_xyz(1.3, FRAC_PI_2);
        assert_close(p[2], 1.0, EPS);
    }

    #[test]
    fn angular_distance_known() {
        let a = radec_to_xyz(0.0, 0.0);
        let b = radec_to_xyz(FRAC_PI_2, 0.0);
        assert_close(angular_distance(a, b), FRAC_PI_2, EPS);
        assert_close(angular_distance(a, a), 0.0, EPS);
        assert_close(radec_distance((0.0, 0.0), (PI, 0.0)), PI, EPS);
    }

    #[test]
    fn distance_across_ra_seam() {
        let d = radec_distance((TAU - 1e-4, 0.0), (1e-4, 0.0));
        assert_close(d, 2e-4, 1e-10);
    }
}
