//! Random cone generation

use rand::Rng;

use crate::error::{ProbeError, Result};
use crate::models::Cone;

pub const DEFAULT_MIN_RADIUS: f64 = 0.0;
pub const DEFAULT_MAX_RADIUS: f64 = 0.25;

fn check_radii(min_radius: f64, max_radius: f64) -> Result<()> {
    if !(0.0 <= min_radius && min_radius < max_radius) {
        return Err(ProbeError::InvalidInput(
            "min-radius must be in the range [0,max_radius).".into(),
        ));
    }
    Ok(())
}

/// One cone uniformly distributed on the sphere
pub fn random_cone<R: Rng>(rng: &mut R, min_radius: f64, max_radius: f64) -> Result<Cone> {
    check_radii(min_radius, max_radius)?;

    let ra = 360.0 * rng.gen::<f64>();
    let dec = (2.0 * (rng.gen::<f64>() - 0.5)).asin().to_degrees();
    let radius = (max_radius - min_radius) * rng.gen::<f64>() + min_radius;

    Ok(Cone::new(ra, dec, radius))
}

/// Generate `num_cones` random cones with radius in `[min_radius, max_radius)`
pub fn generate_random(num_cones: usize, min_radius: f64, max_radius: f64) -> Result<Vec<Cone>> {
    check_radii(min_radius, max_radius)?;
    if num_cones == 0 {
        return Err(ProbeError::InvalidInput(
            "num_cones must be a positive number.".into(),
        ));
    }

    let mut rng = rand::thread_rng();
    (0..num_cones)
        .map(|_| random_cone(&mut rng, min_radius, max_radius))
        .collect()
}
