//! P-value computation for Wald statistics

use statrs::distribution::{ContinuousCDF, Normal};

/// Two-sided p-value under the standard normal: 2 * P(Z < -|z|)
pub fn wald_pvalue(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    let normal = Normal::new(0.0, 1.0).expect("standard normal parameters are valid");
    (2.0 * normal.cdf(-z.abs())).min(1.0)
}
