//! Negative binomial distribution helpers

use statrs::function::gamma::ln_gamma;

/// Floor on fitted means during GLM iteration
pub const MIN_MU: f64 = 0.5;

/// Coefficient magnitude at which iteration stops and the gene is flagged
/// as unstable (~log2 of a 1e9-fold change)
pub const MAX_LFC_BETA: f64 = 30.0;

/// Linear predictor clamp to keep exp() finite
pub const MAX_ETA: f64 = 700.0;

/// mu = offset * exp(eta)
pub fn nb_mean(eta: f64, offset: f64) -> f64 {
    let eta_clamped = eta.clamp(-MAX_ETA, MAX_ETA);
    offset * eta_clamped.exp()
}

/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// IRLS working weight: mu / (1 + alpha * mu)
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}

/// Log density of the negative binomial in mean/size parametrization,
/// size = 1/alpha.
pub fn nb_log_density(y: f64, mu: f64, size: f64) -> f64 {
    if mu <= 0.0 || size <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let prob = size / (size + mu);
    ln_gamma(y + size) - ln_gamma(size) - ln_gamma(y + 1.0)
        + size * prob.ln()
        + y * (1.0 - prob).ln()
}

/// Deviance of one gene given fitted means: -2 * sum log density
pub fn nb_deviance(counts: &[f64], mus: &[f64], alpha: f64) -> f64 {
    let size = 1.0 / alpha;
    counts
        .iter()
        .zip(mus.iter())
        .map(|(&y, &mu)| -2.0 * nb_log_density(y, mu, size))
        .sum()
}
