//! Shared statistical helpers

/// 97.5th percentile of the standard normal
const QNORM_0975: f64 = 1.959963984540054;

/// Weighted quantile with normalized weights and right-continuous step
/// interpolation, so that uniform weights reproduce the ordinary
/// `1 + (n-1)*p` sample quantile.
pub fn weighted_quantile(x: &[f64], weights: &[f64], prob: f64) -> f64 {
    assert_eq!(x.len(), weights.len());

    let mut pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(weights.iter())
        .filter(|(&xi, &wi)| wi > 0.0 && !xi.is_nan() && !wi.is_nan())
        .map(|(&xi, &wi)| (xi, wi))
        .collect();

    if pairs.is_empty() {
        return 0.0;
    }

    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Aggregate weights for tied x values
    let mut unique_x: Vec<f64> = Vec::new();
    let mut agg_weights: Vec<f64> = Vec::new();
    let mut prev_x = pairs[0].0;
    let mut sum_w = pairs[0].1;
    for &(xi, wi) in &pairs[1..] {
        if xi == prev_x {
            sum_w += wi;
        } else {
            unique_x.push(prev_x);
            agg_weights.push(sum_w);
            prev_x = xi;
            sum_w = wi;
        }
    }
    unique_x.push(prev_x);
    agg_weights.push(sum_w);

    // Normalize so the weights sum to the raw observation count
    let n_raw = pairs.len() as f64;
    let raw_weight_sum: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let norm_factor = n_raw / raw_weight_sum;
    for w in agg_weights.iter_mut() {
        *w *= norm_factor;
    }

    let n: f64 = agg_weights.iter().sum();
    let order = 1.0 + (n - 1.0) * prob;
    let low = order.floor().max(1.0);
    let high = (low + 1.0).min(n);
    let frac = order - order.floor();

    let mut cum_weights: Vec<f64> = Vec::with_capacity(agg_weights.len());
    let mut cumsum = 0.0;
    for &w in &agg_weights {
        cumsum += w;
        cum_weights.push(cumsum);
    }

    let allq_low = step_interp_right(&cum_weights, &unique_x, low);
    let allq_high = step_interp_right(&cum_weights, &unique_x, high);

    (1.0 - frac) * allq_low + frac * allq_high
}

/// Right-continuous step lookup on (cumulative weight, value) pairs, clamped
/// at both ends.
fn step_interp_right(xs: &[f64], ys: &[f64], xout: f64) -> f64 {
    assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if xout <= xs[0] {
        return ys[0];
    }
    if xout >= xs[n - 1] {
        return ys[n - 1];
    }
    for i in 0..n {
        if xs[i] >= xout {
            return ys[i];
        }
    }
    ys[n - 1]
}

/// Variance matched to the weighted upper quantile of |x|:
/// `(wtd_quantile(|x|, 1 - uq) / qnorm(0.975))^2`. Used to size the
/// zero-centered prior for fold-change shrinkage.
pub fn match_weighted_upper_quantile_for_variance(
    x: &[f64],
    weights: &[f64],
    upper_quantile: f64,
) -> f64 {
    let abs_x: Vec<f64> = x.iter().map(|&v| v.abs()).collect();
    let prob = 1.0 - upper_quantile;

    let wtd_q = weighted_quantile(&abs_x, weights, prob);
    let sd_est = wtd_q / QNORM_0975;
    let var_est = sd_est * sd_est;

    if var_est <= 0.0 || !var_est.is_finite() {
        1e-6
    } else {
        var_est
    }
}

/// Sample quantile, linear interpolation between order statistics
/// (R's default type 7). `data` need not be sorted.
pub fn quantile_type7(data: &[f64], prob: f64) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n as f64 - 1.0) * prob;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - h.floor();
    sorted[lo] * (1.0 - frac) + sorted[hi] * frac
}

/// Unweighted median; NaN on empty input
pub fn median(data: &[f64]) -> f64 {
    quantile_type7(data, 0.5)
}

/// Trimmed mean with trim fraction applied to each tail
pub fn trimmed_mean(data: &[f64], trim: f64) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    let k = ((n as f64) * trim).floor() as usize;
    if 2 * k >= n {
        return median(&sorted);
    }
    let slice = &sorted[k..n - k];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Sample variance (n - 1 denominator); NaN for fewer than 2 values
pub fn sample_variance(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = data.iter().sum::<f64>() / n as f64;
    data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)
}

/// Trigamma function via the recurrence and asymptotic expansion
pub fn trigamma(x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    // Shift into the asymptotic regime
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    // 1/x + 1/(2x^2) + 1/(6x^3) - 1/(30x^5) + 1/(42x^7)
    acc + inv
        + 0.5 * inv2
        + inv2 * inv * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 / 42.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_quantile_uniform_weights() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let w = vec![1.0; 5];
        let q50 = weighted_quantile(&x, &w, 0.5);
        assert!((q50 - 3.0).abs() < 1e-10, "median of 1..5 should be 3.0, got {}", q50);
    }

    #[test]
    fn test_weighted_quantile_skewed() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let w = vec![1.0, 1.0, 1.0, 1.0, 100.0];
        let q50 = weighted_quantile(&x, &w, 0.5);
        assert!(q50 >= 4.0, "weighted median should move toward 5.0, got {}", q50);
    }

    #[test]
    fn test_match_weighted_upper_quantile_for_variance() {
        let x = vec![0.1, -0.2, 0.3, -0.1, 0.5, -0.3, 0.2, -0.4, 0.15, -0.25];
        let w = vec![1.0; 10];
        let var = match_weighted_upper_quantile_for_variance(&x, &w, 0.05);
        assert!(var > 0.0 && var.is_finite());
    }

    #[test]
    fn test_quantile_type7() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        assert!((quantile_type7(&data, 0.5) - 2.5).abs() < 1e-12);
        assert!((quantile_type7(&data, 0.0) - 1.0).abs() < 1e-12);
        assert!((quantile_type7(&data, 1.0) - 4.0).abs() < 1e-12);
        assert!((quantile_type7(&data, 0.25) - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_trimmed_mean() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        let tm = trimmed_mean(&data, 0.2);
        assert!((tm - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_trigamma_known_values() {
        // trigamma(1) = pi^2/6
        let expected = std::f64::consts::PI.powi(2) / 6.0;
        assert!((trigamma(1.0) - expected).abs() < 1e-8);
        // trigamma(x+1) = trigamma(x) - 1/x^2
        let x = 2.5;
        assert!((trigamma(x + 1.0) - (trigamma(x) - 1.0 / (x * x))).abs() < 1e-10);
    }

    #[test]
    fn test_step_interp_right() {
        let cum = vec![1.0, 2.0, 3.0];
        let x = vec![10.0, 20.0, 30.0];
        assert_eq!(step_interp_right(&cum, &x, 1.5), 20.0);
        assert_eq!(step_interp_right(&cum, &x, 0.5), 10.0);
        assert_eq!(step_interp_right(&cum, &x, 3.5), 30.0);
    }
}
