//! Dispersion estimation for negative binomial models
//!
//! Three stages: per-gene maximum likelihood with the Cox-Reid adjustment,
//! a parametric mean-dispersion trend, and maximum a posteriori shrinkage of
//! the gene-wise estimates toward the trend. Genes whose gene-wise estimate
//! sits far above the trend are kept at their own estimate rather than
//! shrunk.

use ndarray::{Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use statrs::function::gamma::ln_gamma;

use crate::error::{PipelineError, Result};
use crate::glm::fitting::{default_ridge, fit_gene_irls, GlmParams};
use crate::normalization::Normalization;
use crate::stats::{median, sample_variance, trigamma, trimmed_mean};

#[derive(Debug, Clone)]
pub struct DispersionParams {
    pub min_disp: f64,
    pub disp_tol: f64,
    pub maxit: usize,
    /// Residual threshold (in log-sd units) above which a gene keeps its
    /// gene-wise estimate instead of the shrunk one
    pub outlier_sd: f64,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            disp_tol: 1e-6,
            maxit: 100,
            outlier_sd: 2.0,
        }
    }
}

/// All dispersion stages for one fitted dataset
#[derive(Debug, Clone)]
pub struct Dispersions {
    pub gene_wise: Vec<f64>,
    pub trended: Vec<f64>,
    /// Final per-gene dispersions used by the GLM (MAP, or gene-wise for
    /// trend outliers)
    pub map: Vec<f64>,
    /// (asymptotic dispersion, extra-Poisson term) when the parametric
    /// trend converged
    pub trend_coefs: Option<(f64, f64)>,
    pub prior_var: f64,
    pub outliers: Vec<bool>,
    /// Fitted means from the gene-wise stage, reused during shrinkage
    pub mu: Array2<f64>,
}

/// Run all three estimation stages.
pub fn estimate_dispersions(
    counts: ArrayView2<f64>,
    normalization: &Normalization,
    design: &Array2<f64>,
    params: &DispersionParams,
) -> Result<Dispersions> {
    let (n_genes, n_samples) = counts.dim();
    let n_coefs = design.ncols();

    if n_samples <= n_coefs {
        return Err(PipelineError::InvalidDesign {
            reason: "as many or more coefficients than samples; no replicates \
                     for dispersion estimation"
                .to_string(),
        });
    }

    let max_disp = (n_samples as f64).max(10.0);

    // Stage 1: gene-wise maximum likelihood
    let gene_results: Vec<(f64, Vec<f64>)> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let offsets = normalization.gene_offsets(i);
            estimate_gene_dispersion(
                counts.row(i),
                offsets.view(),
                design,
                params.min_disp,
                max_disp,
                params.disp_tol,
            )
        })
        .collect();

    let gene_wise: Vec<f64> = gene_results.iter().map(|(d, _)| *d).collect();
    let mut mu = Array2::zeros((n_genes, n_samples));
    for (i, (_, gene_mu)) in gene_results.iter().enumerate() {
        for j in 0..n_samples {
            mu[[i, j]] = gene_mu[j];
        }
    }

    // Stage 2: mean-dispersion trend
    let normalized = normalization.normalized_counts(counts);
    let base_means: Vec<f64> = (0..n_genes)
        .map(|i| normalized.row(i).sum() / n_samples as f64)
        .collect();

    let (trended, trend_coefs) = match fit_parametric_trend(&base_means, &gene_wise) {
        Ok((fit, coefs)) => {
            log::info!(
                "Dispersion trend: {:.4} + {:.4}/mean",
                coefs.0,
                coefs.1
            );
            (fit, Some(coefs))
        }
        Err(e) => {
            log::warn!("Parametric dispersion fit failed ({}), using mean fit", e);
            let fallback = mean_trend(&gene_wise, params.min_disp);
            (vec![fallback; n_genes], None)
        }
    };

    // Stage 3: shrinkage toward the trend
    let (prior_var, var_log_disp) =
        dispersion_prior_variance(&gene_wise, &trended, n_samples, n_coefs);
    log::debug!(
        "Dispersion prior variance {:.4} (residual variance {:.4})",
        prior_var,
        var_log_disp
    );

    let map_raw: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            if !gene_wise[i].is_finite() {
                return f64::NAN;
            }
            let gene_counts: Vec<f64> = counts.row(i).to_vec();
            let gene_mu: Vec<f64> = mu.row(i).to_vec();
            maximize_log_alpha(
                &gene_counts,
                design,
                &gene_mu,
                params.min_disp,
                max_disp,
                params.disp_tol,
                Some((trended[i], prior_var)),
            )
        })
        .collect();

    let threshold = params.outlier_sd * var_log_disp.sqrt();
    let mut outliers = vec![false; n_genes];
    let mut map = Vec::with_capacity(n_genes);
    for i in 0..n_genes {
        let g = gene_wise[i];
        let t = trended[i];
        if g.is_finite() && t > 0.0 && g > 0.0 && (g.ln() - t.ln()) > threshold {
            outliers[i] = true;
            map.push(g);
        } else {
            map.push(map_raw[i]);
        }
    }
    let n_outliers = outliers.iter().filter(|&&o| o).count();
    if n_outliers > 0 {
        log::info!("{} dispersion outliers kept at gene-wise estimates", n_outliers);
    }

    Ok(Dispersions {
        gene_wise,
        trended,
        map,
        trend_coefs,
        prior_var,
        outliers,
        mu,
    })
}

/// Gene-wise dispersion: fit means at a moment-based starting dispersion,
/// then maximize the Cox-Reid adjusted likelihood over log dispersion.
fn estimate_gene_dispersion(
    counts: ArrayView1<f64>,
    offsets: ArrayView1<f64>,
    design: &Array2<f64>,
    min_disp: f64,
    max_disp: f64,
    tol: f64,
) -> (f64, Vec<f64>) {
    let n_samples = counts.len();
    if counts.iter().all(|&c| c == 0.0) {
        return (f64::NAN, vec![0.0; n_samples]);
    }

    let normalized: Vec<f64> = counts
        .iter()
        .zip(offsets.iter())
        .map(|(&c, &s)| if s > 0.0 { c / s } else { 0.0 })
        .collect();
    let xim = offsets.iter().map(|&s| 1.0 / s.max(1e-10)).sum::<f64>() / n_samples as f64;

    let base_mean = normalized.iter().sum::<f64>() / n_samples as f64;
    let base_var = sample_variance(&normalized);
    let moments_disp = if base_mean > 1e-10 && base_var.is_finite() {
        (base_var - xim * base_mean) / (base_mean * base_mean)
    } else {
        f64::INFINITY
    };
    let alpha_init = moments_disp.clamp(min_disp, max_disp);

    let fit = fit_gene_irls(
        counts,
        design,
        offsets,
        alpha_init,
        &default_ridge(design.ncols()),
        &GlmParams::default(),
    );
    let mu = fit.mu;

    let counts_slice: Vec<f64> = counts.to_vec();
    let alpha = maximize_log_alpha(&counts_slice, design, &mu, min_disp, max_disp, tol, None);
    (alpha, mu)
}

/// Cox-Reid adjusted log likelihood at a given log dispersion, with an
/// optional log-normal prior centered on the trend.
fn cr_log_posterior(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha: f64,
    prior: Option<(f64, f64)>,
) -> f64 {
    let n = counts.len();
    let p = design.ncols();
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;

    let mut ll = 0.0;
    let mut weights = vec![0.0; n];
    for i in 0..n {
        let y = counts[i];
        let mu_i = mu[i].max(1e-10);
        ll += ln_gamma(y + alpha_inv) - ln_gamma(alpha_inv);
        ll -= y * (mu_i + alpha_inv).ln();
        ll -= alpha_inv * (1.0 + mu_i * alpha).ln();
        weights[i] = 1.0 / (1.0 / mu_i + alpha);
    }

    // Cox-Reid term: -0.5 * log|X'WX|
    let mut xtwx = vec![vec![0.0; p]; p];
    for i in 0..n {
        for j in 0..p {
            for k in 0..p {
                xtwx[j][k] += weights[i] * design[[i, j]] * design[[i, k]];
            }
        }
    }
    let det = determinant(&mut xtwx);
    let cr_term = if det > 1e-10 {
        -0.5 * det.ln()
    } else {
        log::debug!(
            "singular X'WX (det = {:.3e}) at dispersion {:.3e}; dropping Cox-Reid adjustment",
            det,
            alpha
        );
        0.0
    };

    let prior_term = match prior {
        Some((trend, prior_var)) if trend > 0.0 && prior_var > 0.0 => {
            let resid = log_alpha - trend.ln();
            -resid * resid / (2.0 * prior_var)
        }
        _ => 0.0,
    };

    ll + cr_term + prior_term
}

/// Coarse grid over log dispersion followed by golden-section refinement
/// around the grid optimum.
fn maximize_log_alpha(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    min_disp: f64,
    max_disp: f64,
    tol: f64,
    prior: Option<(f64, f64)>,
) -> f64 {
    let lo = min_disp.ln();
    let hi = max_disp.ln();
    let n_grid = 20;
    let delta = (hi - lo) / (n_grid - 1) as f64;

    let mut best_idx = 0;
    let mut best_lp = f64::NEG_INFINITY;
    for i in 0..n_grid {
        let la = lo + i as f64 * delta;
        let lp = cr_log_posterior(counts, design, mu, la, prior);
        if lp > best_lp {
            best_lp = lp;
            best_idx = i;
        }
    }

    let mut a = (lo + (best_idx as f64 - 1.0) * delta).max(lo);
    let mut b = (lo + (best_idx as f64 + 1.0) * delta).min(hi);

    // Golden-section on the bracketed interval
    let phi = (5.0_f64.sqrt() - 1.0) / 2.0;
    let mut c = b - phi * (b - a);
    let mut d = a + phi * (b - a);
    let mut fc = cr_log_posterior(counts, design, mu, c, prior);
    let mut fd = cr_log_posterior(counts, design, mu, d, prior);

    for _ in 0..100 {
        if (b - a).abs() < tol {
            break;
        }
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - phi * (b - a);
            fc = cr_log_posterior(counts, design, mu, c, prior);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + phi * (b - a);
            fd = cr_log_posterior(counts, design, mu, d, prior);
        }
    }

    ((a + b) / 2.0).exp().clamp(min_disp, max_disp)
}

/// Determinant by Gaussian elimination with partial pivoting; consumes the
/// workspace.
fn determinant(a: &mut [Vec<f64>]) -> f64 {
    let n = a.len();
    let mut det = 1.0;
    for col in 0..n {
        let mut pivot = col;
        for r in col..n {
            if a[r][col].abs() > a[pivot][col].abs() {
                pivot = r;
            }
        }
        if a[pivot][col].abs() < 1e-300 {
            return 0.0;
        }
        if pivot != col {
            a.swap(pivot, col);
            det = -det;
        }
        det *= a[col][col];
        for r in (col + 1)..n {
            let f = a[r][col] / a[col][col];
            for c in col..n {
                a[r][c] -= f * a[col][c];
            }
        }
    }
    det
}

/// Iteratively reweighted Gamma GLM with identity link fitting
/// `dispersion ~ a0 + a1/mean`, with residual-ratio filtering between
/// rounds. Fails when the coefficients leave the positive quadrant or the
/// outer loop does not settle.
pub fn fit_parametric_trend(
    means: &[f64],
    dispersions: &[f64],
) -> Result<(Vec<f64>, (f64, f64))> {
    let valid: Vec<(f64, f64)> = means
        .iter()
        .zip(dispersions.iter())
        .filter(|(&m, &d)| m > 0.0 && d > 1e-6 && d.is_finite())
        .map(|(&m, &d)| (m, d))
        .collect();
    if valid.len() < 3 {
        return Err(PipelineError::FitFailed {
            reason: "not enough usable genes for the dispersion trend".to_string(),
        });
    }

    let mut coefs = (0.1_f64, 1.0_f64);
    let mut settled = false;
    for _ in 0..11 {
        let old = coefs;
        let good: Vec<(f64, f64)> = valid
            .iter()
            .filter(|&&(mean, disp)| {
                let fitted = coefs.0 + coefs.1 / mean;
                if fitted <= 0.0 {
                    return false;
                }
                let ratio = disp / fitted;
                ratio > 1e-4 && ratio < 15.0
            })
            .copied()
            .collect();
        if good.len() < 3 {
            return Err(PipelineError::FitFailed {
                reason: "too few genes within the trend residual band".to_string(),
            });
        }

        let (new_coefs, glm_converged) = gamma_glm_identity(&good, coefs);
        coefs = new_coefs;

        if coefs.0 <= 0.0 || coefs.1 <= 0.0 {
            return Err(PipelineError::FitFailed {
                reason: format!(
                    "dispersion trend coefficients not positive (a0={:.4}, a1={:.4})",
                    coefs.0, coefs.1
                ),
            });
        }

        let log_change =
            (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if log_change < 1e-6 && glm_converged {
            settled = true;
            break;
        }
    }
    if !settled {
        return Err(PipelineError::FitFailed {
            reason: "dispersion trend fit did not converge".to_string(),
        });
    }

    let trended: Vec<f64> = means
        .iter()
        .map(|&m| if m > 0.0 { coefs.0 + coefs.1 / m } else { coefs.0 })
        .collect();
    Ok((trended, coefs))
}

/// One round of the identity-link Gamma GLM: weights 1/mu^2, closed-form
/// 2x2 normal equations.
fn gamma_glm_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let (mut a0, mut a1) = start;
    let mut converged = false;

    let deviance = |a0: f64, a1: f64| -> f64 {
        data.iter()
            .map(|&(mean, disp)| {
                let mu = (a0 + a1 / mean).max(1e-8);
                2.0 * (-(disp / mu).ln() + (disp - mu) / mu)
            })
            .sum()
    };
    let mut dev_old = deviance(a0, a1);

    for _ in 0..25 {
        let mut sum_w = 0.0;
        let mut sum_wx = 0.0;
        let mut sum_wz = 0.0;
        let mut sum_wxx = 0.0;
        let mut sum_wxz = 0.0;

        for &(mean, disp) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sum_w += w;
            sum_wx += w * x;
            sum_wz += w * disp;
            sum_wxx += w * x * x;
            sum_wxz += w * x * disp;
        }

        let det = sum_w * sum_wxx - sum_wx * sum_wx;
        if det.abs() < 1e-10 {
            break;
        }
        a0 = (sum_wxx * sum_wz - sum_wx * sum_wxz) / det;
        a1 = (sum_w * sum_wxz - sum_wx * sum_wz) / det;

        let dev = deviance(a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < 1e-8 {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    ((a0, a1), converged)
}

/// Fallback flat trend: trimmed mean of the informative gene-wise estimates
fn mean_trend(gene_wise: &[f64], min_disp: f64) -> f64 {
    let valid: Vec<f64> = gene_wise
        .iter()
        .filter(|&&d| d > 10.0 * min_disp && d.is_finite())
        .copied()
        .collect();
    if valid.is_empty() {
        return 0.1;
    }
    trimmed_mean(&valid, 0.001)
}

/// Prior variance for log-dispersion shrinkage: robust residual variance
/// minus the expected sampling variance, floored at 0.25. Returns the prior
/// variance and the raw residual variance used for outlier detection.
fn dispersion_prior_variance(
    gene_wise: &[f64],
    trended: &[f64],
    n_samples: usize,
    n_coefs: usize,
) -> (f64, f64) {
    let residuals: Vec<f64> = gene_wise
        .iter()
        .zip(trended.iter())
        .filter(|(&g, &t)| g >= 1e-6 && t > 0.0 && g.is_finite() && t.is_finite())
        .map(|(&g, &t)| g.ln() - t.ln())
        .collect();
    if residuals.len() < 3 {
        return (0.25, 0.25);
    }

    let center = median(&residuals);
    let abs_dev: Vec<f64> = residuals.iter().map(|&r| (r - center).abs()).collect();
    let mad = 1.4826 * median(&abs_dev);
    let var_log_disp = mad * mad;

    if n_samples <= n_coefs {
        return (0.25, var_log_disp);
    }
    let df = (n_samples - n_coefs) as f64;
    let expected = trigamma(df / 2.0);
    let prior_var = (var_log_disp - expected).max(0.25);
    (prior_var, var_log_disp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_group_design() -> Array2<f64> {
        array![
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [1.0, 1.0],
            [1.0, 1.0]
        ]
    }

    #[test]
    fn test_gene_dispersion_scales_with_spread() {
        let design = two_group_design();
        let offsets = array![1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

        let tight = array![100.0, 102.0, 98.0, 200.0, 205.0, 195.0];
        let noisy = array![60.0, 160.0, 90.0, 120.0, 330.0, 170.0];

        let (d_tight, _) = estimate_gene_dispersion(
            tight.view(),
            offsets.view(),
            &design,
            1e-8,
            10.0,
            1e-6,
        );
        let (d_noisy, _) = estimate_gene_dispersion(
            noisy.view(),
            offsets.view(),
            &design,
            1e-8,
            10.0,
            1e-6,
        );

        assert!(d_tight.is_finite() && d_noisy.is_finite());
        assert!(d_noisy > d_tight, "noisier gene should have higher dispersion");
    }

    #[test]
    fn test_all_zero_gene_gets_nan() {
        let design = two_group_design();
        let offsets = array![1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let counts = array![0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let (d, _) = estimate_gene_dispersion(
            counts.view(),
            offsets.view(),
            &design,
            1e-8,
            10.0,
            1e-6,
        );
        assert!(d.is_nan());
    }

    #[test]
    fn test_singular_design_keeps_likelihood_finite() {
        // A duplicated column makes X'WX singular; the adjustment is dropped
        // and the likelihood must stay finite rather than take ln(0)
        let design = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let counts = vec![10.0, 12.0, 9.0, 11.0];
        let mu = vec![10.5; 4];

        let ll = cr_log_posterior(&counts, &design, &mu, (0.1_f64).ln(), None);
        assert!(ll.is_finite());
    }

    #[test]
    fn test_parametric_trend_recovers_coefficients() {
        // Dispersions generated exactly from a0 + a1/mean
        let means: Vec<f64> = (1..200).map(|i| i as f64 * 5.0).collect();
        let dispersions: Vec<f64> = means.iter().map(|&m| 0.05 + 2.0 / m).collect();

        let (trended, (a0, a1)) = fit_parametric_trend(&means, &dispersions).unwrap();
        assert!((a0 - 0.05).abs() < 0.01, "a0={}", a0);
        assert!((a1 - 2.0).abs() < 0.2, "a1={}", a1);
        assert!((trended[0] - dispersions[0]).abs() < 0.01);
    }

    #[test]
    fn test_prior_variance_floor() {
        // Residuals smaller than sampling noise should hit the 0.25 floor
        let gene_wise = vec![0.1, 0.11, 0.09, 0.1, 0.105];
        let trended = vec![0.1; 5];
        let (prior_var, _) = dispersion_prior_variance(&gene_wise, &trended, 6, 2);
        assert!((prior_var - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_map_shrinks_toward_trend() {
        let design = two_group_design();
        let counts = vec![60.0, 160.0, 90.0, 120.0, 330.0, 170.0];
        let mu = vec![103.0, 103.0, 103.0, 206.0, 206.0, 206.0];

        let free = maximize_log_alpha(&counts, &design, &mu, 1e-8, 10.0, 1e-6, None);
        let trend = 0.01;
        let shrunk =
            maximize_log_alpha(&counts, &design, &mu, 1e-8, 10.0, 1e-6, Some((trend, 0.25)));

        assert!(shrunk < free, "prior at {} should pull {} down, got {}", trend, free, shrunk);
        assert!(shrunk > trend, "shrinkage should not overshoot the trend");
    }

    #[test]
    fn test_full_estimation_flags_outlier() {
        // 30 well-behaved genes plus one wildly overdispersed gene
        let n_genes = 31;
        let mut counts = Array2::zeros((n_genes, 6));
        for i in 0..30 {
            let level = 50.0 + i as f64 * 10.0;
            let wiggle = [0.98, 1.02, 1.0, 0.97, 1.04, 0.99];
            for j in 0..6 {
                counts[[i, j]] = (level * wiggle[j]).round();
            }
        }
        for (j, &c) in [10.0, 700.0, 35.0, 900.0, 60.0, 400.0].iter().enumerate() {
            counts[[30, j]] = c;
        }

        let norm = Normalization::SizeFactors(ndarray::Array1::ones(6));
        let design = two_group_design();
        let disp = estimate_dispersions(
            counts.view(),
            &norm,
            &design,
            &DispersionParams::default(),
        )
        .unwrap();

        assert_eq!(disp.map.len(), n_genes);
        assert!(disp.outliers[30], "overdispersed gene should be flagged");
        assert!((disp.map[30] - disp.gene_wise[30]).abs() < 1e-12);
        assert!(!disp.outliers[0]);
    }

    #[test]
    fn test_no_replicates_rejected() {
        let counts = Array2::from_elem((5, 2), 10.0);
        let norm = Normalization::SizeFactors(ndarray::Array1::ones(2));
        let design = array![[1.0, 0.0], [1.0, 1.0]];
        let err = estimate_dispersions(
            counts.view(),
            &norm,
            &design,
            &DispersionParams::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDesign { .. }));
    }
}
