//! Normal-prior shrinkage of log fold changes
//!
//! Estimates a zero-centered normal prior for each non-intercept coefficient
//! from the spread of the maximum-likelihood estimates, then re-fits every
//! gene with the matching ridge penalty. Only the fold change and its
//! standard error are replaced; test statistics and p-values stay with the
//! unshrunk fit.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::error::{PipelineError, Result};
use crate::glm::fitting::{fit_gene_irls, GlmParams};
use crate::glm::GeneFit;
use crate::normalization::Normalization;
use crate::stats::match_weighted_upper_quantile_for_variance;

/// Upper quantile matched when sizing the prior
pub const DEFAULT_UPPER_QUANTILE: f64 = 0.05;

/// Shrunk (log2 fold change, standard error) per gene for one contrast.
#[allow(clippy::too_many_arguments)]
pub fn shrink_lfc_normal(
    counts: ArrayView2<f64>,
    normalization: &Normalization,
    design: &Array2<f64>,
    dispersions: &[f64],
    trended: &[f64],
    base_means: &[f64],
    fits: &[GeneFit],
    contrast: &[f64],
    upper_quantile: f64,
) -> Result<Vec<(f64, f64)>> {
    let n_genes = counts.nrows();
    let n_coefs = design.ncols();
    let ln2 = std::f64::consts::LN_2;
    let log2_e = std::f64::consts::LOG2_E;
    let ln2_sq = ln2 * ln2;

    let nonzero: Vec<usize> = (0..n_genes).filter(|&i| base_means[i] > 0.0).collect();
    if nonzero.is_empty() {
        return Err(PipelineError::EmptyData {
            reason: "all genes have zero base mean; nothing to shrink".to_string(),
        });
    }

    // Precision weights: genes with high expression and low trend dispersion
    // say more about the prior width
    let weights: Vec<f64> = nonzero
        .iter()
        .map(|&i| 1.0 / (1.0 / base_means[i] + trended[i]))
        .collect();

    let mut beta_prior_var = vec![1e6_f64; n_coefs];
    for k in 1..n_coefs {
        let mut filtered_betas = Vec::new();
        let mut filtered_weights = Vec::new();
        for (w_idx, &i) in nonzero.iter().enumerate() {
            let b_log2 = fits[i].beta[k] * log2_e;
            if b_log2.is_finite() && b_log2.abs() < 10.0 {
                filtered_betas.push(b_log2);
                filtered_weights.push(weights[w_idx]);
            }
        }
        if !filtered_betas.is_empty() {
            beta_prior_var[k] = match_weighted_upper_quantile_for_variance(
                &filtered_betas,
                &filtered_weights,
                upper_quantile,
            );
        }
    }
    log::debug!(
        "Prior variances: [{}]",
        beta_prior_var
            .iter()
            .map(|v| format!("{:.4}", v))
            .collect::<Vec<_>>()
            .join(", ")
    );

    // Ridge penalty on the natural-log scale; the intercept keeps a wide prior
    let mut lambda: Vec<f64> = beta_prior_var.iter().map(|&bpv| (1.0 / bpv) / ln2_sq).collect();
    lambda[0] = 1e-6 / ln2_sq;

    let params = GlmParams::default();
    let results: Vec<(f64, f64)> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            if base_means[i] == 0.0 || !dispersions[i].is_finite() {
                return (0.0, 0.0);
            }
            let offsets = normalization.gene_offsets(i);
            let refit = fit_gene_irls(
                counts.row(i),
                design,
                offsets.view(),
                dispersions[i],
                &lambda,
                &params,
            );
            contrast_estimate(&refit, contrast, ln2)
        })
        .collect();

    Ok(results)
}

fn contrast_estimate(fit: &GeneFit, contrast: &[f64], ln2: f64) -> (f64, f64) {
    let beta_c: f64 = contrast
        .iter()
        .zip(fit.beta.iter())
        .map(|(&c, &b)| c * b)
        .sum();
    let mut var_c = 0.0;
    for (j, &cj) in contrast.iter().enumerate() {
        if cj == 0.0 {
            continue;
        }
        for (k, &ck) in contrast.iter().enumerate() {
            if ck == 0.0 {
                continue;
            }
            var_c += cj * ck * fit.covariance_at(j, k);
        }
    }
    let se = if var_c > 0.0 { var_c.sqrt() } else { f64::NAN };
    (beta_c / ln2, se / ln2)
}
