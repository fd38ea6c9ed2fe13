//! Power-improving filters applied at results time
//!
//! Independent filtering drops weakly expressed genes from the multiple
//! testing burden by scanning mean-expression cutoffs and keeping the one
//! that maximizes discoveries. Cook's distance flags genes where a single
//! sample dominates the fit; their p-values are withheld rather than
//! reported.

use ndarray::{Array2, ArrayView2};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::stats::quantile_type7;
use crate::testing::benjamini_hochberg;

/// BH-adjusted p-values after independent filtering on mean expression.
///
/// Candidate cutoffs are 50 quantiles of the base means between the zero
/// fraction and 0.95. When even the best cutoff yields 10 or fewer
/// rejections at `alpha` the scan is unreliable and no filtering is applied
/// beyond the zero-expression genes.
pub fn independent_filtering(pvalues: &[f64], base_means: &[f64], alpha: f64) -> Vec<f64> {
    let n = pvalues.len();
    if n == 0 {
        return vec![];
    }

    let zero_count = base_means
        .iter()
        .filter(|&&m| m == 0.0 || !m.is_finite())
        .count();
    let lower_quantile = zero_count as f64 / n as f64;
    let upper_quantile = if lower_quantile < 0.95 { 0.95 } else { 1.0 };

    let finite_means: Vec<f64> = base_means.iter().filter(|m| m.is_finite()).copied().collect();
    if finite_means.is_empty() {
        return benjamini_hochberg(pvalues);
    }

    let n_theta = 50;
    let thetas: Vec<f64> = (0..n_theta)
        .map(|i| {
            lower_quantile
                + (upper_quantile - lower_quantile) * i as f64 / (n_theta as f64 - 1.0)
        })
        .collect();

    let mut best_j = 0;
    let mut best_rej = 0usize;
    let mut all_padj: Vec<Vec<f64>> = Vec::with_capacity(n_theta);
    for (j, &theta) in thetas.iter().enumerate() {
        let cutoff = quantile_type7(&finite_means, theta);
        let masked: Vec<f64> = pvalues
            .iter()
            .zip(base_means.iter())
            .map(|(&p, &m)| if m >= cutoff && p.is_finite() { p } else { f64::NAN })
            .collect();
        let padj = benjamini_hochberg(&masked);
        let rejections = padj.iter().filter(|&&p| p.is_finite() && p < alpha).count();
        if rejections > best_rej {
            best_rej = rejections;
            best_j = j;
        }
        all_padj.push(padj);
    }

    let chosen = if best_rej <= 10 { 0 } else { best_j };
    log::debug!(
        "Independent filtering: theta={:.3} with {} rejections at alpha={}",
        thetas[chosen],
        best_rej,
        alpha
    );
    all_padj.swap_remove(chosen)
}

/// Cook's distance for every observation:
/// `pearson_residual^2 / p * h / (1 - h)^2`, with a robust method-of-moments
/// dispersion so an outlying count cannot mask itself.
pub fn cooks_distances(
    counts: ArrayView2<f64>,
    mu: &Array2<f64>,
    hat_diagonals: &Array2<f64>,
    normalized: &Array2<f64>,
    design: &Array2<f64>,
    n_coefs: usize,
) -> Array2<f64> {
    let (n_genes, n_samples) = counts.dim();
    let dispersions = robust_mom_dispersion(normalized, design);

    let mut cooks = Array2::zeros((n_genes, n_samples));
    for i in 0..n_genes {
        let alpha = dispersions[i];
        for j in 0..n_samples {
            let y = counts[[i, j]];
            let mu_ij = mu[[i, j]];
            let h = hat_diagonals[[i, j]];
            let v = mu_ij + alpha * mu_ij * mu_ij;
            let pearson_sq = if v > 0.0 { (y - mu_ij).powi(2) / v } else { 0.0 };
            cooks[[i, j]] = if h.is_finite() && h < 1.0 && pearson_sq.is_finite() {
                pearson_sq / n_coefs as f64 * h / (1.0 - h).powi(2)
            } else {
                f64::NAN
            };
        }
    }
    cooks
}

/// Outlier cutoff: 99th percentile of F(p, m - p)
pub fn cooks_cutoff(n_samples: usize, n_coefs: usize) -> f64 {
    if n_samples <= n_coefs {
        return f64::INFINITY;
    }
    let df1 = n_coefs as f64;
    let df2 = (n_samples - n_coefs) as f64;
    match FisherSnedecor::new(df1, df2) {
        Ok(f_dist) => f_dist.inverse_cdf(0.99),
        Err(_) => 4.0 / n_samples as f64,
    }
}

/// Genes where any sample's Cook's distance exceeds the cutoff. Flagging is
/// only meaningful with replication, so cells with fewer than 3 samples are
/// exempt from triggering the flag.
pub fn flag_cooks_outliers(
    cooks: &Array2<f64>,
    design: &Array2<f64>,
    cutoff: f64,
) -> Vec<bool> {
    let (n_genes, n_samples) = cooks.dim();
    let cell_sizes = design_cell_sizes(design);

    (0..n_genes)
        .map(|i| {
            (0..n_samples).any(|j| {
                cell_sizes[j] >= 3 && cooks[[i, j]].is_finite() && cooks[[i, j]] > cutoff
            })
        })
        .collect()
}

/// Number of samples sharing each sample's design-matrix row
fn design_cell_sizes(design: &Array2<f64>) -> Vec<usize> {
    let n_samples = design.nrows();
    let keys: Vec<String> = (0..n_samples)
        .map(|i| {
            (0..design.ncols())
                .map(|k| format!("{:.6}", design[[i, k]]))
                .collect::<Vec<_>>()
                .join("_")
        })
        .collect();
    keys.iter()
        .map(|key| keys.iter().filter(|k| *k == key).count())
        .collect()
}

/// Trimmed method-of-moments dispersion per gene, taking the worst (largest)
/// cell variance across design cells with at least 3 samples.
fn robust_mom_dispersion(normalized: &Array2<f64>, design: &Array2<f64>) -> Vec<f64> {
    let (n_genes, n_samples) = normalized.dim();
    let min_disp = 0.04;

    let keys: Vec<String> = (0..n_samples)
        .map(|i| {
            (0..design.ncols())
                .map(|k| format!("{:.6}", design[[i, k]]))
                .collect::<Vec<_>>()
                .join("_")
        })
        .collect();
    let mut cells: Vec<Vec<usize>> = Vec::new();
    {
        let mut seen: Vec<&String> = Vec::new();
        for (j, key) in keys.iter().enumerate() {
            match seen.iter().position(|k| *k == key) {
                Some(idx) => cells[idx].push(j),
                None => {
                    seen.push(key);
                    cells.push(vec![j]);
                }
            }
        }
    }
    let replicated: Vec<&Vec<usize>> = cells.iter().filter(|c| c.len() >= 3).collect();

    (0..n_genes)
        .map(|i| {
            let row: Vec<f64> = (0..n_samples).map(|j| normalized[[i, j]]).collect();
            let variance = if replicated.is_empty() {
                trimmed_mom_variance(&row)
            } else {
                replicated
                    .iter()
                    .map(|cell| {
                        let values: Vec<f64> = cell.iter().map(|&j| row[j]).collect();
                        trimmed_mom_variance(&values)
                    })
                    .fold(0.0f64, f64::max)
            };
            let mean = row.iter().sum::<f64>() / n_samples as f64;
            if mean > 0.0 {
                ((variance - mean) / (mean * mean)).max(min_disp)
            } else {
                min_disp
            }
        })
        .collect()
}

/// Trimmed variance with trim ratio and rescaling chosen by sample count
fn trimmed_mom_variance(values: &[f64]) -> f64 {
    let n = values.len();
    let (trim_ratio, scale_c) = if n <= 3 {
        (1.0 / 3.0, 2.04)
    } else if n <= 23 {
        (1.0 / 4.0, 1.86)
    } else {
        (1.0 / 8.0, 1.51)
    };

    let center = crate::stats::trimmed_mean(values, trim_ratio);
    let sq_errors: Vec<f64> = values.iter().map(|&v| (v - center).powi(2)).collect();
    scale_c * crate::stats::trimmed_mean(&sq_errors, trim_ratio)
}
