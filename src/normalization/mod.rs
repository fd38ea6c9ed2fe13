//! Library-size and length-bias normalization
//!
//! Size factors come from the median-of-ratios method. When gene-level
//! average transcript lengths are available from quantification import, a
//! full gene-by-sample normalization factor matrix is built instead, which
//! folds per-sample length bias into the same multiplicative offset.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::data::DgeDataSet;
use crate::error::{PipelineError, Result};
use crate::stats::median;

/// Multiplicative offsets applied to expected counts during model fitting
#[derive(Debug, Clone)]
pub enum Normalization {
    /// One factor per sample
    SizeFactors(Array1<f64>),
    /// One factor per gene per sample (length-aware)
    Factors(Array2<f64>),
}

impl Normalization {
    /// Estimate offsets for a dataset, preferring the length-aware pathway
    /// when the dataset carries effective lengths.
    pub fn estimate(dataset: &DgeDataSet) -> Result<Self> {
        match dataset.lengths() {
            Some(lengths) => {
                let nf = length_normalization_factors(dataset.counts().counts(), lengths.view())?;
                Ok(Normalization::Factors(nf))
            }
            None => {
                let sf = median_of_ratios(dataset.counts().counts())?;
                log::info!(
                    "Size factors: [{}]",
                    sf.iter()
                        .map(|x| format!("{:.4}", x))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Ok(Normalization::SizeFactors(sf))
            }
        }
    }

    pub fn n_samples(&self) -> usize {
        match self {
            Normalization::SizeFactors(sf) => sf.len(),
            Normalization::Factors(nf) => nf.ncols(),
        }
    }

    /// Offsets for one gene, in sample order
    pub fn gene_offsets(&self, gene_idx: usize) -> Array1<f64> {
        match self {
            Normalization::SizeFactors(sf) => sf.clone(),
            Normalization::Factors(nf) => nf.row(gene_idx).to_owned(),
        }
    }

    /// Counts divided by their offsets
    pub fn normalized_counts(&self, counts: ArrayView2<f64>) -> Array2<f64> {
        let mut normalized = counts.to_owned();
        match self {
            Normalization::SizeFactors(sf) => {
                for (j, &s) in sf.iter().enumerate() {
                    normalized.column_mut(j).mapv_inplace(|x| x / s);
                }
            }
            Normalization::Factors(nf) => {
                normalized.zip_mut_with(nf, |x, &f| *x /= f);
            }
        }
        normalized
    }
}

/// Median-of-ratios size factors. Geometric means are taken over genes with
/// all-positive counts; each sample's factor is the median ratio of its
/// counts to those means.
pub fn median_of_ratios(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();
    if n_genes == 0 || n_samples == 0 {
        return Err(PipelineError::EmptyData {
            reason: "count matrix is empty".to_string(),
        });
    }

    let mut geo_means = Vec::with_capacity(n_genes);
    let mut valid_genes = Vec::new();
    for (i, row) in counts.axis_iter(Axis(0)).enumerate() {
        if row.iter().all(|&x| x > 0.0) {
            let log_sum: f64 = row.iter().map(|&x| x.ln()).sum();
            geo_means.push((log_sum / n_samples as f64).exp());
            valid_genes.push(i);
        }
    }

    if valid_genes.is_empty() {
        return Err(PipelineError::SizeFactorFailed {
            reason: "no genes with all non-zero counts".to_string(),
        });
    }

    let mut size_factors = Array1::zeros(n_samples);
    for j in 0..n_samples {
        let ratios: Vec<f64> = valid_genes
            .iter()
            .zip(geo_means.iter())
            .filter_map(|(&i, &geo_mean)| {
                let count = counts[[i, j]];
                if count > 0.0 && geo_mean > 0.0 {
                    Some(count / geo_mean)
                } else {
                    None
                }
            })
            .collect();

        if ratios.is_empty() {
            return Err(PipelineError::SizeFactorFailed {
                reason: format!("no valid count/reference ratios for sample {}", j),
            });
        }
        size_factors[j] = median(&ratios);
    }

    if size_factors.iter().any(|&x| x <= 0.0 || !x.is_finite()) {
        return Err(PipelineError::SizeFactorFailed {
            reason: "non-positive or non-finite size factor".to_string(),
        });
    }

    Ok(size_factors)
}

/// Build a gene-by-sample normalization factor matrix from average
/// transcript effective lengths.
///
/// Lengths are first centered per gene by their geometric mean, size factors
/// are then estimated from the length-corrected counts, and the product is
/// re-centered per gene so each row of the result has geometric mean 1.
pub fn length_normalization_factors(
    counts: ArrayView2<f64>,
    lengths: ArrayView2<f64>,
) -> Result<Array2<f64>> {
    let (n_genes, n_samples) = counts.dim();
    if lengths.dim() != (n_genes, n_samples) {
        return Err(PipelineError::DimensionMismatch {
            expected: format!("{}x{} length matrix", n_genes, n_samples),
            got: format!("{}x{}", lengths.nrows(), lengths.ncols()),
        });
    }

    let mut norm_matrix = Array2::zeros((n_genes, n_samples));
    for i in 0..n_genes {
        let row = lengths.row(i);
        let log_mean = row.iter().map(|&x| x.ln()).sum::<f64>() / n_samples as f64;
        let center = log_mean.exp();
        for j in 0..n_samples {
            norm_matrix[[i, j]] = lengths[[i, j]] / center;
        }
    }

    // Size factors on the length-corrected counts
    let mut corrected = counts.to_owned();
    corrected.zip_mut_with(&norm_matrix, |x, &nm| *x /= nm);
    let size_factors = median_of_ratios(corrected.view())?;
    log::info!(
        "Size factors (length-corrected): [{}]",
        size_factors
            .iter()
            .map(|x| format!("{:.4}", x))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut factors = norm_matrix;
    for j in 0..n_samples {
        factors.column_mut(j).mapv_inplace(|x| x * size_factors[j]);
    }

    // Re-center each gene's factors at geometric mean 1
    for mut row in factors.axis_iter_mut(Axis(0)) {
        let log_mean = row.iter().map(|&x| x.ln()).sum::<f64>() / n_samples as f64;
        let center = log_mean.exp();
        row.mapv_inplace(|x| x / center);
    }

    if factors.iter().any(|&x| x <= 0.0 || !x.is_finite()) {
        return Err(PipelineError::SizeFactorFailed {
            reason: "non-positive or non-finite normalization factor".to_string(),
        });
    }

    Ok(factors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn depth_counts() -> Array2<f64> {
        array![
            [100.0, 200.0, 80.0, 160.0],
            [500.0, 1000.0, 400.0, 800.0],
            [50.0, 100.0, 40.0, 80.0],
            [200.0, 400.0, 160.0, 320.0]
        ]
    }

    #[test]
    fn test_size_factors_track_depth() {
        let counts = depth_counts();
        let sf = median_of_ratios(counts.view()).unwrap();
        assert_eq!(sf.len(), 4);
        assert!(sf.iter().all(|&x| x > 0.0));
        // Sample 2 has twice the depth of sample 1
        assert!((sf[1] / sf[0] - 2.0).abs() < 0.1);
    }

    #[test]
    fn test_normalized_counts_equalize_depth() {
        let counts = depth_counts();
        let sf = median_of_ratios(counts.view()).unwrap();
        let norm = Normalization::SizeFactors(sf);
        let normalized = norm.normalized_counts(counts.view());

        let row: Vec<f64> = normalized.row(0).to_vec();
        let mean = row.iter().sum::<f64>() / 4.0;
        for val in row {
            assert!((val - mean).abs() / mean < 0.1);
        }
    }

    #[test]
    fn test_length_factors_row_centered() {
        let counts = depth_counts();
        let lengths = array![
            [900.0, 950.0, 920.0, 880.0],
            [1800.0, 1750.0, 1900.0, 1850.0],
            [400.0, 410.0, 390.0, 405.0],
            [1200.0, 1150.0, 1250.0, 1220.0]
        ];
        let nf = length_normalization_factors(counts.view(), lengths.view()).unwrap();
        assert_eq!(nf.dim(), (4, 4));

        for row in nf.axis_iter(Axis(0)) {
            let log_mean = row.iter().map(|&x| x.ln()).sum::<f64>() / 4.0;
            assert!(log_mean.abs() < 1e-10, "row geometric mean should be 1");
        }
    }

    #[test]
    fn test_all_zero_overlap_fails() {
        let counts = array![[0.0, 5.0], [3.0, 0.0]];
        assert!(median_of_ratios(counts.view()).is_err());
    }
}
