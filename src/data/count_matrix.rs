//! Gene-level count matrix

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{PipelineError, Result};

/// Aggregated gene counts: rows are genes, columns are samples keyed by
/// composite sample code.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneCountMatrix {
    counts: Array2<f64>,
    gene_ids: Vec<String>,
    sample_codes: Vec<String>,
}

impl GeneCountMatrix {
    pub fn new(
        counts: Array2<f64>,
        gene_ids: Vec<String>,
        sample_codes: Vec<String>,
    ) -> Result<Self> {
        let (n_genes, n_samples) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(PipelineError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{}", gene_ids.len()),
            });
        }
        if sample_codes.len() != n_samples {
            return Err(PipelineError::DimensionMismatch {
                expected: format!("{} sample codes", n_samples),
                got: format!("{}", sample_codes.len()),
            });
        }

        if counts.iter().any(|&x| x < 0.0 || !x.is_finite()) {
            return Err(PipelineError::InvalidCountMatrix {
                reason: "counts must be non-negative finite values".to_string(),
            });
        }

        if !counts.is_empty() && counts.iter().all(|&x| x == 0.0) {
            return Err(PipelineError::InvalidCountMatrix {
                reason: "all samples have 0 counts for all genes".to_string(),
            });
        }

        Ok(Self {
            counts,
            gene_ids,
            sample_codes,
        })
    }

    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_codes(&self) -> &[String] {
        &self.sample_codes
    }

    pub fn gene_counts(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(gene_idx)
    }

    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Total count per gene across all samples
    pub fn gene_totals(&self) -> Vec<f64> {
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.sum())
            .collect()
    }

    /// Drop genes whose total count across all samples is below `min_total`.
    /// Every surviving row satisfies total >= min_total.
    pub fn filter_low_total(&self, min_total: f64) -> Result<Self> {
        let keep: Vec<usize> = self
            .gene_totals()
            .iter()
            .enumerate()
            .filter(|(_, &total)| total >= min_total)
            .map(|(i, _)| i)
            .collect();

        if keep.is_empty() {
            return Err(PipelineError::EmptyData {
                reason: format!("no genes with total count >= {}", min_total),
            });
        }

        let dropped = self.n_genes() - keep.len();
        if dropped > 0 {
            log::info!(
                "Low-count filter: dropped {} of {} genes (total < {})",
                dropped,
                self.n_genes(),
                min_total
            );
        }

        let counts = self.counts.select(Axis(0), &keep);
        let gene_ids = keep.iter().map(|&i| self.gene_ids[i].clone()).collect();
        Self::new(counts, gene_ids, self.sample_codes.clone())
    }

    /// Subset columns to the given order
    pub fn select_samples(&self, sample_indices: &[usize]) -> Result<Self> {
        let counts = self.counts.select(Axis(1), sample_indices);
        let codes = sample_indices
            .iter()
            .map(|&i| self.sample_codes[i].clone())
            .collect();
        Self::new(counts, self.gene_ids.clone(), codes)
    }
}
