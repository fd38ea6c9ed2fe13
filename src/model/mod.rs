//! The fitted model: one immutable value holding everything needed to
//! derive contrasts
//!
//! `fit` runs the full estimation chain (gene filter, normalization,
//! dispersion estimation, per-gene GLM, Cook's outlier flagging) and returns
//! a `FittedModel`. Contrast tables and shrunk fold changes are derived from
//! the fitted state without mutating it, so any number of contrasts can be
//! pulled from one fit in any order.

use ndarray::Array2;
use rayon::prelude::*;

use crate::data::DgeDataSet;
use crate::dispersion::{estimate_dispersions, DispersionParams, Dispersions};
use crate::error::Result;
use crate::filter::{cooks_cutoff, cooks_distances, flag_cooks_outliers, independent_filtering};
use crate::glm::fitting::{default_ridge, fit_gene_irls};
use crate::glm::{contrast_vector, design_matrix, DesignInfo, GeneFit, GlmParams};
use crate::normalization::Normalization;
use crate::results::{ContrastRow, ContrastTable};
use crate::shrinkage::{shrink_lfc_normal, DEFAULT_UPPER_QUANTILE};
use crate::testing::wald_test_gene;

/// Additive design formula over sample metadata factors
#[derive(Debug, Clone)]
pub struct Design {
    pub factors: Vec<String>,
}

impl Design {
    pub fn new<I, S>(factors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            factors: factors.into_iter().map(Into::into).collect(),
        }
    }
}

/// A `numerator vs denominator` comparison within one design factor
#[derive(Debug, Clone)]
pub struct ContrastSpec {
    pub factor: String,
    pub numerator: String,
    pub denominator: String,
}

impl ContrastSpec {
    pub fn new(factor: &str, numerator: &str, denominator: &str) -> Self {
        Self {
            factor: factor.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}_vs_{}", self.numerator, self.denominator)
    }
}

#[derive(Debug, Clone)]
pub struct FitOptions {
    /// Genes with a smaller total raw count are removed before fitting
    pub min_total_count: f64,
    pub glm: GlmParams,
    pub dispersion: DispersionParams,
    /// Withhold p-values for genes where one sample dominates the fit
    pub cooks_filter: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            min_total_count: 10.0,
            glm: GlmParams::default(),
            dispersion: DispersionParams::default(),
            cooks_filter: true,
        }
    }
}

/// Everything estimated from one dataset under one design
#[derive(Debug, Clone)]
pub struct FittedModel {
    dataset: DgeDataSet,
    design: Array2<f64>,
    design_info: DesignInfo,
    normalization: Normalization,
    dispersions: Dispersions,
    fits: Vec<GeneFit>,
    base_means: Vec<f64>,
    cooks_flagged: Vec<bool>,
}

/// Fit with default options.
pub fn fit(dataset: &DgeDataSet, design: &Design) -> Result<FittedModel> {
    fit_with_options(dataset, design, &FitOptions::default())
}

pub fn fit_with_options(
    dataset: &DgeDataSet,
    design: &Design,
    options: &FitOptions,
) -> Result<FittedModel> {
    let dataset = dataset.filter_low_total(options.min_total_count)?;
    let n_genes = dataset.n_genes();
    let n_samples = dataset.n_samples();
    log::info!(
        "Fitting ~{} on {} genes x {} samples",
        design.factors.join("+"),
        n_genes,
        n_samples
    );

    let (design_mx, design_info) = design_matrix(dataset.samples(), &design.factors)?;
    let normalization = Normalization::estimate(&dataset)?;

    let counts = dataset.counts().counts();
    let dispersions =
        estimate_dispersions(counts, &normalization, &design_mx, &options.dispersion)?;

    let n_coefs = design_info.n_coefs();
    let ridge = default_ridge(n_coefs);
    let fits: Vec<GeneFit> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let alpha = dispersions.map[i];
            if !alpha.is_finite() {
                // all-zero gene: nothing to estimate
                return GeneFit {
                    beta: vec![0.0; n_coefs],
                    standard_errors: vec![0.0; n_coefs],
                    covariance: vec![0.0; n_coefs * n_coefs],
                    hat_diagonals: vec![0.0; n_samples],
                    mu: vec![0.0; n_samples],
                    converged: false,
                };
            }
            let offsets = normalization.gene_offsets(i);
            fit_gene_irls(
                counts.row(i),
                &design_mx,
                offsets.view(),
                alpha,
                &ridge,
                &options.glm,
            )
        })
        .collect();
    let n_converged = fits.iter().filter(|f| f.converged).count();
    log::info!("GLM converged for {}/{} genes", n_converged, n_genes);

    let normalized = normalization.normalized_counts(counts);
    let base_means: Vec<f64> = (0..n_genes)
        .map(|i| normalized.row(i).sum() / n_samples as f64)
        .collect();

    let cooks_flagged = if options.cooks_filter {
        let mut mu = Array2::zeros((n_genes, n_samples));
        let mut hat = Array2::zeros((n_genes, n_samples));
        for (i, fit) in fits.iter().enumerate() {
            for j in 0..n_samples {
                mu[[i, j]] = fit.mu[j];
                hat[[i, j]] = fit.hat_diagonals[j];
            }
        }
        let cooks = cooks_distances(counts, &mu, &hat, &normalized, &design_mx, n_coefs);
        let cutoff = cooks_cutoff(n_samples, n_coefs);
        let flags = flag_cooks_outliers(&cooks, &design_mx, cutoff);
        log::info!(
            "Cook's filter: {} genes flagged (cutoff {:.3})",
            flags.iter().filter(|&&f| f).count(),
            cutoff
        );
        flags
    } else {
        vec![false; n_genes]
    };

    Ok(FittedModel {
        dataset,
        design: design_mx,
        design_info,
        normalization,
        dispersions,
        fits,
        base_means,
        cooks_flagged,
    })
}

impl FittedModel {
    pub fn dataset(&self) -> &DgeDataSet {
        &self.dataset
    }

    pub fn design_info(&self) -> &DesignInfo {
        &self.design_info
    }

    pub fn normalization(&self) -> &Normalization {
        &self.normalization
    }

    pub fn dispersions(&self) -> &Dispersions {
        &self.dispersions
    }

    pub fn base_means(&self) -> &[f64] {
        &self.base_means
    }

    pub fn cooks_flagged(&self) -> &[bool] {
        &self.cooks_flagged
    }

    pub fn n_genes(&self) -> usize {
        self.dataset.n_genes()
    }

    /// Wald test table for one contrast, with independent filtering at
    /// `alpha` for the adjusted p-values.
    pub fn contrast(&self, spec: &ContrastSpec, alpha: f64) -> Result<ContrastTable> {
        let contrast = contrast_vector(
            &self.design_info,
            &spec.factor,
            &spec.numerator,
            &spec.denominator,
        )?;
        let rows = self.test_rows(&contrast, alpha);
        Ok(ContrastTable::new(spec.label(), rows))
    }

    /// Same contrast with normal-prior shrinkage applied to the fold changes
    /// and their standard errors. Statistics and p-values are from the
    /// unshrunk fit.
    pub fn shrink(&self, spec: &ContrastSpec, alpha: f64) -> Result<ContrastTable> {
        let contrast = contrast_vector(
            &self.design_info,
            &spec.factor,
            &spec.numerator,
            &spec.denominator,
        )?;
        let mut rows = self.test_rows(&contrast, alpha);

        let shrunk = shrink_lfc_normal(
            self.dataset.counts().counts(),
            &self.normalization,
            &self.design,
            &self.dispersions.map,
            &self.dispersions.trended,
            &self.base_means,
            &self.fits,
            &contrast,
            DEFAULT_UPPER_QUANTILE,
        )?;
        for (row, &(lfc, se)) in rows.iter_mut().zip(shrunk.iter()) {
            row.log2_fold_change = lfc;
            row.lfc_se = se;
        }
        Ok(ContrastTable::new(spec.label(), rows))
    }

    /// Rows in gene order: Wald test per gene, Cook's flags withholding
    /// p-values, then BH with independent filtering.
    fn test_rows(&self, contrast: &[f64], alpha: f64) -> Vec<ContrastRow> {
        let gene_ids = self.dataset.counts().gene_ids();
        let mut rows: Vec<ContrastRow> = (0..self.n_genes())
            .map(|i| {
                let mut test = wald_test_gene(&self.fits[i], contrast, self.base_means[i]);
                if self.cooks_flagged[i] {
                    test.pvalue = f64::NAN;
                }
                ContrastRow {
                    gene_id: gene_ids[i].clone(),
                    base_mean: self.base_means[i],
                    log2_fold_change: test.log2_fold_change,
                    lfc_se: test.lfc_se,
                    stat: test.stat,
                    pvalue: test.pvalue,
                    padj: f64::NAN,
                }
            })
            .collect();

        let pvalues: Vec<f64> = rows.iter().map(|r| r.pvalue).collect();
        let padj = independent_filtering(&pvalues, &self.base_means, alpha);
        for (row, adj) in rows.iter_mut().zip(padj) {
            row.padj = adj;
        }
        rows
    }
}
