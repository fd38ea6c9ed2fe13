//! Design matrices for additive categorical models

use std::collections::HashMap;

use ndarray::Array2;

use crate::data::SampleSheet;
use crate::error::{PipelineError, Result};

/// Coefficient layout of a fitted design matrix
#[derive(Debug, Clone)]
pub struct DesignInfo {
    pub coef_names: Vec<String>,
    /// Factors in formula order
    pub factors: Vec<String>,
    /// Ordered levels per factor; the first level is the reference
    pub factor_levels: HashMap<String, Vec<String>>,
    /// Non-reference level to design column index, per factor
    pub level_columns: HashMap<String, HashMap<String, usize>>,
}

impl DesignInfo {
    pub fn n_coefs(&self) -> usize {
        self.coef_names.len()
    }

    pub fn reference_level(&self, factor: &str) -> Option<&str> {
        self.factor_levels
            .get(factor)
            .and_then(|levels| levels.first())
            .map(|s| s.as_str())
    }
}

/// Build a treatment-coded model matrix for an additive formula over the
/// given factors: an intercept column plus one indicator column per
/// non-reference level of each factor. The reference level of each factor is
/// its first level in sort order.
pub fn design_matrix(
    samples: &SampleSheet,
    factors: &[String],
) -> Result<(Array2<f64>, DesignInfo)> {
    if factors.is_empty() {
        return Err(PipelineError::InvalidDesign {
            reason: "design formula has no factors".to_string(),
        });
    }

    let n_samples = samples.n_samples();
    let mut coef_names = vec!["Intercept".to_string()];
    let mut factor_levels: HashMap<String, Vec<String>> = HashMap::new();
    let mut level_columns: HashMap<String, HashMap<String, usize>> = HashMap::new();
    let mut columns: Vec<(Vec<String>, String)> = Vec::new(); // (values, level) per column

    for factor in factors {
        let values = samples.factor_values(factor)?;
        let levels = samples.levels(factor)?;
        if levels.len() < 2 {
            return Err(PipelineError::InvalidDesign {
                reason: format!("factor '{}' has fewer than 2 levels", factor),
            });
        }

        let reference = levels[0].clone();
        let mut cols = HashMap::new();
        for level in levels.iter().skip(1) {
            let col_idx = coef_names.len();
            coef_names.push(format!("{}_{}_vs_{}", factor, level, reference));
            cols.insert(level.clone(), col_idx);
            columns.push((values.clone(), level.clone()));
        }
        level_columns.insert(factor.clone(), cols);
        factor_levels.insert(factor.clone(), levels);
    }

    let n_coefs = coef_names.len();
    let mut design = Array2::zeros((n_samples, n_coefs));
    for i in 0..n_samples {
        design[[i, 0]] = 1.0;
    }
    for (c, (values, level)) in columns.iter().enumerate() {
        for i in 0..n_samples {
            if &values[i] == level {
                design[[i, c + 1]] = 1.0;
            }
        }
    }

    check_full_rank(&design)?;

    let info = DesignInfo {
        coef_names,
        factors: factors.to_vec(),
        factor_levels,
        level_columns,
    };
    Ok((design, info))
}

/// Numeric contrast vector for `numerator vs denominator` within one factor:
/// +1 on the numerator's column, -1 on the denominator's, with reference
/// levels contributing nothing. Fails when either level is absent from the
/// factor's observed levels.
pub fn contrast_vector(
    info: &DesignInfo,
    factor: &str,
    numerator: &str,
    denominator: &str,
) -> Result<Vec<f64>> {
    let levels = info
        .factor_levels
        .get(factor)
        .ok_or_else(|| PipelineError::InvalidContrast {
            reason: format!("factor '{}' is not in the fitted design", factor),
        })?;

    for level in [numerator, denominator] {
        if !levels.iter().any(|l| l == level) {
            return Err(PipelineError::InvalidContrast {
                reason: format!(
                    "level '{}' not found for factor '{}' (observed: {})",
                    level,
                    factor,
                    levels.join(", ")
                ),
            });
        }
    }
    if numerator == denominator {
        return Err(PipelineError::InvalidContrast {
            reason: format!("contrast '{0} vs {0}' is degenerate", numerator),
        });
    }

    let cols = &info.level_columns[factor];
    let mut contrast = vec![0.0; info.n_coefs()];
    if let Some(&c) = cols.get(numerator) {
        contrast[c] = 1.0;
    }
    if let Some(&c) = cols.get(denominator) {
        contrast[c] = -1.0;
    }
    Ok(contrast)
}

/// Reject rank-deficient model matrices before fitting. Rank is computed by
/// Gaussian elimination with partial pivoting and a scaled tolerance.
pub fn check_full_rank(design: &Array2<f64>) -> Result<()> {
    let nrow = design.nrows();
    let ncol = design.ncols();
    if nrow == 0 || ncol == 0 {
        return Err(PipelineError::InvalidDesign {
            reason: "design matrix has zero rows or columns".to_string(),
        });
    }
    if ncol > nrow {
        return Err(PipelineError::InvalidDesign {
            reason: "more coefficients than samples".to_string(),
        });
    }

    let mut work = design.clone();
    let max_abs = work.iter().fold(0.0f64, |m, &v| m.max(v.abs()));
    let tol = nrow.max(ncol) as f64 * f64::EPSILON * max_abs.max(1.0);

    let mut rank = 0;
    let mut row = 0;
    for col in 0..ncol {
        // Find the pivot in this column
        let mut pivot = row;
        for r in row..nrow {
            if work[[r, col]].abs() > work[[pivot, col]].abs() {
                pivot = r;
            }
        }
        if work[[pivot, col]].abs() <= tol {
            continue;
        }
        if pivot != row {
            for c in 0..ncol {
                work.swap([pivot, c], [row, c]);
            }
        }
        for r in (row + 1)..nrow {
            let factor = work[[r, col]] / work[[row, col]];
            for c in col..ncol {
                work[[r, c]] -= factor * work[[row, c]];
            }
        }
        rank += 1;
        row += 1;
        if row == nrow {
            break;
        }
    }

    if rank < ncol {
        return Err(PipelineError::InvalidDesign {
            reason: "the model matrix is not full rank; a factor level has no samples \
                     or one factor is a linear combination of others"
                .to_string(),
        });
    }
    Ok(())
}
