//! Wald tests over linear contrasts of GLM coefficients

use crate::glm::GeneFit;

use super::pvalue::wald_pvalue;

/// Per-gene Wald test outcome. Fold changes and their errors are reported on
/// the log2 scale.
#[derive(Debug, Clone)]
pub struct WaldTestRow {
    pub log2_fold_change: f64,
    pub lfc_se: f64,
    pub stat: f64,
    pub pvalue: f64,
}

/// Test the linear combination `contrast' beta` for one gene.
///
/// Unexpressed genes (base mean zero) report a zero fold change with zero
/// standard error and no statistic. Genes whose fit did not converge keep
/// their estimates but get no statistic or p-value.
pub fn wald_test_gene(fit: &GeneFit, contrast: &[f64], base_mean: f64) -> WaldTestRow {
    let ln2 = std::f64::consts::LN_2;

    if base_mean == 0.0 {
        return WaldTestRow {
            log2_fold_change: 0.0,
            lfc_se: 0.0,
            stat: f64::NAN,
            pvalue: f64::NAN,
        };
    }

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
    let log2_fold_change = beta_c / ln2;
    let lfc_se = se / ln2;

    if !fit.converged || !se.is_finite() || se <= 0.0 {
        return WaldTestRow {
            log2_fold_change,
            lfc_se,
            stat: f64::NAN,
            pvalue: f64::NAN,
        };
    }

    let stat = beta_c / se;
    WaldTestRow {
        log2_fold_change,
        lfc_se,
        stat,
        pvalue: wald_pvalue(stat),
    }
}
