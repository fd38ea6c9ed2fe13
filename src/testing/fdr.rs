//! Multiple testing correction

/// Benjamini-Hochberg FDR adjustment. NaN p-values are excluded from the
/// test count and stay NaN in the output.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let n = pvalues.len();
    if n == 0 {
        return vec![];
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| {
        let pa = pvalues[a];
        let pb = pvalues[b];
        if pa.is_nan() && pb.is_nan() {
            std::cmp::Ordering::Equal
        } else if pa.is_nan() {
            std::cmp::Ordering::Greater
        } else if pb.is_nan() {
            std::cmp::Ordering::Less
        } else {
            pa.partial_cmp(&pb).unwrap()
        }
    });

    let m = pvalues.iter().filter(|p| p.is_finite()).count();
    if m == 0 {
        return vec![f64::NAN; n];
    }

    let mut padj = vec![f64::NAN; n];
    let mut cummin = f64::INFINITY;
    let mut rank = m;
    for &i in indices.iter().rev() {
        let p = pvalues[i];
        if p.is_finite() {
            let adj = (p * m as f64 / rank as f64).min(1.0);
            cummin = cummin.min(adj);
            padj[i] = cummin;
            rank -= 1;
        }
    }
    padj
}
