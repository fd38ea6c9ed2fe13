//! Validated pairing of gene counts, sample metadata, and length offsets

use ndarray::{Array2, Axis};

use super::{GeneCountMatrix, SampleSheet};
use crate::error::{PipelineError, Result};

/// Immutable input bundle for one analysis: a gene count matrix, the sample
/// sheet aligned to its columns, and (when imported from quantification
/// files) the average transcript effective length per gene per sample.
///
/// Construction performs the schema-mismatch gate: the sample sheet must
/// cover exactly the matrix columns, joined on composite code regardless of
/// order. Fitting against misaligned keys silently produces meaningless
/// results, so this is checked before any model is fit.
#[derive(Debug, Clone)]
pub struct DgeDataSet {
    counts: GeneCountMatrix,
    samples: SampleSheet,
    lengths: Option<Array2<f64>>,
}

impl DgeDataSet {
    pub fn new(
        counts: GeneCountMatrix,
        samples: SampleSheet,
        lengths: Option<Array2<f64>>,
    ) -> Result<Self> {
        let samples = samples.reorder_by_codes(counts.sample_codes())?;

        if let Some(lengths) = &lengths {
            if lengths.dim() != (counts.n_genes(), counts.n_samples()) {
                return Err(PipelineError::DimensionMismatch {
                    expected: format!("{}x{} length matrix", counts.n_genes(), counts.n_samples()),
                    got: format!("{}x{}", lengths.nrows(), lengths.ncols()),
                });
            }
            if lengths.iter().any(|&x| !x.is_finite() || x <= 0.0) {
                return Err(PipelineError::InvalidCountMatrix {
                    reason: "length offsets must be positive finite values".to_string(),
                });
            }
        }

        Ok(Self {
            counts,
            samples,
            lengths,
        })
    }

    pub fn counts(&self) -> &GeneCountMatrix {
        &self.counts
    }

    pub fn samples(&self) -> &SampleSheet {
        &self.samples
    }

    pub fn lengths(&self) -> Option<&Array2<f64>> {
        self.lengths.as_ref()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.n_samples()
    }

    /// Apply the minimum-total-count gene filter, keeping the length matrix
    /// aligned with the surviving genes.
    pub fn filter_low_total(&self, min_total: f64) -> Result<Self> {
        let keep: Vec<usize> = self
            .counts
            .gene_totals()
            .iter()
            .enumerate()
            .filter(|(_, &total)| total >= min_total)
            .map(|(i, _)| i)
            .collect();

        let counts = self.counts.filter_low_total(min_total)?;
        let lengths = self.lengths.as_ref().map(|l| l.select(Axis(0), &keep));

        Ok(Self {
            counts,
            samples: self.samples.clone(),
            lengths,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::samples::SampleRecord;
    use ndarray::array;

    fn sheet(codes: &[(&str, &str, &str)]) -> SampleSheet {
        let records = codes
            .iter()
            .map(|(sample, product, timepoint)| SampleRecord {
                sample_id: sample.to_string(),
                subject: None,
                product: product.to_string(),
                tissue: "Saliva".to_string(),
                timepoint: timepoint.to_string(),
                fortification: "Fortified".to_string(),
            })
            .collect();
        SampleSheet::new(records).unwrap()
    }

    #[test]
    fn test_alignment_is_order_independent() {
        let samples = sheet(&[("S02", "B", "Final"), ("S01", "B", "Initial")]);
        let counts = GeneCountMatrix::new(
            array![[10.0, 20.0], [30.0, 40.0]],
            vec!["g1".into(), "g2".into()],
            vec!["S01_B_Saliva_Initial".into(), "S02_B_Saliva_Final".into()],
        )
        .unwrap();

        let ds = DgeDataSet::new(counts, samples, None).unwrap();
        assert_eq!(ds.samples().records()[0].sample_id, "S01");
        assert_eq!(ds.samples().records()[1].sample_id, "S02");
    }

    #[test]
    fn test_mismatched_codes_fail_before_fitting() {
        let samples = sheet(&[("S01", "B", "Initial"), ("S03", "B", "Final")]);
        let counts = GeneCountMatrix::new(
            array![[10.0, 20.0]],
            vec!["g1".into()],
            vec!["S01_B_Saliva_Initial".into(), "S02_B_Saliva_Final".into()],
        )
        .unwrap();

        let err = DgeDataSet::new(counts, samples, None).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));
    }
}
