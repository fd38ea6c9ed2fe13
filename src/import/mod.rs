//! Transcript quantification import and gene-level aggregation
//!
//! Reads per-sample `quant.sf` tables produced by selective-alignment
//! quantification and collapses transcript estimates to gene level: counts
//! are summed (then rounded to integers), and effective lengths are averaged
//! per gene weighted by transcript abundance. The length matrix feeds the
//! normalization offsets so that library composition and length bias are
//! both corrected.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ndarray::Array2;
use serde::Deserialize;

use crate::annotation::TranscriptGeneMap;
use crate::data::{GeneCountMatrix, SampleSheet};
use crate::error::{PipelineError, Result};

/// One row of a `quant.sf` file
#[derive(Debug, Deserialize)]
pub struct QuantRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Length")]
    pub length: f64,
    #[serde(rename = "EffectiveLength")]
    pub effective_length: f64,
    #[serde(rename = "TPM")]
    pub tpm: f64,
    #[serde(rename = "NumReads")]
    pub num_reads: f64,
}

/// Gene-level quantification for all samples: rounded count matrix plus the
/// matched average effective length matrix (same shape, genes x samples).
#[derive(Debug, Clone)]
pub struct GeneQuantification {
    pub counts: GeneCountMatrix,
    pub lengths: Array2<f64>,
}

/// Import quantification files for every sample in the sheet.
///
/// All `<base>/<code>/quant.sf` paths are checked for existence before any
/// file is parsed, so a single run reports every missing sample at once
/// rather than failing on the first.
pub fn import_quantifications<P: AsRef<Path>>(
    samples: &SampleSheet,
    quant_base: P,
    tx2gene: &TranscriptGeneMap,
) -> Result<GeneQuantification> {
    let paths = samples.quant_paths(quant_base);

    let missing: Vec<PathBuf> = paths
        .iter()
        .filter(|(_, p)| !p.is_file())
        .map(|(_, p)| p.clone())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingInput { paths: missing });
    }

    let gene_ids = tx2gene.gene_ids();
    let gene_index: HashMap<&str, usize> = gene_ids
        .iter()
        .enumerate()
        .map(|(i, g)| (g.as_str(), i))
        .collect();

    let n_genes = gene_ids.len();
    let n_samples = paths.len();
    let mut counts = Array2::<f64>::zeros((n_genes, n_samples));
    let mut lengths = Array2::<f64>::zeros((n_genes, n_samples));

    let mut unmapped: HashSet<String> = HashSet::new();

    for (j, (code, path)) in paths.iter().enumerate() {
        let records = read_quant_file(path)?;
        log::debug!("{}: {} transcript rows", code, records.len());

        // Per-gene accumulators for this sample
        let mut count_sum = vec![0.0_f64; n_genes];
        let mut tpm_sum = vec![0.0_f64; n_genes];
        let mut weighted_len = vec![0.0_f64; n_genes];
        let mut plain_len = vec![0.0_f64; n_genes];
        let mut n_tx = vec![0_usize; n_genes];

        for record in &records {
            let Some(gene) = tx2gene.gene_for(&record.name) else {
                unmapped.insert(record.name.clone());
                continue;
            };
            let i = gene_index[gene];
            count_sum[i] += record.num_reads;
            tpm_sum[i] += record.tpm;
            weighted_len[i] += record.tpm * record.effective_length;
            plain_len[i] += record.effective_length;
            n_tx[i] += 1;
        }

        for i in 0..n_genes {
            counts[[i, j]] = count_sum[i].round();
            // Abundance-weighted mean effective length; unweighted mean when
            // the gene is unexpressed in this sample.
            lengths[[i, j]] = if tpm_sum[i] > 0.0 {
                weighted_len[i] / tpm_sum[i]
            } else if n_tx[i] > 0 {
                plain_len[i] / n_tx[i] as f64
            } else {
                1.0
            };
            if lengths[[i, j]] <= 0.0 || !lengths[[i, j]].is_finite() {
                lengths[[i, j]] = 1.0;
            }
        }
    }

    if !unmapped.is_empty() {
        log::warn!(
            "{} transcripts had no gene mapping and were skipped",
            unmapped.len()
        );
    }

    let codes: Vec<String> = paths.iter().map(|(code, _)| code.clone()).collect();
    let counts = GeneCountMatrix::new(counts, gene_ids, codes)?;

    Ok(GeneQuantification { counts, lengths })
}

fn read_quant_file(path: &Path) -> Result<Vec<QuantRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;

    let mut records = Vec::new();
    for row in reader.deserialize::<QuantRecord>() {
        records.push(row?);
    }
    if records.is_empty() {
        return Err(PipelineError::EmptyData {
            reason: format!("no transcript rows in {}", path.display()),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SampleRecord;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn sheet(samples: &[(&str, &str, &str)]) -> SampleSheet {
        let records = samples
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

    fn map(pairs: &[(&str, &str)]) -> TranscriptGeneMap {
        let m: HashMap<String, String> = pairs
            .iter()
            .map(|(t, g)| (t.to_string(), g.to_string()))
            .collect();
        TranscriptGeneMap::new(m).unwrap()
    }

    fn write_quant(dir: &Path, code: &str, rows: &[(&str, f64, f64, f64, f64)]) {
        let sample_dir = dir.join(code);
        fs::create_dir_all(&sample_dir).unwrap();
        let mut contents = String::from("Name\tLength\tEffectiveLength\tTPM\tNumReads\n");
        for (name, len, eff, tpm, reads) in rows {
            contents.push_str(&format!("{}\t{}\t{}\t{}\t{}\n", name, len, eff, tpm, reads));
        }
        fs::write(sample_dir.join("quant.sf"), contents).unwrap();
    }

    #[test]
    fn test_counts_are_rounded_transcript_sums() {
        let dir = TempDir::new().unwrap();
        let samples = sheet(&[("S01", "B", "Initial")]);
        write_quant(
            dir.path(),
            "S01_B_Saliva_Initial",
            &[
                ("tx1", 1000.0, 900.0, 10.0, 100.3),
                ("tx2", 2000.0, 1900.0, 5.0, 50.4),
                ("tx3", 500.0, 400.0, 1.0, 7.0),
            ],
        );
        let tx2gene = map(&[("tx1", "g1"), ("tx2", "g1"), ("tx3", "g2")]);

        let quant = import_quantifications(&samples, dir.path(), &tx2gene).unwrap();
        let g1 = quant.counts.gene_index("g1").unwrap();
        let g2 = quant.counts.gene_index("g2").unwrap();
        // 100.3 + 50.4 = 150.7 rounds to 151
        assert_eq!(quant.counts.counts()[[g1, 0]], 151.0);
        assert_eq!(quant.counts.counts()[[g2, 0]], 7.0);

        // Abundance-weighted length: (10*900 + 5*1900) / 15
        let expected = (10.0 * 900.0 + 5.0 * 1900.0) / 15.0;
        assert!((quant.lengths[[g1, 0]] - expected).abs() < 1e-9);
    }

    #[test]
    fn test_one_to_one_mapping_preserves_transcript_counts() {
        let dir = TempDir::new().unwrap();
        let samples = sheet(&[("S01", "B", "Initial"), ("S02", "B", "Final")]);
        let rows = [
            ("tx1", 1000.0, 900.0, 10.0, 120.0),
            ("tx2", 2000.0, 1900.0, 5.0, 80.0),
        ];
        write_quant(dir.path(), "S01_B_Saliva_Initial", &rows);
        write_quant(dir.path(), "S02_B_Saliva_Final", &rows);
        // Identity-like map: each transcript is its own gene
        let tx2gene = map(&[("tx1", "gene_tx1"), ("tx2", "gene_tx2")]);

        let quant = import_quantifications(&samples, dir.path(), &tx2gene).unwrap();
        let i1 = quant.counts.gene_index("gene_tx1").unwrap();
        let i2 = quant.counts.gene_index("gene_tx2").unwrap();
        for j in 0..2 {
            assert_eq!(quant.counts.counts()[[i1, j]], 120.0);
            assert_eq!(quant.counts.counts()[[i2, j]], 80.0);
            assert!((quant.lengths[[i1, j]] - 900.0).abs() < 1e-9);
            assert!((quant.lengths[[i2, j]] - 1900.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_all_missing_paths_reported_at_once() {
        let dir = TempDir::new().unwrap();
        let samples = sheet(&[("S01", "B", "Initial"), ("S02", "B", "Final")]);
        write_quant(
            dir.path(),
            "S01_B_Saliva_Initial",
            &[("tx1", 1000.0, 900.0, 10.0, 100.0)],
        );
        let tx2gene = map(&[("tx1", "g1")]);

        let err = import_quantifications(&samples, dir.path(), &tx2gene).unwrap_err();
        match err {
            PipelineError::MissingInput { paths } => {
                assert_eq!(paths.len(), 1);
                assert!(paths[0].to_string_lossy().contains("S02_B_Saliva_Final"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_zero_tpm_gene_gets_unweighted_length() {
        let dir = TempDir::new().unwrap();
        let samples = sheet(&[("S01", "B", "Initial")]);
        write_quant(
            dir.path(),
            "S01_B_Saliva_Initial",
            &[
                ("tx1", 1000.0, 800.0, 0.0, 0.0),
                ("tx2", 2000.0, 1200.0, 0.0, 0.0),
                ("tx3", 500.0, 400.0, 3.0, 30.0),
            ],
        );
        let tx2gene = map(&[("tx1", "g1"), ("tx2", "g1"), ("tx3", "g2")]);

        let quant = import_quantifications(&samples, dir.path(), &tx2gene).unwrap();
        let g1 = quant.counts.gene_index("g1").unwrap();
        assert!((quant.lengths[[g1, 0]] - 1000.0).abs() < 1e-9);
    }
}
