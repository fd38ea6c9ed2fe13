//! Transcript-to-gene annotation map

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Mapping from transcript identifier to gene identifier for one organism
/// build. Many transcripts map to one gene; the map is immutable for the
/// duration of an analysis run.
#[derive(Debug, Clone)]
pub struct TranscriptGeneMap {
    tx_to_gene: HashMap<String, String>,
}

impl TranscriptGeneMap {
    pub fn new(tx_to_gene: HashMap<String, String>) -> Result<Self> {
        if tx_to_gene.is_empty() {
            return Err(PipelineError::EmptyData {
                reason: "transcript-to-gene map is empty".to_string(),
            });
        }
        Ok(Self { tx_to_gene })
    }

    /// Load a two-column delimited file (transcript id, gene id) derived from
    /// the organism build's annotation database. A header row is detected by
    /// a non-data first line and skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|_| PipelineError::MissingInput {
            paths: vec![path.to_path_buf()],
        })?;

        let delimiter = if contents.lines().next().unwrap_or("").contains('\t') {
            b'\t'
        } else {
            b','
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(contents.as_bytes());

        let mut tx_to_gene = HashMap::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            match (row.get(0), row.get(1)) {
                (Some(tx), Some(gene)) if !tx.is_empty() && !gene.is_empty() => {
                    if line == 0 && looks_like_header(tx, gene) {
                        continue;
                    }
                    tx_to_gene.insert(tx.to_string(), gene.to_string());
                }
                _ => {
                    return Err(PipelineError::InvalidMetadata {
                        reason: format!(
                            "malformed transcript-to-gene row in {}: {:?}",
                            path.display(),
                            row
                        ),
                    })
                }
            }
        }

        Self::new(tx_to_gene)
    }

    pub fn gene_for(&self, transcript: &str) -> Option<&str> {
        self.tx_to_gene.get(transcript).map(|s| s.as_str())
    }

    pub fn n_transcripts(&self) -> usize {
        self.tx_to_gene.len()
    }

    /// Unique gene identifiers, sorted for deterministic row order
    pub fn gene_ids(&self) -> Vec<String> {
        let mut genes: Vec<String> = self.tx_to_gene.values().cloned().collect();
        genes.sort();
        genes.dedup();
        genes
    }
}

/// First lines like `tx_id<TAB>gene_id` are column labels, not mappings.
/// Annotation exports frequently omit the header, so identifiers in the
/// first line count as data.
fn looks_like_header(tx: &str, gene: &str) -> bool {
    let tx = tx.to_ascii_lowercase();
    let gene = gene.to_ascii_lowercase();
    gene.contains("gene")
        || tx.contains("transcript")
        || tx == "tx"
        || tx.starts_with("tx_")
        || tx == "name"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_and_lookup() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "tx_id\tgene_id").unwrap();
        writeln!(file, "ENST0001\tENSG0001").unwrap();
        writeln!(file, "ENST0002\tENSG0001").unwrap();
        writeln!(file, "ENST0003\tENSG0002").unwrap();

        let map = TranscriptGeneMap::load(file.path()).unwrap();
        assert_eq!(map.n_transcripts(), 3);
        assert_eq!(map.gene_for("ENST0002"), Some("ENSG0001"));
        assert_eq!(map.gene_for("ENST0099"), None);
        assert_eq!(map.gene_ids(), vec!["ENSG0001", "ENSG0002"]);
    }

    #[test]
    fn test_headerless_file_keeps_first_row() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ENST0001\tENSG0001").unwrap();
        writeln!(file, "ENST0002\tENSG0002").unwrap();

        let map = TranscriptGeneMap::load(file.path()).unwrap();
        assert_eq!(map.n_transcripts(), 2);
        assert_eq!(map.gene_for("ENST0001"), Some("ENSG0001"));
        assert_eq!(map.gene_for("ENST0002"), Some("ENSG0002"));
    }

    #[test]
    fn test_header_row_not_taken_as_mapping() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "TXNAME,GENEID").unwrap();
        writeln!(file, "ENST0001,ENSG0001").unwrap();

        let map = TranscriptGeneMap::load(file.path()).unwrap();
        assert_eq!(map.n_transcripts(), 1);
        assert_eq!(map.gene_for("TXNAME"), None);
        assert_eq!(map.gene_ids(), vec!["ENSG0001"]);
    }
}
