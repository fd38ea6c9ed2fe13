//! Sample metadata: typed records, composite codes, tissue filtering

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Separator used to derive the composite sample code
pub const CODE_SEPARATOR: &str = "_";

/// One biological sample with its experimental conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    /// Subject identifier from the descriptive-name table, when joined
    pub subject: Option<String>,
    pub product: String,
    pub tissue: String,
    pub timepoint: String,
    pub fortification: String,
}

impl SampleRecord {
    /// Composite code joining the identifying fields; this is the canonical
    /// key matching count-matrix columns and quantification subfolders.
    pub fn code(&self) -> String {
        [
            self.sample_id.as_str(),
            self.product.as_str(),
            self.tissue.as_str(),
            self.timepoint.as_str(),
        ]
        .join(CODE_SEPARATOR)
    }
}

/// Sample metadata table
#[derive(Debug, Clone)]
pub struct SampleSheet {
    records: Vec<SampleRecord>,
}

/// Columns the metadata file must provide (matched case-insensitively)
const REQUIRED_COLUMNS: [&str; 5] = ["sample", "product", "tissue", "timepoint", "fortification"];

fn detect_delimiter(first_line: &str) -> u8 {
    if first_line.contains('\t') {
        b'\t'
    } else {
        b','
    }
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

impl SampleSheet {
    pub fn new(records: Vec<SampleRecord>) -> Result<Self> {
        let sheet = Self { records };
        sheet.check_codes_unique()?;
        Ok(sheet)
    }

    /// Read the sample metadata table (tab or comma delimited, auto-detected).
    /// Fails if any required column is absent, naming the column.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|_| PipelineError::MissingInput {
            paths: vec![path.to_path_buf()],
        })?;
        let delimiter = detect_delimiter(contents.lines().next().unwrap_or(""));

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(csv::Trim::All)
            .from_reader(contents.as_bytes());

        let headers = reader.headers()?.clone();
        let mut indices = Vec::with_capacity(REQUIRED_COLUMNS.len());
        for column in REQUIRED_COLUMNS {
            let idx = column_index(&headers, column).ok_or_else(|| PipelineError::MissingColumn {
                column: column.to_string(),
                path: path.to_path_buf(),
            })?;
            indices.push(idx);
        }

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            if row.iter().all(|f| f.is_empty()) {
                continue;
            }
            let field = |i: usize| -> Result<String> {
                row.get(indices[i])
                    .map(|s| s.to_string())
                    .ok_or_else(|| PipelineError::InvalidMetadata {
                        reason: format!("row {:?} is missing fields", row),
                    })
            };
            records.push(SampleRecord {
                sample_id: field(0)?,
                subject: None,
                product: field(1)?,
                tissue: field(2)?,
                timepoint: field(3)?,
                fortification: field(4)?,
            });
        }

        if records.is_empty() {
            return Err(PipelineError::EmptyData {
                reason: format!("no samples found in {}", path.display()),
            });
        }

        Self::new(records)
    }

    /// Join the descriptive-name table (sample id, subject) onto the records.
    /// The table is one row per sample-subject pair with no header; a header
    /// line, if present, matches no sample id and is ignored by the join.
    /// Samples without a matching row keep `subject = None`.
    pub fn attach_subjects<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|_| PipelineError::MissingInput {
            paths: vec![path.to_path_buf()],
        })?;
        let delimiter = detect_delimiter(contents.lines().next().unwrap_or(""));

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(contents.as_bytes());

        let mut subjects: HashMap<String, String> = HashMap::new();
        for row in reader.records() {
            let row = row?;
            if let (Some(sample), Some(subject)) = (row.get(0), row.get(1)) {
                subjects.insert(sample.to_string(), subject.to_string());
            }
        }

        for record in &mut self.records {
            match subjects.get(&record.sample_id) {
                Some(subject) => record.subject = Some(subject.clone()),
                None => log::warn!(
                    "No descriptive name found for sample '{}'",
                    record.sample_id
                ),
            }
        }
        Ok(())
    }

    fn check_codes_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for record in &self.records {
            let code = record.code();
            if !seen.insert(code.clone()) {
                return Err(PipelineError::InvalidMetadata {
                    reason: format!("duplicate composite sample code '{}'", code),
                });
            }
        }
        Ok(())
    }

    /// Keep only samples of the given tissue type
    pub fn retain_tissue(&self, tissue: &str) -> Result<Self> {
        let records: Vec<SampleRecord> = self
            .records
            .iter()
            .filter(|r| r.tissue == tissue)
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(PipelineError::EmptyData {
                reason: format!("no samples with tissue '{}'", tissue),
            });
        }
        Self::new(records)
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn n_samples(&self) -> usize {
        self.records.len()
    }

    pub fn codes(&self) -> Vec<String> {
        self.records.iter().map(|r| r.code()).collect()
    }

    /// Values of a design factor for each sample, in record order.
    /// `Group` is the synthetic product x timepoint combination (e.g. "B.Final").
    pub fn factor_values(&self, factor: &str) -> Result<Vec<String>> {
        let values = match factor {
            "Product" => self.records.iter().map(|r| r.product.clone()).collect(),
            "Timepoint" => self.records.iter().map(|r| r.timepoint.clone()).collect(),
            "Fortification" => self
                .records
                .iter()
                .map(|r| r.fortification.clone())
                .collect(),
            "Group" => self
                .records
                .iter()
                .map(|r| format!("{}.{}", r.product, r.timepoint))
                .collect(),
            other => {
                return Err(PipelineError::InvalidDesign {
                    reason: format!("unknown design factor '{}'", other),
                })
            }
        };
        Ok(values)
    }

    /// Unique levels of a factor, sorted; the first level is the reference
    pub fn levels(&self, factor: &str) -> Result<Vec<String>> {
        let mut levels = self.factor_values(factor)?;
        levels.sort();
        levels.dedup();
        Ok(levels)
    }

    /// Quantification file path for each sample: `<base>/<code>/quant.sf`
    pub fn quant_paths<P: AsRef<Path>>(&self, base: P) -> Vec<(String, PathBuf)> {
        self.records
            .iter()
            .map(|r| {
                let code = r.code();
                let path = base.as_ref().join(&code).join("quant.sf");
                (code, path)
            })
            .collect()
    }

    /// Reorder records to match the given composite codes.
    /// Fails if the code sets differ in any way.
    pub fn reorder_by_codes(&self, codes: &[String]) -> Result<Self> {
        let by_code: HashMap<String, &SampleRecord> =
            self.records.iter().map(|r| (r.code(), r)).collect();

        let missing: Vec<&String> = codes.iter().filter(|c| !by_code.contains_key(*c)).collect();
        if !missing.is_empty() {
            return Err(PipelineError::SchemaMismatch {
                reason: format!(
                    "count matrix columns without metadata: {}",
                    missing
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
        if codes.len() != self.records.len() {
            let wanted: HashSet<&String> = codes.iter().collect();
            let extra: Vec<String> = self
                .records
                .iter()
                .map(|r| r.code())
                .filter(|c| !wanted.contains(c))
                .collect();
            return Err(PipelineError::SchemaMismatch {
                reason: format!("metadata samples without count column: {}", extra.join(", ")),
            });
        }

        let records = codes.iter().map(|c| by_code[c].clone()).collect();
        Self::new(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn toy_record(sample: &str, product: &str, timepoint: &str, fort: &str) -> SampleRecord {
        SampleRecord {
            sample_id: sample.to_string(),
            subject: None,
            product: product.to_string(),
            tissue: "Saliva".to_string(),
            timepoint: timepoint.to_string(),
            fortification: fort.to_string(),
        }
    }

    #[test]
    fn test_composite_code() {
        let record = toy_record("S01", "B", "Final", "Fortified");
        assert_eq!(record.code(), "S01_B_Saliva_Final");
    }

    #[test]
    fn test_load_and_filter_tissue() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Sample\tProduct\tTissue\tTimepoint\tFortification").unwrap();
        writeln!(file, "S01\tB\tSaliva\tInitial\tFortified").unwrap();
        writeln!(file, "S01\tB\tSaliva\tFinal\tFortified").unwrap();
        writeln!(file, "S02\tB\tPlasma\tInitial\tNon-Fortified").unwrap();

        let sheet = SampleSheet::load(file.path()).unwrap();
        assert_eq!(sheet.n_samples(), 3);

        let saliva = sheet.retain_tissue("Saliva").unwrap();
        assert_eq!(saliva.n_samples(), 2);
        assert!(saliva.codes().iter().all(|c| c.contains("Saliva")));
    }

    #[test]
    fn test_missing_column_is_named() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Sample,Product,Tissue,Timepoint").unwrap();
        writeln!(file, "S01,B,Saliva,Initial").unwrap();

        let err = SampleSheet::load(file.path()).unwrap_err();
        match err {
            PipelineError::MissingColumn { column, .. } => assert_eq!(column, "fortification"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_attach_subjects_headerless_keeps_first_pair() {
        let records = vec![
            toy_record("S01", "B", "Initial", "Fortified"),
            toy_record("S02", "B", "Final", "Fortified"),
        ];
        let mut sheet = SampleSheet::new(records).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "S01\tSubjectA").unwrap();
        writeln!(file, "S02\tSubjectB").unwrap();

        sheet.attach_subjects(file.path()).unwrap();
        assert_eq!(sheet.records()[0].subject.as_deref(), Some("SubjectA"));
        assert_eq!(sheet.records()[1].subject.as_deref(), Some("SubjectB"));
    }

    #[test]
    fn test_attach_subjects_tolerates_header_line() {
        let records = vec![
            toy_record("S01", "B", "Initial", "Fortified"),
            toy_record("S02", "B", "Final", "Fortified"),
        ];
        let mut sheet = SampleSheet::new(records).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "Sample\tSubject").unwrap();
        writeln!(file, "S01\tSubjectA").unwrap();
        writeln!(file, "S02\tSubjectB").unwrap();

        sheet.attach_subjects(file.path()).unwrap();
        assert_eq!(sheet.records()[0].subject.as_deref(), Some("SubjectA"));
        assert_eq!(sheet.records()[1].subject.as_deref(), Some("SubjectB"));
    }

    #[test]
    fn test_duplicate_codes_rejected() {
        let records = vec![
            toy_record("S01", "B", "Final", "Fortified"),
            toy_record("S01", "B", "Final", "Fortified"),
        ];
        assert!(SampleSheet::new(records).is_err());
    }

    #[test]
    fn test_group_factor_levels() {
        let records = vec![
            toy_record("S01", "A", "Initial", "Fortified"),
            toy_record("S02", "A", "Final", "Fortified"),
            toy_record("S03", "B", "Initial", "Non-Fortified"),
            toy_record("S04", "B", "Final", "Non-Fortified"),
        ];
        let sheet = SampleSheet::new(records).unwrap();
        let levels = sheet.levels("Group").unwrap();
        assert_eq!(levels, vec!["A.Final", "A.Initial", "B.Final", "B.Initial"]);
    }

    #[test]
    fn test_reorder_detects_mismatch() {
        let records = vec![
            toy_record("S01", "A", "Initial", "Fortified"),
            toy_record("S02", "A", "Final", "Fortified"),
        ];
        let sheet = SampleSheet::new(records).unwrap();

        let codes = vec!["S01_A_Saliva_Initial".to_string(), "S99_X_Saliva_Final".to_string()];
        let err = sheet.reorder_by_codes(&codes).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaMismatch { .. }));

        let good = vec!["S02_A_Saliva_Final".to_string(), "S01_A_Saliva_Initial".to_string()];
        let reordered = sheet.reorder_by_codes(&good).unwrap();
        assert_eq!(reordered.records()[0].sample_id, "S02");
    }
}
