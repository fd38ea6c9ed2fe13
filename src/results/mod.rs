//! Result tables: ordering, significance calls, CSV export, MA plots

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// One gene's test outcome for a contrast. Fold changes are log2.
#[derive(Debug, Clone)]
pub struct ContrastRow {
    pub gene_id: String,
    pub base_mean: f64,
    pub log2_fold_change: f64,
    pub lfc_se: f64,
    pub stat: f64,
    pub pvalue: f64,
    pub padj: f64,
}

/// Results of one contrast, ordered by adjusted p-value (missing values last)
#[derive(Debug, Clone)]
pub struct ContrastTable {
    /// Contrast label, e.g. `Final_vs_Initial`
    pub name: String,
    rows: Vec<ContrastRow>,
}

impl ContrastTable {
    pub fn new(name: String, mut rows: Vec<ContrastRow>) -> Self {
        rows.sort_by(|a, b| {
            if a.padj.is_nan() && b.padj.is_nan() {
                std::cmp::Ordering::Equal
            } else if a.padj.is_nan() {
                std::cmp::Ordering::Greater
            } else if b.padj.is_nan() {
                std::cmp::Ordering::Less
            } else {
                a.padj.partial_cmp(&b.padj).unwrap()
            }
        });
        Self { name, rows }
    }

    pub fn rows(&self) -> &[ContrastRow] {
        &self.rows
    }

    /// Rows passing the adjusted p-value threshold
    pub fn significant(&self, threshold: f64) -> Vec<&ContrastRow> {
        self.rows
            .iter()
            .filter(|r| r.padj.is_finite() && r.padj < threshold)
            .collect()
    }

    pub fn n_significant(&self, threshold: f64) -> usize {
        self.significant(threshold).len()
    }

    /// Write significant rows as CSV. Missing values become `NA`, everything
    /// else keeps full float precision.
    pub fn export_significant_csv<P: AsRef<Path>>(&self, path: P, threshold: f64) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path).map_err(|e| PipelineError::ExportFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut writer = csv::Writer::from_writer(file);

        writer.write_record([
            "gene",
            "baseMean",
            "log2FoldChange",
            "lfcSE",
            "stat",
            "pvalue",
            "padj",
        ])?;
        for row in self.significant(threshold) {
            writer.write_record([
                row.gene_id.clone(),
                format_value(row.base_mean),
                format_value(row.log2_fold_change),
                format_value(row.lfc_se),
                format_value(row.stat),
                format_value(row.pvalue),
                format_value(row.padj),
            ])?;
        }
        writer.flush().map_err(|e| PipelineError::ExportFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    /// MA plot as a standalone SVG: mean expression (log10) against fold
    /// change, fold changes clamped to +-2, significant genes highlighted.
    pub fn export_ma_plot_svg<P: AsRef<Path>>(&self, path: P, threshold: f64) -> Result<()> {
        let path = path.as_ref();
        let (width, height, margin) = (720.0, 480.0, 50.0);

        let max_log_mean = self
            .rows
            .iter()
            .filter(|r| r.base_mean > 0.0)
            .map(|r| (r.base_mean + 1.0).log10())
            .fold(1.0_f64, f64::max);

        let mut svg = String::new();
        let _ = writeln!(
            svg,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{}\" height=\"{}\">",
            width, height
        );
        let _ = writeln!(
            svg,
            "<rect width=\"{}\" height=\"{}\" fill=\"white\"/>",
            width, height
        );
        // zero fold-change line
        let y_zero = height / 2.0;
        let _ = writeln!(
            svg,
            "<line x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\" stroke=\"gray\" stroke-dasharray=\"4\"/>",
            margin,
            y_zero,
            width - margin,
            y_zero
        );

        for row in &self.rows {
            if !(row.base_mean > 0.0) || !row.log2_fold_change.is_finite() {
                continue;
            }
            let x = margin
                + (row.base_mean + 1.0).log10() / max_log_mean * (width - 2.0 * margin);
            let lfc = row.log2_fold_change.clamp(-2.0, 2.0);
            let y = y_zero - lfc / 2.0 * (height / 2.0 - margin);
            let color = if row.padj.is_finite() && row.padj < threshold {
                "crimson"
            } else {
                "darkgray"
            };
            let _ = writeln!(
                svg,
                "<circle cx=\"{:.2}\" cy=\"{:.2}\" r=\"1.8\" fill=\"{}\" fill-opacity=\"0.6\"/>",
                x, y, color
            );
        }
        let _ = writeln!(
            svg,
            "<text x=\"{}\" y=\"{}\" font-size=\"14\">{} (padj &lt; {})</text>",
            margin,
            margin / 2.0,
            self.name,
            threshold
        );
        let _ = writeln!(svg, "</svg>");

        fs::write(path, svg).map_err(|e| PipelineError::ExportFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

fn format_value(x: f64) -> String {
    if x.is_finite() {
        format!("{}", x)
    } else {
        "NA".to_string()
    }
}

/// Output filename for one contrast at one significance threshold. The
/// threshold is part of the name so runs at several thresholds never
/// overwrite each other.
pub fn results_filename(analysis: &str, contrast_name: &str, threshold: f64) -> String {
    format!("{}_{}_p{}_results.csv", analysis, contrast_name, threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(gene: &str, pvalue: f64, padj: f64) -> ContrastRow {
        ContrastRow {
            gene_id: gene.to_string(),
            base_mean: 100.0,
            log2_fold_change: 1.5,
            lfc_se: 0.3,
            stat: 5.0,
            pvalue,
            padj,
        }
    }

    #[test]
    fn test_rows_sorted_by_padj_missing_last() {
        let table = ContrastTable::new(
            "Final_vs_Initial".to_string(),
            vec![
                row("g1", 0.04, 0.08),
                row("g2", f64::NAN, f64::NAN),
                row("g3", 0.001, 0.004),
            ],
        );
        let genes: Vec<&str> = table.rows().iter().map(|r| r.gene_id.as_str()).collect();
        assert_eq!(genes, vec!["g3", "g1", "g2"]);
    }

    #[test]
    fn test_significant_excludes_missing() {
        let table = ContrastTable::new(
            "x".to_string(),
            vec![
                row("g1", 0.001, 0.01),
                row("g2", 0.2, 0.4),
                row("g3", f64::NAN, f64::NAN),
            ],
        );
        assert_eq!(table.n_significant(0.05), 1);
        assert_eq!(table.significant(0.05)[0].gene_id, "g1");
    }

    #[test]
    fn test_csv_export_writes_significant_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let table = ContrastTable::new(
            "x".to_string(),
            vec![row("g1", 0.001, 0.01), row("g2", 0.2, 0.4)],
        );
        table.export_significant_csv(&path, 0.05).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("gene,baseMean,log2FoldChange"));
        assert!(lines[1].starts_with("g1,"));
    }

    #[test]
    fn test_filename_distinguishes_thresholds() {
        let a = results_filename("saliva", "Final_vs_Initial", 0.1);
        let b = results_filename("saliva", "Final_vs_Initial", 0.05);
        assert_eq!(a, "saliva_Final_vs_Initial_p0.1_results.csv");
        assert_eq!(b, "saliva_Final_vs_Initial_p0.05_results.csv");
        assert_ne!(a, b);
    }

    #[test]
    fn test_ma_plot_svg_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ma.svg");
        let table = ContrastTable::new(
            "x".to_string(),
            vec![row("g1", 0.001, 0.01), row("g2", 0.2, 0.4)],
        );
        table.export_ma_plot_svg(&path, 0.05).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("<svg"));
        assert!(contents.contains("crimson"));
    }
}
