//! Error types for the saliva differential expression pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for pipeline operations
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Missing input file(s): {}", paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    MissingInput { paths: Vec<PathBuf> },

    #[error("Required column '{column}' not found in {}", path.display())]
    MissingColumn { column: String, path: PathBuf },

    #[error("Sample metadata does not match count matrix columns: {reason}")]
    SchemaMismatch { reason: String },

    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Invalid design: {reason}")]
    InvalidDesign { reason: String },

    #[error("Invalid contrast: {reason}")]
    InvalidContrast { reason: String },

    #[error("Model fitting failed: {reason}")]
    FitFailed { reason: String },

    #[error("Size factor estimation failed: {reason}")]
    SizeFactorFailed { reason: String },

    #[error("Export failed for {}: {source}", path.display())]
    ExportFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
