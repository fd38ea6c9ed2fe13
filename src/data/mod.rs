//! Data structures for samples, counts, and their validated pairing

pub mod count_matrix;
pub mod dataset;
pub mod samples;

pub use count_matrix::GeneCountMatrix;
pub use dataset::DgeDataSet;
pub use samples::{SampleRecord, SampleSheet, CODE_SEPARATOR};
