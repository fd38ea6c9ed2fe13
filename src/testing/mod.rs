//! Hypothesis testing and multiple-testing correction

pub mod fdr;
pub mod pvalue;
pub mod wald;

pub use fdr::benjamini_hochberg;
pub use pvalue::wald_pvalue;
pub use wald::{wald_test_gene, WaldTestRow};
