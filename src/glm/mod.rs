//! Negative binomial generalized linear models

pub mod design;
pub mod fitting;
pub mod negative_binomial;

pub use design::{contrast_vector, design_matrix, DesignInfo};
pub use fitting::{default_ridge, fit_gene_irls, GeneFit, GlmParams};
