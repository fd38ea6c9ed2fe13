//! salivatx: differential gene-expression analysis of saliva RNA-seq data
//!
//! Batch pipeline from per-sample transcript quantifications (salmon
//! `quant.sf` layout) to per-contrast significant-gene tables. Transcript
//! counts are aggregated to gene level through a transcript-to-gene map, one
//! negative-binomial GLM is fit per gene, and named contrasts between
//! experimental conditions are tested with Wald statistics under BH false
//! discovery control.
//!
//! # Example
//!
//! ```ignore
//! use salivatx::prelude::*;
//!
//! let sheet = SampleSheet::load("metadata.tsv")?.retain_tissue("Saliva")?;
//! let tx2gene = TranscriptGeneMap::load("tx2gene.tsv")?;
//! let quant = import_quantifications(&sheet, "quants/", &tx2gene)?;
//! let dataset = DgeDataSet::new(quant.counts, sheet, Some(quant.lengths))?;
//!
//! let model = fit(&dataset, &Design::new(["Timepoint"]))?;
//! let table = model.contrast(&ContrastSpec::new("Timepoint", "Final", "Initial"), 0.1)?;
//! table.export_significant_csv("final_vs_initial.csv", 0.1)?;
//! ```

pub mod annotation;
pub mod cli;
pub mod data;
pub mod dispersion;
pub mod error;
pub mod filter;
pub mod glm;
pub mod import;
pub mod model;
pub mod normalization;
pub mod results;
pub mod shrinkage;
pub mod stats;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::annotation::TranscriptGeneMap;
    pub use crate::data::{DgeDataSet, GeneCountMatrix, SampleRecord, SampleSheet};
    pub use crate::dispersion::{estimate_dispersions, DispersionParams, Dispersions};
    pub use crate::error::{PipelineError, Result};
    pub use crate::filter::independent_filtering;
    pub use crate::glm::{design_matrix, DesignInfo, GlmParams};
    pub use crate::import::{import_quantifications, GeneQuantification};
    pub use crate::model::{fit, fit_with_options, ContrastSpec, Design, FitOptions, FittedModel};
    pub use crate::normalization::Normalization;
    pub use crate::results::{results_filename, ContrastRow, ContrastTable};
    pub use crate::shrinkage::shrink_lfc_normal;
    pub use crate::testing::benjamini_hochberg;
}
