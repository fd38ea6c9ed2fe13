//! Command-line interface and batch orchestration

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use crate::annotation::TranscriptGeneMap;
use crate::data::{DgeDataSet, SampleSheet};
use crate::error::{PipelineError, Result};
use crate::import::import_quantifications;
use crate::model::{fit_with_options, ContrastSpec, Design, FitOptions, FittedModel};
use crate::results::results_filename;

#[derive(Parser, Debug)]
#[command(name = "salivatx")]
#[command(version)]
#[command(about = "Differential gene expression analysis of saliva RNA-seq quantifications")]
pub struct Cli {
    /// Path to the sample metadata table
    #[arg(short, long,
        long_help = "Path to the sample metadata table (CSV or TSV, auto-detected).\n\
            Required columns: Sample, Product, Tissue, Timepoint, Fortification.")]
    pub metadata: PathBuf,

    /// Optional descriptive-name table (sample id, subject)
    #[arg(long)]
    pub names: Option<PathBuf>,

    /// Base directory holding one quantification folder per sample
    #[arg(short, long, value_name = "DIR",
        long_help = "Base directory holding one folder per composite sample code,\n\
            each containing a quant.sf transcript quantification file.")]
    pub quant_dir: PathBuf,

    /// Transcript-to-gene map (two-column delimited file)
    #[arg(short, long)]
    pub tx2gene: PathBuf,

    /// Output directory for result tables
    #[arg(short, long, default_value = "results")]
    pub out_dir: PathBuf,

    /// Tissue to retain from the metadata table
    #[arg(long, default_value = "Saliva")]
    pub tissue: String,

    /// Minimum total raw count for a gene to enter the fit
    #[arg(long, default_value_t = 10.0)]
    pub min_count: f64,

    /// Adjusted p-value thresholds; one output file per contrast per threshold
    #[arg(long = "alpha", value_name = "ALPHA", default_values_t = [0.1, 0.05])]
    pub alphas: Vec<f64>,

    /// Apply normal-prior shrinkage to reported fold changes
    #[arg(long)]
    pub shrinkage: bool,

    /// Also write an MA plot SVG per contrast
    #[arg(long)]
    pub ma_plots: bool,

    /// Worker threads for per-gene fitting (0 = rayon default)
    #[arg(long, default_value_t = 3)]
    pub threads: usize,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Run the full batch: load inputs, fit one model per design, export every
/// contrast at every threshold.
pub fn run(cli: &Cli) -> Result<()> {
    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .ok();
    }

    info!("Loading metadata from {}", cli.metadata.display());
    let mut samples = SampleSheet::load(&cli.metadata)?;
    if let Some(names) = &cli.names {
        samples.attach_subjects(names)?;
    }
    let samples = samples.retain_tissue(&cli.tissue)?;
    info!("{} {} samples", samples.n_samples(), cli.tissue);

    info!("Loading transcript-gene map from {}", cli.tx2gene.display());
    let tx2gene = TranscriptGeneMap::load(&cli.tx2gene)?;
    info!("{} transcripts mapped", tx2gene.n_transcripts());

    info!("Importing quantifications from {}", cli.quant_dir.display());
    let quant = import_quantifications(&samples, &cli.quant_dir, &tx2gene)?;
    info!(
        "{} genes x {} samples imported",
        quant.counts.n_genes(),
        quant.counts.n_samples()
    );

    let dataset = DgeDataSet::new(quant.counts, samples, Some(quant.lengths))?;

    fs::create_dir_all(&cli.out_dir).map_err(|e| PipelineError::ExportFailed {
        path: cli.out_dir.clone(),
        source: e,
    })?;

    let options = FitOptions {
        min_total_count: cli.min_count,
        ..FitOptions::default()
    };

    let mut first_error: Option<PipelineError> = None;
    for (analysis, design, contrasts) in planned_analyses(&dataset)? {
        info!("Analysis '{}' (~{})", analysis, design.factors.join("+"));
        let model = fit_with_options(&dataset, &design, &options)?;
        for spec in &contrasts {
            if let Err(e) = export_contrast(cli, &model, &analysis, spec) {
                error!("{}: {}", spec.label(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The standard analysis plan: each single factor, timepoint adjusted for
/// product, and the product x timepoint interaction via the synthetic Group
/// factor with all pairwise level contrasts.
fn planned_analyses(
    dataset: &DgeDataSet,
) -> Result<Vec<(String, Design, Vec<ContrastSpec>)>> {
    let samples = dataset.samples();
    let mut plan = Vec::new();

    plan.push((
        "timepoint".to_string(),
        Design::new(["Timepoint"]),
        vec![two_level_contrast(samples, "Timepoint", "Final")?],
    ));
    plan.push((
        "fortification".to_string(),
        Design::new(["Fortification"]),
        vec![two_level_contrast(samples, "Fortification", "Fortified")?],
    ));
    plan.push((
        "product_timepoint".to_string(),
        Design::new(["Product", "Timepoint"]),
        vec![two_level_contrast(samples, "Timepoint", "Final")?],
    ));

    let group_levels = samples.levels("Group")?;
    let mut group_contrasts = Vec::new();
    for (i, denominator) in group_levels.iter().enumerate() {
        for numerator in group_levels.iter().skip(i + 1) {
            group_contrasts.push(ContrastSpec::new("Group", numerator, denominator));
        }
    }
    plan.push(("group".to_string(), Design::new(["Group"]), group_contrasts));

    Ok(plan)
}

/// Contrast for a two-level factor, putting `preferred_numerator` on top when
/// it is observed; otherwise the second sorted level is the numerator.
fn two_level_contrast(
    samples: &SampleSheet,
    factor: &str,
    preferred_numerator: &str,
) -> Result<ContrastSpec> {
    let levels = samples.levels(factor)?;
    if levels.len() != 2 {
        return Err(PipelineError::InvalidDesign {
            reason: format!(
                "factor '{}' has {} levels, expected 2 (observed: {})",
                factor,
                levels.len(),
                levels.join(", ")
            ),
        });
    }
    let (numerator, denominator) = if levels[0] == preferred_numerator {
        (levels[0].clone(), levels[1].clone())
    } else {
        (levels[1].clone(), levels[0].clone())
    };
    Ok(ContrastSpec::new(factor, &numerator, &denominator))
}

fn export_contrast(
    cli: &Cli,
    model: &FittedModel,
    analysis: &str,
    spec: &ContrastSpec,
) -> Result<()> {
    for &alpha in &cli.alphas {
        let table = if cli.shrinkage {
            model.shrink(spec, alpha)?
        } else {
            model.contrast(spec, alpha)?
        };
        let path = cli
            .out_dir
            .join(results_filename(analysis, &table.name, alpha));
        table.export_significant_csv(&path, alpha)?;
        info!(
            "{}: {} significant genes at padj < {} -> {}",
            table.name,
            table.n_significant(alpha),
            alpha,
            path.display()
        );

        if cli.ma_plots && alpha == cli.alphas[0] {
            let svg_path = cli
                .out_dir
                .join(format!("{}_{}_ma.svg", analysis, table.name));
            table.export_ma_plot_svg(&svg_path, alpha)?;
        }
    }
    Ok(())
}
