//! cytovar - flow-cytometry variance partitioning CLI
//!
//! Command-line interface for reshaping readings, flagging outliers, variance
//! decomposition, model comparison and cis-association scanning.

use clap::{Parser, Subcommand, ValueEnum};
use cytovar::assoc::{
    intersect_donors, scan_cis, select_one_per_donor, with_lead_variant, DonorSelection,
    GenotypeBundle, LeadVariant,
};
use cytovar::data::{FlowReading, Metadata, PhenotypeMatrix, WideTable};
use cytovar::error::Result;
use cytovar::filter::{apply_exclusion, detect_candidates};
use cytovar::model::{Estimation, ModelSpec, Orchestrator};
use cytovar::pipeline::{AnalysisConfig, Pipeline, PipelineInputs};
use cytovar::reshape::{dedup_readings, duplicate_keys, reshape};
use std::path::{Path, PathBuf};

/// CLI-friendly estimation method
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliEstimation {
    /// Maximum likelihood (required when fixed effects differ)
    Ml,
    /// Restricted maximum likelihood
    Reml,
}

impl From<CliEstimation> for Estimation {
    fn from(method: CliEstimation) -> Self {
        match method {
            CliEstimation::Ml => Estimation::Ml,
            CliEstimation::Reml => Estimation::Reml,
        }
    }
}

/// CLI-friendly donor selection policy
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliSelection {
    /// First complete measurement in table order
    First,
    /// Earliest flow date
    Earliest,
}

impl From<CliSelection> for DonorSelection {
    fn from(selection: CliSelection) -> Self {
        match selection {
            CliSelection::First => DonorSelection::FirstObserved,
            CliSelection::Earliest => DonorSelection::EarliestDate,
        }
    }
}

/// Flow-cytometry variance partitioning and cis-association analysis
#[derive(Parser)]
#[command(name = "cytovar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pivot channel readings into a per-sample protein table
    Reshape {
        /// Processed readings TSV
        #[arg(short, long)]
        readings: PathBuf,

        /// Sample metadata TSV (needs donor and genotype_id columns)
        #[arg(short, long)]
        metadata: PathBuf,

        /// Analysis configuration (channel map, donor aliases)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Keep the first of duplicated (line, date, channel) readings instead of failing
        #[arg(long)]
        dedup: bool,

        /// Output wide table TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Project samples on principal components to flag outliers
    Pca {
        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Protein columns (default: all)
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Number of top candidates to print
        #[arg(long, default_value = "10")]
        top: usize,

        /// Output PC score TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Remove samples by id
    Exclude {
        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Sample ids to remove (comma-separated)
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,

        /// Output wide table TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Variance fractions of each protein over grouping factors
    Variance {
        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Grouping factors (comma-separated)
        #[arg(short, long, value_delimiter = ',', default_value = "flow_date,line_id")]
        groups: Vec<String>,

        /// Proteins (default: all)
        #[arg(long, value_delimiter = ',')]
        proteins: Option<Vec<String>>,

        /// Output variance summary TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Likelihood-ratio comparison of two nested models
    Compare {
        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Reduced model formula, e.g. "~ 1 + (1 | flow_date)"
        #[arg(long)]
        reduced: String,

        /// Full model formula, e.g. "~ dosage + (1 | flow_date)"
        #[arg(long)]
        full: String,

        /// Estimation method
        #[arg(long, value_enum, default_value = "ml")]
        method: CliEstimation,

        /// Lead-variant dosage TSV (genotype_id, dosage), joined as `dosage`
        #[arg(long)]
        lead_variant: Option<PathBuf>,

        /// Proteins (default: all)
        #[arg(long, value_delimiter = ',')]
        proteins: Option<Vec<String>>,
    },

    /// Cis-association scan with one measurement per donor
    Scan {
        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Variant positions TSV (snpid, chr, pos)
        #[arg(long)]
        snpspos: PathBuf,

        /// Dosage TSV (snpid, then one column per donor)
        #[arg(long)]
        dosage: PathBuf,

        /// Analysis configuration (gene positions)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Window in base pairs around each gene
        #[arg(long, default_value = "200000")]
        window: u64,

        /// Which measurement represents a donor
        #[arg(long, value_enum, default_value = "first")]
        selection: CliSelection,

        /// Output association TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run a pipeline from a YAML (or JSON) configuration file
    Run {
        /// Path to analysis configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Wide table TSV
        #[arg(short, long)]
        wide: PathBuf,

        /// Variant positions TSV, for cis_scan steps
        #[arg(long, requires = "dosage")]
        snpspos: Option<PathBuf>,

        /// Dosage TSV, for cis_scan steps
        #[arg(long, requires = "snpspos")]
        dosage: Option<PathBuf>,

        /// Lead-variant dosage TSV, for compare_models steps
        #[arg(long)]
        lead_variant: Option<PathBuf>,

        /// Output directory
        #[arg(short, long)]
        output_dir: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Reshape {
            readings,
            metadata,
            config,
            dedup,
            output,
        } => cmd_reshape(&readings, &metadata, config.as_deref(), dedup, &output),

        Commands::Pca {
            wide,
            columns,
            top,
            output,
        } => cmd_pca(&wide, columns, top, &output),

        Commands::Exclude { wide, ids, output } => cmd_exclude(&wide, &ids, &output),

        Commands::Variance {
            wide,
            groups,
            proteins,
            output,
        } => cmd_variance(&wide, &groups, proteins, &output),

        Commands::Compare {
            wide,
            reduced,
            full,
            method,
            lead_variant,
            proteins,
        } => cmd_compare(
            &wide,
            &reduced,
            &full,
            method.into(),
            lead_variant.as_deref(),
            proteins,
        ),

        Commands::Scan {
            wide,
            snpspos,
            dosage,
            config,
            window,
            selection,
            output,
        } => cmd_scan(
            &wide,
            &snpspos,
            &dosage,
            config.as_deref(),
            window,
            selection.into(),
            &output,
        ),

        Commands::Run {
            config,
            wide,
            snpspos,
            dosage,
            lead_variant,
            output_dir,
        } => cmd_run(
            &config,
            &wide,
            snpspos.as_deref().zip(dosage.as_deref()),
            lead_variant.as_deref(),
            &output_dir,
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(p) => AnalysisConfig::from_path(p),
        None => Ok(AnalysisConfig::default()),
    }
}

fn cmd_reshape(
    readings_path: &Path,
    metadata_path: &Path,
    config_path: Option<&Path>,
    dedup: bool,
    output_path: &Path,
) -> Result<()> {
    let config = load_config(config_path)?;
    let mut readings = FlowReading::read_tsv(readings_path)?;
    if dedup {
        for ((line, date, channel), count) in duplicate_keys(&readings) {
            eprintln!("  {} x ({}, {}, {})", count, line, date, channel);
        }
        readings = dedup_readings(&readings);
    }
    let metadata = Metadata::from_tsv(metadata_path)?;
    let wide = reshape(&readings, &metadata, &config.channels, &config.donor_aliases)?;
    wide.to_tsv(output_path)?;
    eprintln!(
        "Wrote {} samples x {} proteins to {:?}",
        wide.n_samples(),
        wide.proteins().len(),
        output_path
    );
    Ok(())
}

fn cmd_pca(wide_path: &Path, columns: Option<Vec<String>>, top: usize, output_path: &Path) -> Result<()> {
    let wide = WideTable::from_tsv(wide_path)?;
    let columns = columns.unwrap_or_else(|| wide.proteins().to_vec());
    let candidates = detect_candidates(&wide, &columns)?;
    candidates.to_tsv(output_path)?;

    let ratios: Vec<String> = candidates
        .explained_variance
        .iter()
        .map(|r| format!("{:.1}%", r * 100.0))
        .collect();
    eprintln!("Explained variance: {}", ratios.join(", "));
    eprintln!("Most distant samples:");
    for c in candidates.top(top) {
        eprintln!("  {}\t{:.3}", c.sample_id, c.distance);
    }
    Ok(())
}

fn cmd_exclude(wide_path: &Path, ids: &[String], output_path: &Path) -> Result<()> {
    let wide = WideTable::from_tsv(wide_path)?;
    let filtered = apply_exclusion(&wide, ids)?;
    filtered.to_tsv(output_path)?;
    eprintln!(
        "Removed {} of {} samples",
        wide.n_samples() - filtered.n_samples(),
        wide.n_samples()
    );
    Ok(())
}

fn phenotypes_of(wide: &WideTable, proteins: Option<Vec<String>>) -> Result<PhenotypeMatrix> {
    let proteins = proteins.unwrap_or_else(|| wide.proteins().to_vec());
    PhenotypeMatrix::from_wide(wide, &proteins)
}

fn cmd_variance(
    wide_path: &Path,
    groups: &[String],
    proteins: Option<Vec<String>>,
    output_path: &Path,
) -> Result<()> {
    let wide = WideTable::from_tsv(wide_path)?;
    let phenotypes = phenotypes_of(&wide, proteins)?;
    let metadata = wide.to_metadata()?;
    let orchestrator = Orchestrator::new(&phenotypes, &metadata, Default::default())?;
    let groups: Vec<&str> = groups.iter().map(|s| s.as_str()).collect();
    let summary = orchestrator.variance_fractions(&groups)?;
    summary.to_tsv(output_path)?;

    let columns = summary.columns();
    println!("feature\t{}", columns.join("\t"));
    for (feature, fractions) in summary.iter() {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| fractions.get(c).map(|v| format!("{:.3}", v)).unwrap_or_default())
            .collect();
        println!("{}\t{}", feature, cells.join("\t"));
    }
    Ok(())
}

fn cmd_compare(
    wide_path: &Path,
    reduced: &str,
    full: &str,
    method: Estimation,
    lead_variant: Option<&Path>,
    proteins: Option<Vec<String>>,
) -> Result<()> {
    let wide = WideTable::from_tsv(wide_path)?;
    let phenotypes = phenotypes_of(&wide, proteins)?;
    let mut metadata = wide.to_metadata()?;
    if let Some(path) = lead_variant {
        metadata = with_lead_variant(&metadata, &LeadVariant::from_tsv(path)?)?;
    }
    let orchestrator = Orchestrator::new(&phenotypes, &metadata, Default::default())?;
    let spec = |formula: &str| ModelSpec {
        formula: formula.to_string(),
        method,
    };
    let result = orchestrator.compare(&spec(reduced), &spec(full))?;

    println!("Tested: {:?} ({} df, {})", result.terms_tested, result.df, result.method);
    println!("feature\tll_reduced\tll_full\tchisq\tp_value");
    for r in &result.results {
        println!(
            "{}\t{:.3}\t{:.3}\t{:.3}\t{:.3e}",
            r.feature_id, r.ll_reduced, r.ll_full, r.statistic, r.p_value
        );
    }
    Ok(())
}

fn cmd_scan(
    wide_path: &Path,
    snpspos: &Path,
    dosage: &Path,
    config_path: Option<&Path>,
    window: u64,
    selection: DonorSelection,
    output_path: &Path,
) -> Result<()> {
    let config = load_config(config_path)?;
    let wide = WideTable::from_tsv(wide_path)?;
    let genotypes = GenotypeBundle::from_tsv(snpspos, dosage)?;

    let per_donor = select_one_per_donor(&wide, wide.proteins(), selection)?;
    let (phenotypes, genotypes) = intersect_donors(&per_donor, &genotypes)?;
    let scan_config = cytovar::assoc::ScanConfig {
        window,
        ..Default::default()
    };
    let results = scan_cis(&phenotypes, &genotypes, &config.genes, &scan_config)?;
    results.to_tsv(output_path)?;

    for target in results.targets() {
        for lead in results.lead_variants(target) {
            eprintln!(
                "{}: lead {} ({}:{}) beta={:.3} p={:.3e}",
                target, lead.variant_id, lead.chr, lead.pos, lead.beta, lead.p_value
            );
        }
    }
    Ok(())
}

fn cmd_run(
    config_path: &Path,
    wide_path: &Path,
    genotype_paths: Option<(&Path, &Path)>,
    lead_variant: Option<&Path>,
    output_dir: &Path,
) -> Result<()> {
    eprintln!("Loading analysis configuration from {:?}...", config_path);
    let config = AnalysisConfig::from_path(config_path)?;
    let wide = WideTable::from_tsv(wide_path)?;

    let mut inputs = PipelineInputs::from_config(&config);
    if let Some((snpspos, dosage)) = genotype_paths {
        inputs.genotypes = Some(GenotypeBundle::from_tsv(snpspos, dosage)?);
    }
    if let Some(path) = lead_variant {
        inputs.lead_variant = Some(LeadVariant::from_tsv(path)?);
    }

    eprintln!("Running pipeline '{}'...", config.name);
    let report = Pipeline::from_config(&config).run(&wide, &inputs)?;
    report.write_to_dir(output_dir)?;
    eprintln!(
        "Done: {} samples analysed, results in {:?}",
        report.n_samples, output_dir
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_needs_both_genotype_files() {
        let base = ["cytovar", "run", "--config", "a.yaml", "--wide", "w.tsv", "--output-dir", "out"];
        let with = |extra: &[&'static str]| {
            let mut args = base.to_vec();
            args.extend_from_slice(extra);
            Cli::try_parse_from(args)
        };
        assert!(with(&["--snpspos", "s.tsv"]).is_err());
        assert!(with(&["--dosage", "d.tsv"]).is_err());
        assert!(with(&["--snpspos", "s.tsv", "--dosage", "d.tsv"]).is_ok());
        assert!(with(&[]).is_ok());
    }
}
