//! Pipeline runner for composing and executing analysis steps.

use crate::assoc::{
    intersect_donors, scan_cis, select_one_per_donor, with_lead_variant, AssociationResults,
    DonorSelection, GenePositions, GenotypeBundle, LeadVariant, ScanConfig,
};
use crate::data::{PhenotypeMatrix, WideTable};
use crate::error::{CytoError, Result};
use crate::filter::{apply_exclusion, drop_incomplete};
use crate::model::{LmmConfig, ModelSpec, Orchestrator, VarianceSummary};
use crate::reshape::{ChannelMap, DonorAliases};
use crate::test::LrtResult;
use log::info;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;

/// A step in the analysis pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineStep {
    /// Remove manually flagged samples.
    ExcludeSamples { sample_ids: Vec<String> },
    /// Remove samples missing any of these proteins.
    DropIncomplete { proteins: Vec<String> },
    /// REML variance fractions of each protein over the grouping factors.
    VarianceComponents {
        groups: Vec<String>,
        #[serde(default)]
        proteins: Option<Vec<String>>,
    },
    /// Likelihood-ratio comparison of two nested models.
    CompareModels {
        name: String,
        reduced: ModelSpec,
        full: ModelSpec,
        #[serde(default)]
        proteins: Option<Vec<String>>,
    },
    /// One-measurement-per-donor cis scan against the genotype bundle.
    CisScan {
        #[serde(default)]
        config: ScanConfig,
        #[serde(default)]
        selection: DonorSelection,
        #[serde(default)]
        proteins: Option<Vec<String>>,
    },
}

impl PipelineStep {
    /// Short name used in logs and errors.
    pub fn label(&self) -> String {
        match self {
            PipelineStep::ExcludeSamples { sample_ids } => {
                format!("exclude_samples[{}]", sample_ids.len())
            }
            PipelineStep::DropIncomplete { .. } => "drop_incomplete".to_string(),
            PipelineStep::VarianceComponents { groups, .. } => {
                format!("variance_components[{}]", groups.join(","))
            }
            PipelineStep::CompareModels { name, .. } => format!("compare_models[{}]", name),
            PipelineStep::CisScan { .. } => "cis_scan".to_string(),
        }
    }
}

/// Everything one analysis run needs besides the data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Name of the analysis.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channels: ChannelMap,
    #[serde(default)]
    pub donor_aliases: DonorAliases,
    #[serde(default)]
    pub genes: GenePositions,
    /// Samples excluded before any step runs.
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(default)]
    pub lmm: LmmConfig,
    /// Steps to execute.
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            name: "unnamed".to_string(),
            description: None,
            channels: ChannelMap::default(),
            donor_aliases: DonorAliases::default(),
            genes: GenePositions::default(),
            exclusions: Vec::new(),
            lmm: LmmConfig::default(),
            steps: Vec::new(),
        }
    }
}

impl AnalysisConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(CytoError::from)
    }

    /// Load from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML otherwise.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    /// Check the mapping tables.
    pub fn validate(&self) -> Result<()> {
        self.channels.validate()?;
        self.donor_aliases.validate()?;
        self.genes.validate()
    }
}

/// Data the steps consume beyond the wide table.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    /// Genotypes for the cis scan.
    pub genotypes: Option<GenotypeBundle>,
    /// Lead variant joined as a `dosage` covariate for model comparisons.
    pub lead_variant: Option<LeadVariant>,
    pub genes: GenePositions,
    pub lmm: LmmConfig,
}

impl PipelineInputs {
    /// Inputs carrying the configured gene table and solver settings.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            genotypes: None,
            lead_variant: None,
            genes: config.genes.clone(),
            lmm: config.lmm.clone(),
        }
    }
}

/// A named likelihood-ratio comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ModelComparison {
    pub name: String,
    pub reduced: ModelSpec,
    pub full: ModelSpec,
    pub result: LrtResult,
}

/// Outputs of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub name: String,
    /// Samples remaining after all filters.
    pub n_samples: usize,
    /// Samples removed by exclusion steps.
    pub excluded: Vec<String>,
    pub variance: Option<VarianceSummary>,
    pub comparisons: Vec<ModelComparison>,
    pub associations: Option<AssociationResults>,
    /// Final filtered table.
    #[serde(skip)]
    pub table: WideTable,
}

impl AnalysisReport {
    /// Write every available output into `dir`, creating it if needed.
    pub fn write_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.table.to_tsv(dir.join("wide_table.tsv"))?;
        if let Some(variance) = &self.variance {
            variance.to_tsv(dir.join("variance_fractions.tsv"))?;
        }
        if !self.comparisons.is_empty() {
            let mut writer = BufWriter::new(std::fs::File::create(dir.join("model_comparisons.tsv"))?);
            writeln!(writer, "comparison\tfeature_id\tll_reduced\tll_full\tstatistic\tdf\tp_value")?;
            for c in &self.comparisons {
                for r in &c.result.results {
                    writeln!(
                        writer,
                        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
                        c.name, r.feature_id, r.ll_reduced, r.ll_full, r.statistic, r.df, r.p_value
                    )?;
                }
            }
            writer.flush()?;
        }
        if let Some(associations) = &self.associations {
            associations.to_tsv(dir.join("associations.tsv"))?;
        }
        std::fs::write(dir.join("report.json"), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Builder for constructing and running analysis pipelines.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<PipelineStep>,
    name: String,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create a new empty pipeline.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            name: "unnamed".to_string(),
        }
    }

    /// Create from a config; configured exclusions run first.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        let mut pipeline = Self::new().name(&config.name);
        if !config.exclusions.is_empty() {
            pipeline = pipeline.exclude_samples(&config.exclusions);
        }
        pipeline.steps.extend(config.steps.iter().cloned());
        pipeline
    }

    /// Set the pipeline name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    /// Remove samples by id.
    pub fn exclude_samples(mut self, sample_ids: &[String]) -> Self {
        self.steps.push(PipelineStep::ExcludeSamples {
            sample_ids: sample_ids.to_vec(),
        });
        self
    }

    /// Remove samples missing any of the proteins.
    pub fn drop_incomplete(mut self, proteins: &[&str]) -> Self {
        self.steps.push(PipelineStep::DropIncomplete {
            proteins: proteins.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Add a variance decomposition over the grouping factors.
    pub fn variance_components(mut self, groups: &[&str]) -> Self {
        self.steps.push(PipelineStep::VarianceComponents {
            groups: groups.iter().map(|s| s.to_string()).collect(),
            proteins: None,
        });
        self
    }

    /// Add a likelihood-ratio comparison.
    pub fn compare_models(mut self, name: &str, reduced: ModelSpec, full: ModelSpec) -> Self {
        self.steps.push(PipelineStep::CompareModels {
            name: name.to_string(),
            reduced,
            full,
            proteins: None,
        });
        self
    }

    /// Add a cis scan.
    pub fn cis_scan(mut self, config: ScanConfig, selection: DonorSelection) -> Self {
        self.steps.push(PipelineStep::CisScan {
            config,
            selection,
            proteins: None,
        });
        self
    }

    /// Convert to config for serialization.
    pub fn to_config(&self, description: Option<&str>) -> AnalysisConfig {
        AnalysisConfig {
            name: self.name.clone(),
            description: description.map(String::from),
            steps: self.steps.clone(),
            ..AnalysisConfig::default()
        }
    }

    /// Run the steps in order; each produces a new table from the previous one.
    pub fn run(&self, wide: &WideTable, inputs: &PipelineInputs) -> Result<AnalysisReport> {
        let mut state = PipelineState::new(wide.clone());

        for (i, step) in self.steps.iter().enumerate() {
            info!("Step {} ({}): {} samples", i + 1, step.label(), state.wide.n_samples());
            state = state.apply(step, inputs).map_err(|e| CytoError::Stage {
                index: i + 1,
                step: step.label(),
                source: Box::new(e),
            })?;
        }

        Ok(state.finalize(&self.name))
    }
}

/// Internal state during pipeline execution.
struct PipelineState {
    wide: WideTable,
    variance: Option<VarianceSummary>,
    comparisons: Vec<ModelComparison>,
    associations: Option<AssociationResults>,
}

impl PipelineState {
    fn new(wide: WideTable) -> Self {
        Self {
            wide,
            variance: None,
            comparisons: Vec::new(),
            associations: None,
        }
    }

    fn proteins(&self, requested: &Option<Vec<String>>) -> Vec<String> {
        requested
            .clone()
            .unwrap_or_else(|| self.wide.proteins().to_vec())
    }

    fn apply(mut self, step: &PipelineStep, inputs: &PipelineInputs) -> Result<Self> {
        match step {
            PipelineStep::ExcludeSamples { sample_ids } => {
                self.wide = apply_exclusion(&self.wide, sample_ids)?;
            }
            PipelineStep::DropIncomplete { proteins } => {
                self.wide = drop_incomplete(&self.wide, proteins)?;
            }
            PipelineStep::VarianceComponents { groups, proteins } => {
                let phenotypes = PhenotypeMatrix::from_wide(&self.wide, &self.proteins(proteins))?;
                let metadata = self.wide.to_metadata()?;
                let orchestrator = Orchestrator::new(&phenotypes, &metadata, inputs.lmm.clone())?;
                let groups: Vec<&str> = groups.iter().map(|s| s.as_str()).collect();
                self.variance = Some(orchestrator.variance_fractions(&groups)?);
            }
            PipelineStep::CompareModels {
                name,
                reduced,
                full,
                proteins,
            } => {
                let phenotypes = PhenotypeMatrix::from_wide(&self.wide, &self.proteins(proteins))?;
                let mut metadata = self.wide.to_metadata()?;
                if let Some(lead) = &inputs.lead_variant {
                    metadata = with_lead_variant(&metadata, lead)?;
                }
                let orchestrator = Orchestrator::new(&phenotypes, &metadata, inputs.lmm.clone())?;
                let result = orchestrator.compare(reduced, full)?;
                self.comparisons.push(ModelComparison {
                    name: name.clone(),
                    reduced: reduced.clone(),
                    full: full.clone(),
                    result,
                });
            }
            PipelineStep::CisScan {
                config,
                selection,
                proteins,
            } => {
                let genotypes = inputs.genotypes.as_ref().ok_or_else(|| {
                    CytoError::InvalidParameter("cis scan requires a genotype bundle".to_string())
                })?;
                let per_donor = select_one_per_donor(&self.wide, &self.proteins(proteins), *selection)?;
                let (phenotypes, genotypes) = intersect_donors(&per_donor, genotypes)?;
                self.associations = Some(scan_cis(&phenotypes, &genotypes, &inputs.genes, config)?);
            }
        }
        Ok(self)
    }

    fn finalize(self, name: &str) -> AnalysisReport {
        AnalysisReport {
            name: name.to_string(),
            n_samples: self.wide.n_samples(),
            excluded: self.wide.excluded().iter().cloned().collect(),
            variance: self.variance,
            comparisons: self.comparisons,
            associations: self.associations,
            table: self.wide,
        }
    }
}
