//! Variance partitioning and cis-association analysis of flow-cytometry phenotypes
//!
//! This library turns per-channel flow-cytometry readings of iPSC-derived cell
//! lines into a per-sample protein intensity table, partitions the variance of
//! each protein among experimental factors (measurement date, cell line, donor)
//! with linear mixed models, and scans nearby genetic variants for association.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (readings, wide table, Metadata, formulas, design matrices)
//! - **reshape**: Channel mapping, donor aliases and the long-to-wide pivot
//! - **filter**: PCA outlier candidates, sample exclusion, incomplete-sample removal
//! - **model**: Linear and linear mixed models, variance decomposition, model orchestration
//! - **test**: Likelihood-ratio and nested F-tests
//! - **assoc**: Genotype bundles, gene positions, one-per-donor selection and the cis scan
//! - **pipeline**: Pipeline composition and execution
//!
//! # Example
//!
//! ```no_run
//! use cytovar::prelude::*;
//!
//! let readings = FlowReading::read_tsv("flow_processed.tsv").unwrap();
//! let metadata = Metadata::from_tsv("sample_metadata.tsv").unwrap();
//! let wide = reshape(
//!     &dedup_readings(&readings),
//!     &metadata,
//!     &ChannelMap::default(),
//!     &DonorAliases::default(),
//! )
//! .unwrap();
//!
//! let report = Pipeline::new()
//!     .drop_incomplete(&["CD14", "CD16", "CD206"])
//!     .variance_components(&["flow_date", "line_id"])
//!     .run(&wide, &PipelineInputs::default())
//!     .unwrap();
//! ```

pub mod assoc;
pub mod data;
pub mod error;
pub mod filter;
pub mod model;
pub mod pipeline;
pub mod reshape;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::assoc::{
        align_donors, intersect_donors, scan_cis, select_one_per_donor, with_lead_variant,
        AssociationResults, AssociationRow, DonorSelection, GenePosition, GenePositions,
        GenotypeBundle, LeadVariant, ScanConfig, Variant,
    };
    pub use crate::data::{
        DesignMatrix, FlowReading, Formula, Metadata, MixedFormula, PhenotypeMatrix,
        RandomDesignMatrix, RandomEffect, SampleRecord, Term, Variable, WideTable,
    };
    pub use crate::error::{CytoError, ErrorCategory, Result};
    pub use crate::filter::{apply_exclusion, detect_candidates, drop_incomplete, OutlierCandidates};
    pub use crate::model::{
        decompose, fit_lmm_from_formula, model_lm, model_lmm, Estimation, LmFit, LmmConfig, LmmFit,
        ModelSpec, Orchestrator, VarianceComponents, VarianceSummary, RESIDUAL,
    };
    pub use crate::pipeline::{AnalysisConfig, AnalysisReport, Pipeline, PipelineInputs, PipelineStep};
    pub use crate::reshape::{dedup_readings, reshape, to_long, ChannelMap, DonorAliases};
    pub use crate::test::{test_f_nested, test_lrt, FTestResult, LrtResult};
}
