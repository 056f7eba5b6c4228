//! Pipeline composition and execution for the flow-cytometry variance analysis.

mod runner;

pub use runner::{
    AnalysisConfig, AnalysisReport, ModelComparison, Pipeline, PipelineInputs, PipelineStep,
};
