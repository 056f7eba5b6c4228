//! Statistical models: OLS, linear mixed models, and variance decomposition.

pub mod lm;
pub mod lmm;
pub mod orchestrator;
pub mod variance;

pub use lm::{model_lm, LmFit, LmFitSingle};
pub use lmm::{fit_lmm, fit_lmm_from_formula, model_lmm, Estimation, LmmConfig, LmmFit, LmmFitSingle};
pub use orchestrator::{ModelSpec, Orchestrator};
pub use variance::{decompose, VarianceComponents, VarianceSummary, RESIDUAL};
