//! Issue model fits over one phenotype table and extract variance fractions
//! or nested-model comparisons.

use crate::data::{DesignMatrix, Formula, Metadata, MixedFormula, PhenotypeMatrix};
use crate::error::{CytoError, Result};
use crate::model::lm::{model_lm, LmFit};
use crate::model::lmm::{fit_lmm, Estimation, LmmConfig, LmmFit};
use crate::model::variance::VarianceSummary;
use crate::test::{test_f_nested, test_lrt, FTestResult, LrtResult};
use log::info;
use serde::{Deserialize, Serialize};

/// A model to fit: a mixed formula plus the likelihood to maximise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// lme4-style formula, e.g. `~ dosage + (1 | flow_date)`.
    pub formula: String,
    /// Estimation method.
    pub method: Estimation,
}

impl ModelSpec {
    /// Maximum likelihood specification.
    pub fn ml(formula: &str) -> Self {
        Self {
            formula: formula.to_string(),
            method: Estimation::Ml,
        }
    }

    /// REML specification.
    pub fn reml(formula: &str) -> Self {
        Self {
            formula: formula.to_string(),
            method: Estimation::Reml,
        }
    }

    /// Parse the formula.
    pub fn parse(&self) -> Result<MixedFormula> {
        MixedFormula::parse(&self.formula)
    }
}

/// Fits models of one phenotype table against its sample metadata.
pub struct Orchestrator<'a> {
    phenotypes: &'a PhenotypeMatrix,
    metadata: Metadata,
    config: LmmConfig,
}

impl<'a> Orchestrator<'a> {
    /// Align the metadata to the phenotype columns.
    pub fn new(phenotypes: &'a PhenotypeMatrix, metadata: &Metadata, config: LmmConfig) -> Result<Self> {
        let metadata = metadata.align_to(&phenotypes.sample_ids)?;
        Ok(Self {
            phenotypes,
            metadata,
            config,
        })
    }

    /// Aligned metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Fit one mixed (or fixed-only) model.
    pub fn fit(&self, spec: &ModelSpec) -> Result<LmmFit> {
        let formula = spec.parse()?;
        info!("Fitting {} by {}", formula, spec.method);
        fit_lmm(self.phenotypes, &self.metadata, &formula, spec.method, &self.config)
    }

    /// Fit `~ 1 + (1|g)...` by REML and report each factor's share of variance.
    pub fn variance_fractions(&self, groups: &[&str]) -> Result<VarianceSummary> {
        if groups.is_empty() {
            return Err(CytoError::InvalidParameter(
                "at least one grouping factor is required".to_string(),
            ));
        }
        let formula = MixedFormula::new(Formula::intercept_only(), groups);
        info!("Variance decomposition: {}", formula);
        let fit = fit_lmm(
            self.phenotypes,
            &self.metadata,
            &formula,
            Estimation::Reml,
            &self.config,
        )?;

        let mut summary = VarianceSummary::new();
        for single in &fit.fits {
            let fractions = single.variance_components(&fit.group_names)?.fractions()?;
            summary.push(&single.feature_id, fractions);
        }
        Ok(summary)
    }

    /// Fit both specifications and compare them by likelihood ratio.
    pub fn compare(&self, reduced: &ModelSpec, full: &ModelSpec) -> Result<LrtResult> {
        if reduced.method != full.method {
            return Err(CytoError::IncompatibleEstimation(format!(
                "reduced model requested by {}, full model by {}",
                reduced.method, full.method
            )));
        }
        let reduced_fit = self.fit(reduced)?;
        let full_fit = self.fit(full)?;
        test_lrt(&reduced_fit, &full_fit)
    }

    /// OLS fit of a fixed-effects formula.
    pub fn fit_fixed(&self, formula: &str) -> Result<LmFit> {
        let formula = Formula::parse(formula)?;
        let design = DesignMatrix::from_formula(&self.metadata, &formula)?;
        model_lm(self.phenotypes, &design)
    }

    /// Nested F-test between two fixed-effects formulas.
    pub fn f_test(&self, reduced: &str, full: &str) -> Result<FTestResult> {
        test_f_nested(&self.fit_fixed(reduced)?, &self.fit_fixed(full)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;
    use crate::error::ErrorCategory;
    use crate::model::variance::RESIDUAL;
    use approx::assert_abs_diff_eq;
    use nalgebra::DMatrix;

    /// 10 lines × 3 dates; dosage per line shifts the phenotype.
    fn setup() -> (PhenotypeMatrix, Metadata) {
        let mut ids = Vec::new();
        let mut lines = Vec::new();
        let mut dates = Vec::new();
        let mut dosage = Vec::new();
        let mut values = Vec::new();
        let line_offsets = [3.0, -2.0, 1.5, -0.5, 2.5, -3.0, 0.5, -1.5, 1.0, -1.0];
        let date_offsets = [0.4, -0.3, -0.1];
        let noise = [0.3, -0.2, 0.1, -0.4, 0.2, 0.0, 0.1, -0.1];
        for (l, lo) in line_offsets.iter().enumerate() {
            for (d, dof) in date_offsets.iter().enumerate() {
                let dose = (l % 3) as f64;
                ids.push(format!("L{}D{}", l, d));
                lines.push(Variable::Categorical(format!("L{}", l)));
                dates.push(Variable::Categorical(format!("D{}", d)));
                dosage.push(Variable::Continuous(dose));
                values.push(50.0 + 4.0 * dose + lo + dof + noise[(l * 3 + d) % noise.len()]);
            }
        }
        let n = ids.len();
        let phenotypes =
            PhenotypeMatrix::new(DMatrix::from_row_slice(1, n, &values), vec!["CD16".into()], ids.clone())
                .unwrap();
        let metadata = Metadata::from_columns(
            ids,
            vec![
                ("line_id".into(), lines),
                ("flow_date".into(), dates),
                ("dosage".into(), dosage),
            ],
        )
        .unwrap();
        (phenotypes, metadata)
    }

    #[test]
    fn test_variance_fractions_sum_to_one() {
        let (phenotypes, metadata) = setup();
        let orch = Orchestrator::new(&phenotypes, &metadata, LmmConfig::default()).unwrap();
        let summary = orch.variance_fractions(&["flow_date", "line_id"]).unwrap();
        assert_eq!(summary.columns(), vec!["flow_date", "line_id", RESIDUAL]);
        let (_, row) = summary.iter().next().unwrap();
        assert_abs_diff_eq!(row.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(row["line_id"] > row["flow_date"]);
    }

    #[test]
    fn test_compare_dosage_by_ml() {
        let (phenotypes, metadata) = setup();
        let orch = Orchestrator::new(&phenotypes, &metadata, LmmConfig::default()).unwrap();
        let result = orch
            .compare(
                &ModelSpec::ml("~ 1 + (1 | line_id)"),
                &ModelSpec::ml("~ dosage + (1 | line_id)"),
            )
            .unwrap();
        assert_eq!(result.df, 1);
        assert!(result.results[0].p_value < 0.01);
    }

    #[test]
    fn test_compare_mixed_estimation_fails() {
        let (phenotypes, metadata) = setup();
        let orch = Orchestrator::new(&phenotypes, &metadata, LmmConfig::default()).unwrap();
        let err = orch
            .compare(
                &ModelSpec::reml("~ 1 + (1 | line_id)"),
                &ModelSpec::ml("~ dosage + (1 | line_id)"),
            )
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::StatisticalValidity);
    }

    #[test]
    fn test_overparameterised_fixed_model_fails() {
        let (phenotypes, metadata) = setup();
        let orch = Orchestrator::new(&phenotypes, &metadata, LmmConfig::default()).unwrap();
        // 1 + 9 line + 2 date + dosage = 13 columns for 30 samples, but dosage is
        // constant within line so the design is rank deficient.
        let err = orch
            .fit(&ModelSpec::ml("~ line_id + flow_date + dosage"))
            .unwrap_err();
        assert!(matches!(err, CytoError::RankDeficient { rank: 12, parameters: 13 }));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_f_test_on_fixed_models() {
        let (phenotypes, metadata) = setup();
        let orch = Orchestrator::new(&phenotypes, &metadata, LmmConfig::default()).unwrap();
        let result = orch.f_test("~ flow_date", "~ flow_date + dosage").unwrap();
        assert_eq!(result.coefficients_tested, vec!["dosage"]);
        assert!(result.results[0].p_value < 0.01);
    }
}
