//! Nested F-test between two OLS fits.

use crate::error::{CytoError, Result};
use crate::model::lm::LmFit;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

/// F-test result for one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FTestResultSingle {
    /// Feature identifier.
    pub feature_id: String,
    /// Residual sum of squares of the reduced model.
    pub rss_reduced: f64,
    /// Residual sum of squares of the full model.
    pub rss_full: f64,
    /// F statistic.
    pub statistic: f64,
    /// P-value.
    pub p_value: f64,
}

/// F-test results for all features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FTestResult {
    /// Individual results.
    pub results: Vec<FTestResultSingle>,
    /// Coefficients present only in the full model.
    pub coefficients_tested: Vec<String>,
    /// Numerator degrees of freedom.
    pub df_numerator: usize,
    /// Denominator degrees of freedom (residual df of the full model).
    pub df_denominator: usize,
}

impl FTestResult {
    /// Get result for a specific feature.
    pub fn get_feature(&self, feature_id: &str) -> Option<&FTestResultSingle> {
        self.results.iter().find(|r| r.feature_id == feature_id)
    }
}

/// Classical F-test of a reduced OLS model against a full model that nests it.
///
/// `F = ((RSS_r − RSS_f) / (p_f − p_r)) / (RSS_f / (n − p_f))`.
pub fn test_f_nested(reduced: &LmFit, full: &LmFit) -> Result<FTestResult> {
    if reduced.n_samples != full.n_samples {
        return Err(CytoError::DimensionMismatch {
            expected: full.n_samples,
            actual: reduced.n_samples,
        });
    }
    if let Some(extra) = reduced
        .coefficient_names
        .iter()
        .find(|c| !full.coefficient_names.contains(c))
    {
        return Err(CytoError::NotNested(format!(
            "coefficient '{}' of the reduced model is absent from the full model",
            extra
        )));
    }
    if reduced.n_coefficients() >= full.n_coefficients() {
        return Err(CytoError::NotNested(
            "full model must have more coefficients than the reduced model".to_string(),
        ));
    }

    let df_numerator = full.n_coefficients() - reduced.n_coefficients();
    let df_denominator = full.n_samples - full.n_coefficients();
    let dist = FisherSnedecor::new(df_numerator as f64, df_denominator as f64)
        .map_err(|e| CytoError::Numerical(format!("F({}, {}): {}", df_numerator, df_denominator, e)))?;

    let results = reduced
        .fits
        .iter()
        .zip(&full.fits)
        .map(|(r, f)| {
            if r.feature_id != f.feature_id {
                return Err(CytoError::SampleMismatch(format!(
                    "feature '{}' paired with '{}'",
                    r.feature_id, f.feature_id
                )));
            }
            let numerator = ((r.rss - f.rss) / df_numerator as f64).max(0.0);
            let denominator = f.rss / df_denominator as f64;
            let statistic = numerator / denominator;
            let p_value = if statistic.is_finite() {
                dist.sf(statistic)
            } else {
                f64::NAN
            };
            Ok(FTestResultSingle {
                feature_id: f.feature_id.clone(),
                rss_reduced: r.rss,
                rss_full: f.rss,
                statistic,
                p_value,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FTestResult {
        results,
        coefficients_tested: full
            .coefficient_names
            .iter()
            .filter(|c| !reduced.coefficient_names.contains(c))
            .cloned()
            .collect(),
        df_numerator,
        df_denominator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DesignMatrix, Formula, Metadata, PhenotypeMatrix, Variable};
    use crate::model::lm::model_lm;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn setup() -> (PhenotypeMatrix, Metadata) {
        let ids: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
        let dosage = [0.0, 1.0, 2.0, 0.0, 1.0, 2.0, 1.0, 0.0];
        let values: Vec<f64> = dosage
            .iter()
            .enumerate()
            .map(|(i, d)| 10.0 + 3.0 * d + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let phenotypes =
            PhenotypeMatrix::new(DMatrix::from_row_slice(1, 8, &values), vec!["CD14".into()], ids.clone())
                .unwrap();
        let metadata = Metadata::from_columns(
            ids,
            vec![(
                "dosage".into(),
                dosage.iter().map(|d| Variable::Continuous(*d)).collect(),
            )],
        )
        .unwrap();
        (phenotypes, metadata)
    }

    #[test]
    fn test_f_detects_dosage() {
        let (phenotypes, metadata) = setup();
        let reduced = model_lm(
            &phenotypes,
            &DesignMatrix::from_formula(&metadata, &Formula::intercept_only()).unwrap(),
        )
        .unwrap();
        let full = model_lm(
            &phenotypes,
            &DesignMatrix::from_formula(&metadata, &Formula::parse("~ dosage").unwrap()).unwrap(),
        )
        .unwrap();
        let result = test_f_nested(&reduced, &full).unwrap();
        assert_eq!(result.df_numerator, 1);
        assert_eq!(result.df_denominator, 6);
        assert_eq!(result.coefficients_tested, vec!["dosage"]);
        let r = result.get_feature("CD14").unwrap();
        assert!(r.rss_full < r.rss_reduced);
        assert!(r.p_value < 1e-4);

        // F equals t² for a single coefficient
        let t = full.fits[0].t_statistic(1).unwrap();
        assert_relative_eq!(r.statistic, t * t, max_relative = 1e-9);
    }

    #[test]
    fn test_f_rejects_swapped_models() {
        let (phenotypes, metadata) = setup();
        let reduced = model_lm(
            &phenotypes,
            &DesignMatrix::from_formula(&metadata, &Formula::intercept_only()).unwrap(),
        )
        .unwrap();
        let full = model_lm(
            &phenotypes,
            &DesignMatrix::from_formula(&metadata, &Formula::parse("~ dosage").unwrap()).unwrap(),
        )
        .unwrap();
        assert!(matches!(test_f_nested(&full, &reduced), Err(CytoError::NotNested(_))));
    }
}
