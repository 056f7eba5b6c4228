//! Likelihood ratio test (LRT) between nested mixed-model fits.
//!
//! The statistic `2 (ℓ_full − ℓ_reduced)` is referred to a chi-squared
//! distribution whose degrees of freedom are the number of extra parameters
//! in the full model. Variance parameters tested on the boundary make the
//! p-value conservative.

use crate::error::{CytoError, Result};
use crate::model::lmm::{Estimation, LmmFit};
use log::info;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Result of LRT for a single feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrtResultSingle {
    /// Feature identifier.
    pub feature_id: String,
    /// Log-likelihood of full model.
    pub ll_full: f64,
    /// Log-likelihood of reduced model.
    pub ll_reduced: f64,
    /// LRT statistic: 2 * (ll_full - ll_reduced), floored at zero.
    pub statistic: f64,
    /// Degrees of freedom.
    pub df: usize,
    /// P-value from chi-squared distribution.
    pub p_value: f64,
}

/// Results of LRT for all features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LrtResult {
    /// Individual test results.
    pub results: Vec<LrtResultSingle>,
    /// Fixed coefficients and grouping factors present only in the full model.
    pub terms_tested: Vec<String>,
    /// Degrees of freedom.
    pub df: usize,
    /// Estimation method of both fits.
    pub method: Estimation,
}

impl LrtResult {
    /// Number of tests.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Get p-values for all features.
    pub fn p_values(&self) -> Vec<f64> {
        self.results.iter().map(|r| r.p_value).collect()
    }

    /// Get result for a specific feature.
    pub fn get_feature(&self, feature_id: &str) -> Option<&LrtResultSingle> {
        self.results.iter().find(|r| r.feature_id == feature_id)
    }
}

/// Compare two nested mixed-model fits of the same phenotypes.
///
/// Both fits must use the same estimation method. REML likelihoods depend on
/// the fixed-effect design, so REML fits are only comparable when their
/// fixed coefficients are identical (i.e. only the random part differs).
pub fn test_lrt(reduced: &LmmFit, full: &LmmFit) -> Result<LrtResult> {
    if reduced.method != full.method {
        return Err(CytoError::IncompatibleEstimation(format!(
            "reduced model fitted by {}, full model by {}",
            reduced.method, full.method
        )));
    }
    if full.method == Estimation::Reml && reduced.coefficient_names != full.coefficient_names {
        return Err(CytoError::IncompatibleEstimation(
            "REML likelihoods of models with different fixed effects are not comparable; refit by ML"
                .to_string(),
        ));
    }
    if reduced.n_samples != full.n_samples {
        return Err(CytoError::DimensionMismatch {
            expected: full.n_samples,
            actual: reduced.n_samples,
        });
    }
    if reduced.fits.len() != full.fits.len() {
        return Err(CytoError::DimensionMismatch {
            expected: full.fits.len(),
            actual: reduced.fits.len(),
        });
    }

    let missing: Vec<&String> = reduced
        .coefficient_names
        .iter()
        .chain(&reduced.group_names)
        .filter(|name| {
            !full.coefficient_names.contains(name) && !full.group_names.contains(name)
        })
        .collect();
    if !missing.is_empty() {
        return Err(CytoError::NotNested(format!(
            "terms {:?} of the reduced model are absent from the full model",
            missing
        )));
    }
    if reduced.n_parameters() >= full.n_parameters() {
        return Err(CytoError::NotNested(format!(
            "reduced model has {} parameters, full model {}",
            reduced.n_parameters(),
            full.n_parameters()
        )));
    }

    let terms_tested: Vec<String> = full
        .coefficient_names
        .iter()
        .filter(|c| !reduced.coefficient_names.contains(c))
        .chain(
            full.group_names
                .iter()
                .filter(|g| !reduced.group_names.contains(g)),
        )
        .cloned()
        .collect();

    let df = full.n_parameters() - reduced.n_parameters();
    let chi_sq = ChiSquared::new(df as f64)
        .map_err(|e| CytoError::Numerical(format!("chi-squared({}): {}", df, e)))?;

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
            let statistic = (2.0 * (f.log_likelihood - r.log_likelihood)).max(0.0);
            let p_value = if statistic.is_finite() {
                chi_sq.sf(statistic)
            } else {
                f64::NAN
            };
            Ok(LrtResultSingle {
                feature_id: f.feature_id.clone(),
                ll_full: f.log_likelihood,
                ll_reduced: r.log_likelihood,
                statistic,
                df,
                p_value,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        "LRT ({}) on {} feature(s), testing {:?} with {} df",
        full.method,
        results.len(),
        terms_tested,
        df
    );

    Ok(LrtResult {
        results,
        terms_tested,
        df,
        method: full.method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lmm::LmmFitSingle;
    use approx::assert_relative_eq;

    fn fit(
        coefficients: &[&str],
        groups: &[&str],
        method: Estimation,
        log_likelihood: f64,
    ) -> LmmFit {
        LmmFit {
            fits: vec![LmmFitSingle {
                feature_id: "CD14".into(),
                coefficients: vec![0.0; coefficients.len()],
                std_errors: vec![1.0; coefficients.len()],
                group_variances: vec![1.0; groups.len()],
                residual_variance: 1.0,
                log_likelihood,
                iterations: 1,
                converged: true,
            }],
            coefficient_names: coefficients.iter().map(|s| s.to_string()).collect(),
            group_names: groups.iter().map(|s| s.to_string()).collect(),
            method,
            n_samples: 119,
        }
    }

    #[test]
    fn test_lrt_dosage_effect() {
        let reduced = fit(&["(Intercept)"], &["flow_date"], Estimation::Ml, -100.0);
        let full = fit(&["(Intercept)", "dosage"], &["flow_date"], Estimation::Ml, -98.0);
        let result = test_lrt(&reduced, &full).unwrap();
        assert_eq!(result.df, 1);
        assert_eq!(result.terms_tested, vec!["dosage"]);
        let r = result.get_feature("CD14").unwrap();
        assert_relative_eq!(r.statistic, 4.0, epsilon = 1e-12);
        // P(chi2_1 > 4) = 0.0455
        assert_relative_eq!(r.p_value, 0.04550026, epsilon = 1e-6);
    }

    #[test]
    fn test_reml_vs_ml_rejected() {
        let reduced = fit(&["(Intercept)"], &["flow_date"], Estimation::Reml, -100.0);
        let full = fit(&["(Intercept)", "dosage"], &["flow_date"], Estimation::Ml, -98.0);
        let err = test_lrt(&reduced, &full).unwrap_err();
        assert!(matches!(err, CytoError::IncompatibleEstimation(_)));
        assert_eq!(
            err.category(),
            crate::error::ErrorCategory::StatisticalValidity
        );
    }

    #[test]
    fn test_reml_requires_same_fixed_effects() {
        let reduced = fit(&["(Intercept)"], &["flow_date"], Estimation::Reml, -100.0);
        let full = fit(&["(Intercept)", "dosage"], &["flow_date"], Estimation::Reml, -98.0);
        assert!(matches!(
            test_lrt(&reduced, &full),
            Err(CytoError::IncompatibleEstimation(_))
        ));

        // Random part only differs: allowed
        let reduced = fit(&["(Intercept)"], &["flow_date"], Estimation::Reml, -100.0);
        let full = fit(&["(Intercept)"], &["flow_date", "line_id"], Estimation::Reml, -90.0);
        let result = test_lrt(&reduced, &full).unwrap();
        assert_eq!(result.terms_tested, vec!["line_id"]);
        assert!(result.results[0].p_value < 1e-4);
    }

    #[test]
    fn test_not_nested_rejected() {
        let reduced = fit(&["(Intercept)", "purity"], &["flow_date"], Estimation::Ml, -100.0);
        let full = fit(&["(Intercept)", "dosage"], &["flow_date"], Estimation::Ml, -98.0);
        assert!(matches!(test_lrt(&reduced, &full), Err(CytoError::NotNested(_))));
        // swapped arguments
        let reduced = fit(&["(Intercept)"], &[], Estimation::Ml, -100.0);
        let full = fit(&["(Intercept)"], &["line_id"], Estimation::Ml, -98.0);
        assert!(matches!(test_lrt(&full, &reduced), Err(CytoError::NotNested(_))));
    }

    #[test]
    fn test_negative_statistic_floored() {
        let reduced = fit(&["(Intercept)"], &[], Estimation::Ml, -100.0);
        let full = fit(&["(Intercept)", "dosage"], &[], Estimation::Ml, -100.0 - 1e-9);
        let r = &test_lrt(&reduced, &full).unwrap().results[0];
        assert_eq!(r.statistic, 0.0);
        assert_relative_eq!(r.p_value, 1.0, epsilon = 1e-12);
    }
}
