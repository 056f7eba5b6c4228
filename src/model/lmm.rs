//! Linear mixed models with crossed random intercepts.
//!
//! Fits `y = Xβ + Σ_k Z_k u_k + ε` with `u_k ~ N(0, σ_k² I)` and
//! `ε ~ N(0, σ_e² I)`, so that `V = σ_e² I + Σ_k σ_k² Z_k Z_kᵀ`.
//!
//! Variance components are estimated by EM, either by maximum likelihood or
//! by REML. Both log-likelihoods include the full Gaussian constant, so ML fits
//! of different fixed effects are directly comparable.
//!
//! # Example
//! ```ignore
//! use cytovar::model::lmm::{fit_lmm_from_formula, Estimation};
//!
//! let fit = fit_lmm_from_formula(
//!     &phenotypes,
//!     &metadata,
//!     "~ 1 + (1 | line_id) + (1 | flow_date)",
//!     Estimation::Reml,
//!     None,
//! )?;
//! ```

use crate::data::{DesignMatrix, Metadata, MixedFormula, PhenotypeMatrix, RandomDesignMatrix};
use crate::error::{CytoError, Result};
use crate::model::variance::VarianceComponents;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Likelihood used to estimate the variance components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimation {
    /// Maximum likelihood; required to compare models with different fixed effects.
    Ml,
    /// Restricted maximum likelihood; unbiased variance components.
    Reml,
}

impl fmt::Display for Estimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimation::Ml => write!(f, "ML"),
            Estimation::Reml => write!(f, "REML"),
        }
    }
}

/// EM stopping rule and variance floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmmConfig {
    /// Maximum EM iterations.
    pub max_iter: usize,
    /// Convergence tolerance on the change in log-likelihood.
    pub tol: f64,
    /// Floor applied to every variance component after each update.
    pub var_lower_bound: f64,
    /// A group variance below this share of the total is tested against the
    /// boundary and set to the floor when the likelihood does not rise away
    /// from zero.
    pub boundary_tol: f64,
}

impl Default for LmmConfig {
    fn default() -> Self {
        Self {
            max_iter: 2000,
            tol: 1e-8,
            var_lower_bound: 1e-10,
            boundary_tol: 1e-3,
        }
    }
}

/// Mixed-model fit of one protein.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmmFitSingle {
    /// Feature identifier.
    pub feature_id: String,
    /// GLS fixed effects at the final variances.
    pub coefficients: Vec<f64>,
    /// From (X'V^-1 X)^-1.
    pub std_errors: Vec<f64>,
    /// One variance per grouping factor, in model order.
    pub group_variances: Vec<f64>,
    /// Residual variance.
    pub residual_variance: f64,
    /// Log-likelihood (ML or REML) at the estimates.
    pub log_likelihood: f64,
    /// Number of EM iterations.
    pub iterations: usize,
    /// Whether the change in log-likelihood fell below tolerance.
    pub converged: bool,
}

impl LmmFitSingle {
    /// Get coefficient by index.
    pub fn get_coefficient(&self, index: usize) -> Option<f64> {
        self.coefficients.get(index).copied()
    }

    /// Wald t-statistic of a fixed effect.
    pub fn t_statistic(&self, index: usize) -> Option<f64> {
        let coef = self.coefficients.get(index)?;
        let se = self.std_errors.get(index)?;
        if *se > 0.0 {
            Some(coef / se)
        } else {
            None
        }
    }

    /// Pair the estimated variances with their grouping names.
    pub fn variance_components(&self, group_names: &[String]) -> Result<VarianceComponents> {
        if group_names.len() != self.group_variances.len() {
            return Err(CytoError::DimensionMismatch {
                expected: self.group_variances.len(),
                actual: group_names.len(),
            });
        }
        VarianceComponents::new(
            group_names
                .iter()
                .cloned()
                .zip(self.group_variances.iter().copied())
                .collect(),
            self.residual_variance,
        )
    }
}

/// Mixed-model fits of every protein against one formula.
#[derive(Debug, Clone)]
pub struct LmmFit {
    pub fits: Vec<LmmFitSingle>,
    /// Design column names.
    pub coefficient_names: Vec<String>,
    /// Grouping factor names, one per random intercept.
    pub group_names: Vec<String>,
    /// Estimation method shared by every fit.
    pub method: Estimation,
    /// Number of samples.
    pub n_samples: usize,
}

impl LmmFit {
    /// Fit of one protein.
    pub fn get_feature(&self, feature_id: &str) -> Option<&LmmFitSingle> {
        self.fits.iter().find(|f| f.feature_id == feature_id)
    }

    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Number of features.
    pub fn n_features(&self) -> usize {
        self.fits.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficient_names.len()
    }

    /// Fixed coefficients plus one variance per grouping factor plus the residual.
    pub fn n_parameters(&self) -> usize {
        self.coefficient_names.len() + self.group_names.len() + 1
    }

    /// Whether every protein reached the tolerance.
    pub fn all_converged(&self) -> bool {
        self.fits.iter().all(|f| f.converged)
    }

    /// Variance components of one feature.
    pub fn variance_components(&self, feature_id: &str) -> Result<VarianceComponents> {
        let fit = self.get_feature(feature_id).ok_or_else(|| {
            CytoError::InvalidParameter(format!("No fit for feature '{}'", feature_id))
        })?;
        fit.variance_components(&self.group_names)
    }
}

/// Fit linear mixed models to every phenotype row.
///
/// An empty `random` slice fits the fixed-effects model by ML or REML, which
/// keeps fixed-only and mixed models comparable through one likelihood.
pub fn model_lmm(
    phenotypes: &PhenotypeMatrix,
    design: &DesignMatrix,
    random: &[RandomDesignMatrix],
    method: Estimation,
    config: &LmmConfig,
) -> Result<LmmFit> {
    let n_samples = phenotypes.n_samples();
    if design.n_samples() != n_samples {
        return Err(CytoError::DimensionMismatch {
            expected: n_samples,
            actual: design.n_samples(),
        });
    }
    if design.sample_ids() != phenotypes.sample_ids.as_slice() {
        return Err(CytoError::SampleMismatch(
            "design matrix rows are not in phenotype column order".to_string(),
        ));
    }
    for z in random {
        if z.n_samples() != n_samples {
            return Err(CytoError::DimensionMismatch {
                expected: n_samples,
                actual: z.n_samples(),
            });
        }
    }
    design.check_estimable()?;

    let x = design.matrix();
    let zzt: Vec<DMatrix<f64>> = random.iter().map(|z| z.matrix() * z.matrix().transpose()).collect();
    let zs: Vec<&DMatrix<f64>> = random.iter().map(|z| z.matrix()).collect();

    let fits: Vec<LmmFitSingle> = (0..phenotypes.n_features())
        .into_par_iter()
        .map(|i| {
            fit_single_feature_lmm(
                &phenotypes.row(i),
                &phenotypes.feature_ids[i],
                x,
                &zs,
                &zzt,
                method,
                config,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let n_converged = fits.iter().filter(|f| f.converged).count();
    info!(
        "Fitted {} mixed model(s) by {} ({} converged)",
        fits.len(),
        method,
        n_converged
    );

    Ok(LmmFit {
        fits,
        coefficient_names: design.coefficient_names().to_vec(),
        group_names: random.iter().map(|z| z.grouping.clone()).collect(),
        method,
        n_samples,
    })
}

/// Quantities of the marginal model at fixed variance components.
struct Evaluation {
    beta: DVector<f64>,
    /// (XᵀV⁻¹X)⁻¹
    xtvx_inv: DMatrix<f64>,
    /// V⁻¹ for ML, the REML projection P otherwise.
    m: DMatrix<f64>,
    /// V⁻¹(y - Xβ), equal to P y under REML.
    py: DVector<f64>,
    log_likelihood: f64,
}

fn evaluate(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    zzt: &[DMatrix<f64>],
    group_variances: &[f64],
    residual_variance: f64,
    method: Estimation,
) -> Result<Evaluation> {
    let n = y.len();
    let p = x.ncols();

    let mut v = DMatrix::identity(n, n) * residual_variance;
    for (k, s2) in zzt.iter().zip(group_variances) {
        v += k * *s2;
    }
    let v_chol = v
        .cholesky()
        .ok_or_else(|| CytoError::Numerical("V is not positive definite".to_string()))?;
    let log_det_v = 2.0 * v_chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let v_inv = v_chol.inverse();

    let v_inv_x = &v_inv * x;
    let xtvx = x.tr_mul(&v_inv_x);
    let xtvx_chol = xtvx
        .cholesky()
        .ok_or_else(|| CytoError::Numerical("X'V^-1X is not positive definite".to_string()))?;
    let log_det_xtvx = 2.0 * xtvx_chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let xtvx_inv = xtvx_chol.inverse();

    let beta = &xtvx_inv * v_inv_x.tr_mul(y);
    let residuals = y - x * &beta;
    let py = &v_inv * &residuals;
    let quad_form = residuals.dot(&py);

    let ln_2pi = (2.0 * PI).ln();
    let (log_likelihood, m) = match method {
        Estimation::Ml => (-0.5 * (n as f64 * ln_2pi + log_det_v + quad_form), v_inv),
        Estimation::Reml => {
            let projection = &v_inv - &v_inv_x * &xtvx_inv * v_inv_x.transpose();
            (
                -0.5 * ((n - p) as f64 * ln_2pi + log_det_v + log_det_xtvx + quad_form),
                projection,
            )
        }
    };

    Ok(Evaluation {
        beta,
        xtvx_inv,
        m,
        py,
        log_likelihood,
    })
}

/// Fit one feature by EM over the variance components.
fn fit_single_feature_lmm(
    y: &[f64],
    feature_id: &str,
    x: &DMatrix<f64>,
    zs: &[&DMatrix<f64>],
    zzt: &[DMatrix<f64>],
    method: Estimation,
    config: &LmmConfig,
) -> Result<LmmFitSingle> {
    let n = y.len();
    let p = x.ncols();
    let y_vec = DVector::from_column_slice(y);

    // Start from the OLS residual variance, split evenly across components.
    let (mut group_variances, mut residual_variance) =
        initialize_variance_components(&y_vec, x, zs.len(), method, config)?;

    let mut log_lik_prev = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;
    let mut state = evaluate(&y_vec, x, zzt, &group_variances, residual_variance, method)?;

    while iterations < config.max_iter {
        iterations += 1;
        if zs.is_empty() || (state.log_likelihood - log_lik_prev).abs() < config.tol {
            converged = true;
            break;
        }
        log_lik_prev = state.log_likelihood;

        // EM update: σ² ← (σ⁴‖Zᵀ P y‖² + σ² q − σ⁴ tr(Zᵀ M Z)) / q
        let m_py = &state.py;
        for (s2, z) in group_variances.iter_mut().zip(zs) {
            let q = z.ncols() as f64;
            let zt_py = z.tr_mul(m_py);
            let trace = z.tr_mul(&(&state.m * *z)).trace();
            let updated = (*s2 * *s2 * zt_py.norm_squared() + *s2 * q - *s2 * *s2 * trace) / q;
            *s2 = updated.max(config.var_lower_bound);
        }
        let e2 = residual_variance;
        let updated =
            (e2 * e2 * m_py.norm_squared() + e2 * n as f64 - e2 * e2 * state.m.trace()) / n as f64;
        residual_variance = updated.max(config.var_lower_bound);

        // EM only approaches a zero variance sublinearly.
        let total = group_variances.iter().sum::<f64>() + residual_variance;
        for k in 0..group_variances.len() {
            let s2 = group_variances[k];
            if s2 <= config.var_lower_bound || s2 >= config.boundary_tol * total {
                continue;
            }
            let mut at_bound = group_variances.clone();
            at_bound[k] = config.var_lower_bound;
            let trial = evaluate(&y_vec, x, zzt, &at_bound, residual_variance, method)?;
            if trial.log_likelihood >= state.log_likelihood && component_score(&trial, zs[k]) <= 0.0 {
                debug!("{}: variance component {} set to its floor", feature_id, k);
                group_variances = at_bound;
            }
        }

        state = evaluate(&y_vec, x, zzt, &group_variances, residual_variance, method)?;
    }

    if converged {
        debug!("{}: converged after {} iteration(s)", feature_id, iterations);
    } else {
        warn!(
            "{}: mixed model did not converge in {} iterations",
            feature_id, config.max_iter
        );
    }

    Ok(LmmFitSingle {
        feature_id: feature_id.to_string(),
        coefficients: state.beta.iter().cloned().collect(),
        std_errors: (0..p)
            .map(|j| state.xtvx_inv[(j, j)].max(0.0).sqrt())
            .collect(),
        group_variances,
        residual_variance,
        log_likelihood: state.log_likelihood,
        iterations,
        converged,
    })
}

/// Derivative of the log-likelihood with respect to one group variance.
fn component_score(state: &Evaluation, z: &DMatrix<f64>) -> f64 {
    let zt_py = z.tr_mul(&state.py);
    0.5 * (zt_py.norm_squared() - z.tr_mul(&(&state.m * z)).trace())
}

/// Initial variances from the OLS residuals.
///
/// With no random effects this is already the ML (rss/n) or REML
/// (rss/(n-p)) residual variance.
fn initialize_variance_components(
    y: &DVector<f64>,
    x: &DMatrix<f64>,
    n_groups: usize,
    method: Estimation,
    config: &LmmConfig,
) -> Result<(Vec<f64>, f64)> {
    let n = y.len();
    let p = x.ncols();
    let xtx_chol = x
        .tr_mul(x)
        .cholesky()
        .ok_or_else(|| CytoError::Numerical("X'X is not positive definite".to_string()))?;
    let beta = xtx_chol.solve(&x.tr_mul(y));
    let rss = (y - x * beta).norm_squared();
    let denom = match method {
        Estimation::Ml => n,
        Estimation::Reml => n - p,
    };
    let total = (rss / denom as f64).max(config.var_lower_bound);
    let share = total / (n_groups + 1) as f64;
    Ok((vec![share; n_groups], share))
}

/// Fit LMMs from a formula string with random effects.
///
/// The metadata is aligned to the phenotype columns before building X and Z.
pub fn fit_lmm_from_formula(
    phenotypes: &PhenotypeMatrix,
    metadata: &Metadata,
    formula: &str,
    method: Estimation,
    config: Option<LmmConfig>,
) -> Result<LmmFit> {
    let mixed = MixedFormula::parse(formula)?;
    fit_lmm(phenotypes, metadata, &mixed, method, &config.unwrap_or_default())
}

/// Fit LMMs from a parsed mixed formula.
pub fn fit_lmm(
    phenotypes: &PhenotypeMatrix,
    metadata: &Metadata,
    formula: &MixedFormula,
    method: Estimation,
    config: &LmmConfig,
) -> Result<LmmFit> {
    let aligned = metadata.align_to(&phenotypes.sample_ids)?;
    let design = DesignMatrix::from_formula(&aligned, &formula.fixed)?;
    let random = formula
        .random
        .iter()
        .map(|re| RandomDesignMatrix::from_random_effect(&aligned, re))
        .collect::<Result<Vec<_>>>()?;
    model_lmm(phenotypes, &design, &random, method, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Formula, Variable};
    use crate::model::lm::model_lm;
    use crate::model::variance::RESIDUAL;
    use approx::assert_relative_eq;

    /// Deterministic standard-normal-ish noise.
    fn noise(seed: &mut u64) -> f64 {
        let mut sum = 0.0;
        for _ in 0..12 {
            *seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            sum += (*seed >> 11) as f64 / (1u64 << 53) as f64;
        }
        sum - 6.0
    }

    /// 12 lines × 4 flow dates, strong line effect, weak date effect.
    fn simulated() -> (PhenotypeMatrix, Metadata) {
        let mut seed = 42u64;
        let line_effects: Vec<f64> = (0..12).map(|_| 10.0 * noise(&mut seed)).collect();
        let date_effects: Vec<f64> = (0..4).map(|_| 2.0 * noise(&mut seed)).collect();

        let mut ids = Vec::new();
        let mut lines = Vec::new();
        let mut dates = Vec::new();
        let mut values = Vec::new();
        for (l, le) in line_effects.iter().enumerate() {
            for (d, de) in date_effects.iter().enumerate() {
                ids.push(format!("line{}_d{}", l, d));
                lines.push(Variable::Categorical(format!("line{}", l)));
                dates.push(Variable::Categorical(format!("d{}", d)));
                values.push(100.0 + le + de + 3.0 * noise(&mut seed));
            }
        }
        let n = ids.len();
        let phenotypes =
            PhenotypeMatrix::new(DMatrix::from_row_slice(1, n, &values), vec!["CD14".into()], ids.clone())
                .unwrap();
        let metadata = Metadata::from_columns(
            ids,
            vec![("line_id".into(), lines), ("flow_date".into(), dates)],
        )
        .unwrap();
        (phenotypes, metadata)
    }

    #[test]
    fn test_reml_fractions_dominated_by_line() {
        let (phenotypes, metadata) = simulated();
        let fit = fit_lmm_from_formula(
            &phenotypes,
            &metadata,
            "~ 1 + (1 | line_id) + (1 | flow_date)",
            Estimation::Reml,
            None,
        )
        .unwrap();
        assert!(fit.all_converged());
        assert_eq!(fit.group_names, vec!["line_id", "flow_date"]);
        assert_eq!(fit.n_parameters(), 4);

        let fractions = fit.variance_components("CD14").unwrap().fractions().unwrap();
        let total: f64 = fractions.values().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        assert!(fractions["line_id"] > fractions["flow_date"]);
        assert!(fractions["line_id"] > fractions[RESIDUAL]);
    }

    #[test]
    fn test_no_random_effects_matches_ols() {
        let (phenotypes, metadata) = simulated();
        let aligned = metadata.align_to(&phenotypes.sample_ids).unwrap();
        let design = DesignMatrix::from_formula(&aligned, &Formula::intercept_only()).unwrap();

        let ml = model_lmm(&phenotypes, &design, &[], Estimation::Ml, &LmmConfig::default()).unwrap();
        let ols = model_lm(&phenotypes, &design).unwrap();
        let (m, o) = (&ml.fits[0], &ols.fits[0]);
        assert!(m.converged);
        assert_relative_eq!(m.coefficients[0], o.coefficients[0], epsilon = 1e-9);
        assert_relative_eq!(m.log_likelihood, o.log_likelihood, epsilon = 1e-8);
        assert_relative_eq!(m.residual_variance, o.rss / 48.0, epsilon = 1e-9);

        let reml = model_lmm(&phenotypes, &design, &[], Estimation::Reml, &LmmConfig::default()).unwrap();
        assert_relative_eq!(reml.fits[0].residual_variance, o.sigma * o.sigma, epsilon = 1e-9);
    }

    #[test]
    fn test_ml_likelihood_not_below_fixed_only() {
        let (phenotypes, metadata) = simulated();
        let reduced =
            fit_lmm_from_formula(&phenotypes, &metadata, "~ 1", Estimation::Ml, None).unwrap();
        let full =
            fit_lmm_from_formula(&phenotypes, &metadata, "~ 1 + (1 | line_id)", Estimation::Ml, None)
                .unwrap();
        assert!(full.fits[0].log_likelihood >= reduced.fits[0].log_likelihood - 1e-8);
        // ML shrinks variance components relative to REML
        let reml =
            fit_lmm_from_formula(&phenotypes, &metadata, "~ 1 + (1 | line_id)", Estimation::Reml, None)
                .unwrap();
        assert!(reml.fits[0].group_variances[0] >= full.fits[0].group_variances[0]);
    }

    /// 10 lines × 10 dates. The noise sums to zero within every line and
    /// every date, so the date variance has its maximum at zero.
    fn no_date_effect() -> (PhenotypeMatrix, Metadata) {
        let mut ids = Vec::new();
        let mut lines = Vec::new();
        let mut dates = Vec::new();
        let mut values = Vec::new();
        for l in 0..10 {
            for d in 0..10 {
                let line_effect = 3.0 * ((7 * l) % 10) as f64;
                let noise = ((l + 3 * d) % 10) as f64 - 4.5;
                ids.push(format!("line{}_d{}", l, d));
                lines.push(Variable::Categorical(format!("line{}", l)));
                dates.push(Variable::Categorical(format!("d{}", d)));
                values.push(100.0 + line_effect + noise);
            }
        }
        let phenotypes =
            PhenotypeMatrix::new(DMatrix::from_row_slice(1, 100, &values), vec!["CD14".into()], ids.clone())
                .unwrap();
        let metadata = Metadata::from_columns(
            ids,
            vec![("line_id".into(), lines), ("flow_date".into(), dates)],
        )
        .unwrap();
        (phenotypes, metadata)
    }

    #[test]
    fn test_zero_date_variance_converges() {
        let (phenotypes, metadata) = no_date_effect();
        let fit = fit_lmm_from_formula(
            &phenotypes,
            &metadata,
            "~ 1 + (1 | flow_date) + (1 | line_id)",
            Estimation::Reml,
            None,
        )
        .unwrap();
        let single = &fit.fits[0];
        assert!(single.converged);
        assert!(single.iterations < LmmConfig::default().max_iter);
        assert!(single.group_variances[0] <= 1e-9);

        // one-way ANOVA: MSB = 825, MSW = 825 / 90
        let msw = 825.0 / 90.0;
        assert_relative_eq!(single.residual_variance, msw, max_relative = 1e-3);
        assert_relative_eq!(single.group_variances[1], (825.0 - msw) / 10.0, max_relative = 1e-3);
    }

    #[test]
    fn test_single_level_grouping_rejected() {
        let (phenotypes, _) = simulated();
        let ids = phenotypes.sample_ids.clone();
        let constant = Metadata::from_columns(
            ids.clone(),
            vec![(
                "batch".into(),
                ids.iter().map(|_| Variable::Categorical("b1".into())).collect(),
            )],
        )
        .unwrap();
        let err = fit_lmm_from_formula(&phenotypes, &constant, "~ 1 + (1 | batch)", Estimation::Reml, None)
            .unwrap_err();
        assert!(matches!(err, CytoError::DegenerateGrouping { levels: 1, .. }));
    }

    #[test]
    fn test_random_slope_rejected() {
        let (phenotypes, metadata) = simulated();
        let err = fit_lmm_from_formula(
            &phenotypes,
            &metadata,
            "~ 1 + (flow_date | line_id)",
            Estimation::Reml,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CytoError::NotImplemented(_)));
    }
}
