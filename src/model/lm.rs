//! Ordinary least squares fits, one per phenotype.

use crate::data::{DesignMatrix, PhenotypeMatrix};
use crate::error::{CytoError, Result};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// OLS fit of one protein.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmFitSingle {
    pub feature_id: String,
    pub coefficients: Vec<f64>,
    pub std_errors: Vec<f64>,
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// Residual sum of squares.
    pub rss: f64,
    /// sqrt(rss / df_residual)
    pub sigma: f64,
    pub r_squared: f64,
    /// n - p
    pub df_residual: usize,
    /// Gaussian log-likelihood at the ML variance estimate (rss / n).
    pub log_likelihood: f64,
}

impl LmFitSingle {
    /// Coefficient at a design column.
    pub fn get_coefficient(&self, index: usize) -> Option<f64> {
        self.coefficients.get(index).copied()
    }

    /// Wald t-statistic; `None` for a zero standard error.
    pub fn t_statistic(&self, index: usize) -> Option<f64> {
        let coef = self.coefficients.get(index)?;
        let se = self.std_errors.get(index)?;
        if *se > 0.0 {
            Some(coef / se)
        } else {
            None
        }
    }
}

/// OLS fits of every protein against one design.
#[derive(Debug, Clone)]
pub struct LmFit {
    pub fits: Vec<LmFitSingle>,
    /// Design column names, shared by all fits.
    pub coefficient_names: Vec<String>,
    pub n_samples: usize,
}

impl LmFit {
    /// Fit of one protein.
    pub fn get_feature(&self, feature_id: &str) -> Option<&LmFitSingle> {
        self.fits.iter().find(|f| f.feature_id == feature_id)
    }

    /// Column of a named coefficient.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// One coefficient across all proteins, in fit order.
    pub fn coefficients_for(&self, coefficient_name: &str) -> Option<Vec<f64>> {
        let idx = self.coefficient_index(coefficient_name)?;
        Some(
            self.fits
                .iter()
                .map(|f| f.coefficients.get(idx).copied().unwrap_or(f64::NAN))
                .collect(),
        )
    }

    pub fn n_features(&self) -> usize {
        self.fits.len()
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficient_names.len()
    }
}

/// Fit OLS regressions of every phenotype row against the design matrix.
///
/// The design must be estimable (see [`DesignMatrix::check_estimable`]) and
/// its samples must match the phenotype columns in order.
pub fn model_lm(phenotypes: &PhenotypeMatrix, design: &DesignMatrix) -> Result<LmFit> {
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
    design.check_estimable()?;

    let x = design.matrix();
    let xtx_inv = x
        .tr_mul(x)
        .cholesky()
        .ok_or_else(|| CytoError::Numerical("X'X is not positive definite".to_string()))?
        .inverse();
    let df_residual = n_samples - design.n_coefficients();

    let fits: Vec<LmFitSingle> = (0..phenotypes.n_features())
        .into_par_iter()
        .map(|i| {
            fit_single_feature(
                &phenotypes.row(i),
                &phenotypes.feature_ids[i],
                x,
                &xtx_inv,
                df_residual,
            )
        })
        .collect();

    Ok(LmFit {
        fits,
        coefficient_names: design.coefficient_names().to_vec(),
        n_samples,
    })
}

/// Fit a single feature using pre-computed (X'X)^-1.
fn fit_single_feature(
    y: &[f64],
    feature_id: &str,
    x: &DMatrix<f64>,
    xtx_inv: &DMatrix<f64>,
    df_residual: usize,
) -> LmFitSingle {
    let n = y.len();
    let y_vec = DVector::from_column_slice(y);

    let beta = xtx_inv * x.tr_mul(&y_vec);
    let residuals_vec = &y_vec - x * &beta;
    let rss = residuals_vec.norm_squared();
    let sigma = (rss / df_residual as f64).sqrt();

    let std_errors: Vec<f64> = (0..beta.len())
        .map(|j| sigma * xtx_inv[(j, j)].max(0.0).sqrt())
        .collect();

    let y_mean = y.iter().sum::<f64>() / n as f64;
    let tss: f64 = y.iter().map(|yi| (yi - y_mean).powi(2)).sum();
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    LmFitSingle {
        feature_id: feature_id.to_string(),
        coefficients: beta.iter().cloned().collect(),
        std_errors,
        residuals: residuals_vec.iter().cloned().collect(),
        rss,
        sigma,
        r_squared,
        df_residual,
        log_likelihood: gaussian_log_likelihood(rss, n),
    }
}

/// Maximised Gaussian log-likelihood of a least-squares fit.
pub(crate) fn gaussian_log_likelihood(rss: f64, n: usize) -> f64 {
    let n = n as f64;
    -0.5 * n * ((2.0 * PI).ln() + (rss / n).ln() + 1.0)
}
