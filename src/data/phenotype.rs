//! Phenotype matrix (features × samples) consumed by the models and the scanner.

use crate::data::WideTable;
use crate::error::{CytoError, Result};
use nalgebra::DMatrix;
use serde::Serialize;

/// Complete (no missing values) phenotype values, one row per feature.
#[derive(Debug, Clone, Serialize)]
pub struct PhenotypeMatrix {
    /// features × samples
    #[serde(skip)]
    pub data: DMatrix<f64>,
    /// Feature identifiers (protein names).
    pub feature_ids: Vec<String>,
    /// Column identifiers (sample ids, or donor ids after deduplication).
    pub sample_ids: Vec<String>,
}

impl PhenotypeMatrix {
    /// Build from raw parts.
    pub fn new(data: DMatrix<f64>, feature_ids: Vec<String>, sample_ids: Vec<String>) -> Result<Self> {
        if data.nrows() != feature_ids.len() {
            return Err(CytoError::DimensionMismatch {
                expected: feature_ids.len(),
                actual: data.nrows(),
            });
        }
        if data.ncols() != sample_ids.len() {
            return Err(CytoError::DimensionMismatch {
                expected: sample_ids.len(),
                actual: data.ncols(),
            });
        }
        if let Some(k) = data.iter().position(|v| !v.is_finite()) {
            let (i, j) = (k % data.nrows(), k / data.nrows());
            return Err(CytoError::MissingValue(format!(
                "feature '{}' has no finite value for '{}'",
                feature_ids[i], sample_ids[j]
            )));
        }
        Ok(Self {
            data,
            feature_ids,
            sample_ids,
        })
    }

    /// Select protein columns of a wide table, keyed by sample id.
    ///
    /// Fails when any selected cell is missing; drop incomplete samples first.
    pub fn from_wide(wide: &WideTable, proteins: &[String]) -> Result<Self> {
        let cols = proteins
            .iter()
            .map(|p| wide.protein_index(p))
            .collect::<Result<Vec<_>>>()?;
        let data = DMatrix::from_fn(cols.len(), wide.n_samples(), |i, j| wide.values()[(j, cols[i])]);
        Self::new(data, proteins.to_vec(), wide.sample_ids())
    }

    /// Number of features.
    pub fn n_features(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Get a feature row as a vector.
    pub fn row(&self, feature: usize) -> Vec<f64> {
        self.data.row(feature).iter().cloned().collect()
    }

    /// Row index of a feature.
    pub fn feature_index(&self, feature_id: &str) -> Option<usize> {
        self.feature_ids.iter().position(|f| f == feature_id)
    }

    /// Reorder / subset columns to the given ids.
    pub fn select_samples(&self, sample_ids: &[String]) -> Result<Self> {
        let cols = sample_ids
            .iter()
            .map(|id| {
                self.sample_ids.iter().position(|s| s == id).ok_or_else(|| {
                    CytoError::SampleMismatch(format!("Sample '{}' not in phenotype matrix", id))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            data: self.data.select_columns(&cols),
            feature_ids: self.feature_ids.clone(),
            sample_ids: sample_ids.to_vec(),
        })
    }
}
