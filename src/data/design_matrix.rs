//! Fixed-effect design matrix (X) construction.

use crate::data::{Formula, Metadata, Term, Variable, VariableType};
use crate::error::{CytoError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// Name of the intercept column.
pub const INTERCEPT: &str = "(Intercept)";

/// A design matrix for linear modeling.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// samples × coefficients
    matrix: DMatrix<f64>,
    coefficient_names: Vec<String>,
    sample_ids: Vec<String>,
    /// Reference level of each categorical column.
    reference_levels: HashMap<String, String>,
}

impl DesignMatrix {
    /// Create a design matrix directly from components.
    pub fn from_matrix(
        matrix: DMatrix<f64>,
        coefficient_names: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        if matrix.ncols() != coefficient_names.len() {
            return Err(CytoError::DimensionMismatch {
                expected: matrix.ncols(),
                actual: coefficient_names.len(),
            });
        }
        if matrix.nrows() != sample_ids.len() {
            return Err(CytoError::DimensionMismatch {
                expected: matrix.nrows(),
                actual: sample_ids.len(),
            });
        }
        Ok(Self {
            matrix,
            coefficient_names,
            sample_ids,
            reference_levels: HashMap::new(),
        })
    }

    /// Build a design matrix from metadata and formula.
    ///
    /// Categorical columns are treatment-coded against their alphabetically
    /// first level; continuous columns enter as-is. Missing values in any
    /// formula column are an error.
    pub fn from_formula(metadata: &Metadata, formula: &Formula) -> Result<Self> {
        let sample_ids = metadata.sample_ids().to_vec();
        let n_samples = sample_ids.len();

        let mut reference_levels = HashMap::new();
        for var in formula.variables() {
            if !metadata.has_column(var) {
                return Err(CytoError::MissingColumn(var.to_string()));
            }
            if let Some((row, _)) = metadata
                .column(var)?
                .iter()
                .enumerate()
                .find(|(_, v)| v.is_missing())
            {
                return Err(CytoError::MissingValue(format!(
                    "column '{}' is missing for sample '{}'",
                    var, sample_ids[row]
                )));
            }
            if metadata.column_type(var) == Some(VariableType::Categorical) {
                if let Some(first) = metadata.levels(var)?.into_iter().next() {
                    reference_levels.insert(var.to_string(), first);
                }
            }
        }

        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        if formula.intercept {
            coefficient_names.push(INTERCEPT.to_string());
            columns.push(vec![1.0; n_samples]);
        }

        for term in &formula.terms {
            match term {
                Term::Main(var) => {
                    // Without an intercept the first categorical term keeps all levels.
                    let full_rank = !formula.intercept
                        && formula.terms.iter().position(|t| t == term) == Some(0);
                    for (name, col) in term_columns(metadata, var, &reference_levels, full_rank)? {
                        coefficient_names.push(name);
                        columns.push(col);
                    }
                }
                Term::Interaction(var1, var2) => {
                    let cols1 = term_columns(metadata, var1, &reference_levels, false)?;
                    let cols2 = term_columns(metadata, var2, &reference_levels, false)?;
                    for (name1, col1) in &cols1 {
                        for (name2, col2) in &cols2 {
                            coefficient_names.push(format!("{}:{}", name1, name2));
                            columns.push(col1.iter().zip(col2).map(|(a, b)| a * b).collect());
                        }
                    }
                }
            }
        }

        let matrix = DMatrix::from_fn(n_samples, columns.len(), |i, j| columns[j][i]);

        Ok(Self {
            matrix,
            coefficient_names,
            sample_ids,
            reference_levels,
        })
    }

    /// Verify the fixed effects are estimable from the available samples.
    ///
    /// More columns than rows is reported before the (more expensive) rank check.
    pub fn check_estimable(&self) -> Result<()> {
        let n = self.n_samples();
        let p = self.n_coefficients();
        if p == 0 {
            return Err(CytoError::InvalidParameter(
                "Design matrix has no columns".to_string(),
            ));
        }
        if p >= n {
            return Err(CytoError::TooManyParameters {
                parameters: p,
                observations: n,
            });
        }
        let rank = numerical_rank(&self.matrix);
        if rank < p {
            return Err(CytoError::RankDeficient {
                rank,
                parameters: p,
            });
        }
        Ok(())
    }

    /// Get the design matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Get coefficient names.
    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    /// Get sample IDs.
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Number of samples (rows).
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Get the reference level for a categorical variable.
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.reference_levels.get(variable).map(|s| s.as_str())
    }

    /// Get the index of a coefficient by name.
    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    /// Check if the matrix has an intercept.
    pub fn has_intercept(&self) -> bool {
        self.coefficient_names.first().map(|s| s.as_str()) == Some(INTERCEPT)
    }
}

/// Columns contributed by one variable.
fn term_columns(
    metadata: &Metadata,
    var: &str,
    reference_levels: &HashMap<String, String>,
    keep_reference: bool,
) -> Result<Vec<(String, Vec<f64>)>> {
    let values = metadata.column(var)?;
    match metadata.column_type(var) {
        Some(VariableType::Continuous) => Ok(vec![(
            var.to_string(),
            values
                .iter()
                .map(|v| v.as_continuous().unwrap_or(f64::NAN))
                .collect(),
        )]),
        Some(VariableType::Categorical) | None => {
            let reference = reference_levels.get(var);
            Ok(metadata
                .levels(var)?
                .into_iter()
                .filter(|level| keep_reference || Some(level) != reference)
                .map(|level| {
                    let col = values
                        .iter()
                        .map(|v| match v {
                            Variable::Categorical(s) if *s == level => 1.0,
                            _ => 0.0,
                        })
                        .collect();
                    (format!("{}{}", var, level), col)
                })
                .collect())
        }
    }
}

/// Number of singular values above the usual LAPACK-style tolerance.
pub(crate) fn numerical_rank(matrix: &DMatrix<f64>) -> usize {
    if matrix.is_empty() {
        return 0;
    }
    let singular = matrix.clone().svd(false, false).singular_values;
    let max_sv = singular.iter().cloned().fold(0.0_f64, f64::max);
    let tol = max_sv * (matrix.nrows().max(matrix.ncols()) as f64) * f64::EPSILON;
    singular.iter().filter(|&&s| s > tol).count()
}
