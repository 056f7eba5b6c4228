//! Sample metadata: one row per sample, typed columns.

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// A single metadata cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical level (line id, donor, date, ...).
    Categorical(String),
    /// Continuous numeric value.
    Continuous(f64),
    /// Missing value.
    Missing,
}

impl Variable {
    /// NA cell.
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Render the value as a grouping label.
    pub fn label(&self) -> Option<String> {
        match self {
            Variable::Categorical(s) => Some(s.clone()),
            Variable::Continuous(v) => Some(v.to_string()),
            Variable::Missing => None,
        }
    }
}

fn is_na(raw: &str) -> bool {
    raw.is_empty() || raw == "NA" || raw == "na" || raw == "NaN"
}

/// Type of a metadata column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Sample metadata keyed by sample id.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    sample_ids: Vec<String>,
    column_names: Vec<String>,
    /// sample_id -> column_name -> value
    data: HashMap<String, HashMap<String, Variable>>,
    column_types: HashMap<String, VariableType>,
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a tab-separated table.
    ///
    /// The first column holds the row id; remaining columns are variables.
    /// A column is continuous when every non-missing value parses as a number.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path)?;

        let header: Vec<String> = reader.headers()?.iter().map(|s| s.to_string()).collect();
        if header.len() < 2 {
            return Err(CytoError::EmptyData(
                "Metadata must have at least one variable column".to_string(),
            ));
        }
        let column_names = header[1..].to_vec();

        let mut raw_rows: Vec<(String, Vec<String>)> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let Some(id) = record.get(0) else { continue };
            if id.trim().is_empty() {
                continue;
            }
            let values = (1..header.len())
                .map(|i| record.get(i).unwrap_or("").trim().to_string())
                .collect();
            raw_rows.push((id.trim().to_string(), values));
        }

        if raw_rows.is_empty() {
            return Err(CytoError::EmptyData("No rows in metadata".to_string()));
        }

        let mut columns: Vec<Vec<String>> = vec![Vec::with_capacity(raw_rows.len()); column_names.len()];
        let mut sample_ids = Vec::with_capacity(raw_rows.len());
        for (id, values) in raw_rows {
            sample_ids.push(id);
            for (col, value) in values.into_iter().enumerate() {
                columns[col].push(value);
            }
        }

        let typed: Vec<(String, Vec<Variable>)> = column_names
            .iter()
            .zip(columns)
            .map(|(name, raw)| (name.clone(), infer_column(&raw)))
            .collect();

        Self::from_columns(sample_ids, typed)
    }

    /// Build metadata from in-memory columns.
    ///
    /// Column types are taken from the first non-missing value of each column.
    pub fn from_columns(sample_ids: Vec<String>, columns: Vec<(String, Vec<Variable>)>) -> Result<Self> {
        let unique: BTreeSet<&String> = sample_ids.iter().collect();
        if unique.len() != sample_ids.len() {
            return Err(CytoError::DuplicateKey(
                "sample ids in metadata are not unique".to_string(),
            ));
        }

        let mut data: HashMap<String, HashMap<String, Variable>> = sample_ids
            .iter()
            .map(|s| (s.clone(), HashMap::new()))
            .collect();
        let mut column_names = Vec::with_capacity(columns.len());
        let mut column_types = HashMap::new();

        for (name, values) in columns {
            if values.len() != sample_ids.len() {
                return Err(CytoError::DimensionMismatch {
                    expected: sample_ids.len(),
                    actual: values.len(),
                });
            }
            let var_type = values
                .iter()
                .find_map(|v| match v {
                    Variable::Categorical(_) => Some(VariableType::Categorical),
                    Variable::Continuous(_) => Some(VariableType::Continuous),
                    Variable::Missing => None,
                })
                .unwrap_or(VariableType::Categorical);
            for (sid, value) in sample_ids.iter().zip(values) {
                if let Some(row) = data.get_mut(sid) {
                    row.insert(name.clone(), value);
                }
            }
            column_types.insert(name.clone(), var_type);
            column_names.push(name);
        }

        Ok(Self {
            sample_ids,
            column_names,
            data,
            column_types,
        })
    }

    /// Override column types, re-interpreting stored values.
    pub fn with_column_types(mut self, types: HashMap<String, VariableType>) -> Self {
        for (col_name, var_type) in &types {
            self.column_types.insert(col_name.clone(), *var_type);
            for row in self.data.values_mut() {
                if let Some(var) = row.get_mut(col_name) {
                    *var = match (&*var, var_type) {
                        (Variable::Categorical(s), VariableType::Continuous) => s
                            .trim()
                            .parse::<f64>()
                            .map(Variable::Continuous)
                            .unwrap_or(Variable::Missing),
                        (Variable::Continuous(v), VariableType::Categorical) => {
                            Variable::Categorical(v.to_string())
                        }
                        (other, _) => other.clone(),
                    };
                }
            }
        }
        self
    }

    /// Sample IDs in order.
    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    /// Column names.
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// Get a value for a specific sample and column.
    pub fn get(&self, sample_id: &str, column: &str) -> Option<&Variable> {
        self.data.get(sample_id).and_then(|m| m.get(column))
    }

    /// All values of a column, in sample order.
    pub fn column(&self, column: &str) -> Result<Vec<&Variable>> {
        if !self.has_column(column) {
            return Err(CytoError::MissingColumn(column.to_string()));
        }
        Ok(self
            .sample_ids
            .iter()
            .map(|sid| {
                self.data
                    .get(sid)
                    .and_then(|m| m.get(column))
                    .unwrap_or(&Variable::Missing)
            })
            .collect())
    }

    /// Get the type of a column.
    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Sorted unique levels of a column (missing values excluded).
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let levels: BTreeSet<String> = self
            .column(column)?
            .iter()
            .filter_map(|v| v.label())
            .collect();
        Ok(levels.into_iter().collect())
    }

    /// Subset (and reorder) metadata to the given samples.
    pub fn subset_samples(&self, sample_ids: &[String]) -> Result<Self> {
        let mut data = HashMap::with_capacity(sample_ids.len());
        for sid in sample_ids {
            let row = self.data.get(sid).ok_or_else(|| {
                CytoError::SampleMismatch(format!("Sample '{}' not found in metadata", sid))
            })?;
            data.insert(sid.clone(), row.clone());
        }
        Ok(Self {
            sample_ids: sample_ids.to_vec(),
            column_names: self.column_names.clone(),
            data,
            column_types: self.column_types.clone(),
        })
    }

    /// Align metadata to the sample order of a phenotype matrix.
    pub fn align_to(&self, sample_ids: &[String]) -> Result<Self> {
        self.subset_samples(sample_ids)
    }

    /// Add a continuous column looked up through a categorical key column.
    ///
    /// Samples whose key has no entry in `values` get a missing value.
    pub fn join_continuous(
        &self,
        key_column: &str,
        name: &str,
        values: &HashMap<String, f64>,
    ) -> Result<Self> {
        if self.has_column(name) {
            return Err(CytoError::InvalidParameter(format!(
                "Column '{}' already exists",
                name
            )));
        }
        let keys = self.column(key_column)?;
        let joined: Vec<Variable> = keys
            .iter()
            .map(|k| {
                k.label()
                    .and_then(|k| values.get(&k).copied())
                    .map(Variable::Continuous)
                    .unwrap_or(Variable::Missing)
            })
            .collect();

        let mut out = self.clone();
        for (sid, value) in self.sample_ids.iter().zip(joined) {
            if let Some(row) = out.data.get_mut(sid) {
                row.insert(name.to_string(), value);
            }
        }
        out.column_names.push(name.to_string());
        out.column_types.insert(name.to_string(), VariableType::Continuous);
        Ok(out)
    }

    /// Check if a sample exists.
    pub fn has_sample(&self, sample_id: &str) -> bool {
        self.data.contains_key(sample_id)
    }

    /// Check if a column exists.
    pub fn has_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

fn infer_column(raw: &[String]) -> Vec<Variable> {
    let numeric = raw.iter().all(|v| is_na(v) || v.parse::<f64>().is_ok());
    raw.iter()
        .map(|v| {
            if is_na(v) {
                Variable::Missing
            } else if numeric {
                v.parse::<f64>().map(Variable::Continuous).unwrap_or(Variable::Missing)
            } else {
                Variable::Categorical(v.clone())
            }
        })
        .collect()
}
