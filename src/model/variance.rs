//! Variance decomposition: each grouping factor's share of total variance.

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Reserved name of the unexplained (residual) component.
pub const RESIDUAL: &str = "residual";

/// Convert variances to fractions of their sum.
///
/// Every variance must be finite and non-negative; an all-zero input has no
/// defined fractions and fails.
pub fn decompose(variances: &BTreeMap<String, f64>) -> Result<BTreeMap<String, f64>> {
    for (name, &v) in variances {
        if !v.is_finite() || v < 0.0 {
            return Err(CytoError::InvalidVariance {
                name: name.clone(),
                value: v,
            });
        }
    }
    let total: f64 = variances.values().sum();
    if total <= 0.0 {
        return Err(CytoError::ZeroVariance);
    }
    Ok(variances
        .iter()
        .map(|(name, v)| (name.clone(), v / total))
        .collect())
}

/// Estimated variances of a fitted model: one per grouping factor plus the residual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    groups: Vec<(String, f64)>,
    residual: f64,
}

impl VarianceComponents {
    /// Fails if a grouping factor uses the reserved residual name or repeats.
    pub fn new(groups: Vec<(String, f64)>, residual: f64) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for (name, _) in &groups {
            if name == RESIDUAL {
                return Err(CytoError::ReservedName(name.clone()));
            }
            if !seen.insert(name.as_str()) {
                return Err(CytoError::InvalidParameter(format!(
                    "grouping factor '{}' listed twice",
                    name
                )));
            }
        }
        Ok(Self { groups, residual })
    }

    /// Per-group variances, in model order.
    pub fn groups(&self) -> &[(String, f64)] {
        &self.groups
    }

    /// Residual variance.
    pub fn residual(&self) -> f64 {
        self.residual
    }

    /// Sum of all components.
    pub fn total(&self) -> f64 {
        self.groups.iter().map(|(_, v)| v).sum::<f64>() + self.residual
    }

    /// All components keyed by name, residual under [`RESIDUAL`].
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map: BTreeMap<String, f64> = self.groups.iter().cloned().collect();
        map.insert(RESIDUAL.to_string(), self.residual);
        map
    }

    /// Fractions of total variance.
    pub fn fractions(&self) -> Result<BTreeMap<String, f64>> {
        decompose(&self.to_map())
    }
}

/// Variance fractions for several phenotypes, one row each.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VarianceSummary {
    rows: Vec<(String, BTreeMap<String, f64>)>,
}

impl VarianceSummary {
    /// Create an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row of fractions for one phenotype.
    pub fn push(&mut self, feature_id: &str, fractions: BTreeMap<String, f64>) {
        self.rows.push((feature_id.to_string(), fractions));
    }

    /// Number of phenotypes.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of component names; grouping factors sorted, residual last.
    pub fn columns(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.rows.iter().flat_map(|(_, m)| m.keys()).collect();
        let mut columns: Vec<String> = names
            .into_iter()
            .filter(|n| n.as_str() != RESIDUAL)
            .cloned()
            .collect();
        if self.rows.iter().any(|(_, m)| m.contains_key(RESIDUAL)) {
            columns.push(RESIDUAL.to_string());
        }
        columns
    }

    /// Fraction for one phenotype and component.
    pub fn get(&self, feature_id: &str, component: &str) -> Option<f64> {
        self.rows
            .iter()
            .find(|(f, _)| f == feature_id)
            .and_then(|(_, m)| m.get(component).copied())
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, f64>)> {
        self.rows.iter().map(|(f, m)| (f.as_str(), m))
    }

    /// Write the summary as TSV; absent components are written as NA.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        let columns = self.columns();
        writeln!(writer, "feature_id\t{}", columns.join("\t"))?;
        for (feature, fractions) in &self.rows {
            let cells: Vec<String> = columns
                .iter()
                .map(|c| {
                    fractions
                        .get(c)
                        .map(|v| format!("{:.6}", v))
                        .unwrap_or_else(|| "NA".to_string())
                })
                .collect();
            writeln!(writer, "{}\t{}", feature, cells.join("\t"))?;
        }
        writer.flush()?;
        Ok(())
    }
}
