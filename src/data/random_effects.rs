//! Random-effect (grouping factor) specifications.
//!
//! lme4-style syntax:
//! - `(1 | line_id)` - random intercept per cell line
//! - `~ 1 + (1 | flow_date) + (1 | line_id)` - crossed random intercepts

use crate::data::{Formula, Metadata};
use crate::error::{CytoError, Result};
use crate::model::variance::RESIDUAL;
use nalgebra::DMatrix;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single random-effect term `(terms | grouping)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomEffect {
    /// Terms left of the bar; `"1"` is the intercept.
    pub terms: Vec<String>,
    /// Grouping column.
    pub grouping: String,
}

impl RandomEffect {
    /// Random intercept for a grouping column.
    pub fn intercept(grouping: &str) -> Self {
        Self {
            terms: vec!["1".to_string()],
            grouping: grouping.to_string(),
        }
    }

    /// Parse `(1 | group)`, `(1 + x | group)`, `(0 + x | group)` or `(x | group)`.
    pub fn parse(spec: &str) -> Result<Self> {
        let inner = spec
            .trim()
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| {
                CytoError::FormulaParse(format!(
                    "Random effect must be wrapped in parentheses: {}",
                    spec
                ))
            })?;

        let (lhs, grouping) = match inner.split('|').collect::<Vec<_>>().as_slice() {
            [lhs, grouping] => (lhs.trim(), grouping.trim()),
            _ => {
                return Err(CytoError::FormulaParse(format!(
                    "Random effect must have exactly one '|': {}",
                    spec
                )))
            }
        };
        if grouping.is_empty() {
            return Err(CytoError::FormulaParse(
                "Random effect grouping variable cannot be empty".to_string(),
            ));
        }

        let mut has_intercept = true;
        let mut terms = Vec::new();
        for term in lhs.split('+').map(str::trim) {
            match term {
                "" | "1" => {}
                "0" | "-1" => has_intercept = false,
                _ => terms.push(term.to_string()),
            }
        }
        if has_intercept {
            terms.insert(0, "1".to_string());
        }
        if terms.is_empty() {
            return Err(CytoError::FormulaParse(
                "Random effect must have at least one term".to_string(),
            ));
        }

        Ok(Self {
            terms,
            grouping: grouping.to_string(),
        })
    }

    /// Check if this is a random intercept only.
    pub fn is_intercept_only(&self) -> bool {
        self.terms.len() == 1 && self.terms[0] == "1"
    }
}

impl std::fmt::Display for RandomEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} | {})", self.terms.join(" + "), self.grouping)
    }
}

/// A formula with fixed effects and zero or more random effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedFormula {
    /// Fixed-effect part.
    pub fixed: Formula,
    /// Random-effect terms, in formula order.
    pub random: Vec<RandomEffect>,
}

impl MixedFormula {
    /// Parse a mixed model formula.
    ///
    /// ```
    /// use cytovar::data::MixedFormula;
    /// let f = MixedFormula::parse("~ dosage + (1 | flow_date) + (1 | line_id)").unwrap();
    /// assert_eq!(f.grouping_variables(), vec!["flow_date", "line_id"]);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let rhs = formula
            .trim()
            .strip_prefix('~')
            .ok_or_else(|| CytoError::FormulaParse("Formula must start with '~'".to_string()))?;

        let re = Regex::new(r"\([^()]*\|[^()]*\)")
            .map_err(|e| CytoError::FormulaParse(e.to_string()))?;
        let random: Vec<RandomEffect> = re
            .find_iter(rhs)
            .map(|m| RandomEffect::parse(m.as_str()))
            .collect::<Result<_>>()?;

        let fixed_rhs = re.replace_all(rhs, "");
        let fixed_rhs = fixed_rhs
            .split('+')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" + ");
        let fixed = if fixed_rhs.is_empty() {
            Formula::intercept_only()
        } else {
            Formula::parse(&format!("~ {}", fixed_rhs))?
        };

        let mut seen = std::collections::BTreeSet::new();
        for r in &random {
            if !seen.insert(r.grouping.as_str()) {
                return Err(CytoError::FormulaParse(format!(
                    "Grouping factor '{}' appears more than once",
                    r.grouping
                )));
            }
        }

        Ok(Self { fixed, random })
    }

    /// Build from parts.
    pub fn new(fixed: Formula, groupings: &[&str]) -> Self {
        Self {
            fixed,
            random: groupings.iter().map(|g| RandomEffect::intercept(g)).collect(),
        }
    }

    /// Check if the formula has any random effects.
    pub fn has_random_effects(&self) -> bool {
        !self.random.is_empty()
    }

    /// Grouping columns, in formula order.
    pub fn grouping_variables(&self) -> Vec<&str> {
        self.random.iter().map(|r| r.grouping.as_str()).collect()
    }
}

impl std::fmt::Display for MixedFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fixed)?;
        for r in &self.random {
            write!(f, " + {}", r)?;
        }
        Ok(())
    }
}

/// Indicator matrix (Z) for one random intercept.
#[derive(Debug, Clone)]
pub struct RandomDesignMatrix {
    /// Grouping column name.
    pub grouping: String,
    /// n_samples × n_groups indicator matrix.
    pub matrix: DMatrix<f64>,
    /// Group index of each sample.
    pub group_indices: Vec<usize>,
    /// Group labels in first-seen order.
    pub group_ids: Vec<String>,
}

impl RandomDesignMatrix {
    /// Build the indicator matrix for a random intercept.
    ///
    /// Fails on random slopes, on a grouping column named like the reserved
    /// residual component, on missing grouping values, and on a grouping
    /// column with a single level.
    pub fn from_random_effect(metadata: &Metadata, random_effect: &RandomEffect) -> Result<Self> {
        if !random_effect.is_intercept_only() {
            return Err(CytoError::NotImplemented(format!(
                "Random slopes are not supported: {}",
                random_effect
            )));
        }
        let grouping = &random_effect.grouping;
        if grouping == RESIDUAL {
            return Err(CytoError::ReservedName(grouping.clone()));
        }

        let column = metadata.column(grouping)?;
        let mut group_map: HashMap<String, usize> = HashMap::new();
        let mut group_ids: Vec<String> = Vec::new();
        let mut group_indices = Vec::with_capacity(column.len());

        for (row, value) in column.iter().enumerate() {
            let label = value.label().ok_or_else(|| {
                CytoError::MissingValue(format!(
                    "grouping column '{}' is missing for sample '{}'",
                    grouping,
                    metadata.sample_ids()[row]
                ))
            })?;
            let idx = *group_map.entry(label.clone()).or_insert_with(|| {
                group_ids.push(label);
                group_ids.len() - 1
            });
            group_indices.push(idx);
        }

        if group_ids.len() < 2 {
            return Err(CytoError::DegenerateGrouping {
                column: grouping.clone(),
                levels: group_ids.len(),
            });
        }

        let mut matrix = DMatrix::zeros(group_indices.len(), group_ids.len());
        for (row, &g) in group_indices.iter().enumerate() {
            matrix[(row, g)] = 1.0;
        }

        Ok(Self {
            grouping: grouping.clone(),
            matrix,
            group_indices,
            group_ids,
        })
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of groups.
    pub fn n_groups(&self) -> usize {
        self.group_ids.len()
    }

    /// Get the Z matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Observations per group.
    pub fn observations_per_group(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_groups()];
        for &idx in &self.group_indices {
            counts[idx] += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;

    fn metadata(lines: &[&str]) -> Metadata {
        let ids: Vec<String> = (0..lines.len()).map(|i| format!("s{}", i)).collect();
        Metadata::from_columns(
            ids,
            vec![(
                "line_id".into(),
                lines.iter().map(|l| Variable::Categorical(l.to_string())).collect(),
            )],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_random_intercept() {
        let re = RandomEffect::parse("(1 | line_id)").unwrap();
        assert_eq!(re.grouping, "line_id");
        assert!(re.is_intercept_only());
        assert_eq!(re, RandomEffect::intercept("line_id"));
    }

    #[test]
    fn test_parse_random_slope() {
        let re = RandomEffect::parse("(1 + dosage | line_id)").unwrap();
        assert_eq!(re.terms, vec!["1", "dosage"]);
        let re = RandomEffect::parse("(0 + dosage | line_id)").unwrap();
        assert_eq!(re.terms, vec!["dosage"]);
    }

    #[test]
    fn test_invalid_random_effect() {
        assert!(RandomEffect::parse("1 | line_id").is_err());
        assert!(RandomEffect::parse("(1 line_id)").is_err());
        assert!(RandomEffect::parse("(1 | )").is_err());
    }

    #[test]
    fn test_mixed_formula_crossed() {
        let f = MixedFormula::parse("~ 1 + (1 | flow_date) + (1 | line_id)").unwrap();
        assert_eq!(f.fixed, Formula::intercept_only());
        assert_eq!(f.grouping_variables(), vec!["flow_date", "line_id"]);
    }

    #[test]
    fn test_mixed_formula_fixed_part() {
        let f = MixedFormula::parse("~ dosage + (1 | flow_date)").unwrap();
        assert_eq!(f.fixed.terms.len(), 1);
        assert!(f.fixed.uses_variable("dosage"));
        assert_eq!(MixedFormula::parse(&f.to_string()).unwrap(), f);
    }

    #[test]
    fn test_mixed_formula_without_random() {
        let f = MixedFormula::parse("~ dosage").unwrap();
        assert!(!f.has_random_effects());
    }

    #[test]
    fn test_mixed_formula_repeated_grouping() {
        assert!(MixedFormula::parse("~ 1 + (1 | line_id) + (1 | line_id)").is_err());
    }

    #[test]
    fn test_random_design_matrix() {
        let meta = metadata(&["a", "a", "b", "c", "b"]);
        let z = RandomDesignMatrix::from_random_effect(&meta, &RandomEffect::intercept("line_id"))
            .unwrap();
        assert_eq!(z.n_samples(), 5);
        assert_eq!(z.n_groups(), 3);
        assert_eq!(z.group_indices, vec![0, 0, 1, 2, 1]);
        assert_eq!(z.observations_per_group(), vec![2, 2, 1]);
        for i in 0..5 {
            assert_eq!(z.matrix.row(i).sum(), 1.0);
        }
    }

    #[test]
    fn test_single_level_is_degenerate() {
        let meta = metadata(&["a", "a", "a"]);
        let err = RandomDesignMatrix::from_random_effect(&meta, &RandomEffect::intercept("line_id"))
            .unwrap_err();
        assert!(matches!(err, CytoError::DegenerateGrouping { levels: 1, .. }));
    }

    #[test]
    fn test_reserved_grouping_name() {
        let meta = metadata(&["a", "b"]);
        let err = RandomDesignMatrix::from_random_effect(&meta, &RandomEffect::intercept(RESIDUAL))
            .unwrap_err();
        assert!(matches!(err, CytoError::ReservedName(_)));
    }
}
