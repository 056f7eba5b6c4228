//! Fixed-effect formula parsing.

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};

/// A term on the right-hand side of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Main effect of a column.
    Main(String),
    /// Interaction between two columns.
    Interaction(String, String),
}

impl Term {
    /// Column names involved in this term.
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Term::Main(v) => vec![v.as_str()],
            Term::Interaction(v1, v2) => vec![v1.as_str(), v2.as_str()],
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::Main(v) => write!(f, "{}", v),
            Term::Interaction(v1, v2) => write!(f, "{}:{}", v1, v2),
        }
    }
}

/// A parsed fixed-effect formula.
///
/// R-style syntax:
/// - `~ 1` - intercept only
/// - `~ flow_date` - intercept + one coefficient per non-reference date
/// - `~ dosage + purity`
/// - `~ dosage * purity` - both main effects and their interaction
/// - `~ 0 + line_id` - no intercept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    /// Whether to include an intercept.
    pub intercept: bool,
    /// Terms in the formula (excluding intercept).
    pub terms: Vec<Term>,
}

impl Formula {
    /// Intercept-only formula.
    pub fn intercept_only() -> Self {
        Self {
            intercept: true,
            terms: Vec::new(),
        }
    }

    /// Parse a formula string.
    ///
    /// ```
    /// use cytovar::data::Formula;
    /// let f = Formula::parse("~ flow_date + purity").unwrap();
    /// assert!(f.intercept);
    /// assert_eq!(f.terms.len(), 2);
    /// ```
    pub fn parse(formula: &str) -> Result<Self> {
        let rhs = formula
            .trim()
            .strip_prefix('~')
            .ok_or_else(|| CytoError::FormulaParse("Formula must start with '~'".to_string()))?
            .trim();
        if rhs.is_empty() {
            return Err(CytoError::FormulaParse(
                "Formula right-hand side is empty".to_string(),
            ));
        }

        let mut intercept = true;
        let mut terms: Vec<Term> = Vec::new();

        for piece in rhs.split('+').map(str::trim) {
            match piece {
                "" | "1" => {}
                "0" | "-1" => intercept = false,
                _ if piece.contains('*') => {
                    let (a, b) = split_pair(piece, '*')?;
                    for main in [Term::Main(a.clone()), Term::Main(b.clone())] {
                        if !terms.contains(&main) {
                            terms.push(main);
                        }
                    }
                    terms.push(Term::Interaction(a, b));
                }
                _ if piece.contains(':') => {
                    let (a, b) = split_pair(piece, ':')?;
                    terms.push(Term::Interaction(a, b));
                }
                _ => {
                    if piece.contains(char::is_whitespace) || piece.contains('(') {
                        return Err(CytoError::FormulaParse(format!(
                            "Invalid term '{}'",
                            piece
                        )));
                    }
                    let term = Term::Main(piece.to_string());
                    if !terms.contains(&term) {
                        terms.push(term);
                    }
                }
            }
        }

        if terms.is_empty() && !intercept {
            return Err(CytoError::FormulaParse(
                "Formula must have at least one term".to_string(),
            ));
        }

        Ok(Self { intercept, terms })
    }

    /// All column names used in the formula, sorted and unique.
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = self.terms.iter().flat_map(|t| t.variables()).collect();
        vars.sort();
        vars.dedup();
        vars
    }

    /// Check if a column is used in the formula.
    pub fn uses_variable(&self, name: &str) -> bool {
        self.terms.iter().any(|t| t.variables().contains(&name))
    }
}

fn split_pair(piece: &str, sep: char) -> Result<(String, String)> {
    let parts: Vec<&str> = piece.split(sep).map(str::trim).collect();
    match parts.as_slice() {
        [a, b] if !a.is_empty() && !b.is_empty() => Ok((a.to_string(), b.to_string())),
        _ => Err(CytoError::FormulaParse(format!(
            "Invalid interaction term: {}",
            piece
        ))),
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        parts.push(if self.intercept { "1" } else { "0" }.to_string());
        parts.extend(self.terms.iter().map(|t| t.to_string()));
        write!(f, "~ {}", parts.join(" + "))
    }
}
