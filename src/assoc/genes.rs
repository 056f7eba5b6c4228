//! Gene positions defining the cis window of each protein.

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Closed genomic interval of the gene encoding one protein.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenePosition {
    /// Phenotype (protein) name, e.g. `CD16`.
    pub protein: String,
    /// Gene symbol, e.g. `FCGR3A`.
    pub gene: String,
    pub chr: String,
    pub start: u64,
    pub end: u64,
}

impl GenePosition {
    pub fn new(protein: &str, gene: &str, chr: &str, start: u64, end: u64) -> Self {
        Self {
            protein: protein.to_string(),
            gene: gene.to_string(),
            chr: chr.to_string(),
            start,
            end,
        }
    }

    /// Distance in base pairs from `pos` to the interval; 0 inside it.
    pub fn distance(&self, pos: u64) -> u64 {
        if pos < self.start {
            self.start - pos
        } else if pos > self.end {
            pos - self.end
        } else {
            0
        }
    }

    /// Whether a variant on `chr` at `pos` lies within `window` of the gene.
    pub fn in_window(&self, chr: &str, pos: u64, window: u64) -> bool {
        same_chromosome(&self.chr, chr) && self.distance(pos) <= window
    }
}

/// Chromosome names compare equal with or without a `chr` prefix.
pub fn same_chromosome(a: &str, b: &str) -> bool {
    let strip = |c: &str| c.strip_prefix("chr").unwrap_or(c).to_string();
    strip(a) == strip(b)
}

/// Position table for the measured proteins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenePositions(Vec<GenePosition>);

impl Default for GenePositions {
    /// CD14, CD16 (FCGR3A) and CD206 (MRC1) on GRCh38.
    fn default() -> Self {
        Self(vec![
            GenePosition::new("CD14", "CD14", "5", 140_631_728, 140_633_701),
            GenePosition::new("CD16", "FCGR3A", "1", 161_541_759, 161_550_737),
            GenePosition::new("CD206", "MRC1", "10", 17_809_344, 17_911_170),
        ])
    }
}

impl GenePositions {
    pub fn new(positions: Vec<GenePosition>) -> Result<Self> {
        let table = Self(positions);
        table.validate()?;
        Ok(table)
    }

    /// Position of the gene for a protein.
    pub fn get(&self, protein: &str) -> Option<&GenePosition> {
        self.0.iter().find(|g| g.protein == protein)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GenePosition> {
        self.0.iter()
    }

    /// Intervals must be ordered and proteins unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for g in &self.0 {
            if g.start > g.end {
                return Err(CytoError::InvalidParameter(format!(
                    "gene {} has start {} after end {}",
                    g.gene, g.start, g.end
                )));
            }
            if !seen.insert(g.protein.as_str()) {
                return Err(CytoError::DuplicateKey(format!("gene position for '{}'", g.protein)));
            }
        }
        Ok(())
    }
}
