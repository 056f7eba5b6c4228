//! Principal-component projection of the wide table for manual outlier review.
//!
//! Nothing here removes samples: callers inspect the projection and pass the
//! ids they decide to drop to [`apply_exclusion`](super::apply_exclusion).
//! Skipping that manual step on automated re-runs keeps every sample and
//! therefore changes downstream results.

use crate::data::WideTable;
use crate::error::{CytoError, Result};
use log::info;
use nalgebra::{DMatrix, SymmetricEigen};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One sample's position in PC space.
#[derive(Debug, Clone, Serialize)]
pub struct OutlierCandidate {
    pub sample_id: String,
    /// Scores on every component.
    pub scores: Vec<f64>,
    /// Euclidean distance from the origin over the first two components.
    pub distance: f64,
}

/// PCA projection of selected protein columns.
#[derive(Debug, Clone, Serialize)]
pub struct OutlierCandidates {
    /// Input columns, in loading order.
    pub columns: Vec<String>,
    /// Samples ranked by descending `distance` (ties by sample id).
    pub ranked: Vec<OutlierCandidate>,
    /// Fraction of total variance per component.
    pub explained_variance: Vec<f64>,
    /// columns × components
    #[serde(skip)]
    pub loadings: DMatrix<f64>,
}

impl OutlierCandidates {
    /// Sample ids, most extreme first.
    pub fn sample_ids(&self) -> Vec<&str> {
        self.ranked.iter().map(|c| c.sample_id.as_str()).collect()
    }

    /// The `n` most extreme samples.
    pub fn top(&self, n: usize) -> &[OutlierCandidate] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    /// Write scores as TSV: sample_id, distance, PC1..PCk.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        let n_pc = self.explained_variance.len();
        let pcs: Vec<String> = (1..=n_pc).map(|k| format!("PC{}", k)).collect();
        writeln!(writer, "sample_id\tdistance\t{}", pcs.join("\t"))?;
        for c in &self.ranked {
            let scores: Vec<String> = c.scores.iter().map(|s| format!("{:.6}", s)).collect();
            writeln!(writer, "{}\t{:.6}\t{}", c.sample_id, c.distance, scores.join("\t"))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Project the selected columns onto their principal components.
///
/// Columns are standardised to zero mean and unit variance first. Each
/// loading vector is oriented so its largest-magnitude entry is positive.
pub fn detect_candidates(wide: &WideTable, columns: &[String]) -> Result<OutlierCandidates> {
    let n = wide.n_samples();
    let p = columns.len();
    if n < 2 {
        return Err(CytoError::EmptyData(
            "PCA needs at least two samples".to_string(),
        ));
    }
    if p == 0 {
        return Err(CytoError::InvalidParameter(
            "PCA needs at least one column".to_string(),
        ));
    }

    let mut z = DMatrix::zeros(n, p);
    for (j, name) in columns.iter().enumerate() {
        let col = wide.column(name)?;
        if let Some(i) = col.iter().position(|v| v.is_nan()) {
            return Err(CytoError::MissingValue(format!(
                "'{}' is missing for sample '{}'",
                name,
                wide.samples()[i].sample_id
            )));
        }
        let mean = col.iter().sum::<f64>() / n as f64;
        let var = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let sd = var.sqrt();
        if sd <= f64::EPSILON * mean.abs().max(1.0) {
            return Err(CytoError::Numerical(format!(
                "column '{}' has zero variance and cannot be standardised",
                name
            )));
        }
        for (i, v) in col.iter().enumerate() {
            z[(i, j)] = (v - mean) / sd;
        }
    }

    let cov = (z.transpose() * &z) / (n - 1) as f64;
    let eigen = SymmetricEigen::new(cov);

    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let mut loadings = DMatrix::zeros(p, p);
    for (k, &src) in order.iter().enumerate() {
        let mut v = eigen.eigenvectors.column(src).clone_owned();
        let pivot = v.iter().cloned().fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            v.neg_mut();
        }
        loadings.set_column(k, &v);
    }

    let eigenvalues: Vec<f64> = order.iter().map(|&k| eigen.eigenvalues[k].max(0.0)).collect();
    let total: f64 = eigenvalues.iter().sum();
    let explained_variance = eigenvalues.iter().map(|l| l / total).collect();

    let scores = &z * &loadings;
    let n_dist = p.min(2);
    let mut ranked: Vec<OutlierCandidate> = wide
        .samples()
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let row: Vec<f64> = scores.row(i).iter().cloned().collect();
            let distance = row[..n_dist].iter().map(|x| x * x).sum::<f64>().sqrt();
            OutlierCandidate {
                sample_id: s.sample_id.clone(),
                scores: row,
                distance,
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.distance
            .total_cmp(&a.distance)
            .then_with(|| a.sample_id.cmp(&b.sample_id))
    });

    info!("PCA over {} samples x {} columns", n, p);
    Ok(OutlierCandidates {
        columns: columns.to_vec(),
        ranked,
        explained_variance,
        loadings,
    })
}
