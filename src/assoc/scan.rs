//! Cis-association scan: per-donor phenotypes regressed on nearby variant dosages.

use crate::assoc::genes::GenePositions;
use crate::assoc::genotype::GenotypeBundle;
use crate::data::{PhenotypeMatrix, WideTable};
use crate::error::{CytoError, Result};
use chrono::NaiveDate;
use log::{debug, info, warn};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Flow dates are stored as ISO dates.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Scan parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Maximum distance in base pairs between a variant and the gene interval.
    pub window: u64,
    /// Minimum donors with a called dosage for a pair to be tested.
    pub min_samples: usize,
    /// Report only pairs with a p-value at or below this threshold.
    pub p_value_threshold: Option<f64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: 200_000,
            min_samples: 3,
            p_value_threshold: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_samples < 3 {
            return Err(CytoError::InvalidParameter(format!(
                "min_samples must be at least 3, got {}",
                self.min_samples
            )));
        }
        if let Some(p) = self.p_value_threshold {
            if !(0.0..=1.0).contains(&p) {
                return Err(CytoError::InvalidParameter(format!(
                    "p_value_threshold must be in [0, 1], got {}",
                    p
                )));
            }
        }
        Ok(())
    }
}

/// Which measurement represents a donor measured several times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonorSelection {
    /// First complete row in table order.
    #[default]
    FirstObserved,
    /// Earliest flow date, ties broken by line id.
    EarliestDate,
}

/// Collapse repeated measurements to one column per donor, keyed by `genotype_id`.
///
/// Only rows with every requested protein present are candidates; donors
/// without such a row are dropped. Donors keep their first-seen table order.
pub fn select_one_per_donor(
    wide: &WideTable,
    proteins: &[String],
    selection: DonorSelection,
) -> Result<PhenotypeMatrix> {
    let cols = proteins
        .iter()
        .map(|p| wide.protein_index(p))
        .collect::<Result<Vec<_>>>()?;
    let complete = |row: usize| cols.iter().all(|&c| !wide.values()[(row, c)].is_nan());

    let mut donors: Vec<String> = Vec::new();
    let mut chosen: HashMap<String, usize> = HashMap::new();
    let mut dates: HashMap<usize, NaiveDate> = HashMap::new();
    for (row, sample) in wide.samples().iter().enumerate() {
        let donor = &sample.genotype_id;
        if !donors.contains(donor) {
            donors.push(donor.clone());
        }
        if !complete(row) {
            continue;
        }
        if selection == DonorSelection::EarliestDate {
            dates.insert(row, NaiveDate::parse_from_str(&sample.flow_date, DATE_FORMAT)?);
        }
        match chosen.get(donor).copied() {
            None => {
                chosen.insert(donor.clone(), row);
            }
            Some(current) if selection == DonorSelection::EarliestDate => {
                let key = |r: usize| (dates[&r], wide.samples()[r].line_id.clone());
                if key(row) < key(current) {
                    chosen.insert(donor.clone(), row);
                }
            }
            Some(_) => {}
        }
    }

    let (kept, dropped): (Vec<String>, Vec<String>) =
        donors.into_iter().partition(|d| chosen.contains_key(d));
    if !dropped.is_empty() {
        warn!(
            "{} donor(s) have no complete measurement and are skipped: {:?}",
            dropped.len(),
            dropped
        );
    }
    if kept.is_empty() {
        return Err(CytoError::EmptyData(
            "no donor has a complete measurement".to_string(),
        ));
    }

    let rows: Vec<usize> = kept.iter().map(|d| chosen[d]).collect();
    let data = DMatrix::from_fn(cols.len(), rows.len(), |i, j| wide.values()[(rows[j], cols[i])]);
    info!(
        "Selected one of {} measurement(s) for each of {} donor(s)",
        wide.n_samples(),
        kept.len()
    );
    PhenotypeMatrix::new(data, proteins.to_vec(), kept)
}

/// Reorder genotype columns to the phenotype donor order.
///
/// Fails when the two donor sets differ; see [`intersect_donors`].
pub fn align_donors(phenotypes: &PhenotypeMatrix, genotypes: &GenotypeBundle) -> Result<GenotypeBundle> {
    let pheno: BTreeSet<&String> = phenotypes.sample_ids.iter().collect();
    let geno: BTreeSet<&String> = genotypes.donor_ids().iter().collect();
    if pheno != geno {
        return Err(CytoError::DonorMismatch {
            missing_genotype: pheno.difference(&geno).map(|s| s.to_string()).collect(),
            missing_phenotype: geno.difference(&pheno).map(|s| s.to_string()).collect(),
        });
    }
    genotypes.select_donors(&phenotypes.sample_ids)
}

/// Restrict both inputs to the donors they share, in phenotype order.
pub fn intersect_donors(
    phenotypes: &PhenotypeMatrix,
    genotypes: &GenotypeBundle,
) -> Result<(PhenotypeMatrix, GenotypeBundle)> {
    let geno: BTreeSet<&String> = genotypes.donor_ids().iter().collect();
    let shared: Vec<String> = phenotypes
        .sample_ids
        .iter()
        .filter(|d| geno.contains(d))
        .cloned()
        .collect();
    if shared.is_empty() {
        return Err(CytoError::EmptyData(
            "phenotypes and genotypes share no donor".to_string(),
        ));
    }
    info!(
        "{} donor(s) shared between {} phenotyped and {} genotyped",
        shared.len(),
        phenotypes.n_samples(),
        genotypes.n_donors()
    );
    Ok((phenotypes.select_samples(&shared)?, genotypes.select_donors(&shared)?))
}

/// One tested variant / phenotype pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRow {
    pub variant_id: String,
    pub target_id: String,
    pub chr: String,
    pub pos: u64,
    /// Distance to the gene interval (0 inside).
    pub distance: u64,
    pub n_samples: usize,
    /// Phenotype change per allele copy.
    pub beta: f64,
    pub std_error: f64,
    pub t_statistic: f64,
    pub p_value: f64,
}

/// All rows of one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssociationResults {
    rows: Vec<AssociationRow>,
}

impl AssociationResults {
    pub fn new(rows: Vec<AssociationRow>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[AssociationRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Targets with at least one row, in first-seen order.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        for r in &self.rows {
            if !targets.contains(&r.target_id.as_str()) {
                targets.push(&r.target_id);
            }
        }
        targets
    }

    /// Rows of one target, in scan order.
    pub fn for_target(&self, target: &str) -> Vec<&AssociationRow> {
        self.rows.iter().filter(|r| r.target_id == target).collect()
    }

    /// Rows of one target by ascending p-value, then position, then variant id.
    pub fn ranked(&self, target: &str) -> Vec<&AssociationRow> {
        let mut rows = self.for_target(target);
        rows.sort_by(|a, b| compare_rows(a, b));
        rows
    }

    /// Every row tied at the smallest p-value of a target.
    pub fn lead_variants(&self, target: &str) -> Vec<&AssociationRow> {
        let ranked = self.ranked(target);
        match ranked.first() {
            Some(best) => {
                let p = best.p_value;
                ranked.into_iter().take_while(|r| r.p_value == p).collect()
            }
            None => Vec::new(),
        }
    }

    /// Write rows as TSV.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        for row in &self.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn compare_rows(a: &AssociationRow, b: &AssociationRow) -> Ordering {
    a.p_value
        .total_cmp(&b.p_value)
        .then(a.pos.cmp(&b.pos))
        .then_with(|| a.variant_id.cmp(&b.variant_id))
}

/// Test every phenotype against the variants within its gene's cis window.
///
/// Genotype columns must cover exactly the phenotype donors (any order).
/// Phenotypes without a gene position are skipped with a warning.
pub fn scan_cis(
    phenotypes: &PhenotypeMatrix,
    genotypes: &GenotypeBundle,
    genes: &GenePositions,
    config: &ScanConfig,
) -> Result<AssociationResults> {
    config.validate()?;
    genes.validate()?;
    let genotypes = align_donors(phenotypes, genotypes)?;

    let mut rows = Vec::new();
    for (f, target) in phenotypes.feature_ids.iter().enumerate() {
        let Some(gene) = genes.get(target) else {
            warn!("No gene position for '{}'; not scanned", target);
            continue;
        };
        let y = phenotypes.row(f);
        let candidates: Vec<usize> = genotypes
            .variants()
            .iter()
            .enumerate()
            .filter(|(_, v)| gene.in_window(&v.chr, v.pos, config.window))
            .map(|(i, _)| i)
            .collect();

        let tested: Vec<AssociationRow> = candidates
            .into_par_iter()
            .filter_map(|i| {
                let variant = &genotypes.variants()[i];
                let dosage = genotypes.dosage_row(i);
                let (x, yy): (Vec<f64>, Vec<f64>) = dosage
                    .iter()
                    .zip(&y)
                    .filter(|(d, _)| !d.is_nan())
                    .map(|(d, v)| (*d, *v))
                    .unzip();
                if x.len() < config.min_samples {
                    debug!("{} / {}: only {} called donor(s)", variant.id, target, x.len());
                    return None;
                }
                let Some(fit) = simple_regression(&x, &yy) else {
                    debug!("{} / {}: dosage is constant", variant.id, target);
                    return None;
                };
                Some(AssociationRow {
                    variant_id: variant.id.clone(),
                    target_id: target.clone(),
                    chr: variant.chr.clone(),
                    pos: variant.pos,
                    distance: gene.distance(variant.pos),
                    n_samples: x.len(),
                    beta: fit.beta,
                    std_error: fit.std_error,
                    t_statistic: fit.t_statistic,
                    p_value: fit.p_value,
                })
            })
            .collect();

        info!(
            "{}: tested {} variant(s) within {} bp of {}",
            target,
            tested.len(),
            config.window,
            gene.gene
        );
        rows.extend(tested);
    }

    if let Some(threshold) = config.p_value_threshold {
        rows.retain(|r| r.p_value <= threshold);
    }
    Ok(AssociationResults::new(rows))
}

struct SimpleFit {
    beta: f64,
    std_error: f64,
    t_statistic: f64,
    p_value: f64,
}

/// OLS of `y` on `x` with intercept; `None` when `x` is constant.
fn simple_regression(x: &[f64], y: &[f64]) -> Option<SimpleFit> {
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - x_mean).powi(2)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - x_mean) * (b - y_mean)).sum();
    let beta = sxy / sxx;
    let alpha = y_mean - beta * x_mean;
    let rss: f64 = x
        .iter()
        .zip(y)
        .map(|(a, b)| (b - alpha - beta * a).powi(2))
        .sum();
    let df = n - 2.0;
    let std_error = (rss / df / sxx).sqrt();

    let (t_statistic, p_value) = if std_error > 0.0 {
        let t = beta / std_error;
        let p = StudentsT::new(0.0, 1.0, df)
            .map(|dist| 2.0 * dist.sf(t.abs()))
            .unwrap_or(f64::NAN);
        (t, p.min(1.0))
    } else if beta == 0.0 {
        (0.0, 1.0)
    } else {
        (beta.signum() * f64::INFINITY, 0.0)
    };

    Some(SimpleFit {
        beta,
        std_error,
        t_statistic,
        p_value,
    })
}
