//! Genotype bundle: variant coordinates plus a variant × donor dosage matrix.

use crate::data::Metadata;
use crate::error::{CytoError, Result};
use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// Position of one genetic variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    #[serde(rename = "snpid")]
    pub id: String,
    pub chr: String,
    pub pos: u64,
}

/// Variants and their dosages (0, 1 or 2 copies; NaN when missing).
///
/// Dosage rows follow variant order; columns are donor (genotype) ids.
#[derive(Debug, Clone)]
pub struct GenotypeBundle {
    variants: Vec<Variant>,
    donor_ids: Vec<String>,
    dosages: DMatrix<f64>,
}

impl GenotypeBundle {
    /// Assemble a bundle, validating shapes, id uniqueness and dosage range.
    pub fn new(variants: Vec<Variant>, donor_ids: Vec<String>, dosages: DMatrix<f64>) -> Result<Self> {
        if dosages.nrows() != variants.len() {
            return Err(CytoError::DimensionMismatch {
                expected: variants.len(),
                actual: dosages.nrows(),
            });
        }
        if dosages.ncols() != donor_ids.len() {
            return Err(CytoError::DimensionMismatch {
                expected: donor_ids.len(),
                actual: dosages.ncols(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(v) = variants.iter().find(|v| !seen.insert(v.id.as_str())) {
            return Err(CytoError::DuplicateKey(format!("variant '{}'", v.id)));
        }
        let mut seen = HashSet::new();
        if let Some(d) = donor_ids.iter().find(|d| !seen.insert(d.as_str())) {
            return Err(CytoError::DuplicateKey(format!("donor '{}'", d)));
        }
        for (k, &value) in dosages.iter().enumerate() {
            if !value.is_nan() && !(0.0..=2.0).contains(&value) {
                let (i, j) = (k % dosages.nrows(), k / dosages.nrows());
                return Err(CytoError::InvalidValue {
                    value: value.to_string(),
                    line: i + 2,
                    column: donor_ids[j].clone(),
                });
            }
        }
        Ok(Self {
            variants,
            donor_ids,
            dosages,
        })
    }

    /// Load a bundle from a `snpid, chr, pos` table and a dosage table whose
    /// first column is `snpid` followed by one column per donor.
    ///
    /// The dosage rows must list the same variants in the same order.
    pub fn from_tsv<P: AsRef<Path>, Q: AsRef<Path>>(snpspos: P, dosage: Q) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(snpspos)?;
        let variants = reader
            .deserialize()
            .collect::<std::result::Result<Vec<Variant>, _>>()?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(dosage)?;
        let header: Vec<String> = reader.headers()?.iter().map(|s| s.to_string()).collect();
        if header.first().map(|s| s.as_str()) != Some("snpid") {
            return Err(CytoError::MissingColumn("snpid".to_string()));
        }
        let donor_ids = header[1..].to_vec();

        let mut cells = Vec::with_capacity(variants.len() * donor_ids.len());
        let mut n_rows = 0;
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let id = record.get(0).unwrap_or("");
            match variants.get(row) {
                Some(v) if v.id == id => {}
                _ => {
                    return Err(CytoError::SampleMismatch(format!(
                        "dosage row {} ('{}') does not match variant position table order",
                        row + 1,
                        id
                    )))
                }
            }
            for (j, raw) in record.iter().skip(1).enumerate() {
                let value = match raw {
                    "" | "NA" | "NaN" => f64::NAN,
                    _ => raw.parse::<f64>().map_err(|_| CytoError::InvalidValue {
                        value: raw.to_string(),
                        line: row + 2,
                        column: donor_ids.get(j).cloned().unwrap_or_default(),
                    })?,
                };
                cells.push(value);
            }
            n_rows += 1;
        }
        if n_rows != variants.len() {
            return Err(CytoError::DimensionMismatch {
                expected: variants.len(),
                actual: n_rows,
            });
        }

        let bundle = Self::new(
            variants,
            donor_ids.clone(),
            DMatrix::from_row_slice(n_rows, donor_ids.len(), &cells),
        )?;
        info!(
            "Loaded {} variant(s) for {} donor(s)",
            bundle.n_variants(),
            bundle.n_donors()
        );
        Ok(bundle)
    }

    /// Variants in table order.
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Donor ids in column order.
    pub fn donor_ids(&self) -> &[String] {
        &self.donor_ids
    }

    /// Number of variants.
    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    /// Number of donors.
    pub fn n_donors(&self) -> usize {
        self.donor_ids.len()
    }

    /// Dosages of one variant, in donor order.
    pub fn dosage_row(&self, variant: usize) -> Vec<f64> {
        self.dosages.row(variant).iter().cloned().collect()
    }

    /// Row index of a variant id.
    pub fn variant_index(&self, id: &str) -> Option<usize> {
        self.variants.iter().position(|v| v.id == id)
    }

    /// Reorder (and subset) the donor columns.
    pub fn select_donors(&self, donor_ids: &[String]) -> Result<Self> {
        let index: HashMap<&str, usize> = self
            .donor_ids
            .iter()
            .enumerate()
            .map(|(j, d)| (d.as_str(), j))
            .collect();
        let cols = donor_ids
            .iter()
            .map(|d| {
                index
                    .get(d.as_str())
                    .copied()
                    .ok_or_else(|| CytoError::UnknownDonor(d.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            variants: self.variants.clone(),
            donor_ids: donor_ids.to_vec(),
            dosages: self.dosages.select_columns(&cols),
        })
    }

    /// Keep only donors whose data may be used (consented / open access).
    pub fn restrict_donors(&self, allowed: &[String]) -> Result<Self> {
        let allowed: BTreeSet<&str> = allowed.iter().map(|s| s.as_str()).collect();
        let keep: Vec<String> = self
            .donor_ids
            .iter()
            .filter(|d| allowed.contains(d.as_str()))
            .cloned()
            .collect();
        if keep.is_empty() {
            return Err(CytoError::EmptyData(
                "no genotyped donor is in the allowed set".to_string(),
            ));
        }
        if keep.len() < self.donor_ids.len() {
            info!(
                "Restricted genotypes to {} of {} donor(s)",
                keep.len(),
                self.donor_ids.len()
            );
        }
        self.select_donors(&keep)
    }
}

/// Dosage of a single lead variant, keyed by donor (genotype) id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadVariant {
    pub dosages: HashMap<String, f64>,
}

#[derive(Deserialize)]
struct LeadRow {
    genotype_id: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    dosage: Option<f64>,
}

impl LeadVariant {
    /// Read a `genotype_id, dosage` table; missing dosages are skipped.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(path)?;
        let mut dosages = HashMap::new();
        for row in reader.deserialize::<LeadRow>() {
            let row = row?;
            if let Some(d) = row.dosage {
                if !(0.0..=2.0).contains(&d) {
                    return Err(CytoError::InvalidParameter(format!(
                        "dosage {} for '{}' outside [0, 2]",
                        d, row.genotype_id
                    )));
                }
                if dosages.insert(row.genotype_id.clone(), d).is_some() {
                    return Err(CytoError::DuplicateKey(format!("donor '{}'", row.genotype_id)));
                }
            }
        }
        if dosages.is_empty() {
            return Err(CytoError::EmptyData("No lead-variant dosages".to_string()));
        }
        Ok(Self { dosages })
    }

    /// Lead variant taken from a row of a genotype bundle.
    pub fn from_bundle(bundle: &GenotypeBundle, variant_id: &str) -> Result<Self> {
        let i = bundle.variant_index(variant_id).ok_or_else(|| {
            CytoError::InvalidParameter(format!("variant '{}' not in genotype bundle", variant_id))
        })?;
        let dosages = bundle
            .donor_ids()
            .iter()
            .cloned()
            .zip(bundle.dosage_row(i))
            .filter(|(_, d)| !d.is_nan())
            .collect();
        Ok(Self { dosages })
    }

    /// Dosage for one donor.
    pub fn get(&self, genotype_id: &str) -> Option<f64> {
        self.dosages.get(genotype_id).copied()
    }
}

/// Add the lead variant as a continuous `dosage` column joined on `genotype_id`.
///
/// Samples of donors without a dosage get a missing value, which model
/// fitting reports rather than imputes.
pub fn with_lead_variant(metadata: &Metadata, lead: &LeadVariant) -> Result<Metadata> {
    metadata.join_continuous("genotype_id", "dosage", &lead.dosages)
}
