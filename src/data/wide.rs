//! Wide per-sample table: one row per (line_id, flow_date), one column per protein.

use crate::data::{Metadata, Variable, VariableType};
use crate::error::{CytoError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Identity and covariates of one measured sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub line_id: String,
    pub genotype_id: String,
    pub donor: String,
    pub flow_date: String,
    pub purity: Option<f64>,
}

/// Columns of the wide table that are not proteins.
const EXCLUDED_MARKER: &str = "#excluded";

const KEY_COLUMNS: [&str; 6] = [
    "sample_id",
    "line_id",
    "genotype_id",
    "donor",
    "flow_date",
    "purity",
];

/// Pivoted sample × protein intensity table.
///
/// Missing intensities are stored as NaN. `excluded` records samples removed
/// by exclusion so repeated exclusion of the same ids stays valid.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    samples: Vec<SampleRecord>,
    proteins: Vec<String>,
    values: DMatrix<f64>,
    excluded: BTreeSet<String>,
}

impl WideTable {
    /// Assemble a table, checking shapes and key uniqueness.
    pub fn new(samples: Vec<SampleRecord>, proteins: Vec<String>, values: DMatrix<f64>) -> Result<Self> {
        if values.nrows() != samples.len() {
            return Err(CytoError::DimensionMismatch {
                expected: samples.len(),
                actual: values.nrows(),
            });
        }
        if values.ncols() != proteins.len() {
            return Err(CytoError::DimensionMismatch {
                expected: proteins.len(),
                actual: values.ncols(),
            });
        }
        let mut keys = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for s in &samples {
            if !keys.insert((s.line_id.as_str(), s.flow_date.as_str())) {
                return Err(CytoError::DuplicateKey(format!(
                    "({}, {})",
                    s.line_id, s.flow_date
                )));
            }
            // distinct keys can still concatenate to the same id
            if !ids.insert(s.sample_id.as_str()) {
                return Err(CytoError::DuplicateKey(format!(
                    "sample id '{}' from ({}, {})",
                    s.sample_id, s.line_id, s.flow_date
                )));
            }
        }
        Ok(Self {
            samples,
            proteins,
            values,
            excluded: BTreeSet::new(),
        })
    }

    /// Sample records in row order.
    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    /// Protein column names.
    pub fn proteins(&self) -> &[String] {
        &self.proteins
    }

    /// Intensity matrix (samples × proteins).
    pub fn values(&self) -> &DMatrix<f64> {
        &self.values
    }

    /// Ids excluded so far.
    pub fn excluded(&self) -> &BTreeSet<String> {
        &self.excluded
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Sample ids in row order.
    pub fn sample_ids(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.sample_id.clone()).collect()
    }

    /// Row index of a sample id.
    pub fn sample_index(&self, sample_id: &str) -> Option<usize> {
        self.samples.iter().position(|s| s.sample_id == sample_id)
    }

    /// Column index of a protein.
    pub fn protein_index(&self, protein: &str) -> Result<usize> {
        self.proteins
            .iter()
            .position(|p| p == protein)
            .ok_or_else(|| CytoError::MissingColumn(protein.to_string()))
    }

    /// Intensities of one protein in row order (NaN when missing).
    pub fn column(&self, protein: &str) -> Result<Vec<f64>> {
        let j = self.protein_index(protein)?;
        Ok(self.values.column(j).iter().cloned().collect())
    }

    /// Intensity of one cell, if observed.
    pub fn get(&self, row: usize, protein: &str) -> Option<f64> {
        let j = self.protein_index(protein).ok()?;
        let v = *self.values.get((row, j))?;
        (!v.is_nan()).then_some(v)
    }

    /// Keep only the given rows, in the given order.
    pub(crate) fn select_rows(&self, rows: &[usize]) -> Self {
        let samples = rows.iter().map(|&i| self.samples[i].clone()).collect();
        let values = self.values.select_rows(rows);
        Self {
            samples,
            proteins: self.proteins.clone(),
            values,
            excluded: self.excluded.clone(),
        }
    }

    pub(crate) fn with_excluded(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.excluded.extend(ids);
        self
    }

    /// Covariates and intensities as typed metadata for formula-driven models.
    ///
    /// `line_id`, `genotype_id`, `donor` and `flow_date` are categorical;
    /// `purity` and every protein are continuous.
    pub fn to_metadata(&self) -> Result<Metadata> {
        let mut columns = vec![
            ("line_id".to_string(), categorical(self.samples.iter().map(|s| &s.line_id))),
            ("genotype_id".to_string(), categorical(self.samples.iter().map(|s| &s.genotype_id))),
            ("donor".to_string(), categorical(self.samples.iter().map(|s| &s.donor))),
            ("flow_date".to_string(), categorical(self.samples.iter().map(|s| &s.flow_date))),
            (
                "purity".to_string(),
                self.samples
                    .iter()
                    .map(|s| s.purity.map(Variable::Continuous).unwrap_or(Variable::Missing))
                    .collect(),
            ),
        ];
        for (j, protein) in self.proteins.iter().enumerate() {
            columns.push((
                protein.clone(),
                self.values
                    .column(j)
                    .iter()
                    .map(|&v| if v.is_nan() { Variable::Missing } else { Variable::Continuous(v) })
                    .collect(),
            ));
        }

        let types: HashMap<String, VariableType> = std::iter::once("purity")
            .chain(self.proteins.iter().map(|p| p.as_str()))
            .map(|c| (c.to_string(), VariableType::Continuous))
            .collect();
        Ok(Metadata::from_columns(self.sample_ids(), columns)?.with_column_types(types))
    }

    /// Write the table as TSV (key columns, then proteins; missing as NA).
    ///
    /// Previously excluded ids go on a leading `#excluded` line so that
    /// re-applying an exclusion to the reloaded table is still a no-op.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        if !self.excluded.is_empty() {
            let ids: Vec<&str> = self.excluded.iter().map(|s| s.as_str()).collect();
            writeln!(file, "{}\t{}", EXCLUDED_MARKER, ids.join("\t"))?;
        }
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
        let header: Vec<&str> = KEY_COLUMNS
            .iter()
            .copied()
            .chain(self.proteins.iter().map(|p| p.as_str()))
            .collect();
        writer.write_record(&header)?;
        for (i, s) in self.samples.iter().enumerate() {
            let mut record = vec![
                s.sample_id.clone(),
                s.line_id.clone(),
                s.genotype_id.clone(),
                s.donor.clone(),
                s.flow_date.clone(),
                format_value(s.purity.unwrap_or(f64::NAN)),
            ];
            record.extend(self.values.row(i).iter().map(|&v| format_value(v)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a table written by [`WideTable::to_tsv`].
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let (excluded, body, skipped) = match text.split_once('\n') {
            Some((first, rest)) if first.starts_with(EXCLUDED_MARKER) => {
                let ids: Vec<String> = first
                    .trim_end_matches('\r')
                    .split('\t')
                    .skip(1)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect();
                (ids, rest, 1)
            }
            _ => (Vec::new(), text.as_str(), 0),
        };
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .from_reader(body.as_bytes());
        let header: Vec<String> = reader.headers()?.iter().map(|s| s.to_string()).collect();
        for (i, key) in KEY_COLUMNS.iter().enumerate() {
            if header.get(i).map(|s| s.as_str()) != Some(*key) {
                return Err(CytoError::MissingColumn(key.to_string()));
            }
        }
        let proteins = header[KEY_COLUMNS.len()..].to_vec();

        let mut samples = Vec::new();
        let mut cells: Vec<f64> = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();
            let parse = |i: usize| -> Result<f64> {
                parse_value(&field(i)).ok_or_else(|| CytoError::InvalidValue {
                    value: field(i),
                    line: line + 2 + skipped,
                    column: header[i].clone(),
                })
            };
            let purity = parse(5)?;
            samples.push(SampleRecord {
                sample_id: field(0),
                line_id: field(1),
                genotype_id: field(2),
                donor: field(3),
                flow_date: field(4),
                purity: (!purity.is_nan()).then_some(purity),
            });
            for j in 0..proteins.len() {
                cells.push(parse(KEY_COLUMNS.len() + j)?);
            }
        }
        if samples.is_empty() {
            return Err(CytoError::EmptyData("No samples in wide table".to_string()));
        }

        let values = DMatrix::from_row_slice(samples.len(), proteins.len(), &cells);
        Ok(Self::new(samples, proteins, values)?.with_excluded(excluded))
    }
}

fn categorical<'a>(values: impl Iterator<Item = &'a String>) -> Vec<Variable> {
    values.map(|v| Variable::Categorical(v.clone())).collect()
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        v.to_string()
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "" | "NA" | "NaN" => Some(f64::NAN),
        _ => raw.parse().ok(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    pub(crate) fn record(line: &str, genotype: &str, date: &str) -> SampleRecord {
        SampleRecord {
            sample_id: format!("{}{}", line, date),
            line_id: line.to_string(),
            genotype_id: genotype.to_string(),
            donor: genotype.to_string(),
            flow_date: date.to_string(),
            purity: Some(0.9),
        }
    }

    fn table() -> WideTable {
        WideTable::new(
            vec![
                record("L1", "G1", "2017-01-01"),
                record("L1", "G1", "2017-02-01"),
                record("L2", "G2", "2017-01-01"),
            ],
            vec!["CD14".into(), "CD16".into()],
            DMatrix::from_row_slice(3, 2, &[200.0, 10.0, 180.0, f64::NAN, 90.0, 12.5]),
        )
        .unwrap()
    }

    #[test]
    fn test_accessors() {
        let t = table();
        assert_eq!(t.n_samples(), 3);
        assert_eq!(t.get(0, "CD14"), Some(200.0));
        assert_eq!(t.get(1, "CD16"), None);
        assert_eq!(t.sample_index("L22017-01-01"), Some(2));
        assert!(t.column("CD206").is_err());
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err = WideTable::new(
            vec![record("L1", "G1", "d"), record("L1", "G1", "d")],
            vec!["CD14".into()],
            DMatrix::zeros(2, 1),
        )
        .unwrap_err();
        assert!(matches!(err, CytoError::DuplicateKey(_)));
    }

    #[test]
    fn test_colliding_sample_ids_rejected() {
        let err = WideTable::new(
            vec![record("A1", "G1", "0"), record("A", "G1", "10")],
            vec!["CD14".into()],
            DMatrix::zeros(2, 1),
        )
        .unwrap_err();
        assert!(matches!(err, CytoError::DuplicateKey(ref m) if m.contains("A10")));
    }

    #[test]
    fn test_to_metadata_types() {
        let meta = table().to_metadata().unwrap();
        assert_eq!(meta.column_type("flow_date"), Some(VariableType::Categorical));
        assert_eq!(meta.column_type("CD14"), Some(VariableType::Continuous));
        assert_eq!(meta.levels("line_id").unwrap(), vec!["L1", "L2"]);
        assert!(meta.get("L12017-02-01", "CD16").unwrap().is_missing());
    }

    #[test]
    fn test_tsv_roundtrip() {
        let t = table();
        let file = NamedTempFile::new().unwrap();
        t.to_tsv(file.path()).unwrap();
        let back = WideTable::from_tsv(file.path()).unwrap();
        assert_eq!(back.samples(), t.samples());
        assert_eq!(back.proteins(), t.proteins());
        assert_eq!(back.get(0, "CD14"), Some(200.0));
        assert_eq!(back.get(1, "CD16"), None);
        assert!(back.excluded().is_empty());
    }
}
