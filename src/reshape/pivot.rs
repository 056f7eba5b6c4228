//! Joining, intensity computation and the long → wide pivot.

use crate::data::{sample_id, FlowReading, Metadata, SampleRecord, WideTable};
use crate::error::{CytoError, Result};
use crate::reshape::{ChannelMap, DonorAliases};
use log::{debug, info};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One observed intensity in long form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongIntensity {
    pub sample_id: String,
    pub line_id: String,
    pub flow_date: String,
    pub protein: String,
    pub intensity: f64,
}

/// Pivot readings into one row per (line_id, flow_date).
///
/// Channels are translated through `channels`, donor labels in both tables
/// are canonicalised through `aliases`, and `genotype_id` is attached by
/// joining on the canonical donor. A repeated (line_id, flow_date, protein)
/// key is an error; see [`dedup_readings`].
pub fn reshape(
    readings: &[FlowReading],
    metadata: &Metadata,
    channels: &ChannelMap,
    aliases: &DonorAliases,
) -> Result<WideTable> {
    channels.validate()?;
    aliases.validate()?;
    if readings.is_empty() {
        return Err(CytoError::EmptyData("No readings to reshape".to_string()));
    }

    let genotypes = donor_genotypes(metadata, aliases)?;
    let proteins = channels.proteins();
    let protein_col: HashMap<&str, usize> = proteins
        .iter()
        .enumerate()
        .map(|(j, p)| (p.as_str(), j))
        .collect();

    let mut samples: Vec<SampleRecord> = Vec::new();
    let mut row_of: HashMap<(String, String), usize> = HashMap::new();
    let mut cells: HashMap<(usize, usize), f64> = HashMap::new();

    for reading in readings {
        let protein = channels.protein(&reading.channel)?;
        let donor = aliases.canonical(&reading.donor);
        let genotype_id = genotypes
            .get(donor)
            .ok_or_else(|| CytoError::UnknownDonor(donor.to_string()))?;

        let key = (reading.line_id.clone(), reading.flow_date.clone());
        let row = match row_of.get(&key) {
            Some(&row) => {
                let existing = &mut samples[row];
                if existing.donor != donor {
                    return Err(CytoError::SampleMismatch(format!(
                        "sample {} recorded for donors '{}' and '{}'",
                        existing.sample_id, existing.donor, donor
                    )));
                }
                if existing.purity.is_none() {
                    existing.purity = reading.purity;
                }
                row
            }
            None => {
                samples.push(SampleRecord {
                    sample_id: sample_id(&reading.line_id, &reading.flow_date),
                    line_id: reading.line_id.clone(),
                    genotype_id: genotype_id.clone(),
                    donor: donor.to_string(),
                    flow_date: reading.flow_date.clone(),
                    purity: reading.purity,
                });
                row_of.insert(key, samples.len() - 1);
                samples.len() - 1
            }
        };

        let col = protein_col[protein];
        if cells.insert((row, col), reading.intensity()).is_some() {
            return Err(CytoError::DuplicateKey(format!(
                "({}, {}, {})",
                reading.line_id, reading.flow_date, protein
            )));
        }
    }

    let mut values = DMatrix::from_element(samples.len(), proteins.len(), f64::NAN);
    for ((row, col), v) in cells {
        values[(row, col)] = v;
    }

    info!(
        "Reshaped {} readings into {} samples x {} proteins",
        readings.len(),
        samples.len(),
        proteins.len()
    );
    WideTable::new(samples, proteins, values)
}

/// canonical donor -> genotype_id, from the `donor` and `genotype_id` columns.
fn donor_genotypes(metadata: &Metadata, aliases: &DonorAliases) -> Result<HashMap<String, String>> {
    let donors = metadata.column("donor")?;
    let genotype_ids = metadata.column("genotype_id")?;
    let mut map: HashMap<String, String> = HashMap::new();

    for (donor, genotype) in donors.iter().zip(genotype_ids) {
        let (Some(donor), Some(genotype)) = (donor.label(), genotype.label()) else {
            continue;
        };
        let canonical = aliases.canonical(&donor).to_string();
        if let Some(previous) = map.get(&canonical) {
            if *previous != genotype {
                return Err(CytoError::DuplicateKey(format!(
                    "donor '{}' maps to genotypes '{}' and '{}'",
                    canonical, previous, genotype
                )));
            }
        }
        map.insert(canonical, genotype);
    }
    Ok(map)
}

/// Project a wide table back to long form (missing cells skipped).
pub fn to_long(wide: &WideTable) -> Vec<LongIntensity> {
    let mut out = Vec::new();
    for (i, s) in wide.samples().iter().enumerate() {
        for (j, protein) in wide.proteins().iter().enumerate() {
            let v = wide.values()[(i, j)];
            if v.is_nan() {
                continue;
            }
            out.push(LongIntensity {
                sample_id: s.sample_id.clone(),
                line_id: s.line_id.clone(),
                flow_date: s.flow_date.clone(),
                protein: protein.clone(),
                intensity: v,
            });
        }
    }
    out
}

/// Keep one reading per (line_id, flow_date, channel).
///
/// Readings are stably sorted by that key first, so the survivor is the
/// first reading of each key in input order, independent of how keys
/// interleave.
pub fn dedup_readings(readings: &[FlowReading]) -> Vec<FlowReading> {
    let mut sorted: Vec<&FlowReading> = readings.iter().collect();
    sorted.sort_by(|a, b| {
        (&a.line_id, &a.flow_date, &a.channel).cmp(&(&b.line_id, &b.flow_date, &b.channel))
    });

    let mut seen = HashSet::new();
    let kept: Vec<FlowReading> = sorted
        .into_iter()
        .filter(|r| seen.insert((r.line_id.clone(), r.flow_date.clone(), r.channel.clone())))
        .cloned()
        .collect();

    if kept.len() < readings.len() {
        debug!("Dropped {} duplicate readings", readings.len() - kept.len());
    }
    kept
}

/// Count readings per (line_id, flow_date, channel) key; keys seen more than once.
pub fn duplicate_keys(readings: &[FlowReading]) -> BTreeMap<(String, String, String), usize> {
    let mut counts: BTreeMap<(String, String, String), usize> = BTreeMap::new();
    for r in readings {
        *counts
            .entry((r.line_id.clone(), r.flow_date.clone(), r.channel.clone()))
            .or_default() += 1;
    }
    counts.retain(|_, n| *n > 1);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Variable;

    fn reading(line: &str, donor: &str, date: &str, channel: &str, m1: f64, m2: f64) -> FlowReading {
        FlowReading {
            line_id: line.into(),
            donor: donor.into(),
            flow_date: date.into(),
            channel: channel.into(),
            purity: Some(0.9),
            mean1: m1,
            mean2: m2,
        }
    }

    fn metadata() -> Metadata {
        let cat = |v: &[&str]| -> Vec<Variable> {
            v.iter().map(|s| Variable::Categorical(s.to_string())).collect()
        };
        Metadata::from_columns(
            vec!["r1".into(), "r2".into()],
            vec![
                ("donor".into(), cat(&["pelm", "qolg"])),
                ("genotype_id".into(), cat(&["HPSI0114i-pelm", "HPSI0314i-qolg"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_intensity_attributed_to_protein() {
        let readings = vec![reading("X", "pelm", "d1", "Pacific.Blue.A", 100.0, 300.0)];
        let wide = reshape(&readings, &metadata(), &ChannelMap::default(), &DonorAliases::default())
            .unwrap();
        assert_eq!(wide.n_samples(), 1);
        assert_eq!(wide.samples()[0].sample_id, "Xd1");
        assert_eq!(wide.samples()[0].genotype_id, "HPSI0114i-pelm");
        assert_eq!(wide.get(0, "CD14"), Some(200.0));
        assert_eq!(wide.get(0, "CD16"), None);
    }

    #[test]
    fn test_duplicate_key_fails() {
        let readings = vec![
            reading("X", "pelm", "d1", "PE.A", 1.0, 2.0),
            reading("X", "pelm", "d1", "PE.A", 1.0, 3.0),
        ];
        let err = reshape(&readings, &metadata(), &ChannelMap::default(), &DonorAliases::default())
            .unwrap_err();
        assert!(matches!(err, CytoError::DuplicateKey(_)));
        assert_eq!(duplicate_keys(&readings).len(), 1);

        let deduped = dedup_readings(&readings);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].mean2, 2.0);
        assert!(reshape(&deduped, &metadata(), &ChannelMap::default(), &DonorAliases::default()).is_ok());
    }

    #[test]
    fn test_unmapped_channel_fails() {
        let readings = vec![reading("X", "pelm", "d1", "FITC.A", 1.0, 2.0)];
        let err = reshape(&readings, &metadata(), &ChannelMap::default(), &DonorAliases::default())
            .unwrap_err();
        assert!(matches!(err, CytoError::UnmappedChannel(_)));
    }

    #[test]
    fn test_alias_resolves_donor() {
        let readings = vec![reading("Y", "qolg_2", "d1", "APC.A", 5.0, 9.0)];
        let err = reshape(&readings, &metadata(), &ChannelMap::default(), &DonorAliases::default())
            .unwrap_err();
        assert!(matches!(err, CytoError::UnknownDonor(_)));

        let aliases = DonorAliases::new(1, &[("qolg_2", "qolg")]);
        let wide = reshape(&readings, &metadata(), &ChannelMap::default(), &aliases).unwrap();
        assert_eq!(wide.samples()[0].donor, "qolg");
        assert_eq!(wide.samples()[0].genotype_id, "HPSI0314i-qolg");
    }

    #[test]
    fn test_long_roundtrip() {
        let readings = vec![
            reading("X", "pelm", "d1", "Pacific.Blue.A", 100.0, 300.0),
            reading("X", "pelm", "d1", "PE.A", 10.0, 12.5),
            reading("Y", "qolg", "d2", "APC.A", 1.0, 41.0),
            reading("X", "pelm", "d2", "PE.A", 3.0, 4.0),
        ];
        let wide = reshape(&readings, &metadata(), &ChannelMap::default(), &DonorAliases::default())
            .unwrap();
        let long = to_long(&wide);
        assert_eq!(long.len(), readings.len());

        for r in &readings {
            let protein = ChannelMap::default().protein(&r.channel).unwrap().to_string();
            let hit = long
                .iter()
                .find(|l| l.sample_id == r.sample_id() && l.protein == protein)
                .unwrap();
            assert_eq!(hit.intensity, r.intensity());
        }
    }
}
