//! Row filters on the wide table.

use crate::data::WideTable;
use crate::error::{CytoError, Result};
use log::{info, warn};
use std::collections::BTreeSet;

/// Remove the listed samples.
///
/// Ids removed by an earlier exclusion are accepted again, so applying the
/// same list twice is a no-op. Any id that was never in the table fails as
/// a stale exclusion.
pub fn apply_exclusion(wide: &WideTable, excluded_ids: &[String]) -> Result<WideTable> {
    let excluded: BTreeSet<&str> = excluded_ids.iter().map(|s| s.as_str()).collect();
    for id in &excluded {
        if wide.sample_index(id).is_none() && !wide.excluded().contains(*id) {
            return Err(CytoError::StaleExclusion(id.to_string()));
        }
    }

    let keep: Vec<usize> = wide
        .samples()
        .iter()
        .enumerate()
        .filter(|(_, s)| !excluded.contains(s.sample_id.as_str()))
        .map(|(i, _)| i)
        .collect();

    let removed = wide.n_samples() - keep.len();
    if removed > 0 {
        info!("Excluded {} samples, {} remain", removed, keep.len());
    }
    Ok(wide
        .select_rows(&keep)
        .with_excluded(excluded.into_iter().map(String::from)))
}

/// Remove samples missing any of the named proteins.
pub fn drop_incomplete(wide: &WideTable, proteins: &[String]) -> Result<WideTable> {
    let cols = proteins
        .iter()
        .map(|p| wide.protein_index(p))
        .collect::<Result<Vec<_>>>()?;

    let keep: Vec<usize> = (0..wide.n_samples())
        .filter(|&i| cols.iter().all(|&j| !wide.values()[(i, j)].is_nan()))
        .collect();

    if keep.is_empty() {
        return Err(CytoError::EmptyData(format!(
            "No sample has all of {:?}",
            proteins
        )));
    }
    if keep.len() < wide.n_samples() {
        warn!(
            "Dropped {} samples with missing {:?}",
            wide.n_samples() - keep.len(),
            proteins
        );
    }
    Ok(wide.select_rows(&keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::wide::tests::record;
    use nalgebra::DMatrix;

    fn wide() -> WideTable {
        WideTable::new(
            vec![
                record("L1", "G1", "d1"),
                record("L2", "G2", "d1"),
                record("L3", "G3", "d2"),
            ],
            vec!["CD14".into(), "CD16".into()],
            DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, f64::NAN, 5.0, 6.0]),
        )
        .unwrap()
    }

    #[test]
    fn test_exclusion_removes_rows() {
        let out = apply_exclusion(&wide(), &["L2d1".to_string()]).unwrap();
        assert_eq!(out.sample_ids(), vec!["L1d1", "L3d2"]);
        assert_eq!(out.proteins(), wide().proteins());
        assert_eq!(out.get(1, "CD14"), Some(5.0));
    }

    #[test]
    fn test_exclusion_idempotent() {
        let ids = vec!["L2d1".to_string()];
        let once = apply_exclusion(&wide(), &ids).unwrap();
        let twice = apply_exclusion(&once, &ids).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_exclusion_idempotent_after_reload() {
        let ids = vec!["L2d1".to_string()];
        let once = apply_exclusion(&wide(), &ids).unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        once.to_tsv(file.path()).unwrap();

        let reloaded = WideTable::from_tsv(file.path()).unwrap();
        assert!(reloaded.excluded().contains("L2d1"));
        let twice = apply_exclusion(&reloaded, &ids).unwrap();
        assert_eq!(twice.sample_ids(), vec!["L1d1", "L3d2"]);
        assert_eq!(twice, once);

        let err = apply_exclusion(&reloaded, &["L9d9".to_string()]).unwrap_err();
        assert!(matches!(err, CytoError::StaleExclusion(_)));
    }

    #[test]
    fn test_empty_exclusion_is_identity() {
        let out = apply_exclusion(&wide(), &[]).unwrap();
        assert_eq!(out.sample_ids(), wide().sample_ids());
        assert!(out.excluded().is_empty());
    }

    #[test]
    fn test_stale_id_fails() {
        let err = apply_exclusion(&wide(), &["L9d9".to_string()]).unwrap_err();
        assert!(matches!(err, CytoError::StaleExclusion(_)));
    }

    #[test]
    fn test_drop_incomplete() {
        let out = drop_incomplete(&wide(), &["CD16".to_string()]).unwrap();
        assert_eq!(out.sample_ids(), vec!["L1d1", "L3d2"]);
        let all = drop_incomplete(&wide(), &["CD14".to_string()]).unwrap();
        assert_eq!(all.n_samples(), 3);
    }
}
