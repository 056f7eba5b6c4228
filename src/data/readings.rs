//! Raw flow-cytometry readings (long format, one row per sample × channel).

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One processed reading: a channel measured on one cell line at one date.
///
/// `mean1` is the negative (unstained) reference, `mean2` the stained
/// measurement of the same channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowReading {
    pub line_id: String,
    pub donor: String,
    pub flow_date: String,
    pub channel: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub purity: Option<f64>,
    pub mean1: f64,
    pub mean2: f64,
}

impl FlowReading {
    /// Background-corrected intensity.
    pub fn intensity(&self) -> f64 {
        self.mean2 - self.mean1
    }

    /// Sample identifier: line id immediately followed by the flow date.
    pub fn sample_id(&self) -> String {
        sample_id(&self.line_id, &self.flow_date)
    }

    /// Read a tab-separated readings table.
    pub fn read_tsv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(path)?;
        let readings = reader
            .deserialize()
            .collect::<std::result::Result<Vec<FlowReading>, _>>()?;
        if readings.is_empty() {
            return Err(CytoError::EmptyData("No readings in table".to_string()));
        }
        Ok(readings)
    }

    /// Write readings as a tab-separated table.
    pub fn write_tsv<P: AsRef<Path>>(readings: &[Self], path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
        for reading in readings {
            writer.serialize(reading)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Build a sample id from its key.
pub fn sample_id(line_id: &str, flow_date: &str) -> String {
    format!("{}{}", line_id, flow_date)
}
