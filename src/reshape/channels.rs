//! Static lookup tables consulted while reshaping.

use crate::error::{CytoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One instrument channel and the protein it reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub channel: String,
    pub protein: String,
}

/// Channel → protein lookup. Entry order fixes the protein column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelMap {
    entries: Vec<ChannelEntry>,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self::new(&[
            ("Pacific.Blue.A", "CD14"),
            ("PE.A", "CD16"),
            ("APC.A", "CD206"),
        ])
    }
}

impl ChannelMap {
    /// Build from `(channel, protein)` pairs.
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            entries: pairs
                .iter()
                .map(|(c, p)| ChannelEntry {
                    channel: c.to_string(),
                    protein: p.to_string(),
                })
                .collect(),
        }
    }

    /// Protein reported by a channel.
    pub fn protein(&self, channel: &str) -> Result<&str> {
        self.entries
            .iter()
            .find(|e| e.channel == channel)
            .map(|e| e.protein.as_str())
            .ok_or_else(|| CytoError::UnmappedChannel(channel.to_string()))
    }

    /// Proteins in map order.
    pub fn proteins(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.protein.clone()).collect()
    }

    /// Reject repeated channels or proteins.
    pub fn validate(&self) -> Result<()> {
        for (i, e) in self.entries.iter().enumerate() {
            let earlier = &self.entries[..i];
            if earlier.iter().any(|o| o.channel == e.channel || o.protein == e.protein) {
                return Err(CytoError::InvalidParameter(format!(
                    "channel map repeats '{}' -> '{}'",
                    e.channel, e.protein
                )));
            }
        }
        Ok(())
    }
}

/// Versioned table of donor labels known to denote the same donor.
///
/// Keys are recorded aliases, values the canonical label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorAliases {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl DonorAliases {
    /// Build from `(alias, canonical)` pairs.
    pub fn new(version: u32, pairs: &[(&str, &str)]) -> Self {
        Self {
            version,
            aliases: pairs
                .iter()
                .map(|(a, c)| (a.to_string(), c.to_string()))
                .collect(),
        }
    }

    /// Canonical label of a donor.
    pub fn canonical<'a>(&'a self, donor: &'a str) -> &'a str {
        self.aliases.get(donor).map(|s| s.as_str()).unwrap_or(donor)
    }

    /// Aliases must resolve in one step: no self-maps, no chains.
    pub fn validate(&self) -> Result<()> {
        for (alias, canonical) in &self.aliases {
            if alias == canonical {
                return Err(CytoError::InvalidAlias(format!(
                    "'{}' maps to itself",
                    alias
                )));
            }
            if self.aliases.contains_key(canonical) {
                return Err(CytoError::InvalidAlias(format!(
                    "'{}' -> '{}' points at another alias",
                    alias, canonical
                )));
            }
        }
        Ok(())
    }
}
