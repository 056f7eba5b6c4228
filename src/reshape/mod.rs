//! From long-format instrument readings to the wide per-sample table.

pub mod channels;
pub mod pivot;

pub use channels::{ChannelEntry, ChannelMap, DonorAliases};
pub use pivot::{dedup_readings, duplicate_keys, reshape, to_long, LongIntensity};
