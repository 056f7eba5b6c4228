//! Sample filtering: PCA-based outlier inspection and explicit exclusion.

pub mod exclusion;
pub mod outlier;

pub use exclusion::{apply_exclusion, drop_incomplete};
pub use outlier::{detect_candidates, OutlierCandidate, OutlierCandidates};
