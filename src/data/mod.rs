//! Data structures: tables, formulas and design matrices.

mod design_matrix;
mod formula;
mod metadata;
mod phenotype;
mod random_effects;
mod readings;
pub(crate) mod wide;

pub use design_matrix::{DesignMatrix, INTERCEPT};
pub use formula::{Formula, Term};
pub use metadata::{Metadata, Variable, VariableType};
pub use phenotype::PhenotypeMatrix;
pub use random_effects::{MixedFormula, RandomDesignMatrix, RandomEffect};
pub use readings::{sample_id, FlowReading};
pub use wide::{SampleRecord, WideTable};
