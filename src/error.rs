//! Error types for the cytovar library.

use thiserror::Error;

/// Broad class of a failure, used to decide how a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unreadable or malformed input files.
    Input,
    /// Mapping tables, key sets or model specifications that do not fit the data.
    Configuration,
    /// Table contents that break an invariant (duplicate keys, stale ids, ...).
    Data,
    /// Requests that would yield statistically meaningless output.
    StatisticalValidity,
}

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum CytoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("Invalid value '{value}' at line {line}, column '{column}'")]
    InvalidValue {
        value: String,
        line: usize,
        column: String,
    },

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Missing column '{0}'")]
    MissingColumn(String),

    #[error("Formula parse error: {0}")]
    FormulaParse(String),

    #[error("Channel '{0}' has no entry in the channel map")]
    UnmappedChannel(String),

    #[error("Donor '{0}' not found in sample metadata")]
    UnknownDonor(String),

    #[error("Invalid donor alias table: {0}")]
    InvalidAlias(String),

    #[error("Donor id sets differ: missing from genotypes {missing_genotype:?}, missing from phenotypes {missing_phenotype:?}")]
    DonorMismatch {
        missing_genotype: Vec<String>,
        missing_phenotype: Vec<String>,
    },

    #[error("Fixed effects need {parameters} parameters but only {observations} observations are available")]
    TooManyParameters {
        parameters: usize,
        observations: usize,
    },

    #[error("Design matrix is rank deficient: rank {rank} < {parameters} parameters")]
    RankDeficient { rank: usize, parameters: usize },

    #[error("Grouping factor name '{0}' collides with a reserved name")]
    ReservedName(String),

    #[error("Duplicate key {0}: deduplicate before pivoting")]
    DuplicateKey(String),

    #[error("Excluded sample '{0}' is not in the table (stale exclusion list?)")]
    StaleExclusion(String),

    #[error("Grouping factor '{column}' has {levels} observed level(s); its variance is inestimable")]
    DegenerateGrouping { column: String, levels: usize },

    #[error("Missing value: {0}")]
    MissingValue(String),

    #[error("Invalid variance for '{name}': {value}")]
    InvalidVariance { name: String, value: f64 },

    #[error("Total variance is zero; fractions are undefined")]
    ZeroVariance,

    #[error("Cannot compare likelihoods: {0}")]
    IncompatibleEstimation(String),

    #[error("Models are not nested: {0}")]
    NotNested(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Sample ID mismatch: {0}")]
    SampleMismatch(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Step {index} ({step}) failed: {source}")]
    Stage {
        index: usize,
        step: String,
        #[source]
        source: Box<CytoError>,
    },
}

impl CytoError {
    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        use CytoError::*;
        match self {
            Io(_) | Csv(_) | Yaml(_) | Json(_) | Date(_) | InvalidValue { .. } | EmptyData(_) => {
                ErrorCategory::Input
            }
            MissingColumn(_)
            | FormulaParse(_)
            | UnmappedChannel(_)
            | UnknownDonor(_)
            | InvalidAlias(_)
            | DonorMismatch { .. }
            | TooManyParameters { .. }
            | RankDeficient { .. }
            | ReservedName(_)
            | InvalidParameter(_)
            | NotImplemented(_) => ErrorCategory::Configuration,
            DuplicateKey(_)
            | StaleExclusion(_)
            | DegenerateGrouping { .. }
            | MissingValue(_)
            | InvalidVariance { .. }
            | DimensionMismatch { .. }
            | SampleMismatch(_) => ErrorCategory::Data,
            ZeroVariance | IncompatibleEstimation(_) | NotNested(_) | Numerical(_) => {
                ErrorCategory::StatisticalValidity
            }
            Stage { source, .. } => source.category(),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, CytoError>;
