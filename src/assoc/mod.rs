//! Cis-association scanning against donor genotypes.

pub mod genes;
pub mod genotype;
pub mod scan;

pub use genes::{same_chromosome, GenePosition, GenePositions};
pub use genotype::{with_lead_variant, GenotypeBundle, LeadVariant, Variant};
pub use scan::{
    align_donors, intersect_donors, scan_cis, select_one_per_donor, AssociationResults,
    AssociationRow, DonorSelection, ScanConfig,
};
