//! Significance tests for comparing nested models.

pub mod f_test;
pub mod lrt;

pub use f_test::{test_f_nested, FTestResult, FTestResultSingle};
pub use lrt::{test_lrt, LrtResult, LrtResultSingle};
