//! Mathematical utilities: the chi-square probability conversion.

pub mod prob;

pub use prob::*;
