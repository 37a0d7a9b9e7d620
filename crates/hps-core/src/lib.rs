//! Core types shared by the HPS conditions crates.

pub mod errors;
pub mod parsers;
pub mod run_periods;

/// Primary integer identifier type used for table rows and collections.
pub type Id = i64;

/// Run number type as stored in the conditions database.
pub type RunNumber = i64;
