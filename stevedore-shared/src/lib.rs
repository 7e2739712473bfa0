//! Stevedore shared code
//!
//! This crate contains the error taxonomy and constants used by both the
//! `stevedore` library and the `stevedore` command-line binary.

pub mod constants;
pub mod errors;

pub use errors::{ErrorKind, StevedoreError, StevedoreResult};
