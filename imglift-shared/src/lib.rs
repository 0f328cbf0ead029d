//! imglift shared core - error taxonomy and cross-crate constants
//!
//! This crate contains the error types and constants shared by the
//! migration core library and the command-line frontend.

pub mod constants;
pub mod errors;

pub use errors::{MigrateError, MigrateResult};
