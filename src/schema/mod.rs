//! Schema module - Configuration, occupation matrices and search records.

mod config;
pub(crate) mod matrix;
mod search;

pub use config::*;
pub use matrix::*;
pub use search::*;
