//! Utility functions.
//!
//! Collection of helper functions used across the crate.

pub mod duration_serde;
pub mod parser;

pub use parser::{format_duration, parse_bool, parse_duration};
