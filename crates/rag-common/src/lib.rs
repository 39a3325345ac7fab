//! Shared library for the RAG operator
//!
//! Error types and small parsing helpers used across the operator crates.

pub mod duration;
pub mod error;

pub use duration::parse_duration_str;
pub use error::{RagError, Result};
