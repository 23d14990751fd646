//! Shared types and utilities for Stride
//!
//! This crate contains the identifier types that flow between the GPU
//! correlation engine, its backends, and the command-line front end.

pub mod types;
pub mod utils;

// Re-export commonly used types
pub use types::{ids::*, ip::*};
