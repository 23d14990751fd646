//! Identifier and address types

pub mod ids;
pub mod ip;
