//! Core types: errors, configuration, tree-path helpers.

pub mod config;
pub mod errors;
pub mod paths;
