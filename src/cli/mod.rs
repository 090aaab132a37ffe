//! Command-line driver

pub mod commands;

pub use commands::*;
