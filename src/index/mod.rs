//! Indexing for history queries

pub mod key_index;

pub use key_index::*;
