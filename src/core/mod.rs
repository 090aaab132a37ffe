//! Core data types and models

pub mod clock;
pub mod record;
pub mod temporal;

pub use clock::*;
pub use record::*;
pub use temporal::*;
