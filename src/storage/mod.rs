//! Storage layer: history log, frame codec, and current-state snapshot

pub mod current_state;
pub mod frame;
pub mod history_log;

pub use current_state::*;
pub use history_log::*;
