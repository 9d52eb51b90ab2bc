//! Pure, deterministic orchestration logic.
//!
//! Nothing in this module performs I/O; everything is a function of its
//! inputs so it can be tested without repositories or child processes.

pub mod assign;
pub mod consensus;
pub mod resume;
pub mod types;
