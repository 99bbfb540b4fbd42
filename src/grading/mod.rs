// src/grading/mod.rs

pub mod engine;
pub mod recompute;

pub use engine::{BulkUpdateResult, RegenerationEngine, RegenerationResult};
