// src/handlers/mod.rs

pub mod solution;
pub mod student_report;
