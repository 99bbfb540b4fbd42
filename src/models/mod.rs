// src/models/mod.rs

pub mod answer_key;
pub mod marks;
pub mod student_report;
