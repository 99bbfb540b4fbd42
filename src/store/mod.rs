// src/store/mod.rs

//! Storage handle shared by handlers, the regeneration engine and the bulk gateway.
//!
//! The process entry point picks one implementation and passes it around as
//! `Arc<dyn ExamStore>`; nothing in the core reaches for a global connection.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    error::{AppError, RecordFailure},
    models::{
        answer_key::{AnswerKey, AnswerKeyEntry, AnswerKeyFilter, NewAnswerKey, TestIdentity},
        student_report::{NewStudentReport, ReportFilter, ReportKey, StudentReport},
        test::Stream,
    },
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A stored report, or the reason it could not be decoded.
pub type LoadedReport = Result<StudentReport, RecordFailure>;

#[async_trait]
pub trait ExamStore: Send + Sync {
    /// Inserts a key with all its entries. A duplicate test identity is a `Conflict`.
    async fn insert_answer_key(&self, key: NewAnswerKey) -> Result<AnswerKey, AppError>;

    async fn find_answer_key(&self, id: i64) -> Result<Option<AnswerKey>, AppError>;

    async fn list_answer_keys(&self, filter: &AnswerKeyFilter) -> Result<Vec<AnswerKey>, AppError>;

    async fn update_answer_key_identity(
        &self,
        id: i64,
        identity: &TestIdentity,
    ) -> Result<AnswerKey, AppError>;

    /// Deletes the key and every entry it owns.
    async fn delete_answer_key(&self, id: i64) -> Result<bool, AppError>;

    /// Returns the entry together with the id of the key owning it.
    async fn find_answer_key_entry(
        &self,
        entry_id: i64,
    ) -> Result<Option<(i64, AnswerKeyEntry)>, AppError>;

    /// Inserts or fully replaces the entry for `(answer_key_id, question_number)`.
    async fn put_answer_key_entry(
        &self,
        answer_key_id: i64,
        entry: &AnswerKeyEntry,
    ) -> Result<AnswerKeyEntry, AppError>;

    async fn delete_answer_key_entry(&self, entry_id: i64) -> Result<bool, AppError>;

    /// Inserts a report. A duplicate natural key is a `Conflict`.
    async fn insert_report(&self, report: &NewStudentReport) -> Result<StudentReport, AppError>;

    /// Replaces every mutable column of report `report.id` in one write, provided
    /// the stored version still equals `expected_version`. The version is bumped.
    async fn replace_report(
        &self,
        report: &StudentReport,
        expected_version: i32,
    ) -> Result<StudentReport, AppError>;

    async fn find_report(&self, id: i64) -> Result<Option<StudentReport>, AppError>;

    async fn find_report_by_key(&self, key: &ReportKey) -> Result<Option<StudentReport>, AppError>;

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StudentReport>, AppError>;

    /// Every report of one test sitting. Records that cannot be decoded come
    /// back as failures instead of failing the whole load.
    async fn load_reports_for_test(
        &self,
        test_name: &str,
        stream: Stream,
        date: NaiveDate,
    ) -> Result<Vec<LoadedReport>, AppError>;

    /// The subset of `keys` that already has a stored report.
    async fn existing_report_keys(&self, keys: &[ReportKey]) -> Result<Vec<ReportKey>, AppError>;

    async fn delete_report(&self, id: i64) -> Result<bool, AppError>;
}
