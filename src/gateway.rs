// src/gateway.rs

//! Bulk Persistence Gateway.
//!
//! Applies a batch of independent record writes with bounded concurrency. The
//! batch is not atomic: each operation succeeds or fails on its own, and a
//! failure is reported next to the success count instead of aborting the rest.
//! Each single record is written in one statement, never field by field.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::{
    error::{AppError, ErrorKind, RecordFailure},
    models::{
        answer_key::AnswerKeyEntry,
        student_report::{NewStudentReport, StudentReport},
    },
    store::ExamStore,
};

/// One keyed write.
#[derive(Debug, Clone)]
pub enum BatchOperation {
    /// Create a report; if its natural key already exists, replace that record instead.
    UpsertReport(NewStudentReport),
    /// Replace a stored report, provided nobody wrote it since `expected_version`.
    ReplaceReport {
        report: StudentReport,
        expected_version: i32,
    },
    /// Insert or replace the entry at `(answer_key_id, entry.question_number)`.
    PutAnswerKeyEntry {
        answer_key_id: i64,
        entry: AnswerKeyEntry,
    },
}

impl BatchOperation {
    /// Natural key of the record this operation writes.
    pub fn key(&self) -> String {
        match self {
            BatchOperation::UpsertReport(new) => new.key().to_string(),
            BatchOperation::ReplaceReport { report, .. } => report.key().to_string(),
            BatchOperation::PutAnswerKeyEntry {
                answer_key_id,
                entry,
            } => format!("answer_key:{}/Q{}", answer_key_id, entry.question_number),
        }
    }

    fn reg_number(&self) -> Option<&str> {
        match self {
            BatchOperation::UpsertReport(new) => Some(&new.reg_number),
            BatchOperation::ReplaceReport { report, .. } => Some(&report.reg_number),
            BatchOperation::PutAnswerKeyEntry { .. } => None,
        }
    }

    fn failure(&self, err: &AppError) -> RecordFailure {
        let failure = RecordFailure::from_error(self.key(), err);
        match self.reg_number() {
            Some(reg) => failure.for_student(reg),
            None => failure,
        }
    }
}

/// The record as stored after a successful operation.
#[derive(Debug, Clone)]
pub enum Applied {
    Report(StudentReport),
    Entry {
        answer_key_id: i64,
        entry: AnswerKeyEntry,
    },
}

#[derive(Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<RecordFailure>,
    /// Stored records, in completion order.
    #[serde(skip)]
    pub applied: Vec<Applied>,
}

impl BatchOutcome {
    pub fn reports(&self) -> impl Iterator<Item = &StudentReport> {
        self.applied.iter().filter_map(|a| match a {
            Applied::Report(report) => Some(report),
            Applied::Entry { .. } => None,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (i64, &AnswerKeyEntry)> {
        self.applied.iter().filter_map(|a| match a {
            Applied::Entry {
                answer_key_id,
                entry,
            } => Some((*answer_key_id, entry)),
            Applied::Report(_) => None,
        })
    }

    /// Records a failure for an operation that was rejected before being submitted.
    pub fn reject(&mut self, failure: RecordFailure) {
        self.attempted += 1;
        self.failures.push(failure);
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failures.extend(other.failures);
        self.applied.extend(other.applied);
    }
}

#[derive(Clone)]
pub struct BulkGateway {
    store: Arc<dyn ExamStore>,
    concurrency: usize,
    max_operations: usize,
}

impl BulkGateway {
    pub fn new(store: Arc<dyn ExamStore>, concurrency: usize, max_operations: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            max_operations,
        }
    }

    /// Applies every operation independently.
    ///
    /// The only whole-batch error is an oversized batch, which is rejected
    /// before anything is written.
    pub async fn apply_batch(&self, ops: Vec<BatchOperation>) -> Result<BatchOutcome, AppError> {
        if ops.len() > self.max_operations {
            return Err(AppError::Validation(format!(
                "batch exceeds max operations: {} > {}",
                ops.len(),
                self.max_operations
            )));
        }

        let mut outcome = BatchOutcome {
            attempted: ops.len(),
            ..Default::default()
        };
        if ops.is_empty() {
            return Ok(outcome);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(ops.len());

        for op in ops {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::InternalServerError(e.to_string()))?;
            let store = self.store.clone();
            let key = op.key();
            let reg_number = op.reg_number().map(str::to_string);

            let handle = tokio::spawn(async move {
                let _permit = permit;
                match apply_one(store.as_ref(), &op).await {
                    Ok(applied) => Ok(applied),
                    Err(e) => {
                        tracing::warn!("Batch write for {} failed: {:?}", op.key(), e);
                        Err(op.failure(&e))
                    }
                }
            });
            handles.push((key, reg_number, handle));
        }

        for (key, reg_number, handle) in handles {
            match handle.await {
                Ok(Ok(applied)) => {
                    outcome.succeeded += 1;
                    outcome.applied.push(applied);
                }
                Ok(Err(failure)) => outcome.failures.push(failure),
                Err(e) => {
                    tracing::error!("Batch write task for {} panicked: {}", key, e);
                    let failure = RecordFailure::new(key, ErrorKind::Internal, e.to_string());
                    outcome.failures.push(match reg_number {
                        Some(reg) => failure.for_student(reg),
                        None => failure,
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Applies any number of operations in consecutive batches of at most
    /// `max_operations`. For writes the service derives itself, such as a
    /// re-grade touching a whole cohort, where the size limit must not abort
    /// a run whose earlier writes already landed.
    pub async fn apply_chunked(&self, ops: Vec<BatchOperation>) -> Result<BatchOutcome, AppError> {
        let chunk_size = self.max_operations.max(1);
        let mut outcome = BatchOutcome::default();
        let mut ops = ops.into_iter().peekable();

        while ops.peek().is_some() {
            let chunk: Vec<BatchOperation> = ops.by_ref().take(chunk_size).collect();
            outcome.merge(self.apply_batch(chunk).await?);
        }
        Ok(outcome)
    }
}

/// Inserts `new`, or replaces the stored report with the same natural key.
/// The flag is true when a record was created.
pub async fn upsert_report(
    store: &dyn ExamStore,
    new: &NewStudentReport,
) -> Result<(StudentReport, bool), AppError> {
    match store.insert_report(new).await {
        Ok(report) => Ok((report, true)),
        Err(AppError::Conflict(_)) => {
            let existing = store
                .find_report_by_key(&new.key())
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Report {} not found", new.key())))?;
            let mut replacement = StudentReport::from_new(existing.id, existing.version, new.clone());
            replacement.created_at = existing.created_at;
            let stored = store.replace_report(&replacement, existing.version).await?;
            tracing::debug!("Report {} existed, updated in place", new.key());
            Ok((stored, false))
        }
        Err(e) => Err(e),
    }
}

async fn apply_one(store: &dyn ExamStore, op: &BatchOperation) -> Result<Applied, AppError> {
    match op {
        BatchOperation::UpsertReport(new) => upsert_report(store, new)
            .await
            .map(|(report, _)| Applied::Report(report)),
        BatchOperation::ReplaceReport {
            report,
            expected_version,
        } => store
            .replace_report(report, *expected_version)
            .await
            .map(Applied::Report),
        BatchOperation::PutAnswerKeyEntry {
            answer_key_id,
            entry,
        } => store
            .put_answer_key_entry(*answer_key_id, entry)
            .await
            .map(|entry| Applied::Entry {
                answer_key_id: *answer_key_id,
                entry,
            }),
    }
}
