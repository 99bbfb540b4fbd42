// src/grading/engine.rs

use std::{collections::BTreeSet, sync::Arc};

use serde::Serialize;

use super::recompute::{KeyDelta, recompute};
use crate::{
    error::{AppError, ErrorKind, RecordFailure},
    gateway::{BatchOperation, BatchOutcome, BulkGateway},
    models::{
        answer_key::{
            AnswerKey, AnswerKeyEntry, CorrectionOutcome, EntryInput, EntryState, TestIdentity,
            check_entry_for_type,
        },
        marks::MarkScheme,
        student_report::{NewStudentReport, StudentReport},
    },
    store::ExamStore,
};

/// Outcome of re-grading every report of one test after a key correction.
#[derive(Debug, Serialize)]
pub struct RegenerationResult {
    pub answer_key_id: i64,
    pub test: TestIdentity,
    /// Question numbers whose key value changed in this run.
    pub corrected_questions: Vec<i32>,
    /// Reports found for the test.
    pub matched: usize,
    pub updated_count: usize,
    pub unchanged: usize,
    pub failures: Vec<RecordFailure>,
    /// Snapshot of every report written by this run.
    pub reports: Vec<StudentReport>,
}

/// Outcome of the combined answer-key-and-reports batch.
#[derive(Debug, Serialize)]
pub struct BulkUpdateResult {
    pub answer_key_id: i64,
    #[serde(flatten)]
    pub batch: BatchOutcome,
    /// Present when a published entry changed and reports were re-graded.
    pub regeneration: Option<RegenerationResult>,
}

/// Grading Reconciliation Engine.
///
/// Loads the key and every report of its test, re-grades each report on its
/// own through `recompute`, and hands the changed records to the gateway.
#[derive(Clone)]
pub struct RegenerationEngine {
    store: Arc<dyn ExamStore>,
    gateway: BulkGateway,
    fallback_marks: MarkScheme,
}

impl RegenerationEngine {
    pub fn new(store: Arc<dyn ExamStore>, gateway: BulkGateway, fallback_marks: MarkScheme) -> Self {
        Self {
            store,
            gateway,
            fallback_marks,
        }
    }

    /// Applies `corrections` and `grace_questions` to answer key `answer_key_id`
    /// and re-grades every report of that test.
    ///
    /// Input problems are rejected before any record is touched. After that,
    /// a record that cannot be re-graded or written is listed in `failures`
    /// and the remaining records are still processed.
    pub async fn regenerate(
        &self,
        answer_key_id: i64,
        corrections: &[EntryInput],
        grace_questions: &[i32],
    ) -> Result<RegenerationResult, AppError> {
        if let Some(bad) = grace_questions.iter().find(|&&q| q < 1) {
            return Err(AppError::Validation(format!(
                "malformed grace question number {}",
                bad
            )));
        }

        let mut key = self
            .store
            .find_answer_key(answer_key_id)
            .await?
            .ok_or_else(|| {
                AppError::Validation(format!("answer key {} does not exist", answer_key_id))
            })?;

        let mut seen = BTreeSet::new();
        for correction in corrections {
            if !seen.insert(correction.question_number) {
                return Err(AppError::Validation(format!(
                    "question {} is corrected more than once",
                    correction.question_number
                )));
            }
            if !key.entries.contains(correction.question_number) {
                return Err(AppError::Validation(format!(
                    "question {} is not part of answer key {}",
                    correction.question_number, answer_key_id
                )));
            }
            check_entry_for_type(key.question_type, correction).map_err(AppError::Validation)?;
        }

        let original = key.clone();
        let mut changed_entries = Vec::new();
        for correction in corrections {
            if let Some(entry) = key.entries.get_mut(correction.question_number) {
                if entry.apply_correction(correction) != CorrectionOutcome::Unchanged {
                    changed_entries.push(entry.question_number);
                }
            }
        }
        // Grace numbers absent from the key are ignored.
        for &number in grace_questions {
            if let Some(entry) = key.entries.get_mut(number) {
                if entry.grant_grace() && !changed_entries.contains(&number) {
                    changed_entries.push(number);
                }
            }
        }

        let mut failures = Vec::new();
        let mut corrected_questions = Vec::new();
        if !changed_entries.is_empty() {
            let ops = changed_entries
                .iter()
                .filter_map(|&q| key.entries.get(q))
                .map(|entry| BatchOperation::PutAnswerKeyEntry {
                    answer_key_id,
                    entry: entry.clone(),
                })
                .collect();
            let outcome = self.gateway.apply_chunked(ops).await?;

            let persisted: BTreeSet<i32> =
                outcome.entries().map(|(_, e)| e.question_number).collect();
            for &number in &changed_entries {
                if persisted.contains(&number) {
                    corrected_questions.push(number);
                } else if let Some(previous) = original.entries.get(number) {
                    // Grade against what is actually stored.
                    key.entries.put(previous.clone());
                }
            }
            failures.extend(outcome.failures);
        }
        corrected_questions.sort_unstable();

        let mut result = self.regrade_reports(&key).await?;
        result.corrected_questions = corrected_questions;
        failures.append(&mut result.failures);
        result.failures = failures;

        tracing::info!(
            "Regenerated answer key {} ({}): {} matched, {} updated, {} unchanged, {} failed",
            answer_key_id,
            result.test,
            result.matched,
            result.updated_count,
            result.unchanged,
            result.failures.len()
        );
        Ok(result)
    }

    async fn regrade_reports(&self, key: &AnswerKey) -> Result<RegenerationResult, AppError> {
        let delta = KeyDelta::from_answer_key(key);
        let loaded = self
            .store
            .load_reports_for_test(&key.test_name, key.stream, key.date)
            .await?;

        let mut result = RegenerationResult {
            answer_key_id: key.id,
            test: key.identity(),
            corrected_questions: Vec::new(),
            matched: loaded.len(),
            updated_count: 0,
            unchanged: 0,
            failures: Vec::new(),
            reports: Vec::new(),
        };

        let mut ops = Vec::new();
        for record in loaded {
            let report = match record {
                Ok(report) => report,
                Err(failure) => {
                    tracing::warn!("Skipping undecodable report {}: {}", failure.key, failure.reason);
                    result.failures.push(failure);
                    continue;
                }
            };

            match recompute(&report, &delta, self.fallback_marks) {
                Ok(out) if out.is_changed() => {
                    tracing::debug!(
                        "Report {} re-graded: {} flips, {} snapshots refreshed",
                        report.key(),
                        out.flips.len(),
                        out.refreshed
                    );
                    ops.push(BatchOperation::ReplaceReport {
                        report: out.report,
                        expected_version: report.version,
                    });
                }
                Ok(_) => result.unchanged += 1,
                Err(e) => {
                    tracing::warn!("Cannot re-grade report {}: {}", report.key(), e);
                    result.failures.push(
                        RecordFailure::new(report.key().to_string(), ErrorKind::Validation, e.to_string())
                            .for_student(&report.reg_number),
                    );
                }
            }
        }

        // A cohort may be larger than one batch.
        let outcome = self.gateway.apply_chunked(ops).await?;
        result.updated_count = outcome.succeeded;
        result.reports = outcome.reports().cloned().collect();
        result.reports.sort_by(|a, b| a.reg_number.cmp(&b.reg_number));
        result.failures.extend(outcome.failures);
        Ok(result)
    }

    /// Combined batch: upserts answer key entries and reports for one key, then
    /// re-grades if a published entry was corrected.
    ///
    /// Entries and reports that fail validation are reported per record; only
    /// an unknown key or an oversized batch rejects the whole request.
    pub async fn bulk_update(
        &self,
        answer_key_id: i64,
        entries: &[EntryInput],
        reports: Vec<NewStudentReport>,
    ) -> Result<BulkUpdateResult, AppError> {
        let key = self
            .store
            .find_answer_key(answer_key_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Answer key {} not found", answer_key_id)))?;

        let key_is_published = key.entries.iter().any(|e| e.state.is_published());
        let mut outcome = BatchOutcome::default();
        let mut ops = Vec::new();
        let mut corrected = false;
        let mut seen = BTreeSet::new();

        for input in entries {
            let label = format!("answer_key:{}/Q{}", answer_key_id, input.question_number);
            if !seen.insert(input.question_number) {
                outcome.reject(RecordFailure::new(
                    label,
                    ErrorKind::Validation,
                    "question listed more than once",
                ));
                continue;
            }
            if let Err(errs) = validator::Validate::validate(input) {
                outcome.reject(RecordFailure::new(label, ErrorKind::Validation, errs.to_string()));
                continue;
            }
            if let Err(reason) = check_entry_for_type(key.question_type, input) {
                outcome.reject(RecordFailure::new(label, ErrorKind::Validation, reason));
                continue;
            }

            let entry = match key.entries.get(input.question_number) {
                Some(existing) => {
                    let mut entry = existing.clone();
                    match entry.apply_correction(input) {
                        CorrectionOutcome::Unchanged => continue,
                        CorrectionOutcome::Corrected => corrected = true,
                        CorrectionOutcome::Replaced => {}
                    }
                    entry
                }
                None => {
                    let mut entry = AnswerKeyEntry::from_input(input);
                    if key_is_published {
                        entry.publish();
                    }
                    entry
                }
            };
            ops.push(BatchOperation::PutAnswerKeyEntry {
                answer_key_id,
                entry,
            });
        }

        for report in reports {
            let label = report.key().to_string();
            if let Err(errs) = validator::Validate::validate(&report) {
                outcome.reject(
                    RecordFailure::new(label, ErrorKind::Validation, errs.to_string())
                        .for_student(&report.reg_number),
                );
                continue;
            }
            if report.test_name != key.test_name || report.stream != key.stream || report.date != key.date {
                outcome.reject(
                    RecordFailure::new(label, ErrorKind::Validation, "report belongs to a different test")
                        .for_student(&report.reg_number),
                );
                continue;
            }
            ops.push(BatchOperation::UpsertReport(report));
        }

        outcome.merge(self.gateway.apply_batch(ops).await?);

        let corrected_persisted = corrected
            && outcome
                .entries()
                .any(|(_, e)| e.state == EntryState::Corrected);
        let regeneration = if corrected_persisted {
            Some(self.regenerate(answer_key_id, &[], &[]).await?)
        } else {
            None
        };

        tracing::info!(
            "Bulk update of answer key {}: {}/{} operations applied",
            answer_key_id,
            outcome.succeeded,
            outcome.attempted
        );

        Ok(BulkUpdateResult {
            answer_key_id,
            batch: outcome,
            regeneration,
        })
    }
}
