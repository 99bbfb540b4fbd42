// src/store/memory.rs

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{ExamStore, LoadedReport};
use crate::{
    error::AppError,
    models::{
        answer_key::{AnswerKey, AnswerKeyEntry, AnswerKeyFilter, NewAnswerKey, TestIdentity},
        student_report::{NewStudentReport, ReportFilter, ReportKey, StudentReport},
        test::Stream,
    },
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    answer_keys: BTreeMap<i64, AnswerKey>,
    reports: BTreeMap<i64, StudentReport>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn identity_taken(&self, identity: &TestIdentity, except: Option<i64>) -> bool {
        self.answer_keys
            .values()
            .any(|k| Some(k.id) != except && k.identity() == *identity)
    }

    fn report_key_taken(&self, key: &ReportKey, except: Option<i64>) -> bool {
        self.reports
            .values()
            .any(|r| Some(r.id) != except && r.key() == *key)
    }
}

/// Process-local store with the same uniqueness and versioning rules as the
/// Postgres schema. Used when no database is configured, and by the tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExamStore for MemoryStore {
    async fn insert_answer_key(&self, key: NewAnswerKey) -> Result<AnswerKey, AppError> {
        let mut inner = self.inner.write().await;
        if inner.identity_taken(&key.identity, None) {
            return Err(AppError::Conflict(format!(
                "Answer key for {} already exists",
                key.identity
            )));
        }

        let id = inner.next_id();
        let mut entries = key.entries;
        for entry in entries.iter_mut() {
            entry.id = inner.next_id();
        }

        let now = Utc::now();
        let stored = AnswerKey {
            id,
            stream: key.identity.stream,
            question_type: key.identity.question_type,
            test_name: key.identity.test_name,
            date: key.identity.date,
            entries,
            created_at: Some(now),
            updated_at: Some(now),
        };
        inner.answer_keys.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_answer_key(&self, id: i64) -> Result<Option<AnswerKey>, AppError> {
        Ok(self.inner.read().await.answer_keys.get(&id).cloned())
    }

    async fn list_answer_keys(&self, filter: &AnswerKeyFilter) -> Result<Vec<AnswerKey>, AppError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<AnswerKey> = inner
            .answer_keys
            .values()
            .filter(|k| filter.matches(k))
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| b.id.cmp(&a.id)));
        Ok(keys)
    }

    async fn update_answer_key_identity(
        &self,
        id: i64,
        identity: &TestIdentity,
    ) -> Result<AnswerKey, AppError> {
        let mut inner = self.inner.write().await;
        if !inner.answer_keys.contains_key(&id) {
            return Err(AppError::NotFound("Answer key not found".to_string()));
        }
        if inner.identity_taken(identity, Some(id)) {
            return Err(AppError::Conflict(format!(
                "Answer key for {} already exists",
                identity
            )));
        }

        let key = inner
            .answer_keys
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound("Answer key not found".to_string()))?;
        key.test_name = identity.test_name.clone();
        key.date = identity.date;
        key.stream = identity.stream;
        key.question_type = identity.question_type;
        key.updated_at = Some(Utc::now());
        Ok(key.clone())
    }

    async fn delete_answer_key(&self, id: i64) -> Result<bool, AppError> {
        Ok(self.inner.write().await.answer_keys.remove(&id).is_some())
    }

    async fn find_answer_key_entry(
        &self,
        entry_id: i64,
    ) -> Result<Option<(i64, AnswerKeyEntry)>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner.answer_keys.values().find_map(|k| {
            k.entries
                .iter()
                .find(|e| e.id == entry_id)
                .map(|e| (k.id, e.clone()))
        }))
    }

    async fn put_answer_key_entry(
        &self,
        answer_key_id: i64,
        entry: &AnswerKeyEntry,
    ) -> Result<AnswerKeyEntry, AppError> {
        let mut inner = self.inner.write().await;
        let fresh_id = inner.next_id();
        let key = inner
            .answer_keys
            .get_mut(&answer_key_id)
            .ok_or_else(|| AppError::NotFound(format!("Answer key {} not found", answer_key_id)))?;

        let mut stored = entry.clone();
        stored.id = key
            .entries
            .get(entry.question_number)
            .map(|existing| existing.id)
            .unwrap_or(fresh_id);
        key.entries.put(stored.clone());
        key.updated_at = Some(Utc::now());
        Ok(stored)
    }

    async fn delete_answer_key_entry(&self, entry_id: i64) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        for key in inner.answer_keys.values_mut() {
            let Some(number) = key
                .entries
                .iter()
                .find(|e| e.id == entry_id)
                .map(|e| e.question_number)
            else {
                continue;
            };
            key.entries.remove(number);
            key.updated_at = Some(Utc::now());
            return Ok(true);
        }
        Ok(false)
    }

    async fn insert_report(&self, report: &NewStudentReport) -> Result<StudentReport, AppError> {
        let mut inner = self.inner.write().await;
        let key = report.key();
        if inner.report_key_taken(&key, None) {
            return Err(AppError::Conflict(format!("Report {} already exists", key)));
        }
        let id = inner.next_id();
        let stored = StudentReport::from_new(id, 1, report.clone());
        inner.reports.insert(id, stored.clone());
        Ok(stored)
    }

    async fn replace_report(
        &self,
        report: &StudentReport,
        expected_version: i32,
    ) -> Result<StudentReport, AppError> {
        let mut inner = self.inner.write().await;
        let current_version = inner
            .reports
            .get(&report.id)
            .map(|r| r.version)
            .ok_or_else(|| AppError::NotFound(format!("Report {} not found", report.key())))?;

        if current_version != expected_version {
            return Err(AppError::Conflict(format!(
                "Report {} was modified concurrently (version {} != {})",
                report.key(),
                current_version,
                expected_version
            )));
        }
        if inner.report_key_taken(&report.key(), Some(report.id)) {
            return Err(AppError::Conflict(format!(
                "Report {} already exists",
                report.key()
            )));
        }

        let mut stored = report.clone();
        stored.version = expected_version + 1;
        stored.updated_at = Some(Utc::now());
        if let Some(previous) = inner.reports.get(&report.id) {
            stored.created_at = previous.created_at;
        }
        inner.reports.insert(report.id, stored.clone());
        Ok(stored)
    }

    async fn find_report(&self, id: i64) -> Result<Option<StudentReport>, AppError> {
        Ok(self.inner.read().await.reports.get(&id).cloned())
    }

    async fn find_report_by_key(&self, key: &ReportKey) -> Result<Option<StudentReport>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner.reports.values().find(|r| r.key() == *key).cloned())
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StudentReport>, AppError> {
        let inner = self.inner.read().await;
        let mut reports: Vec<StudentReport> = inner
            .reports
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        filter.sort(&mut reports);
        Ok(reports)
    }

    async fn load_reports_for_test(
        &self,
        test_name: &str,
        stream: Stream,
        date: NaiveDate,
    ) -> Result<Vec<LoadedReport>, AppError> {
        let filter = ReportFilter::for_test(test_name, stream, date);
        Ok(self.list_reports(&filter).await?.into_iter().map(Ok).collect())
    }

    async fn existing_report_keys(&self, keys: &[ReportKey]) -> Result<Vec<ReportKey>, AppError> {
        let inner = self.inner.read().await;
        Ok(keys
            .iter()
            .filter(|k| inner.report_key_taken(k, None))
            .cloned()
            .collect())
    }

    async fn delete_report(&self, id: i64) -> Result<bool, AppError> {
        Ok(self.inner.write().await.reports.remove(&id).is_some())
    }
}
