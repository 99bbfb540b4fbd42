// src/store/postgres.rs

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, prelude::FromRow, types::Json};

use super::{ExamStore, LoadedReport};
use crate::{
    error::{AppError, ErrorKind, RecordFailure},
    models::{
        answer_key::{
            AnswerKey, AnswerKeyEntries, AnswerKeyEntry, AnswerKeyFilter, NewAnswerKey,
            TestIdentity,
        },
        marks::MarkScheme,
        student_report::{
            NewStudentReport, ReportFilter, ReportKey, ResponseEntry, SortOrder, StudentReport,
        },
        test::Stream,
    },
};

const KEY_COLUMNS: &str = "id, stream, question_type, test_name, test_date, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, answer_key_id, question_number, correct_options, correct_solution, \
     is_grace, marks, state, revision";

const REPORT_COLUMNS: &str = "id, reg_number, stream, test_name, test_date, marks_type, \
     total_questions, correct_answers, wrong_answers, unattempted, accuracy, percentage, \
     total_marks, percentile, responses, version, created_at, updated_at";

/// Represents a row of the 'answer_keys' table.
#[derive(Debug, FromRow)]
struct AnswerKeyRow {
    id: i64,
    stream: String,
    question_type: String,
    test_name: String,
    test_date: NaiveDate,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

/// Represents a row of the 'answer_key_entries' table.
#[derive(Debug, FromRow)]
struct EntryRow {
    id: i64,
    answer_key_id: i64,
    question_number: i32,
    correct_options: Json<Vec<String>>,
    correct_solution: Option<String>,
    is_grace: bool,
    marks: Option<Json<MarkScheme>>,
    state: String,
    revision: i32,
}

/// Represents a row of the 'student_reports' table.
/// `responses` stays untyped until the row is decoded, so one bad document
/// only spoils its own record.
#[derive(Debug, FromRow)]
struct StudentReportRow {
    id: i64,
    reg_number: String,
    stream: String,
    test_name: String,
    test_date: NaiveDate,
    marks_type: String,
    total_questions: i32,
    correct_answers: i32,
    wrong_answers: i32,
    unattempted: i32,
    accuracy: i32,
    percentage: f64,
    total_marks: i32,
    percentile: f64,
    responses: Json<serde_json::Value>,
    version: i32,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, FromRow)]
struct ReportKeyRow {
    reg_number: String,
    stream: String,
    test_name: String,
    test_date: NaiveDate,
}

impl TryFrom<EntryRow> for AnswerKeyEntry {
    type Error = String;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            question_number: row.question_number,
            correct_options: row.correct_options.0.into_iter().collect(),
            correct_solution: row.correct_solution,
            is_grace: row.is_grace,
            marks: row.marks.map(|m| m.0),
            state: row.state.parse()?,
            revision: row.revision,
        })
    }
}

impl StudentReportRow {
    fn key_label(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.reg_number, self.test_name, self.stream, self.test_date
        )
    }
}

impl TryFrom<StudentReportRow> for StudentReport {
    type Error = String;

    fn try_from(row: StudentReportRow) -> Result<Self, Self::Error> {
        let responses: Vec<ResponseEntry> = serde_json::from_value(row.responses.0)
            .map_err(|e| format!("malformed responses: {}", e))?;

        Ok(Self {
            id: row.id,
            reg_number: row.reg_number,
            stream: row.stream.parse()?,
            test_name: row.test_name,
            date: row.test_date,
            marks_type: row.marks_type,
            total_questions: row.total_questions,
            correct_answers: row.correct_answers,
            wrong_answers: row.wrong_answers,
            unattempted: row.unattempted,
            accuracy: row.accuracy,
            percentage: row.percentage,
            total_marks: row.total_marks,
            percentile: row.percentile,
            responses,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_report(row: StudentReportRow) -> Result<StudentReport, AppError> {
    let label = row.key_label();
    StudentReport::try_from(row)
        .map_err(|e| AppError::InternalServerError(format!("report {}: {}", label, e)))
}

fn assemble_key(row: AnswerKeyRow, entries: Vec<EntryRow>) -> Result<AnswerKey, AppError> {
    let entries = entries
        .into_iter()
        .map(AnswerKeyEntry::try_from)
        .collect::<Result<Vec<_>, _>>()
        .and_then(AnswerKeyEntries::try_from_entries)
        .map_err(|e| AppError::InternalServerError(format!("answer key {}: {}", row.id, e)))?;

    Ok(AnswerKey {
        id: row.id,
        stream: row.stream.parse().map_err(AppError::InternalServerError)?,
        question_type: row
            .question_type
            .parse()
            .map_err(AppError::InternalServerError)?,
        test_name: row.test_name,
        date: row.test_date,
        entries,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

/// `ExamStore` backed by the Postgres schema in `migrations/`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn entries_for(&self, answer_key_ids: &[i64]) -> Result<Vec<EntryRow>, AppError> {
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM answer_key_entries WHERE answer_key_id = ANY($1) ORDER BY question_number",
            ENTRY_COLUMNS
        ))
        .bind(answer_key_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ExamStore for PgStore {
    async fn insert_answer_key(&self, key: NewAnswerKey) -> Result<AnswerKey, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, AnswerKeyRow>(&format!(
            "INSERT INTO answer_keys (stream, question_type, test_name, test_date) \
             VALUES ($1, $2, $3, $4) RETURNING {}",
            KEY_COLUMNS
        ))
        .bind(key.identity.stream.as_str())
        .bind(key.identity.question_type.as_str())
        .bind(&key.identity.test_name)
        .bind(key.identity.date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict(format!(
                "Answer key for {} already exists",
                key.identity
            )),
            other => other,
        })?;

        let mut entry_rows = Vec::with_capacity(key.entries.len());
        for entry in key.entries.iter() {
            let inserted = sqlx::query_as::<_, EntryRow>(&format!(
                "INSERT INTO answer_key_entries \
                 (answer_key_id, question_number, correct_options, correct_solution, is_grace, marks, state, revision) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
                ENTRY_COLUMNS
            ))
            .bind(row.id)
            .bind(entry.question_number)
            .bind(Json(entry.correct_options.iter().collect::<Vec<_>>()))
            .bind(&entry.correct_solution)
            .bind(entry.is_grace)
            .bind(entry.marks.map(Json))
            .bind(entry.state.as_str())
            .bind(entry.revision)
            .fetch_one(&mut *tx)
            .await?;
            entry_rows.push(inserted);
        }

        tx.commit().await?;
        assemble_key(row, entry_rows)
    }

    async fn find_answer_key(&self, id: i64) -> Result<Option<AnswerKey>, AppError> {
        let row = sqlx::query_as::<_, AnswerKeyRow>(&format!(
            "SELECT {} FROM answer_keys WHERE id = $1",
            KEY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entries = self.entries_for(&[row.id]).await?;
        assemble_key(row, entries).map(Some)
    }

    async fn list_answer_keys(&self, filter: &AnswerKeyFilter) -> Result<Vec<AnswerKey>, AppError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM answer_keys WHERE TRUE", KEY_COLUMNS));

        if let Some(stream) = filter.stream {
            builder.push(" AND stream = ");
            builder.push_bind(stream.as_str());
        }
        if let Some(question_type) = filter.question_type {
            builder.push(" AND question_type = ");
            builder.push_bind(question_type.as_str());
        }
        if let Some(test_name) = &filter.test_name {
            builder.push(" AND test_name = ");
            builder.push_bind(test_name.clone());
        }
        if let Some(date) = filter.date {
            builder.push(" AND test_date = ");
            builder.push_bind(date);
        }
        builder.push(" ORDER BY test_date DESC, id DESC");

        let rows: Vec<AnswerKeyRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut grouped: BTreeMap<i64, Vec<EntryRow>> = BTreeMap::new();
        for entry in self.entries_for(&ids).await? {
            grouped.entry(entry.answer_key_id).or_default().push(entry);
        }

        rows.into_iter()
            .map(|row| {
                let entries = grouped.remove(&row.id).unwrap_or_default();
                assemble_key(row, entries)
            })
            .collect()
    }

    async fn update_answer_key_identity(
        &self,
        id: i64,
        identity: &TestIdentity,
    ) -> Result<AnswerKey, AppError> {
        let row = sqlx::query_as::<_, AnswerKeyRow>(&format!(
            "UPDATE answer_keys SET test_name = $1, test_date = $2, stream = $3, question_type = $4, \
             updated_at = NOW() WHERE id = $5 RETURNING {}",
            KEY_COLUMNS
        ))
        .bind(&identity.test_name)
        .bind(identity.date)
        .bind(identity.stream.as_str())
        .bind(identity.question_type.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("Answer key for {} already exists", identity))
            }
            other => other,
        })?
        .ok_or(AppError::NotFound("Answer key not found".to_string()))?;

        let entries = self.entries_for(&[row.id]).await?;
        assemble_key(row, entries)
    }

    async fn delete_answer_key(&self, id: i64) -> Result<bool, AppError> {
        // Entries go with the key through ON DELETE CASCADE.
        let result = sqlx::query("DELETE FROM answer_keys WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_answer_key_entry(
        &self,
        entry_id: i64,
    ) -> Result<Option<(i64, AnswerKeyEntry)>, AppError> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM answer_key_entries WHERE id = $1",
            ENTRY_COLUMNS
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let key_id = row.answer_key_id;
            AnswerKeyEntry::try_from(row)
                .map(|entry| (key_id, entry))
                .map_err(AppError::InternalServerError)
        })
        .transpose()
    }

    async fn put_answer_key_entry(
        &self,
        answer_key_id: i64,
        entry: &AnswerKeyEntry,
    ) -> Result<AnswerKeyEntry, AppError> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query("UPDATE answer_keys SET updated_at = NOW() WHERE id = $1")
            .bind(answer_key_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Answer key {} not found",
                answer_key_id
            )));
        }

        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "INSERT INTO answer_key_entries \
             (answer_key_id, question_number, correct_options, correct_solution, is_grace, marks, state, revision) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (answer_key_id, question_number) DO UPDATE SET \
                correct_options = EXCLUDED.correct_options, \
                correct_solution = EXCLUDED.correct_solution, \
                is_grace = EXCLUDED.is_grace, \
                marks = EXCLUDED.marks, \
                state = EXCLUDED.state, \
                revision = EXCLUDED.revision \
             RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(answer_key_id)
        .bind(entry.question_number)
        .bind(Json(entry.correct_options.iter().collect::<Vec<_>>()))
        .bind(&entry.correct_solution)
        .bind(entry.is_grace)
        .bind(entry.marks.map(Json))
        .bind(entry.state.as_str())
        .bind(entry.revision)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        AnswerKeyEntry::try_from(row).map_err(AppError::InternalServerError)
    }

    async fn delete_answer_key_entry(&self, entry_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM answer_key_entries WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_report(&self, report: &NewStudentReport) -> Result<StudentReport, AppError> {
        let row = sqlx::query_as::<_, StudentReportRow>(&format!(
            "INSERT INTO student_reports \
             (reg_number, stream, test_name, test_date, marks_type, total_questions, correct_answers, \
              wrong_answers, unattempted, accuracy, percentage, total_marks, percentile, responses) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) RETURNING {}",
            REPORT_COLUMNS
        ))
        .bind(&report.reg_number)
        .bind(report.stream.as_str())
        .bind(&report.test_name)
        .bind(report.date)
        .bind(&report.marks_type)
        .bind(report.total_questions)
        .bind(report.correct_answers)
        .bind(report.wrong_answers)
        .bind(report.unattempted)
        .bind(report.accuracy)
        .bind(report.percentage)
        .bind(report.total_marks)
        .bind(report.percentile)
        .bind(Json(&report.responses))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("Report {} already exists", report.key()))
            }
            other => other,
        })?;

        decode_report(row)
    }

    async fn replace_report(
        &self,
        report: &StudentReport,
        expected_version: i32,
    ) -> Result<StudentReport, AppError> {
        // Single-statement replace: readers see either the old or the new row.
        let row = sqlx::query_as::<_, StudentReportRow>(&format!(
            "UPDATE student_reports SET \
                reg_number = $1, stream = $2, test_name = $3, test_date = $4, marks_type = $5, \
                total_questions = $6, correct_answers = $7, wrong_answers = $8, unattempted = $9, \
                accuracy = $10, percentage = $11, total_marks = $12, percentile = $13, responses = $14, \
                version = version + 1, updated_at = NOW() \
             WHERE id = $15 AND version = $16 RETURNING {}",
            REPORT_COLUMNS
        ))
        .bind(&report.reg_number)
        .bind(report.stream.as_str())
        .bind(&report.test_name)
        .bind(report.date)
        .bind(&report.marks_type)
        .bind(report.total_questions)
        .bind(report.correct_answers)
        .bind(report.wrong_answers)
        .bind(report.unattempted)
        .bind(report.accuracy)
        .bind(report.percentage)
        .bind(report.total_marks)
        .bind(report.percentile)
        .bind(Json(&report.responses))
        .bind(report.id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("Report {} already exists", report.key()))
            }
            other => other,
        })?;

        if let Some(row) = row {
            return decode_report(row);
        }

        let current: Option<i32> =
            sqlx::query_scalar("SELECT version FROM student_reports WHERE id = $1")
                .bind(report.id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(AppError::NotFound(format!("Report {} not found", report.key()))),
            Some(version) => Err(AppError::Conflict(format!(
                "Report {} was modified concurrently (version {} != {})",
                report.key(),
                version,
                expected_version
            ))),
        }
    }

    async fn find_report(&self, id: i64) -> Result<Option<StudentReport>, AppError> {
        sqlx::query_as::<_, StudentReportRow>(&format!(
            "SELECT {} FROM student_reports WHERE id = $1",
            REPORT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(decode_report)
        .transpose()
    }

    async fn find_report_by_key(&self, key: &ReportKey) -> Result<Option<StudentReport>, AppError> {
        sqlx::query_as::<_, StudentReportRow>(&format!(
            "SELECT {} FROM student_reports \
             WHERE reg_number = $1 AND test_name = $2 AND stream = $3 AND test_date = $4",
            REPORT_COLUMNS
        ))
        .bind(&key.reg_number)
        .bind(&key.test_name)
        .bind(key.stream.as_str())
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await?
        .map(decode_report)
        .transpose()
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StudentReport>, AppError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM student_reports WHERE TRUE", REPORT_COLUMNS));

        if let Some(reg_number) = &filter.reg_number {
            builder.push(" AND reg_number = ");
            builder.push_bind(reg_number.clone());
        }
        if let Some(test_name) = &filter.test_name {
            builder.push(" AND test_name = ");
            builder.push_bind(test_name.clone());
        }
        if let Some(stream) = filter.stream {
            builder.push(" AND stream = ");
            builder.push_bind(stream.as_str());
        }
        if let Some(date) = filter.date {
            builder.push(" AND test_date = ");
            builder.push_bind(date);
        }
        if let Some(min) = filter.min_accuracy {
            builder.push(" AND accuracy >= ");
            builder.push_bind(min);
        }
        if let Some(max) = filter.max_accuracy {
            builder.push(" AND accuracy <= ");
            builder.push_bind(max);
        }

        let direction = match filter.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        builder.push(format!(
            " ORDER BY {col} {dir}, id {dir}",
            col = filter.sort_by.column(),
            dir = direction
        ));

        let rows: Vec<StudentReportRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(decode_report).collect()
    }

    async fn load_reports_for_test(
        &self,
        test_name: &str,
        stream: Stream,
        date: NaiveDate,
    ) -> Result<Vec<LoadedReport>, AppError> {
        let rows = sqlx::query_as::<_, StudentReportRow>(&format!(
            "SELECT {} FROM student_reports \
             WHERE test_name = $1 AND stream = $2 AND test_date = $3 ORDER BY reg_number",
            REPORT_COLUMNS
        ))
        .bind(test_name)
        .bind(stream.as_str())
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let label = row.key_label();
                let reg_number = row.reg_number.clone();
                StudentReport::try_from(row).map_err(|reason| {
                    RecordFailure::new(label, ErrorKind::Validation, reason).for_student(reg_number)
                })
            })
            .collect())
    }

    async fn existing_report_keys(&self, keys: &[ReportKey]) -> Result<Vec<ReportKey>, AppError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT reg_number, stream, test_name, test_date FROM student_reports \
             WHERE (reg_number, test_name, stream, test_date) IN (",
        );
        builder.push_tuples(keys, |mut b, key| {
            b.push_bind(key.reg_number.clone())
                .push_bind(key.test_name.clone())
                .push_bind(key.stream.as_str())
                .push_bind(key.date);
        });
        builder.push(")");

        let rows: Vec<ReportKeyRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        let found: BTreeSet<ReportKey> = rows
            .into_iter()
            .map(|row| {
                Ok(ReportKey {
                    reg_number: row.reg_number,
                    test_name: row.test_name,
                    stream: row.stream.parse().map_err(AppError::InternalServerError)?,
                    date: row.test_date,
                })
            })
            .collect::<Result<_, AppError>>()?;

        // Preserve the caller's order.
        Ok(keys.iter().filter(|k| found.contains(k)).cloned().collect())
    }

    async fn delete_report(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM student_reports WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
