// src/models/student_report.rs

use std::{collections::BTreeSet, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{marks::MAX_MARKS, test::Stream};

/// One question of a student's graded sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEntry {
    pub question_number: i32,
    /// Absent when the student left the question blank.
    #[serde(default)]
    pub marked_option: Option<String>,
    /// Copy of the answer key's correct options at the time of last grading.
    #[serde(default, alias = "correct_option")]
    pub correct_options: BTreeSet<String>,
    pub is_correct: bool,
    /// Whether the question was graced at the time of last grading.
    #[serde(default)]
    pub grace_snapshot: bool,
}

impl ResponseEntry {
    pub fn is_attempted(&self) -> bool {
        self.marked_option
            .as_deref()
            .is_some_and(|opt| !opt.trim().is_empty())
    }
}

/// Natural key of a report: (regNumber, testName, stream, date).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportKey {
    pub reg_number: String,
    pub test_name: String,
    pub stream: Stream,
    pub date: NaiveDate,
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.reg_number, self.test_name, self.stream, self.date
        )
    }
}

/// Represents the 'student_reports' table: one student's outcome for one test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentReport {
    pub id: i64,
    pub reg_number: String,
    pub stream: Stream,
    pub test_name: String,
    pub date: NaiveDate,
    /// Scoring scheme of the test, e.g. "+4/-1".
    pub marks_type: String,
    pub total_questions: i32,
    pub correct_answers: i32,
    pub wrong_answers: i32,
    pub unattempted: i32,
    pub accuracy: i32,
    pub percentage: f64,
    pub total_marks: i32,
    pub percentile: f64,
    pub responses: Vec<ResponseEntry>,
    /// Bumped on every write; replaces are conditional on it.
    pub version: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StudentReport {
    pub fn key(&self) -> ReportKey {
        ReportKey {
            reg_number: self.reg_number.clone(),
            test_name: self.test_name.clone(),
            stream: self.stream,
            date: self.date,
        }
    }

    /// `correct + wrong + unattempted == total`.
    pub fn is_conserved(&self) -> bool {
        counts_add_up(
            self.correct_answers,
            self.wrong_answers,
            self.unattempted,
            self.total_questions,
        )
    }

    /// Builds a stored report from an accepted submission.
    pub fn from_new(id: i64, version: i32, new: NewStudentReport) -> Self {
        let now = Utc::now();
        Self {
            id,
            reg_number: new.reg_number,
            stream: new.stream,
            test_name: new.test_name,
            date: new.date,
            marks_type: new.marks_type,
            total_questions: new.total_questions,
            correct_answers: new.correct_answers,
            wrong_answers: new.wrong_answers,
            unattempted: new.unattempted,
            accuracy: new.accuracy,
            percentage: new.percentage,
            total_marks: new.total_marks,
            percentile: new.percentile,
            responses: new.responses,
            version,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }
}

/// Summed in i64 so stored counters of any size cannot overflow.
fn counts_add_up(correct: i32, wrong: i32, unattempted: i32, total: i32) -> bool {
    i64::from(correct) + i64::from(wrong) + i64::from(unattempted) == i64::from(total)
}

/// `round(correct / total * 100)`, zero for an empty test.
pub fn accuracy(correct_answers: i32, total_questions: i32) -> i32 {
    if total_questions <= 0 {
        return 0;
    }
    (f64::from(correct_answers) / f64::from(total_questions) * 100.0).round() as i32
}

/// Upper bound on questions per test sitting, matching the answer key entry range.
pub const MAX_QUESTIONS: i32 = 10_000;

/// Largest total a submission may carry: every question at the highest mark.
pub const MAX_TOTAL_MARKS: i32 = MAX_QUESTIONS * MAX_MARKS;
pub const MIN_TOTAL_MARKS: i32 = -MAX_TOTAL_MARKS;

/// DTO for submitting a graded report. The caller computes every aggregate.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = validate_report_shape))]
pub struct NewStudentReport {
    #[validate(length(min = 1, max = 50))]
    pub reg_number: String,
    pub stream: Stream,
    #[validate(length(min = 1, max = 200))]
    pub test_name: String,
    pub date: NaiveDate,
    #[validate(length(max = 20))]
    #[serde(default)]
    pub marks_type: String,
    #[validate(range(min = 0, max = MAX_QUESTIONS))]
    pub total_questions: i32,
    #[validate(range(min = 0, max = MAX_QUESTIONS))]
    pub correct_answers: i32,
    #[validate(range(min = 0, max = MAX_QUESTIONS))]
    pub wrong_answers: i32,
    #[validate(range(min = 0, max = MAX_QUESTIONS))]
    pub unattempted: i32,
    #[validate(range(min = 0, max = 100))]
    pub accuracy: i32,
    #[validate(range(min = 0.0, max = 100.0))]
    pub percentage: f64,
    #[validate(range(min = MIN_TOTAL_MARKS, max = MAX_TOTAL_MARKS))]
    pub total_marks: i32,
    #[validate(range(min = 0.0, max = 100.0))]
    pub percentile: f64,
    #[serde(default)]
    pub responses: Vec<ResponseEntry>,
}

impl NewStudentReport {
    pub fn key(&self) -> ReportKey {
        ReportKey {
            reg_number: self.reg_number.clone(),
            test_name: self.test_name.clone(),
            stream: self.stream,
            date: self.date,
        }
    }
}

fn validate_report_shape(report: &NewStudentReport) -> Result<(), validator::ValidationError> {
    if !counts_add_up(
        report.correct_answers,
        report.wrong_answers,
        report.unattempted,
        report.total_questions,
    ) {
        return Err(validator::ValidationError::new("counts_do_not_sum_to_total"));
    }
    let mut seen = BTreeSet::new();
    for response in &report.responses {
        if response.question_number < 1 {
            return Err(validator::ValidationError::new("invalid_question_number"));
        }
        if !seen.insert(response.question_number) {
            return Err(validator::ValidationError::new("duplicate_response"));
        }
    }
    Ok(())
}

/// Projection returned when listing one student's history.
#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub id: i64,
    pub test_name: String,
    pub date: NaiveDate,
    pub correct_answers: i32,
    pub wrong_answers: i32,
    pub unattempted: i32,
    pub total_marks: i32,
    pub percentile: f64,
    pub accuracy: i32,
}

impl From<&StudentReport> for ReportSummary {
    fn from(r: &StudentReport) -> Self {
        Self {
            id: r.id,
            test_name: r.test_name.clone(),
            date: r.date,
            correct_answers: r.correct_answers,
            wrong_answers: r.wrong_answers,
            unattempted: r.unattempted,
            total_marks: r.total_marks,
            percentile: r.percentile,
            accuracy: r.accuracy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportSortField {
    #[default]
    Date,
    TotalMarks,
    Accuracy,
    Percentile,
    RegNumber,
}

impl ReportSortField {
    pub fn column(&self) -> &'static str {
        match self {
            ReportSortField::Date => "test_date",
            ReportSortField::TotalMarks => "total_marks",
            ReportSortField::Accuracy => "accuracy",
            ReportSortField::Percentile => "percentile",
            ReportSortField::RegNumber => "reg_number",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Query-string filters for listing reports.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ReportFilter {
    pub reg_number: Option<String>,
    pub test_name: Option<String>,
    pub stream: Option<Stream>,
    pub date: Option<NaiveDate>,
    pub min_accuracy: Option<i32>,
    pub max_accuracy: Option<i32>,
    #[serde(default)]
    pub sort_by: ReportSortField,
    #[serde(default)]
    pub order: SortOrder,
}

impl ReportFilter {
    /// Every report of one test sitting, regardless of student.
    pub fn for_test(test_name: &str, stream: Stream, date: NaiveDate) -> Self {
        Self {
            test_name: Some(test_name.to_string()),
            stream: Some(stream),
            date: Some(date),
            sort_by: ReportSortField::RegNumber,
            order: SortOrder::Asc,
            ..Default::default()
        }
    }

    pub fn matches(&self, r: &StudentReport) -> bool {
        self.reg_number.as_deref().is_none_or(|v| v == r.reg_number)
            && self.test_name.as_deref().is_none_or(|v| v == r.test_name)
            && self.stream.is_none_or(|v| v == r.stream)
            && self.date.is_none_or(|v| v == r.date)
            && self.min_accuracy.is_none_or(|v| r.accuracy >= v)
            && self.max_accuracy.is_none_or(|v| r.accuracy <= v)
    }

    /// Orders reports in memory the same way the SQL store's ORDER BY does.
    pub fn sort(&self, reports: &mut [StudentReport]) {
        reports.sort_by(|a, b| {
            let ord = match self.sort_by {
                ReportSortField::Date => a.date.cmp(&b.date),
                ReportSortField::TotalMarks => a.total_marks.cmp(&b.total_marks),
                ReportSortField::Accuracy => a.accuracy.cmp(&b.accuracy),
                ReportSortField::Percentile => a.percentile.total_cmp(&b.percentile),
                ReportSortField::RegNumber => a.reg_number.cmp(&b.reg_number),
            }
            .then_with(|| a.id.cmp(&b.id));
            match self.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }
}

/// DTO for replacing a stored report by id.
#[derive(Debug, Deserialize, Validate)]
pub struct ReplaceStudentReportRequest {
    #[serde(flatten)]
    #[validate(nested)]
    pub report: NewStudentReport,
    /// Version the caller last read. Omitted means "whatever is stored now".
    pub expected_version: Option<i32>,
}

/// DTO for a batch of report submissions.
#[derive(Debug, Deserialize)]
pub struct BulkReportsRequest {
    pub reports: Vec<NewStudentReport>,
}

/// DTO for asking which reports already exist.
#[derive(Debug, Deserialize)]
pub struct CheckExistingRequest {
    pub keys: Vec<ReportKey>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_rounds_half_up() {
        assert_eq!(accuracy(7, 10), 70);
        assert_eq!(accuracy(2, 3), 67);
        assert_eq!(accuracy(1, 8), 13);
        assert_eq!(accuracy(0, 0), 0);
    }

    #[test]
    fn blank_marked_option_counts_as_unattempted() {
        let entry = ResponseEntry {
            question_number: 1,
            marked_option: Some("  ".into()),
            correct_options: BTreeSet::new(),
            is_correct: false,
            grace_snapshot: false,
        };
        assert!(!entry.is_attempted());
    }

    #[test]
    fn legacy_single_option_snapshot_is_accepted() {
        let entry: ResponseEntry = serde_json::from_value(serde_json::json!({
            "question_number": 2,
            "marked_option": "B",
            "correct_option": ["A"],
            "is_correct": false
        }))
        .unwrap();
        assert!(entry.correct_options.contains("A"));
        assert!(!entry.grace_snapshot);
    }

    fn submission(correct: i32, wrong: i32, unattempted: i32, total: i32) -> NewStudentReport {
        NewStudentReport {
            reg_number: "REG-1".to_string(),
            stream: Stream::Puc,
            test_name: "Unit".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            marks_type: "+4/-1".to_string(),
            total_questions: total,
            correct_answers: correct,
            wrong_answers: wrong,
            unattempted,
            accuracy: 0,
            percentage: 0.0,
            total_marks: 0,
            percentile: 0.0,
            responses: Vec::new(),
        }
    }

    #[test]
    fn counters_must_add_up() {
        assert!(submission(7, 3, 0, 10).validate().is_ok());
        assert!(submission(7, 3, 1, 10).validate().is_err());
    }

    #[test]
    fn huge_counters_are_rejected_without_overflow() {
        assert!(submission(i32::MAX, i32::MAX, 2, 0).validate().is_err());
        assert!(!counts_add_up(i32::MAX, 1, 0, i32::MIN));
    }
}
