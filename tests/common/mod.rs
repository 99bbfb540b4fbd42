// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;

use chrono::NaiveDate;
use exam_backend::{
    config::Config,
    gateway::BulkGateway,
    grading::RegenerationEngine,
    models::{
        answer_key::{AnswerKey, AnswerKeyEntries, AnswerKeyEntry, EntryInput, NewAnswerKey, TestIdentity},
        marks::MarkScheme,
        student_report::{NewStudentReport, ResponseEntry},
        test::{QuestionType, Stream},
    },
    store::{ExamStore, MemoryStore},
};

pub const QUESTIONS: i32 = 10;

pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 9).unwrap()
}

pub fn test_config() -> Config {
    Config {
        database_url: None,
        jwt_secret: "test_secret_for_integration_tests".to_string(),
        rust_log: "error".to_string(),
        port: 0,
        write_concurrency: 4,
        max_batch_operations: 100,
        default_marks: MarkScheme::default(),
    }
}

pub fn memory_store() -> Arc<dyn ExamStore> {
    Arc::new(MemoryStore::new())
}

pub fn engine(store: &Arc<dyn ExamStore>) -> RegenerationEngine {
    let gateway = BulkGateway::new(store.clone(), 4, 100);
    RegenerationEngine::new(store.clone(), gateway, MarkScheme::default())
}

pub fn entry_input(question_number: i32, options: &[&str]) -> EntryInput {
    EntryInput {
        question_number,
        correct_options: options.iter().map(|s| s.to_string()).collect(),
        correct_solution: None,
        is_grace: false,
        marks: None,
    }
}

/// A published MCQ key where every question's answer is "A".
pub async fn published_key(store: &Arc<dyn ExamStore>, test_name: &str) -> AnswerKey {
    let entries = (1..=QUESTIONS)
        .map(|q| {
            let mut entry = AnswerKeyEntry::from_input(&entry_input(q, &["A"]));
            entry.publish();
            entry
        })
        .collect();
    store
        .insert_answer_key(NewAnswerKey {
            identity: TestIdentity {
                test_name: test_name.to_string(),
                date: test_date(),
                stream: Stream::LongTerm,
                question_type: QuestionType::Mcq,
            },
            entries: AnswerKeyEntries::try_from_entries(entries).unwrap(),
        })
        .await
        .unwrap()
}

/// Builds a report graded against an all-"A" key under +4/-1.
/// `marked(q)` returns the option the student marked, `None` for a blank.
pub fn graded_report(
    reg_number: &str,
    test_name: &str,
    marked: impl Fn(i32) -> Option<&'static str>,
) -> NewStudentReport {
    let mut correct = 0;
    let mut wrong = 0;
    let mut unattempted = 0;
    let responses = (1..=QUESTIONS)
        .map(|q| {
            let marked_option = marked(q).map(str::to_string);
            let is_correct = marked_option.as_deref() == Some("A");
            match (&marked_option, is_correct) {
                (None, _) => unattempted += 1,
                (Some(_), true) => correct += 1,
                (Some(_), false) => wrong += 1,
            }
            ResponseEntry {
                question_number: q,
                marked_option,
                correct_options: ["A".to_string()].into_iter().collect(),
                is_correct,
                grace_snapshot: false,
            }
        })
        .collect();

    NewStudentReport {
        reg_number: reg_number.to_string(),
        stream: Stream::LongTerm,
        test_name: test_name.to_string(),
        date: test_date(),
        marks_type: "+4/-1".to_string(),
        total_questions: QUESTIONS,
        correct_answers: correct,
        wrong_answers: wrong,
        unattempted,
        accuracy: correct * 100 / QUESTIONS,
        percentage: (f64::from(correct * 4 - wrong) / f64::from(QUESTIONS * 4) * 100.0).max(0.0),
        total_marks: correct * 4 - wrong,
        percentile: 50.0,
        responses,
    }
}

/// 7 correct, 3 wrong (Q5 marked "C", Q8 and Q9 marked "D"), 25 marks.
pub fn scenario_report(reg_number: &str, test_name: &str) -> NewStudentReport {
    graded_report(reg_number, test_name, |q| match q {
        5 => Some("C"),
        8 | 9 => Some("D"),
        _ => Some("A"),
    })
}
