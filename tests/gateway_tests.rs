// tests/gateway_tests.rs

mod common;

use common::*;
use exam_backend::{
    error::{AppError, ErrorKind},
    gateway::{BatchOperation, BulkGateway},
    models::{answer_key::AnswerKeyEntry, student_report::ReportFilter},
};

#[tokio::test]
async fn failed_operations_do_not_roll_back_the_rest() {
    let store = memory_store();
    let gateway = BulkGateway::new(store.clone(), 2, 10);

    let mut ghost = store
        .insert_report(&scenario_report("REG-100", "Gateway Test"))
        .await
        .unwrap();
    store.delete_report(ghost.id).await.unwrap();
    ghost.total_marks = 0;

    let outcome = gateway
        .apply_batch(vec![
            BatchOperation::UpsertReport(scenario_report("REG-101", "Gateway Test")),
            BatchOperation::ReplaceReport {
                expected_version: ghost.version,
                report: ghost,
            },
            BatchOperation::PutAnswerKeyEntry {
                answer_key_id: 777,
                entry: AnswerKeyEntry::from_input(&entry_input(1, &["A"])),
            },
            BatchOperation::UpsertReport(scenario_report("REG-102", "Gateway Test")),
        ])
        .await
        .unwrap();

    assert_eq!(outcome.attempted, 4);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failures.len(), 2);
    assert!(outcome.failures.iter().all(|f| f.kind == ErrorKind::NotFound));
    assert!(
        outcome
            .failures
            .iter()
            .any(|f| f.reg_number.as_deref() == Some("REG-100"))
    );

    let stored = store.list_reports(&ReportFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn upsert_of_existing_key_updates_in_place() {
    let store = memory_store();
    let gateway = BulkGateway::new(store.clone(), 2, 10);
    let first = store
        .insert_report(&scenario_report("REG-110", "Gateway Test"))
        .await
        .unwrap();

    let mut resubmitted = scenario_report("REG-110", "Gateway Test");
    resubmitted.percentile = 91.5;
    let outcome = gateway
        .apply_batch(vec![BatchOperation::UpsertReport(resubmitted)])
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, 1);
    let stored = outcome.reports().next().unwrap();
    assert_eq!(stored.id, first.id);
    assert_eq!(stored.version, first.version + 1);
    assert_eq!(stored.percentile, 91.5);
    assert_eq!(stored.created_at, first.created_at);
}

#[tokio::test]
async fn oversized_batch_is_rejected_before_writing() {
    let store = memory_store();
    let gateway = BulkGateway::new(store.clone(), 2, 2);

    let ops = (0..3)
        .map(|i| BatchOperation::UpsertReport(scenario_report(&format!("REG-12{}", i), "Gateway Test")))
        .collect();
    let err = gateway.apply_batch(ops).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let stored = store.list_reports(&ReportFilter::default()).await.unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn stale_version_is_a_conflict() {
    let store = memory_store();
    let gateway = BulkGateway::new(store.clone(), 2, 10);
    let original = store
        .insert_report(&scenario_report("REG-130", "Gateway Test"))
        .await
        .unwrap();

    let mut first_edit = original.clone();
    first_edit.percentile = 10.0;
    let mut second_edit = original.clone();
    second_edit.percentile = 20.0;

    let first = gateway
        .apply_batch(vec![BatchOperation::ReplaceReport {
            report: first_edit,
            expected_version: original.version,
        }])
        .await
        .unwrap();
    assert_eq!(first.succeeded, 1);

    let second = gateway
        .apply_batch(vec![BatchOperation::ReplaceReport {
            report: second_edit,
            expected_version: original.version,
        }])
        .await
        .unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failures[0].kind, ErrorKind::Conflict);

    let stored = store.find_report(original.id).await.unwrap().unwrap();
    assert_eq!(stored.percentile, 10.0);
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let gateway = BulkGateway::new(memory_store(), 2, 10);
    let outcome = gateway.apply_batch(Vec::new()).await.unwrap();
    assert_eq!((outcome.attempted, outcome.succeeded), (0, 0));
}

#[tokio::test]
async fn chunked_apply_splits_large_batches() {
    let store = memory_store();
    let gateway = BulkGateway::new(store.clone(), 2, 2);

    let ops = (0..5)
        .map(|i| BatchOperation::UpsertReport(scenario_report(&format!("REG-14{}", i), "Gateway Test")))
        .collect();
    let outcome = gateway.apply_chunked(ops).await.unwrap();

    assert_eq!((outcome.attempted, outcome.succeeded), (5, 5));
    assert!(outcome.failures.is_empty());
    let stored = store.list_reports(&ReportFilter::default()).await.unwrap();
    assert_eq!(stored.len(), 5);
}
