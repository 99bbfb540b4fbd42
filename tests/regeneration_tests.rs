// tests/regeneration_tests.rs

mod common;

use common::*;
use exam_backend::{
    error::{AppError, ErrorKind},
    gateway::BulkGateway,
    grading::RegenerationEngine,
    models::{answer_key::EntryState, marks::MarkScheme, student_report::ReportKey},
};

#[tokio::test]
async fn corrected_option_flips_marked_response() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 5").await;
    let stored = store
        .insert_report(&scenario_report("REG-001", "Mock Test 5"))
        .await
        .unwrap();
    assert_eq!((stored.correct_answers, stored.wrong_answers, stored.total_marks), (7, 3, 25));

    let result = engine(&store)
        .regenerate(key.id, &[entry_input(5, &["A", "C"])], &[])
        .await
        .unwrap();

    assert_eq!(result.corrected_questions, vec![5]);
    assert_eq!(result.matched, 1);
    assert_eq!(result.updated_count, 1);
    assert!(result.failures.is_empty());

    let report = store.find_report(stored.id).await.unwrap().unwrap();
    assert_eq!(report.correct_answers, 8);
    assert_eq!(report.wrong_answers, 2);
    assert_eq!(report.unattempted, 0);
    assert_eq!(report.total_marks, 30);
    assert_eq!(report.accuracy, 80);
    assert_eq!(report.version, stored.version + 1);

    let q5 = report.responses.iter().find(|r| r.question_number == 5).unwrap();
    assert!(q5.is_correct);
    assert_eq!(q5.correct_options.len(), 2);
    assert_eq!(result.reports, vec![report]);

    let key = store.find_answer_key(key.id).await.unwrap().unwrap();
    let entry = key.entries.get(5).unwrap();
    assert_eq!(entry.state, EntryState::Corrected);
    assert_eq!(entry.revision, 1);
}

#[tokio::test]
async fn regenerating_twice_changes_nothing_the_second_time() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 6").await;
    let stored = store
        .insert_report(&scenario_report("REG-002", "Mock Test 6"))
        .await
        .unwrap();
    let engine = engine(&store);
    let correction = [entry_input(5, &["A", "C"])];

    engine.regenerate(key.id, &correction, &[]).await.unwrap();
    let after_first = store.find_report(stored.id).await.unwrap().unwrap();

    let second = engine.regenerate(key.id, &correction, &[]).await.unwrap();
    assert!(second.corrected_questions.is_empty());
    assert_eq!(second.updated_count, 0);
    assert_eq!(second.unchanged, 1);

    let after_second = store.find_report(stored.id).await.unwrap().unwrap();
    assert_eq!(after_first, after_second);

    let key = store.find_answer_key(key.id).await.unwrap().unwrap();
    assert_eq!(key.entries.get(5).unwrap().revision, 1);
}

#[tokio::test]
async fn grace_skips_unattempted_and_credits_attempted() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 7").await;
    let skipped = store
        .insert_report(&graded_report("REG-010", "Mock Test 7", |q| {
            if q == 3 { None } else { Some("A") }
        }))
        .await
        .unwrap();
    let wrong = store
        .insert_report(&graded_report("REG-011", "Mock Test 7", |q| {
            if q == 3 { Some("B") } else { Some("A") }
        }))
        .await
        .unwrap();

    // 99 is not part of the key and is ignored.
    let result = engine(&store)
        .regenerate(key.id, &[], &[3, 99])
        .await
        .unwrap();
    assert!(result.failures.is_empty());
    assert_eq!(result.corrected_questions, vec![3]);

    let skipped_after = store.find_report(skipped.id).await.unwrap().unwrap();
    assert_eq!(skipped_after.correct_answers, skipped.correct_answers);
    assert_eq!(skipped_after.unattempted, 1);
    assert_eq!(skipped_after.total_marks, skipped.total_marks);

    let wrong_after = store.find_report(wrong.id).await.unwrap().unwrap();
    assert_eq!(wrong_after.correct_answers, 10);
    assert_eq!(wrong_after.wrong_answers, 0);
    assert_eq!(wrong_after.total_marks, wrong.total_marks + 5);

    // Granting the same grace again is a no-op.
    let again = engine(&store).regenerate(key.id, &[], &[3]).await.unwrap();
    assert_eq!(again.updated_count, 0);
    assert_eq!(
        store.find_report(wrong.id).await.unwrap().unwrap().total_marks,
        wrong_after.total_marks
    );
}

#[tokio::test]
async fn malformed_grace_number_is_rejected() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 8").await;

    let err = engine(&store).regenerate(key.id, &[], &[0]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn one_corrupt_report_does_not_stop_the_others() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 9").await;
    let good_a = store
        .insert_report(&scenario_report("REG-020", "Mock Test 9"))
        .await
        .unwrap();
    let good_b = store
        .insert_report(&scenario_report("REG-021", "Mock Test 9"))
        .await
        .unwrap();

    // Stored counters that do not add up; only reachable by bypassing validation.
    let mut corrupt = scenario_report("REG-022", "Mock Test 9");
    corrupt.unattempted = 4;
    store.insert_report(&corrupt).await.unwrap();

    let result = engine(&store)
        .regenerate(key.id, &[entry_input(5, &["A", "C"])], &[])
        .await
        .unwrap();

    assert_eq!(result.matched, 3);
    assert_eq!(result.updated_count, 2);
    assert_eq!(result.failures.len(), 1);
    let failure = &result.failures[0];
    assert_eq!(failure.reg_number.as_deref(), Some("REG-022"));
    assert_eq!(failure.kind, ErrorKind::Validation);

    for id in [good_a.id, good_b.id] {
        let report = store.find_report(id).await.unwrap().unwrap();
        assert_eq!(report.total_marks, 30);
    }
}

#[tokio::test]
async fn unknown_answer_key_touches_nothing() {
    let store = memory_store();
    published_key(&store, "Mock Test 10").await;
    let stored = store
        .insert_report(&scenario_report("REG-030", "Mock Test 10"))
        .await
        .unwrap();

    let err = engine(&store)
        .regenerate(9999, &[entry_input(5, &["A", "C"])], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let report = store.find_report(stored.id).await.unwrap().unwrap();
    assert_eq!(report, stored);
}

#[tokio::test]
async fn correction_for_missing_question_is_rejected_before_writing() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 11").await;

    let err = engine(&store)
        .regenerate(key.id, &[entry_input(5, &["C"]), entry_input(42, &["B"])], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let key = store.find_answer_key(key.id).await.unwrap().unwrap();
    assert_eq!(key.entries.get(5).unwrap().state, EntryState::Published);
}

#[tokio::test]
async fn reports_of_other_tests_are_left_alone() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 12").await;
    published_key(&store, "Mock Test 13").await;
    let other = store
        .insert_report(&scenario_report("REG-040", "Mock Test 13"))
        .await
        .unwrap();

    let result = engine(&store)
        .regenerate(key.id, &[entry_input(5, &["A", "C"])], &[])
        .await
        .unwrap();
    assert_eq!(result.matched, 0);

    let untouched = store
        .find_report_by_key(&ReportKey {
            reg_number: "REG-040".to_string(),
            test_name: "Mock Test 13".to_string(),
            stream: other.stream,
            date: other.date,
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched, other);
}

#[tokio::test]
async fn bulk_update_corrects_key_and_regrades_new_reports() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 14").await;

    let mut bad = scenario_report("REG-051", "Mock Test 14");
    bad.correct_answers = 9;
    let result = engine(&store)
        .bulk_update(
            key.id,
            &[entry_input(5, &["A", "C"])],
            vec![scenario_report("REG-050", "Mock Test 14"), bad],
        )
        .await
        .unwrap();

    assert_eq!(result.batch.attempted, 3);
    assert_eq!(result.batch.succeeded, 2);
    assert_eq!(result.batch.failures.len(), 1);
    assert_eq!(result.batch.failures[0].reg_number.as_deref(), Some("REG-051"));

    let regeneration = result.regeneration.expect("correction triggers regeneration");
    assert_eq!(regeneration.updated_count, 1);
    assert_eq!(regeneration.reports[0].total_marks, 30);
}

#[tokio::test]
async fn bulk_update_adding_entry_does_not_regrade() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 15").await;
    let result = engine(&store)
        .bulk_update(key.id, &[entry_input(11, &["B"])], vec![])
        .await
        .unwrap();

    assert_eq!(result.batch.succeeded, 1);
    assert!(result.regeneration.is_none());

    let key = store.find_answer_key(key.id).await.unwrap().unwrap();
    // New entries on a published key are published too.
    assert_eq!(key.entries.get(11).unwrap().state, EntryState::Published);
}

#[tokio::test]
async fn cohort_larger_than_one_batch_is_regraded_in_full() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 16").await;
    for reg in ["REG-060", "REG-061", "REG-062"] {
        store
            .insert_report(&scenario_report(reg, "Mock Test 16"))
            .await
            .unwrap();
    }
    // Two writes per batch, three reports to re-grade.
    let gateway = BulkGateway::new(store.clone(), 2, 2);
    let engine = RegenerationEngine::new(store.clone(), gateway, MarkScheme::default());

    let result = engine
        .regenerate(key.id, &[entry_input(5, &["A", "C"])], &[])
        .await
        .unwrap();

    assert_eq!(result.corrected_questions, vec![5]);
    assert_eq!(result.matched, 3);
    assert_eq!(result.updated_count, 3);
    assert!(result.failures.is_empty());
    assert!(result.reports.iter().all(|r| r.total_marks == 30));
}

#[tokio::test]
async fn bulk_update_reports_invalid_entry_without_rejecting_batch() {
    let store = memory_store();
    let key = published_key(&store, "Mock Test 17").await;

    let result = engine(&store)
        .bulk_update(
            key.id,
            &[entry_input(0, &["A"])],
            vec![scenario_report("REG-070", "Mock Test 17")],
        )
        .await
        .unwrap();

    assert_eq!(result.batch.attempted, 2);
    assert_eq!(result.batch.succeeded, 1);
    assert_eq!(result.batch.failures.len(), 1);
    assert_eq!(result.batch.failures[0].kind, ErrorKind::Validation);
    assert!(result.batch.failures[0].key.ends_with("/Q0"));
    assert!(result.regeneration.is_none());
}
