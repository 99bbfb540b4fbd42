// src/handlers/student_report.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use validator::Validate;

use crate::{
    error::{AppError, RecordFailure},
    gateway::{BatchOperation, BatchOutcome, upsert_report},
    models::student_report::{
        BulkReportsRequest, CheckExistingRequest, NewStudentReport, ReplaceStudentReportRequest,
        ReportFilter, ReportSummary, StudentReport,
    },
    state::AppState,
    store::ExamStore,
};

/// Lists reports matching the query, newest test first unless asked otherwise.
pub async fn list_reports(
    State(store): State<Arc<dyn ExamStore>>,
    Query(filter): Query<ReportFilter>,
) -> Result<impl IntoResponse, AppError> {
    let reports = store.list_reports(&filter).await?;
    Ok(Json(reports))
}

/// Creates a report, or replaces the one with the same natural key.
/// Admin only.
pub async fn create_or_update_report(
    State(store): State<Arc<dyn ExamStore>>,
    Json(payload): Json<NewStudentReport>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let (report, created) = upsert_report(store.as_ref(), &payload).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

/// Upserts many reports; each one succeeds or fails on its own.
/// Admin only.
pub async fn bulk_create_or_update(
    State(state): State<AppState>,
    Json(payload): Json<BulkReportsRequest>,
) -> Result<impl IntoResponse, AppError> {
    let mut outcome = BatchOutcome::default();
    let mut ops = Vec::with_capacity(payload.reports.len());

    for report in payload.reports {
        if let Err(errs) = report.validate() {
            let err = AppError::from(errs);
            outcome.reject(
                RecordFailure::from_error(report.key().to_string(), &err)
                    .for_student(&report.reg_number),
            );
            continue;
        }
        ops.push(BatchOperation::UpsertReport(report));
    }

    outcome.merge(state.gateway().apply_batch(ops).await?);
    tracing::info!(
        "Bulk report upsert: {}/{} succeeded",
        outcome.succeeded,
        outcome.attempted
    );
    Ok(Json(outcome))
}

/// Tells the caller which natural keys already have a report.
/// Accepts at most as many keys as one batch may write.
pub async fn check_existing(
    State(state): State<AppState>,
    Json(payload): Json<CheckExistingRequest>,
) -> Result<impl IntoResponse, AppError> {
    let limit = state.config.max_batch_operations;
    if payload.keys.len() > limit {
        return Err(AppError::Validation(format!(
            "too many keys to check: {} > {}",
            payload.keys.len(),
            limit
        )));
    }

    let existing = state.store.existing_report_keys(&payload.keys).await?;
    Ok(Json(json!({
        "checked": payload.keys.len(),
        "existing": existing,
    })))
}

pub async fn get_report(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let report = store
        .find_report(id)
        .await?
        .ok_or(AppError::NotFound("Student report not found".to_string()))?;
    Ok(Json(report))
}

/// One student's history across tests, as summaries.
pub async fn get_reports_by_reg_number(
    State(store): State<Arc<dyn ExamStore>>,
    Path(reg_number): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let filter = ReportFilter {
        reg_number: Some(reg_number.clone()),
        ..Default::default()
    };
    let reports = store.list_reports(&filter).await?;
    if reports.is_empty() {
        return Err(AppError::NotFound(format!(
            "No reports found for {}",
            reg_number
        )));
    }

    let summaries: Vec<ReportSummary> = reports.iter().map(ReportSummary::from).collect();
    Ok(Json(json!({
        "reg_number": reg_number,
        "reports": summaries,
    })))
}

/// Full replacement of a stored report.
/// Admin only.
pub async fn update_report(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
    Json(payload): Json<ReplaceStudentReportRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let existing = store
        .find_report(id)
        .await?
        .ok_or(AppError::NotFound("Student report not found".to_string()))?;

    let expected_version = payload.expected_version.unwrap_or(existing.version);
    let mut replacement = StudentReport::from_new(id, existing.version, payload.report);
    replacement.created_at = existing.created_at;

    let stored = store.replace_report(&replacement, expected_version).await?;
    tracing::info!("Replaced report {} (version {})", stored.key(), stored.version);
    Ok(Json(stored))
}

/// Admin only.
pub async fn delete_report(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !store.delete_report(id).await? {
        return Err(AppError::NotFound("Student report not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}
