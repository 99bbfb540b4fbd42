// src/handlers/solution.rs

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    error::AppError,
    grading::RegenerationResult,
    models::{
        answer_key::{
            AnswerKeyEntries, AnswerKeyEntry, AnswerKeyFilter, CorrectionOutcome,
            CreateAnswerKeyRequest, EntryInput, NewAnswerKey, TestIdentity,
            UpdateAnswerKeyRequest, check_entry_for_type, validate_entries,
        },
        student_report::NewStudentReport,
    },
    state::AppState,
    store::ExamStore,
};

/// Lists answer keys, newest test date first.
pub async fn list_answer_keys(
    State(store): State<Arc<dyn ExamStore>>,
    Query(filter): Query<AnswerKeyFilter>,
) -> Result<impl IntoResponse, AppError> {
    let keys = store.list_answer_keys(&filter).await?;
    Ok(Json(keys))
}

/// Creates an answer key with all its entries.
/// Admin only.
pub async fn create_answer_key(
    State(store): State<Arc<dyn ExamStore>>,
    Json(payload): Json<CreateAnswerKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    validate_entries(payload.question_type, &payload.entries).map_err(AppError::Validation)?;

    let entries = payload
        .entries
        .iter()
        .map(|input| {
            let mut entry = AnswerKeyEntry::from_input(input);
            if payload.publish {
                entry.publish();
            }
            entry
        })
        .collect();
    let entries = AnswerKeyEntries::try_from_entries(entries).map_err(AppError::Validation)?;

    let new_key = NewAnswerKey {
        identity: TestIdentity {
            test_name: payload.test_name.trim().to_string(),
            date: payload.date,
            stream: payload.stream,
            question_type: payload.question_type,
        },
        entries,
    };

    let key = store.insert_answer_key(new_key).await.map_err(|e| match e {
        AppError::Conflict(_) => AppError::Conflict(format!(
            "An answer key for {} on {} ({}, {}) already exists",
            payload.test_name, payload.date, payload.stream, payload.question_type
        )),
        other => other,
    })?;

    tracing::info!("Created answer key {} ({})", key.id, key.identity());
    Ok((StatusCode::CREATED, Json(key)))
}

pub async fn get_answer_key(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let key = store
        .find_answer_key(id)
        .await?
        .ok_or(AppError::NotFound("Answer key not found".to_string()))?;
    Ok(Json(key))
}

/// Updates the test identity of an answer key. Entries and reports are untouched.
/// Admin only.
pub async fn update_answer_key(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateAnswerKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let key = store
        .find_answer_key(id)
        .await?
        .ok_or(AppError::NotFound("Answer key not found".to_string()))?;

    let mut identity = key.identity();
    if let Some(test_name) = payload.test_name {
        identity.test_name = test_name.trim().to_string();
    }
    if let Some(date) = payload.date {
        identity.date = date;
    }
    if let Some(question_type) = payload.question_type {
        if let Some(entry) = key.entries.iter().find(|e| {
            question_type.is_objective() && !e.is_grace && e.correct_options.is_empty()
        }) {
            return Err(AppError::Validation(format!(
                "question {} has no correct option and cannot become {}",
                entry.question_number, question_type
            )));
        }
        identity.question_type = question_type;
    }

    if identity == key.identity() {
        return Ok(Json(key));
    }

    let updated = store.update_answer_key_identity(id, &identity).await?;
    tracing::info!("Answer key {} is now {}", id, identity);
    Ok(Json(updated))
}

/// Deletes an answer key and its entries. Reports keep their stored grading.
/// Admin only.
pub async fn delete_answer_key(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !store.delete_answer_key(id).await? {
        return Err(AppError::NotFound("Answer key not found".to_string()));
    }
    tracing::info!("Deleted answer key {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// Publishes every draft entry. Publication never re-grades reports.
/// Admin only.
pub async fn publish_answer_key(
    State(store): State<Arc<dyn ExamStore>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let mut key = store
        .find_answer_key(id)
        .await?
        .ok_or(AppError::NotFound("Answer key not found".to_string()))?;

    let mut published = 0;
    for entry in key.entries.iter_mut() {
        if entry.publish() {
            *entry = store.put_answer_key_entry(id, entry).await?;
            published += 1;
        }
    }

    tracing::info!("Published {} entries of answer key {}", published, id);
    Ok(Json(key))
}

/// DTO for a regeneration run.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct RegenerateRequest {
    /// Entry corrections to persist before re-grading.
    #[serde(default)]
    #[validate(nested)]
    pub corrections: Vec<EntryInput>,
    /// Questions to grace. Numbers absent from the key are ignored.
    #[serde(default)]
    pub grace_questions: Vec<i32>,
}

/// Re-grades every report of the key's test.
/// Admin only.
pub async fn regenerate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Option<Json<RegenerateRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate()?;

    let result = state
        .engine()
        .regenerate(id, &payload.corrections, &payload.grace_questions)
        .await?;
    Ok(Json(result))
}

/// DTO for the combined answer key and report batch.
/// Entries and reports are validated per record so that one bad record does
/// not reject the batch.
#[derive(Debug, Deserialize)]
pub struct BulkUpdateRequest {
    #[serde(default)]
    pub entries: Vec<EntryInput>,
    #[serde(default)]
    pub reports: Vec<NewStudentReport>,
}

/// Admin only.
pub async fn bulk_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<BulkUpdateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let result = state
        .engine()
        .bulk_update(id, &payload.entries, payload.reports)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct EntryUpdateResponse {
    pub answer_key_id: i64,
    pub entry: AnswerKeyEntry,
    pub outcome: CorrectionOutcome,
    /// Present when a published entry was corrected.
    pub regeneration: Option<RegenerationResult>,
}

/// Full replace of one entry. Correcting a published entry re-grades the test.
/// Admin only.
pub async fn update_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<i64>,
    Json(mut payload): Json<EntryInput>,
) -> Result<impl IntoResponse, AppError> {
    let (answer_key_id, mut entry) = state
        .store
        .find_answer_key_entry(entry_id)
        .await?
        .ok_or(AppError::NotFound("Answer key entry not found".to_string()))?;

    // The entry id already names the question.
    payload.question_number = entry.question_number;
    payload.validate()?;

    let key = state
        .store
        .find_answer_key(answer_key_id)
        .await?
        .ok_or(AppError::NotFound("Answer key not found".to_string()))?;
    check_entry_for_type(key.question_type, &payload).map_err(AppError::Validation)?;

    let outcome = entry.apply_correction(&payload);
    if outcome == CorrectionOutcome::Unchanged {
        return Ok(Json(EntryUpdateResponse {
            answer_key_id,
            entry,
            outcome,
            regeneration: None,
        }));
    }

    let entry = state.store.put_answer_key_entry(answer_key_id, &entry).await?;
    tracing::info!(
        "Entry Q{} of answer key {} is now {} (revision {})",
        entry.question_number,
        answer_key_id,
        entry.state,
        entry.revision
    );

    let regeneration = if outcome == CorrectionOutcome::Corrected {
        Some(state.engine().regenerate(answer_key_id, &[], &[]).await?)
    } else {
        None
    };

    Ok(Json(EntryUpdateResponse {
        answer_key_id,
        entry,
        outcome,
        regeneration,
    }))
}

/// Admin only.
pub async fn delete_entry(
    State(store): State<Arc<dyn ExamStore>>,
    Path(entry_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !store.delete_answer_key_entry(entry_id).await? {
        return Err(AppError::NotFound("Answer key entry not found".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}
