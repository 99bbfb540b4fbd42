// tests/api_tests.rs

mod common;

use common::*;
use exam_backend::{routes, state::AppState, utils::jwt::sign_jwt};
use serde_json::{Value, json};

/// Helper function to spawn the app on a random port for testing.
/// Returns the base URL (e.g., "http://127.0.0.1:12345").
async fn spawn_app() -> String {
    let state = AppState::new(memory_store(), test_config());
    let app = routes::create_router(state);

    // Bind to port 0 to get a random available port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind random port");

    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    // Spawn the server in the background
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    address
}

fn token(role: &str) -> String {
    sign_jwt("tester", role, &test_config().jwt_secret, 600).unwrap()
}

fn unique_reg() -> String {
    format!("REG-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn answer_key_body(test_name: &str) -> Value {
    let entries: Vec<Value> = (1..=QUESTIONS)
        .map(|q| json!({ "question_number": q, "correct_options": ["a"] }))
        .collect();
    json!({
        "stream": "LongTerm",
        "question_type": "MCQ",
        "test_name": test_name,
        "date": "2025-03-09",
        "entries": entries,
        "publish": true,
    })
}

async fn create_answer_key(client: &reqwest::Client, address: &str, test_name: &str) -> Value {
    let response = client
        .post(format!("{}/api/solutions", address))
        .bearer_auth(token("admin"))
        .json(&answer_key_body(test_name))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 201);
    response.json().await.unwrap()
}

#[tokio::test]
async fn unknown_path_is_404() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/random_path_that_does_not_exist", address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn api_requires_token_and_admin_role_for_writes() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let anonymous = client
        .get(format!("{}/api/solutions", address))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status().as_u16(), 401);

    let staff_read = client
        .get(format!("{}/api/solutions", address))
        .bearer_auth(token("staff"))
        .send()
        .await
        .unwrap();
    assert_eq!(staff_read.status().as_u16(), 200);

    let staff_write = client
        .post(format!("{}/api/solutions", address))
        .bearer_auth(token("staff"))
        .json(&answer_key_body("Forbidden Test"))
        .send()
        .await
        .unwrap();
    assert_eq!(staff_write.status().as_u16(), 403);
}

#[tokio::test]
async fn answer_key_lifecycle() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let key = create_answer_key(&client, &address, "Lifecycle Test").await;
    let id = key["id"].as_i64().unwrap();
    assert_eq!(key["entries"].as_array().unwrap().len(), QUESTIONS as usize);
    // Labels are normalized on the way in.
    assert_eq!(key["entries"][0]["correct_options"], json!(["A"]));
    assert_eq!(key["entries"][0]["state"], "Published");

    let duplicate = client
        .post(format!("{}/api/solutions", address))
        .bearer_auth(token("admin"))
        .json(&answer_key_body("Lifecycle Test"))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status().as_u16(), 409);

    let renamed = client
        .put(format!("{}/api/solutions/{}", address, id))
        .bearer_auth(token("admin"))
        .json(&json!({ "test_name": "Lifecycle Test (Renamed)" }))
        .send()
        .await
        .unwrap();
    assert_eq!(renamed.status().as_u16(), 200);
    let renamed: Value = renamed.json().await.unwrap();
    assert_eq!(renamed["test_name"], "Lifecycle Test (Renamed)");

    let deleted = client
        .delete(format!("{}/api/solutions/{}", address, id))
        .bearer_auth(token("admin"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status().as_u16(), 204);

    let missing = client
        .get(format!("{}/api/solutions/{}", address, id))
        .bearer_auth(token("staff"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn objective_entry_without_options_is_rejected() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let mut body = answer_key_body("Invalid Key Test");
    body["entries"][2]["correct_options"] = json!([]);

    let response = client
        .post(format!("{}/api/solutions", address))
        .bearer_auth(token("admin"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn report_upsert_and_queries() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let reg = unique_reg();
    let report = scenario_report(&reg, "Report Test");
    let body = ReportBody::from(&report).0;

    let created = client
        .post(format!("{}/api/student-reports", address))
        .bearer_auth(token("admin"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(created.status().as_u16(), 201);
    let created: Value = created.json().await.unwrap();

    let again = client
        .post(format!("{}/api/student-reports", address))
        .bearer_auth(token("admin"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(again.status().as_u16(), 200);
    let again: Value = again.json().await.unwrap();
    assert_eq!(again["id"], created["id"]);
    assert_eq!(again["version"], 2);

    let history: Value = client
        .get(format!("{}/api/student-reports/student/{}", address, reg))
        .bearer_auth(token("staff"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["reports"][0]["total_marks"], 25);

    let existing: Value = client
        .post(format!("{}/api/student-reports/check-existing", address))
        .bearer_auth(token("staff"))
        .json(&json!({ "keys": [
            { "reg_number": reg, "test_name": "Report Test", "stream": "LongTerm", "date": "2025-03-09" },
            { "reg_number": unique_reg(), "test_name": "Report Test", "stream": "LongTerm", "date": "2025-03-09" },
        ]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(existing["existing"].as_array().unwrap().len(), 1);

    let unknown = client
        .get(format!("{}/api/student-reports/student/{}", address, unique_reg()))
        .bearer_auth(token("staff"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status().as_u16(), 404);
}

#[tokio::test]
async fn check_existing_rejects_more_keys_than_a_batch() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let limit = test_config().max_batch_operations;
    let keys: Vec<Value> = (0..=limit)
        .map(|_| {
            json!({ "reg_number": unique_reg(), "test_name": "Report Test", "stream": "LongTerm", "date": "2025-03-09" })
        })
        .collect();

    let response = client
        .post(format!("{}/api/student-reports/check-existing", address))
        .bearer_auth(token("staff"))
        .json(&json!({ "keys": keys }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn bulk_reports_report_per_record_failures() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();

    let good = ReportBody::from(&scenario_report(&unique_reg(), "Bulk Test"));
    let mut bad = ReportBody::from(&scenario_report(&unique_reg(), "Bulk Test"));
    bad.0["wrong_answers"] = json!(5);

    let response = client
        .post(format!("{}/api/student-reports/bulk", address))
        .bearer_auth(token("admin"))
        .json(&json!({ "reports": [good.0, bad.0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let outcome: Value = response.json().await.unwrap();
    assert_eq!(outcome["attempted"], 2);
    assert_eq!(outcome["succeeded"], 1);
    assert_eq!(outcome["failures"][0]["kind"], "validation");
}

#[tokio::test]
async fn correcting_a_published_entry_regrades_reports() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let key = create_answer_key(&client, &address, "Correction Test").await;
    let reg = unique_reg();

    client
        .post(format!("{}/api/student-reports", address))
        .bearer_auth(token("admin"))
        .json(&ReportBody::from(&scenario_report(&reg, "Correction Test")).0)
        .send()
        .await
        .unwrap();

    let entry_id = key["entries"][4]["id"].as_i64().unwrap();
    let response = client
        .put(format!("{}/api/solutions/entries/{}", address, entry_id))
        .bearer_auth(token("admin"))
        .json(&json!({ "question_number": 5, "correct_options": ["A", "C"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["outcome"], "corrected");
    assert_eq!(body["entry"]["state"], "Corrected");
    assert_eq!(body["regeneration"]["updated_count"], 1);
    assert_eq!(body["regeneration"]["reports"][0]["total_marks"], 30);
    assert_eq!(body["regeneration"]["reports"][0]["correct_answers"], 8);

    // Same value again: nothing to do.
    let repeat: Value = client
        .put(format!("{}/api/solutions/entries/{}", address, entry_id))
        .bearer_auth(token("admin"))
        .json(&json!({ "question_number": 5, "correct_options": ["a", "c"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(repeat["outcome"], "unchanged");
    assert!(repeat["regeneration"].is_null());
}

#[tokio::test]
async fn regenerate_endpoint_applies_grace() {
    let address = spawn_app().await;
    let client = reqwest::Client::new();
    let key = create_answer_key(&client, &address, "Grace Test").await;
    let id = key["id"].as_i64().unwrap();
    let reg = unique_reg();

    client
        .post(format!("{}/api/student-reports", address))
        .bearer_auth(token("admin"))
        .json(&ReportBody::from(&scenario_report(&reg, "Grace Test")).0)
        .send()
        .await
        .unwrap();

    let result: Value = client
        .post(format!("{}/api/solutions/{}/regenerate", address, id))
        .bearer_auth(token("admin"))
        .json(&json!({ "grace_questions": [8, 9] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["updated_count"], 1);
    assert_eq!(result["reports"][0]["total_marks"], 35);

    let unknown = client
        .post(format!("{}/api/solutions/{}/regenerate", address, 424242))
        .bearer_auth(token("admin"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status().as_u16(), 400);
}

/// JSON body for a report submission.
struct ReportBody(Value);

impl From<&exam_backend::models::student_report::NewStudentReport> for ReportBody {
    fn from(r: &exam_backend::models::student_report::NewStudentReport) -> Self {
        let responses: Vec<Value> = r
            .responses
            .iter()
            .map(|resp| serde_json::to_value(resp).unwrap())
            .collect();
        ReportBody(json!({
            "reg_number": r.reg_number,
            "stream": r.stream,
            "test_name": r.test_name,
            "date": r.date,
            "marks_type": r.marks_type,
            "total_questions": r.total_questions,
            "correct_answers": r.correct_answers,
            "wrong_answers": r.wrong_answers,
            "unattempted": r.unattempted,
            "accuracy": r.accuracy,
            "percentage": r.percentage,
            "total_marks": r.total_marks,
            "percentile": r.percentile,
            "responses": responses,
        }))
    }
}
