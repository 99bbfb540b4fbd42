// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{solution, student_report},
    state::AppState,
    utils::jwt::{admin_middleware, auth_middleware},
};

/// Assembles the main application router.
///
/// * Every `/api` route requires a valid bearer token.
/// * Mutating routes additionally require the admin role.
/// * Applies global middleware (Trace, CORS) and injects `AppState`.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let solution_routes = Router::new()
        .route("/", get(solution::list_answer_keys))
        .route("/{id}", get(solution::get_answer_key))
        .merge(
            Router::new()
                .route("/", post(solution::create_answer_key))
                .route(
                    "/{id}",
                    put(solution::update_answer_key).delete(solution::delete_answer_key),
                )
                .route("/{id}/publish", post(solution::publish_answer_key))
                .route("/{id}/regenerate", post(solution::regenerate))
                .route("/{id}/bulk", put(solution::bulk_update))
                .route(
                    "/entries/{entry_id}",
                    put(solution::update_entry).delete(solution::delete_entry),
                )
                .layer(middleware::from_fn(admin_middleware)),
        );

    let report_routes = Router::new()
        .route("/", get(student_report::list_reports))
        .route("/{id}", get(student_report::get_report))
        .route(
            "/student/{reg_number}",
            get(student_report::get_reports_by_reg_number),
        )
        .route("/check-existing", post(student_report::check_existing))
        .merge(
            Router::new()
                .route("/", post(student_report::create_or_update_report))
                .route("/bulk", post(student_report::bulk_create_or_update))
                .route(
                    "/{id}",
                    put(student_report::update_report).delete(student_report::delete_report),
                )
                .layer(middleware::from_fn(admin_middleware)),
        );

    let api_routes = Router::new()
        .nest("/solutions", solution_routes)
        .nest("/student-reports", report_routes)
        // Auth runs before the admin check
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(|| async { "ok" }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
