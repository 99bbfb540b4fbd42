// src/config.rs

use std::env;
use dotenvy::dotenv;

use crate::models::marks::MarkScheme;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub rust_log: String,
    pub port: u16,
    /// Upper bound on concurrently running record writes inside one batch.
    pub write_concurrency: usize,
    /// Batches larger than this are rejected before any write is attempted.
    pub max_batch_operations: usize,
    /// Marks applied when neither the answer key entry nor the report names a scheme.
    pub default_marks: MarkScheme,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let jwt_secret = env::var("JWT_SECRET")
            .expect("JWT_SECRET must be set");

        let rust_log = env::var("RUST_LOG")
            .unwrap_or_else(|_| "info".to_string());

        let port = parse_var("PORT", 3000);
        let write_concurrency = parse_var("WRITE_CONCURRENCY", 8usize).max(1);
        let max_batch_operations = parse_var("MAX_BATCH_OPERATIONS", 5000usize);

        let default_marks = MarkScheme {
            positive: parse_var("DEFAULT_POSITIVE_MARKS", 4),
            negative: parse_var("DEFAULT_NEGATIVE_MARKS", 1),
        };

        Self {
            database_url,
            jwt_secret,
            rust_log,
            port,
            write_concurrency,
            max_batch_operations,
            default_marks,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
