// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;

use crate::{config::Config, gateway::BulkGateway, grading::RegenerationEngine, store::ExamStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ExamStore>,
    pub config: Config,
}

impl AppState {
    pub fn new(store: Arc<dyn ExamStore>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn gateway(&self) -> BulkGateway {
        BulkGateway::new(
            self.store.clone(),
            self.config.write_concurrency,
            self.config.max_batch_operations,
        )
    }

    pub fn engine(&self) -> RegenerationEngine {
        RegenerationEngine::new(self.store.clone(), self.gateway(), self.config.default_marks)
    }
}

impl FromRef<AppState> for Arc<dyn ExamStore> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
