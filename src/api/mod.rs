pub mod logs;
pub mod objects;
pub mod obs;
pub mod traces;

use serde::Deserialize;
use std::sync::Arc;

use crate::api_errors::AppError;
use crate::app_state::AppState;
use crate::object_store::ObjectStore;

/// `?limit=` query; absent or zero falls back to the handler's default.
#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    pub fn or(&self, default: usize) -> usize {
        self.limit.filter(|n| *n > 0).unwrap_or(default)
    }
}

pub(crate) fn endpoint(state: &AppState, name: &str) -> Result<Arc<dyn ObjectStore>, AppError> {
    state
        .endpoints
        .get(name)
        .ok_or_else(|| AppError::not_found("endpoint not found"))
}
