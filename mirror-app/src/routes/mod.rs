pub mod health;
pub mod stats;

use crate::settings::FileSettingsStore;
use axum::Router;
use chrono::{DateTime, Utc};
use mirror_engine::MirrorEngine;
use std::sync::Arc;

/// Shared handles for the HTTP surface.
pub struct AppState {
    pub engine: Arc<MirrorEngine>,
    pub settings: Arc<FileSettingsStore>,
    pub started_at: DateTime<Utc>,
    pub intake_enabled: bool,
}

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(stats::router())
}
