use crate::routes::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/mirror/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.engine.status();
    let degradation = status.stats.degradation;
    let label = if !status.running {
        "stopped"
    } else if degradation.is_degraded() {
        "degraded"
    } else {
        "ok"
    };

    Json(serde_json::json!({
        "status": label,
        "ready": status.running,
        "checked_at": Utc::now(),
        "checks": {
            "engine": {
                "running": status.running,
                "enabled": status.enabled,
                "transport": status.transport,
                "queue_depth": status.queue_depth,
                "in_flight": status.in_flight,
                "cooldowns": status.cooldowns.len(),
            },
            "degradation": degradation,
            "mappings": {
                "active": status.mapping_count,
                "disabled": state.settings.disabled_mappings().len(),
            },
            "intake": {
                "enabled": state.intake_enabled,
            }
        }
    }))
}
