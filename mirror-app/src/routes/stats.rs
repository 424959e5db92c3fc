use crate::routes::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/mirror/stats", get(get_stats))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_stats(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(serde_json::json!({
        "started_at": state.started_at,
        "uptime_seconds": uptime_seconds,
        "engine": state.engine.status(),
        "mappings": state.settings.mappings(),
        "disabled_mappings": state.settings.disabled_mappings(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support;
    use mirror_engine::{
        ChatId, EventKind, InboundEvent, IngestOutcome, MessageId, MessageRef, Payload,
    };

    #[tokio::test]
    async fn exposes_queue_and_mapping_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_support::state(dir.path()).await;
        state
            .settings
            .add_mapping(ChatId::new(-100), ChatId::new(-200))
            .await
            .expect("mapping");

        let outcome = state.engine.ingest(InboundEvent::new(
            EventKind::New,
            MessageRef::new(ChatId::new(-100), MessageId::new(1)),
            Payload::plain_text("hello"),
        ));
        assert!(matches!(outcome, IngestOutcome::Queued { depth: 1, .. }));

        let Json(body) = get_stats(Extension(state)).await;
        assert_eq!(body["engine"]["queue_depth"], 1);
        assert_eq!(body["engine"]["mapping_count"], 1);
        assert_eq!(body["engine"]["running"], false);
        assert_eq!(body["mappings"][0]["source_chat_id"], -100);
        assert_eq!(body["mappings"][0]["target_chat_id"], -200);
        assert!(body["uptime_seconds"].as_i64().expect("uptime") >= 0);
    }
}
