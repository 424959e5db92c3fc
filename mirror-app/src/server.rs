use crate::config::{AppConfig, ServerConfig};
use crate::routes::{self, AppState};
use crate::settings::FileSettingsStore;
use anyhow::Result;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use chrono::Utc;
use mirror_engine::{IngestOutcome, InboundEvent, MirrorEngine, SettingsStore};
use mirror_telegram::{TelegramIntake, TelegramTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

const INTAKE_CHANNEL_CAPACITY: usize = 1024;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    let data_dir = cfg.data_dir_path()?;
    let settings = FileSettingsStore::open(&data_dir).await?;
    let options = settings.options();
    if settings.mapping_count() == 0 {
        tracing::warn!(
            settings_path = %settings.settings_path().display(),
            "no channel mappings configured; nothing will be mirrored"
        );
    }
    tracing::info!(
        config_path = %path.display(),
        data_dir = %data_dir.display(),
        bind_addr = %cfg.server.bind_addr,
        api_base = %cfg.telegram.api_base,
        workers = cfg.engine.workers,
        mappings = settings.mapping_count(),
        disabled_mappings = settings.disabled_mappings().len(),
        mirror_enabled = options.mirror_enabled,
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    let settings = FileSettingsStore::open(&cfg.data_dir_path()?).await?;
    let snapshot = settings.load_snapshot().await?;
    let report = serde_json::json!({
        "config_path": path,
        "settings_path": settings.settings_path(),
        "options": settings.options(),
        "mappings": settings.mappings(),
        "disabled_mappings": settings.disabled_mappings(),
        "snapshot": snapshot.map(|snapshot| serde_json::json!({
            "saved_at": snapshot.saved_at,
            "cache_entries": snapshot.message_cache.len(),
            "stats": snapshot.stats,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    tracing::info!(config_path = %path.display(), "status ok");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = AppConfig::load_with_path(config_path).await?;
    tracing::info!(config_path = %path.display(), "loaded config");

    let addr = cfg.bind_addr()?;
    let listener = preflight_bind_listener(addr).await?;

    let data_dir = cfg.data_dir_path()?;
    let settings = Arc::new(FileSettingsStore::open(&data_dir).await?);
    let transport =
        TelegramTransport::with_api_base(&cfg.telegram.bot_token, &cfg.telegram.api_base)?;
    let engine = Arc::new(MirrorEngine::new(
        cfg.engine.clone(),
        Arc::new(transport.clone()),
        settings.clone(),
    )?);
    engine.start().await?;

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(INTAKE_CHANNEL_CAPACITY);
    let forwarder = spawn_ingest_forwarder(engine.clone(), rx);
    let intake = if cfg.telegram.intake_enabled {
        let intake =
            TelegramIntake::new(transport).with_degradation(engine.subscribe_degradation());
        Some(intake.spawn(tx, shutdown.clone()))
    } else {
        tracing::warn!("telegram intake disabled; engine will only see externally ingested events");
        drop(tx);
        None
    };

    let state = Arc::new(AppState {
        engine: engine.clone(),
        settings,
        started_at: Utc::now(),
        intake_enabled: cfg.telegram.intake_enabled,
    });

    let app = build_app(state, &cfg.server);
    tracing::info!(%addr, "tgmirror listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server stopped");

    shutdown.cancel();
    if let Some(intake) = intake {
        join_logged(intake, "telegram intake").await;
    }
    // The forwarder exits once the intake side of the channel is dropped.
    join_logged(forwarder, "ingest forwarder").await;
    engine.shutdown().await?;
    Ok(())
}

/// Routes plus the HTTP middleware stack: request ids outermost, then
/// tracing, timeout, and a global in-flight limit.
fn build_app(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(request_span)
        .on_response(log_response)
        .on_failure(log_failure);

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

fn request_span(request: &Request<Body>) -> Span {
    tracing::info_span!(
        "http",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id_from_headers(request.headers()),
    )
}

fn log_response(response: &Response, latency: Duration, _span: &Span) {
    tracing::debug!(
        status = response.status().as_u16(),
        latency_ms = latency.as_millis() as u64,
        "http response"
    );
}

fn log_failure(class: ServerErrorsFailureClass, latency: Duration, _span: &Span) {
    tracing::error!(
        error_class = %class,
        latency_ms = latency.as_millis() as u64,
        "http request failed"
    );
}

fn spawn_ingest_forwarder(
    engine: Arc<MirrorEngine>,
    mut rx: mpsc::Receiver<InboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let source = event.source;
            match engine.ingest(event) {
                IngestOutcome::Queued { task_id, depth } => {
                    tracing::trace!(%task_id, depth, source_chat = %source.chat_id, "event queued");
                }
                IngestOutcome::Batched => {
                    tracing::trace!(source_chat = %source.chat_id, "event batched");
                }
                IngestOutcome::Ignored(reason) => {
                    tracing::trace!(
                        source_chat = %source.chat_id,
                        source_message = %source.message_id,
                        reason,
                        "event ignored"
                    );
                }
            }
        }
    })
}

async fn join_logged(handle: JoinHandle<()>, name: &'static str) {
    match handle.await {
        Ok(()) => tracing::info!(task = name, "shutdown completed"),
        Err(e) => tracing::error!(task = name, error = %e, "task join failed during shutdown"),
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::debug!(%addr, "bound http listener");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> &str {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("missing")
}

/// Resolves on ctrl-c, SIGTERM, or an internal cancel, and cancels `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!(signal = "ctrl-c", "shutting down"),
        _ = terminate => tracing::warn!(signal = "SIGTERM", "shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_falls_back_when_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc-123".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc-123");
    }

    #[tokio::test]
    async fn preflight_bind_reports_conflicting_address() {
        let first = preflight_bind_listener("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind ephemeral");
        let taken = first.local_addr().expect("local addr");
        let err = preflight_bind_listener(taken)
            .await
            .expect_err("address already bound");
        assert!(err.to_string().contains("preflight bind failed"));
    }
}
