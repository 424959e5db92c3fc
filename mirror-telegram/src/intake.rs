use crate::api::{TelegramUpdate, build_inbound_event};
use crate::transport::TelegramTransport;
use anyhow::Result;
use mirror_engine::{Degradation, InboundEvent};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LONG_POLL_TIMEOUT_SECS: u32 = 30;
const ALLOWED_UPDATES: &str =
    r#"["message","edited_message","channel_post","edited_channel_post"]"#;
/// Pause after a response that retrying soon will not fix (bad token, bad request).
const REJECTED_POLL_PAUSE: Duration = Duration::from_secs(10);
const POLL_BACKOFF_BASE: Duration = Duration::from_millis(250);
const POLL_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Pause between polls while the engine reports degradation.
const DEGRADED_POLL_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct UpdatesEnvelope {
    /// Kept raw so one update that fails to decode cannot sink the batch.
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

/// Outcome of one `getUpdates` round trip.
enum Poll {
    Updates(Vec<serde_json::Value>),
    /// Network failure, 429/408/5xx, or an undecodable body.
    Retry(String),
    /// Any other non-success status.
    Rejected(StatusCode, String),
}

/// Consecutive-failure counter for the poll loop.
#[derive(Debug, Default)]
struct PollBackoff {
    failures: u32,
}

impl PollBackoff {
    fn fail(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        retry_delay(self.failures)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Long-polls `getUpdates` and forwards mirrorable updates as engine events.
#[derive(Clone)]
pub struct TelegramIntake {
    transport: TelegramTransport,
    degradation: Option<watch::Receiver<Degradation>>,
}

impl TelegramIntake {
    pub fn new(transport: TelegramTransport) -> Self {
        Self {
            transport,
            degradation: None,
        }
    }

    /// Slows polling while the engine signals degradation.
    pub fn with_degradation(mut self, degradation: watch::Receiver<Degradation>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    fn is_degraded(&self) -> bool {
        self.degradation
            .as_ref()
            .is_some_and(|degradation| degradation.borrow().is_degraded())
    }

    pub fn spawn(
        self,
        tx: mpsc::Sender<InboundEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.run_poll_loop(tx, shutdown).await {
                Ok(()) => tracing::info!("telegram intake stopped"),
                Err(error) => tracing::error!(%error, "telegram intake stopped with error"),
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(
        &self,
        tx: mpsc::Sender<InboundEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut offset: i64 = 0;
        let mut backoff = PollBackoff::default();

        loop {
            let poll = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                poll = self.poll_once(offset) => poll?,
            };

            let pause = match poll {
                Poll::Updates(updates) => {
                    backoff.reset();
                    offset = forward_updates(updates, offset, &tx).await?;
                    if !self.is_degraded() {
                        continue;
                    }
                    tracing::debug!(pause = ?DEGRADED_POLL_PAUSE, "engine degraded; slowing intake");
                    DEGRADED_POLL_PAUSE
                }
                Poll::Retry(reason) => {
                    let delay = backoff.fail();
                    tracing::warn!(
                        %reason,
                        failures = backoff.failures,
                        ?delay,
                        "getUpdates failed; backing off"
                    );
                    delay
                }
                Poll::Rejected(status, body) => {
                    backoff.reset();
                    tracing::error!(
                        %status,
                        %body,
                        pause = ?REJECTED_POLL_PAUSE,
                        "getUpdates rejected; pausing intake"
                    );
                    REJECTED_POLL_PAUSE
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn poll_once(&self, offset: i64) -> Result<Poll> {
        let url = self.transport.api_url("getUpdates")?;
        let sent = self
            .transport
            .http()
            .get(url)
            .query(&[
                ("timeout", LONG_POLL_TIMEOUT_SECS.to_string()),
                ("offset", offset.to_string()),
                ("allowed_updates", ALLOWED_UPDATES.to_string()),
            ])
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(error) => return Ok(Poll::Retry(error.to_string())),
        };

        let status = response.status();
        if status.is_success() {
            return Ok(match response.json::<UpdatesEnvelope>().await {
                Ok(envelope) => Poll::Updates(envelope.result),
                Err(error) => Poll::Retry(format!("decode updates: {error}")),
            });
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<unreadable body: {error}>"));
        if is_retryable_status(status) {
            Ok(Poll::Retry(format!("{status}: {body}")))
        } else {
            Ok(Poll::Rejected(status, body))
        }
    }
}

/// Sends converted events downstream in update order and returns the next
/// offset. The offset moves past every update, including ones that fail to
/// decode or do not convert, so a malformed update is never fetched again.
async fn forward_updates(
    updates: Vec<serde_json::Value>,
    mut offset: i64,
    tx: &mpsc::Sender<InboundEvent>,
) -> Result<i64> {
    let mut updates: Vec<(i64, serde_json::Value)> = updates
        .into_iter()
        .filter_map(|raw| match raw.get("update_id").and_then(serde_json::Value::as_i64) {
            Some(update_id) => Some((update_id, raw)),
            None => {
                tracing::warn!("skipping update without update_id");
                None
            }
        })
        .collect();
    updates.sort_by_key(|(update_id, _)| *update_id);

    for (update_id, raw) in updates {
        if update_id < offset {
            continue;
        }
        offset = update_id.saturating_add(1);
        let update = match serde_json::from_value::<TelegramUpdate>(raw) {
            Ok(update) => update,
            Err(error) => {
                tracing::warn!(update_id, %error, "skipping undecodable update");
                continue;
            }
        };
        match build_inbound_event(&update) {
            Some(event) => tx
                .send(event)
                .await
                .map_err(|e| anyhow::anyhow!("mirror intake queue closed: {e}"))?,
            None => tracing::trace!(update_id = update.update_id, "update has nothing to mirror"),
        }
    }
    Ok(offset)
}

/// Doubling delay from [`POLL_BACKOFF_BASE`], capped at [`POLL_BACKOFF_CAP`].
fn retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    POLL_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(POLL_BACKOFF_CAP)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
    ) || status.is_server_error()
}
