//! Push channel for deploy task updates.
//!
//! The platform pushes a JSON [`DeployEvent`] per text frame. Every event is
//! handed to the tracker, which ignores the ones it is not waiting for.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use shipyard_deploy::DeployStateTracker;
use shipyard_protocol::DeployEvent;
use shipyard_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_READ_TIMEOUT};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ApiError;

/// Backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt `attempt` (1-based), with up to ±20% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        // [-1.0, 1.0)
        let offset = f64::from(nanos) / 1_000_000_000.0 * 2.0 - 1.0;
        Duration::from_secs_f64((capped * (1.0 + 0.2 * offset)).max(0.05))
    }
}

/// Follows the push channel and applies every event to a tracker.
pub struct EventListener {
    url: String,
    token: Option<String>,
    tracker: DeployStateTracker,
    reconnect: ReconnectConfig,
}

impl EventListener {
    pub fn new(url: impl Into<String>, tracker: DeployStateTracker) -> Self {
        Self {
            url: url.into(),
            token: None,
            tracker,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Keeps the channel open until `cancel` fires, reconnecting with backoff.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut attempt = 0u32;
        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                Ok(applied) => {
                    debug!(applied, "push channel closed");
                    attempt = 0;
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "push channel failed");
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.reconnect.delay_for_attempt(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting push channel");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("push channel listener stopped");
    }

    /// Runs the listener on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Connects once and reads until the server closes, the read deadline
    /// passes, or `cancel` fires. Returns the number of events applied.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize, ApiError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ApiError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false).await?;
        info!(url = %self.url, "push channel connected");
        let (mut write, mut read) = ws_stream.split();

        let read_deadline = tokio::time::sleep(WS_READ_TIMEOUT);
        tokio::pin!(read_deadline);
        let mut applied = 0usize;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    break;
                }

                () = &mut read_deadline => {
                    warn!("no traffic on push channel, closing");
                    break;
                }

                msg = read.next() => {
                    let Some(msg) = msg else {
                        debug!("push channel stream ended");
                        break;
                    };
                    read_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + WS_READ_TIMEOUT);

                    match msg? {
                        tungstenite::Message::Text(text) => {
                            if handle_text_message(&text, &self.tracker) {
                                applied += 1;
                            }
                        }
                        tungstenite::Message::Ping(data) => {
                            trace!("received ping, sending pong");
                            let _ = write.send(tungstenite::Message::Pong(data)).await;
                        }
                        tungstenite::Message::Close(_) => {
                            debug!("received close frame");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(applied)
    }
}

/// Parses one pushed event and applies it. Returns whether the tracker used it.
fn handle_text_message(text: &str, tracker: &DeployStateTracker) -> bool {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return false;
    }

    let event: DeployEvent = match serde_json::from_str(text) {
        Ok(ev) => ev,
        Err(e) => {
            warn!("failed to parse pushed event: {e}");
            return false;
        }
    };

    trace!(
        deployment = %event.deployment_id,
        task = %event.task_id,
        status = ?event.status,
        "received deploy event"
    );
    tracker.apply_event(&event)
}
