//! Fire-and-forget notifications to external channels.
//!
//! Workers and the reconciler emit a [`Notification`] after batches,
//! reclaims, and fatal conditions. Delivery failures are logged and
//! swallowed; the queue never blocks or fails on a notifier.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::model::Stage;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BatchFinished {
        stage: Stage,
        worker_id: String,
        done: usize,
        failed: usize,
    },
    LeasesReclaimed {
        stage: Stage,
        count: u64,
    },
    FatalError {
        context: String,
        error: String,
    },
}

impl Notification {
    /// Throttle key: notifications sharing a tag are rate-limited together.
    pub fn tag(&self) -> String {
        match self {
            Notification::BatchFinished { stage, .. } => format!("batch_{stage}"),
            Notification::LeasesReclaimed { stage, .. } => format!("reclaimed_{stage}"),
            Notification::FatalError { .. } => "fatal_error".to_string(),
        }
    }

    /// Minimum spacing between notifications with the same tag. Fatal
    /// errors repeat in tight loops, so they get a wider window.
    pub fn min_interval(&self) -> Duration {
        match self {
            Notification::FatalError { .. } => Duration::from_secs(600),
            _ => Duration::from_secs(300),
        }
    }

    /// Human-readable one-liner for chat-style channels.
    pub fn render(&self) -> String {
        match self {
            Notification::BatchFinished {
                stage,
                worker_id,
                done,
                failed,
            } => format!("{stage} batch finished by {worker_id}: {done} done, {failed} failed"),
            Notification::LeasesReclaimed { stage, count } => {
                format!("{count} expired {stage} lease(s) returned to pending")
            }
            Notification::FatalError { context, error } => {
                format!("fatal error in {context}: {error}")
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Must not fail and must not block the
    /// caller beyond ordinary network timeouts.
    async fn notify(&self, notification: Notification);
}

/// Default sink: notifications land in the structured log stream.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) {
        info!(
            target: "fetchq::notify",
            kind = %notification.tag(),
            "{}",
            notification.render()
        );
    }
}

/// Per-tag minimum-interval gate, so a flapping worker cannot spam an
/// external channel.
pub struct Throttle {
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true (and records the send) if enough time has passed since
    /// the last notification with this tag.
    pub fn allow(&self, tag: &str, min_interval: Duration) -> bool {
        let mut last_sent = self
            .last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match last_sent.get(tag) {
            Some(last) if now.duration_since(*last) < min_interval => false,
            _ => {
                last_sent.insert(tag.to_string(), now);
                true
            }
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends notifications to a Telegram chat via the Bot API.
pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: SecretString,
    chat_id: String,
    throttle: Throttle,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            chat_id,
            throttle: Throttle::new(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notification: Notification) {
        if !self
            .throttle
            .allow(&notification.tag(), notification.min_interval())
        {
            return;
        }

        let url = format!(
            "https://api.telegram.org/bot{}/sendMessage",
            self.bot_token.expose_secret()
        );
        let result = self
            .client
            .post(&url)
            .form(&[
                ("chat_id", self.chat_id.as_str()),
                ("text", notification.render().as_str()),
            ])
            .send()
            .await;

        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "telegram rejected notification");
            }
            Err(e) => warn!("telegram delivery failed: {e}"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_gates_repeated_tags() {
        let throttle = Throttle::new();
        let interval = Duration::from_millis(30);

        assert!(throttle.allow("batch_download", interval));
        assert!(!throttle.allow("batch_download", interval));
        // Different tag is unaffected.
        assert!(throttle.allow("batch_upload", interval));

        std::thread::sleep(Duration::from_millis(40));
        assert!(throttle.allow("batch_download", interval));
    }

    #[test]
    fn render_mentions_counts() {
        let text = Notification::BatchFinished {
            stage: Stage::Download,
            worker_id: "worker-1".into(),
            done: 7,
            failed: 2,
        }
        .render();
        assert!(text.contains("7 done"));
        assert!(text.contains("2 failed"));
    }
}
