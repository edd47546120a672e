//! Webhook notifier. Pushes fill and cycle events to an external endpoint.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied on network errors, rate limits and 5xx
//!   responses, up to [`MAX_BACKOFF_SECS`] seconds.
//! * Any other 4xx response is a hard failure and is not retried.
//! * After `max_attempts` deliveries the event is given up on; the ledger is
//!   the source of truth, the webhook only mirrors it.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::{Result, ServiceError};
use crate::events::EngineEvent;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    url: String,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl Notifier {
    pub fn new(client: Client, url: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            client,
            url: url.into(),
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }

    #[cfg(test)]
    fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Deliver one event, retrying transient failures.
    pub async fn publish(&self, event: &EngineEvent) -> Result<()> {
        let body = json!({
            "kind": event.kind().as_str(),
            "payload": event,
        });
        let mut backoff = self.initial_backoff;
        let max_backoff = Duration::from_secs(MAX_BACKOFF_SECS);

        for attempt in 1..=self.max_attempts {
            let last = attempt == self.max_attempts;
            match self.client.post(&self.url).json(&body).send().await {
                Err(e) => {
                    if last {
                        return Err(e.into());
                    }
                    warn!("Webhook request failed (will retry in {backoff:?}): {e}");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!("Delivered {} event (attempt {attempt})", event.kind().as_str());
                        return Ok(());
                    }
                    if !is_retryable(status) || last {
                        return Err(ServiceError::Webhook(format!(
                            "{} responded {status}",
                            self.url
                        )));
                    }
                    warn!("Webhook responded {status} (will retry in {backoff:?})");
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }

        Err(ServiceError::Webhook(format!(
            "{} not reached after {} attempts",
            self.url, self.max_attempts
        )))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
