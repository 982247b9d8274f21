//! Publishing messages to the broadcast server.
//!
//! Each publish is one `POST` of the raw payload. The server answers
//! `200 OK` with the assigned message id as the body.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use tokio::time::timeout;
use tracing::debug;

use ssecast_core::MessageId;

use crate::error::{ClientError, Result};

/// Default limit for a whole publish round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends messages to one endpoint.
#[derive(Debug, Clone)]
pub struct Publisher {
    url: Url,
    client: Client,
    request_timeout: Duration,
}

impl Publisher {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Publishes `payload` and returns the id the server assigned to it.
    ///
    /// # Errors
    ///
    /// * `ClientError::Http` - the server could not be reached
    /// * `ClientError::Rejected` - the server answered with an error status
    ///   (e.g. 400 for an empty payload, 503 while shutting down)
    /// * `ClientError::Timeout` - the round trip exceeded the request timeout
    pub async fn publish(&self, payload: impl AsRef<[u8]>) -> Result<MessageId> {
        timeout(self.request_timeout, self.round_trip(payload.as_ref()))
            .await
            .map_err(|_| ClientError::Timeout(self.request_timeout))?
    }

    async fn round_trip(&self, payload: &[u8]) -> Result<MessageId> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?.trim().to_string();

        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            });
        }

        let id = body
            .parse::<MessageId>()
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        debug!(message_id = %id, bytes = payload.len(), "Message published");
        Ok(id)
    }
}
