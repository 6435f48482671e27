//! Delivery client for the remote clinical records endpoint.
//!
//! Endpoint: POST <EHR_API_URL>
//! Auth: optional Bearer token
//!
//! One call to [`Transport::deliver`] issues at most one HTTP request. With
//! no endpoint configured the client is offline and every delivery is a
//! successful no-op, so the system can run with local persistence only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::debug;

use crate::domain::Submission;

use super::transform::{transform, Payload, PayloadFormat};

/// Request timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the submission's idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body kept in a [`TransportError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// A single delivery attempt failed
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Something that can hand a submission to the remote system
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Perform one delivery attempt
    async fn deliver(&self, submission: &Submission) -> Result<(), TransportError>;
}

/// HTTP client for the records endpoint
pub struct EhrClient {
    endpoint: Option<String>,
    token: Option<String>,
    format: PayloadFormat,
    timeout: Duration,
    client: reqwest::Client,
}

impl EhrClient {
    /// Create a client. Blank endpoint or token values count as absent.
    pub fn new(
        endpoint: Option<String>,
        token: Option<String>,
        format: PayloadFormat,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            token: token.filter(|t| !t.trim().is_empty()),
            format,
            timeout,
            client: reqwest::Client::new(),
        }
    }

    /// A client with no endpoint; every delivery succeeds without a request
    pub fn offline() -> Self {
        Self::new(None, None, PayloadFormat::default(), DEFAULT_TIMEOUT)
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    /// POST an already transformed payload
    pub async fn post(&self, payload: &Payload, idempotency_key: &str) -> Result<(), TransportError> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            debug!("No endpoint configured, skipping delivery");
            return Ok(());
        };

        let mut request = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(payload);

        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "Submission delivered");
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Request(error)
        }
    }
}

#[async_trait]
impl Transport for EhrClient {
    fn name(&self) -> &str {
        "ehr"
    }

    async fn deliver(&self, submission: &Submission) -> Result<(), TransportError> {
        let payload = transform(submission, self.format);
        self.post(&payload, &submission.idempotency_key()).await
    }
}
