//! Client for invoking the Compliance Guardian Agent remotely
//!
//! Used by dashboards and representative tooling to read status,
//! trigger sweeps, and cast consultation votes. Also home of the HTTP
//! health-check source the aggregator polls collaborators with.

use crate::contracts::{HealthReport, SessionStatus, StatusSnapshot, SweepReport};
use crate::engine::HealthCheckable;
use crate::error::GuardianError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Polls one collaborator's health endpoint
pub struct HttpHealthSource {
    id: String,
    endpoint: String,
    client: reqwest::Client,
    conservative_default: f64,
}

impl HttpHealthSource {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            conservative_default: 0.5,
        }
    }

    /// Override the score substituted when this source is unreachable
    pub fn with_conservative_default(mut self, value: f64) -> Self {
        self.conservative_default = value;
        self
    }
}

impl HealthCheckable for HttpHealthSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn conservative_default(&self) -> f64 {
        self.conservative_default
    }

    fn health_check(
        &self,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = crate::error::Result<HealthReport>> + Send>,
    > {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let source_id = self.id.clone();

        Box::pin(async move {
            let response = client.get(&endpoint).send().await.map_err(|e| {
                GuardianError::SourceUnavailable {
                    source_id: source_id.clone(),
                    reason: e.to_string(),
                }
            })?;

            if !response.status().is_success() {
                return Err(GuardianError::SourceUnavailable {
                    source_id: source_id.clone(),
                    reason: format!("status {}", response.status()),
                });
            }

            response
                .json()
                .await
                .map_err(|e| GuardianError::SourceUnavailable {
                    source_id,
                    reason: format!("malformed health report: {}", e),
                })
        })
    }
}

/// Compliance Guardian Agent client
pub struct GuardianClient {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl GuardianClient {
    /// Create new client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            timeout: Duration::from_millis(5000),
        }
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the full status snapshot
    pub async fn status(&self) -> Result<StatusSnapshot, ClientError> {
        let url = format!("{}/api/v1/guardian/status", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| ClientError::Parse(e.to_string()))
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(ClientError::Server {
                status: status.as_u16(),
                message: error_text,
            })
        }
    }

    /// Trigger one sweep outside the periodic schedule
    pub async fn sweep(&self) -> Result<SweepReport, ClientError> {
        let url = format!("{}/api/v1/guardian/sweep", self.base_url);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status().is_success() {
            let data: ApiResponse<SweepReport> = response
                .json()
                .await
                .map_err(|e| ClientError::Parse(e.to_string()))?;
            Ok(data.data)
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(ClientError::Server {
                status: status.as_u16(),
                message: error_text,
            })
        }
    }

    /// Cast one representative's vote on a consultation session
    pub async fn vote(
        &self,
        session_id: Uuid,
        representative: impl Into<String>,
        approve: bool,
    ) -> Result<SessionStatus, ClientError> {
        let url = format!("{}/api/v1/consultations/{}/votes", self.base_url, session_id);

        let request = VoteRequest {
            representative: representative.into(),
            approve,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;

        if response.status().is_success() {
            let data: VoteResponse = response
                .json()
                .await
                .map_err(|e| ClientError::Parse(e.to_string()))?;
            Ok(data.status)
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            Err(ClientError::Server {
                status: status.as_u16(),
                message: error_text,
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct VoteRequest {
    representative: String,
    approve: bool,
}

#[derive(Debug, Deserialize)]
struct VoteResponse {
    #[allow(dead_code)]
    session_id: Uuid,
    status: SessionStatus,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: T,
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
}
