//! Client for the result relay backend.
//!
//! The relay receives CI callbacks, keeps the latest results per request and
//! rebroadcasts them to push subscribers. This module is the coordinator's
//! side of that: a health probe and a stored-results query.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{ChannelError, ConfigurationError};
use crate::model::{RequestId, SubjectId, TestResult};

/// Latest results the relay holds for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResults {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<SubjectId>,
    pub results: Vec<TestResult>,
    pub updated_at: DateTime<Utc>,
}

/// A result payload as posted by CI and rebroadcast over the push channel.
///
/// Older workflows only send the subject id; those payloads are routed to
/// the subject's active request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(default, alias = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(
        default,
        alias = "subjectId",
        alias = "requirement_id",
        alias = "requirementId",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject_id: Option<SubjectId>,
    #[serde(alias = "testResults")]
    pub results: Vec<TestResult>,
}

/// Result relay backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Returns Ok if the backend is reachable and healthy.
    async fn health(&self) -> Result<(), ChannelError>;

    /// Fetch stored results for a request. `None` when nothing is stored yet.
    async fn fetch_results(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<StoredResults>, ChannelError>;
}

/// HTTP implementation of [`BackendApi`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client for the relay at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, ConfigurationError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigurationError::InvalidBackendUrl {
                url: base_url,
                reason: "expected an http(s) URL".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ConfigurationError::Client(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// Base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Server-sent events stream of incoming results.
    pub fn events_url(&self) -> String {
        format!("{}/api/events", self.base_url)
    }

    /// Where CI should post results.
    pub fn callback_url(&self) -> String {
        format!("{}/api/webhook/results", self.base_url)
    }

    /// Shared HTTP client, reused by the push channel.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn health(&self) -> Result<(), ChannelError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ChannelError::transport)?;
        if !response.status().is_success() {
            return Err(ChannelError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %request_id))]
    async fn fetch_results(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<StoredResults>, ChannelError> {
        let url = format!("{}/api/results/{}", self.base_url, request_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ChannelError::transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("no stored results yet");
                Ok(None)
            }
            status if status.is_success() => response
                .json::<StoredResults>()
                .await
                .map(Some)
                .map_err(|e| ChannelError::Decode(e.to_string())),
            status => Err(ChannelError::Status {
                status: status.as_u16(),
                url,
            }),
        }
    }
}
