//! Client for the enrollment/login REST backend.
//!
//! The backend persists embeddings and makes every match decision. This
//! client only ships vectors to it; nothing is stored locally.

use crate::config::ApiConfig;
use chrono::{DateTime, Utc};
use faceid_core::{CaptureOutcome, RankedCandidate};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid API configuration: {0}")]
    Config(String),
}

/// Server verdict for an enrollment or login submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiVerdict {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct EnrollRequest<'a> {
    identity: &'a str,
    embedding: &'a [f32],
    session_id: Uuid,
    samples: usize,
    captured_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    /// Closest-to-consensus first.
    candidates: Vec<&'a [f32]>,
    captured_at: DateTime<Utc>,
}

/// Destination for finished captures.
#[allow(async_fn_in_trait)]
pub trait EnrollmentApi {
    async fn enroll(&self, identity: &str, outcome: &CaptureOutcome) -> Result<ApiVerdict, ApiError>;
    async fn login(&self, candidates: &[RankedCandidate]) -> Result<ApiVerdict, ApiError>;
}

pub struct RestEnrollmentApi {
    config: ApiConfig,
    http: Client,
}

impl RestEnrollmentApi {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        if config.base_url.trim().is_empty() {
            return Err(ApiError::Config("base_url cannot be empty".to_string()));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;

        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<ApiVerdict, ApiError> {
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json::<ApiVerdict>().await?)
    }
}

impl EnrollmentApi for RestEnrollmentApi {
    async fn enroll(&self, identity: &str, outcome: &CaptureOutcome) -> Result<ApiVerdict, ApiError> {
        let body = EnrollRequest {
            identity,
            embedding: outcome.embedding.as_slice(),
            session_id: outcome.session_id,
            samples: outcome.accepted,
            captured_at: Utc::now(),
        };
        tracing::info!(identity, session = %outcome.session_id, "submitting enrollment");
        self.post("faceid/enroll", &body).await
    }

    async fn login(&self, candidates: &[RankedCandidate]) -> Result<ApiVerdict, ApiError> {
        let body = LoginRequest {
            candidates: candidates.iter().map(|c| c.embedding.as_slice()).collect(),
            captured_at: Utc::now(),
        };
        tracing::info!(candidates = candidates.len(), "submitting login candidates");
        self.post("faceid/login", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::FaceEmbedding;

    fn config(base_url: &str) -> ApiConfig {
        ApiConfig {
            base_url: base_url.to_string(),
            token: None,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let api = RestEnrollmentApi::new(config("http://backend/api/")).unwrap();
        assert_eq!(api.url("faceid/enroll"), "http://backend/api/faceid/enroll");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(matches!(
            RestEnrollmentApi::new(config("  ")),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn test_login_payload_shape() {
        let candidates = [
            RankedCandidate {
                index: 2,
                embedding: FaceEmbedding::new(vec![0.6, 0.8]),
                distance: 0.1,
            },
            RankedCandidate {
                index: 0,
                embedding: FaceEmbedding::new(vec![1.0, 0.0]),
                distance: 0.4,
            },
        ];
        let body = LoginRequest {
            candidates: candidates.iter().map(|c| c.embedding.as_slice()).collect(),
            captured_at: Utc::now(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["candidates"], serde_json::json!([[0.6, 0.8], [1.0, 0.0]]));
        assert!(json["captured_at"].is_string());
    }

    #[test]
    fn test_verdict_optional_fields() {
        let verdict: ApiVerdict = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(
            verdict,
            ApiVerdict {
                success: true,
                identity: None,
                message: None
            }
        );
    }
}
