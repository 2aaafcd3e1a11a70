//! HTTP authority client: status mapping and retry.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AuthorityClient, AuthorityStatus, RangeRequest};
use crate::config::AuthorityConfig;
use crate::error::{FolioError, FolioResult};

const USER_AGENT_VALUE: &str = concat!("folio-core/", env!("CARGO_PKG_VERSION"));

/// Cap for server-requested and exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    tracking_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    artifact_url: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Failure of a single HTTP attempt.
#[derive(Debug)]
enum AttemptError {
    RateLimited { retry_after: Option<Duration> },
    Transient { message: String },
    Fatal(FolioError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    fn into_error(self) -> FolioError {
        match self {
            Self::RateLimited { .. } => FolioError::AuthorityUnavailable {
                message: "rate limited".to_string(),
            },
            Self::Transient { message } => FolioError::AuthorityUnavailable { message },
            Self::Fatal(e) => e,
        }
    }
}

/// Authority client speaking JSON over HTTP.
///
/// | Call | Endpoint |
/// |------|----------|
/// | submit | `POST {url}/caf/requests` -> `{tracking_id}` |
/// | status | `GET {url}/caf/requests/{tracking_id}` -> `{status, artifact_url?, reason?}` |
/// | download | `GET {artifact_url}` (absolute, or relative to `url`) |
#[derive(Debug, Clone)]
pub struct HttpAuthorityClient {
    client: reqwest::Client,
    base_url: String,
    config: AuthorityConfig,
}

impl HttpAuthorityClient {
    pub fn new(config: AuthorityConfig) -> FolioResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(default_headers)
            .build()
            .map_err(|e| FolioError::Config {
                message: format!("failed to create HTTP client: {e}"),
            })?;

        let base_url = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    fn resolve(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            format!("{}/{}", self.base_url, location.trim_start_matches('/'))
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&RangeRequest>,
    ) -> FolioResult<reqwest::Response> {
        use rand::Rng;

        let mut retries = 0;
        let max_retries = self.config.max_retries;

        loop {
            match self.request_once(method.clone(), url, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;

                    let backoff = match &e {
                        AttemptError::RateLimited {
                            retry_after: Some(retry_after),
                        } => {
                            let base_ms = (*retry_after).min(MAX_BACKOFF).as_millis() as u64;
                            let jitter: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
                            Duration::from_millis(((base_ms as f64) * jitter).round() as u64)
                                .max(Duration::from_millis(100))
                        }
                        _ => {
                            let base = Duration::from_secs(1 << retries).min(MAX_BACKOFF);
                            let jittered_ms =
                                rand::thread_rng().gen_range(0..=base.as_millis() as u64);
                            Duration::from_millis(jittered_ms.max(10))
                        }
                    };

                    warn!(
                        error = ?e,
                        url,
                        retry = retries,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying authority request"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into_error()),
            }
        }
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&RangeRequest>,
    ) -> Result<reqwest::Response, AttemptError> {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.config.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| AttemptError::Transient {
            message: e.to_string(),
        })?;
        let status = response.status();

        match status.as_u16() {
            200..=299 => Ok(response),

            401 | 403 => Err(AttemptError::Fatal(FolioError::Config {
                message: format!("authority refused credentials (HTTP {})", status.as_u16()),
            })),

            404 => Err(AttemptError::Fatal(FolioError::not_found(format!(
                "authority resource {url}"
            )))),

            429 => {
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(AttemptError::RateLimited { retry_after })
            }

            code if status.is_server_error() => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(AttemptError::Transient {
                    message: format!("HTTP {code}: {message}"),
                })
            }

            code => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(AttemptError::Fatal(FolioError::InvalidRequest {
                    reason: format!("authority returned HTTP {code}: {message}"),
                }))
            }
        }
    }
}

#[async_trait]
impl AuthorityClient for HttpAuthorityClient {
    async fn submit_request(&self, request: &RangeRequest) -> FolioResult<String> {
        let url = format!("{}/caf/requests", self.base_url);
        debug!(
            url = %url,
            issuer = %request.issuer,
            doc_type = %request.doc_type,
            quantity = request.quantity(),
            "submitting range request"
        );

        let response = self
            .request(reqwest::Method::POST, &url, Some(request))
            .await?;
        let body: SubmitResponse = response.json().await.map_err(|e| {
            FolioError::AuthorityUnavailable {
                message: format!("malformed submit response: {e}"),
            }
        })?;
        if body.tracking_id.trim().is_empty() {
            return Err(FolioError::AuthorityUnavailable {
                message: "authority returned an empty tracking id".to_string(),
            });
        }
        Ok(body.tracking_id)
    }

    async fn query_status(&self, tracking_id: &str) -> FolioResult<AuthorityStatus> {
        let url = format!("{}/caf/requests/{tracking_id}", self.base_url);
        let response = self.request(reqwest::Method::GET, &url, None).await?;
        let body: StatusResponse = response.json().await.map_err(|e| {
            FolioError::AuthorityUnavailable {
                message: format!("malformed status response: {e}"),
            }
        })?;

        match body.status.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(AuthorityStatus::Pending),
            "ACCEPTED" => {
                let artifact_location =
                    body.artifact_url.ok_or_else(|| FolioError::InvalidArtifact {
                        reason: format!("accepted request {tracking_id} has no artifact_url"),
                    })?;
                Ok(AuthorityStatus::Accepted { artifact_location })
            }
            "REJECTED" => Ok(AuthorityStatus::Rejected {
                reason: body
                    .reason
                    .unwrap_or_else(|| "no reason provided".to_string()),
            }),
            other => Err(FolioError::AuthorityUnavailable {
                message: format!("unknown request status from authority: {other}"),
            }),
        }
    }

    async fn download(&self, artifact_location: &str) -> FolioResult<Vec<u8>> {
        let url = self.resolve(artifact_location);
        debug!(url = %url, "downloading authorization artifact");
        let response = self.request(reqwest::Method::GET, &url, None).await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute_locations() {
        let client = HttpAuthorityClient::new(AuthorityConfig {
            url: "https://authority.example/api/".into(),
            ..AuthorityConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.resolve("/artifacts/1.json"),
            "https://authority.example/api/artifacts/1.json"
        );
        assert_eq!(
            client.resolve("https://cdn.example/a.json"),
            "https://cdn.example/a.json"
        );
    }

    #[test]
    fn test_attempt_errors_map_to_folio_errors() {
        let e = AttemptError::RateLimited { retry_after: None };
        assert!(e.is_retryable());
        assert!(e.into_error().is_retryable());

        let fatal = AttemptError::Fatal(FolioError::not_found("x"));
        assert!(!fatal.is_retryable());
        assert!(matches!(fatal.into_error(), FolioError::NotFound { .. }));
    }
}
