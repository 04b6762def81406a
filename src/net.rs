use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_TIMEOUT_MS: u64 = 15_000;
pub const MAX_URL_LENGTH: usize = 2048;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("insecure transport refused for '{url}'")]
    InsecureTransport { url: String },

    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token acquisition failed: {0}")]
    TokenUnavailable(String),
}

/// Validated endpoint URL - immutable after construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    url: String,
    scheme: String,
    host: String,
}

impl ValidatedUrl {
    pub fn new(url: impl Into<String>) -> Result<Self, NetError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(NetError::InvalidUrl {
                url,
                reason: "URL cannot be empty".to_string(),
            });
        }
        if url.len() > MAX_URL_LENGTH {
            return Err(NetError::InvalidUrl {
                url: url.chars().take(100).collect::<String>() + "...",
                reason: format!("URL exceeds maximum length of {MAX_URL_LENGTH} bytes"),
            });
        }

        let parsed = Url::parse(&url).map_err(|e| NetError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(NetError::InvalidUrl {
                url,
                reason: format!("invalid scheme '{scheme}', only 'http' and 'https' are allowed"),
            });
        }

        let host = parsed
            .host_str()
            .ok_or_else(|| NetError::InvalidUrl {
                url: url.clone(),
                reason: "URL must have a host".to_string(),
            })?
            .to_lowercase();

        if !parsed.username().is_empty() || parsed.password().is_some() {
            return Err(NetError::InvalidUrl {
                url,
                reason: "credentials in URL are not allowed".to_string(),
            });
        }

        Ok(Self {
            url: parsed.to_string(),
            scheme,
            host,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

/// Structured diagnostic from a non-2xx response body, preserved verbatim in
/// dead-letter records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Normalized response shape regardless of transport.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PostResponse {
    pub ok: bool,
    pub status: u16,
    pub issues: Vec<OperationIssue>,
}

impl PostResponse {
    pub fn first_diagnostic(&self) -> Option<&str> {
        self.issues.iter().find_map(|i| i.diagnostics.as_deref())
    }
}

/// Capability that supplies a bearer token for the clinical-data server.
/// Token refresh is owned by the host; the engine only consumes it.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, NetError>;
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn post_bundle(
        &self,
        url: &ValidatedUrl,
        body: &str,
        token: &str,
    ) -> Result<PostResponse, NetError>;
}

#[derive(Clone, Copy, Debug)]
pub struct NetworkConfig {
    pub timeout_ms: u64,
    /// Permit plaintext http endpoints. Off in production; the client fails
    /// closed before any request leaves the device.
    pub allow_insecure_http: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            allow_insecure_http: false,
        }
    }
}

/// HTTPS transport for transaction bundles. Each call gets its own freshly
/// created timeout; an expiry aborts that attempt only and surfaces as a
/// transient `Timeout`.
pub struct HttpNetworkClient {
    http: reqwest::Client,
    config: NetworkConfig,
}

impl HttpNetworkClient {
    pub fn new(config: NetworkConfig) -> Result<Self, NetError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(Self { http, config })
    }
}

#[derive(Debug, Default, Deserialize)]
struct OperationOutcomeBody {
    #[serde(default)]
    issue: Vec<OperationIssue>,
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn post_bundle(
        &self,
        url: &ValidatedUrl,
        body: &str,
        token: &str,
    ) -> Result<PostResponse, NetError> {
        if !url.is_tls() && !self.config.allow_insecure_http {
            return Err(NetError::InsecureTransport {
                url: url.as_str().to_string(),
            });
        }

        let timeout_ms = self.config.timeout_ms;
        let request = self
            .http
            .post(url.as_str())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/fhir+json")
            .body(body.to_string());

        let exchange = async move {
            let response = request
                .send()
                .await
                .map_err(|e| NetError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            let ok = response.status().is_success();
            let text = response.text().await.unwrap_or_default();
            Ok::<_, NetError>((ok, status, text))
        };

        let (ok, status, text) = tokio::time::timeout(Duration::from_millis(timeout_ms), exchange)
            .await
            .map_err(|_| NetError::Timeout { timeout_ms })??;

        let issues = if ok {
            Vec::new()
        } else {
            serde_json::from_str::<OperationOutcomeBody>(&text)
                .map(|o| o.issue)
                .unwrap_or_default()
        };

        debug!(status, ok, "bundle POST completed");
        Ok(PostResponse { ok, status, issues })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(ValidatedUrl::new("https://fhir.example.org/base").is_ok());
        assert!(ValidatedUrl::new("http://fhir.example.org/base").is_ok());
        assert!(ValidatedUrl::new("").is_err());
        assert!(ValidatedUrl::new("   ").is_err());
        assert!(ValidatedUrl::new("ftp://example.org").is_err());
        assert!(ValidatedUrl::new("https://user:pw@example.org").is_err());
        assert!(ValidatedUrl::new("not a url").is_err());
    }

    #[test]
    fn url_normalizes_scheme_and_host() {
        let url = ValidatedUrl::new("HTTPS://FHIR.Example.ORG/base").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host(), "fhir.example.org");
        assert!(url.is_tls());
    }

    #[test]
    fn plain_http_is_not_tls() {
        let url = ValidatedUrl::new("http://fhir.example.org/base").unwrap();
        assert!(!url.is_tls());
    }

    #[tokio::test]
    async fn insecure_transport_fails_closed_before_any_request() {
        let client = HttpNetworkClient::new(NetworkConfig::default()).unwrap();
        let url = ValidatedUrl::new("http://fhir.example.org/base").unwrap();

        let err = client.post_bundle(&url, "{}", "token").await.unwrap_err();
        assert!(matches!(err, NetError::InsecureTransport { .. }));
    }

    #[test]
    fn operation_outcome_parsing_is_tolerant() {
        let body = r#"{"resourceType":"OperationOutcome","issue":[
            {"severity":"error","code":"invalid","diagnostics":"bad resource"}
        ]}"#;
        let parsed: OperationOutcomeBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.issue.len(), 1);
        assert_eq!(parsed.issue[0].diagnostics.as_deref(), Some("bad resource"));

        let parsed: Result<OperationOutcomeBody, _> = serde_json::from_str("not json");
        assert!(parsed.is_err());
    }

    #[test]
    fn first_diagnostic_skips_empty_issues() {
        let response = PostResponse {
            ok: false,
            status: 400,
            issues: vec![
                OperationIssue::default(),
                OperationIssue {
                    diagnostics: Some("duplicate identifier".into()),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(response.first_diagnostic(), Some("duplicate identifier"));
    }
}
