//! HTTP client for the platform's web endpoints.
//!
//! Handles cookie-jar authentication, the common form fields every call
//! carries, timeout management, retry with exponential backoff, and the
//! login check applied to each response body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use tracing::{debug, warn};

use msgr_core::config::HttpConfig;
use msgr_core::error::{MsgrError, MsgrResult};

use crate::credentials::Credentials;
use crate::graphql::check_login;

/// Anything that can POST a form to the platform and hand back a body
/// that already passed the login check.
///
/// The listener only depends on this seam so tests can script responses.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    /// POST `form` (plus the session's common fields) to `path`.
    async fn post_form(&self, path: &str, form: &[(String, String)]) -> MsgrResult<String>;
}

/// Retry configuration for HTTP requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt).
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// HTTP status codes that trigger a retry.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            retryable_statuses: vec![502, 503, 504],
        }
    }
}

/// Cookie-authenticated HTTP client.
#[derive(Clone)]
pub struct ApiClient {
    inner: Client,
    /// Web origin, e.g. `https://www.facebook.com`.
    base_url: String,
    /// Default request timeout.
    timeout: Duration,
    user_id: String,
    actor_id: String,
    fb_dtsg: Option<String>,
    retry_config: RetryConfig,
}

impl ApiClient {
    /// Create a client that sends the credentials' cookies on every request.
    pub fn new(config: &HttpConfig, credentials: &Credentials, user_agent: &str) -> MsgrResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ORIGIN,
            header::HeaderValue::from_str(config.base_url.trim_end_matches('/'))
                .map_err(|e| MsgrError::Config(format!("invalid base url header: {e}")))?,
        );

        let inner = Client::builder()
            .cookie_provider(credentials.jar())
            .user_agent(user_agent)
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_secs(15))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| MsgrError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            inner,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            user_id: credentials.user_id.clone(),
            actor_id: credentials.actor_id().to_string(),
            fb_dtsg: credentials.fb_dtsg.clone(),
            retry_config: RetryConfig::default(),
        })
    }

    /// Set custom retry configuration.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Get the web origin.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fields every form POST carries.
    fn common_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("__user".to_string(), self.user_id.clone()),
            ("__a".to_string(), "1".to_string()),
            ("av".to_string(), self.actor_id.clone()),
        ];
        if let Some(ref token) = self.fb_dtsg {
            fields.push(("fb_dtsg".to_string(), token.clone()));
        }
        fields
    }

    /// Execute a form POST with exponential backoff retry.
    async fn post_with_retry(&self, path: &str, form: &[(String, String)]) -> MsgrResult<Response> {
        let url = self.url(path);
        debug!("POST {}", path);

        let mut fields = self.common_fields();
        for (k, v) in form {
            fields.retain(|(existing, _)| existing != k);
            fields.push((k.clone(), v.clone()));
        }

        let mut last_error: Option<MsgrError> = None;

        for attempt in 0..=self.retry_config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_retry_delay(attempt - 1);
                warn!(
                    "retrying POST {} (attempt {}/{}) after {:.1}s",
                    path,
                    attempt + 1,
                    self.retry_config.max_retries + 1,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }

            let builder = self.inner.post(&url).form(&fields).timeout(self.timeout);

            match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if self
                        .retry_config
                        .retryable_statuses
                        .contains(&status.as_u16())
                        && attempt < self.retry_config.max_retries
                    {
                        warn!("retryable status {} from {}", status.as_u16(), path);
                        last_error = Some(MsgrError::ServerError {
                            status: status.as_u16(),
                            message: format!("retryable status {status}"),
                        });
                        continue;
                    }

                    return Self::check_status(response).await;
                }
                Err(e) => {
                    let is_retryable = e.is_timeout() || e.is_connect();
                    let err = Self::classify_error(e);

                    if is_retryable && attempt < self.retry_config.max_retries {
                        warn!("retryable error on {}: {}", path, err);
                        last_error = Some(err);
                        continue;
                    }

                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| MsgrError::Http("max retries exceeded".into())))
    }

    /// Calculate retry delay with exponential backoff.
    fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.retry_config.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        let max_ms = self.retry_config.max_delay.as_millis() as u64;
        Duration::from_millis(delay_ms.min(max_ms))
    }

    /// Check the HTTP status code and convert to MsgrError if needed.
    async fn check_status(response: Response) -> MsgrResult<Response> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(MsgrError::AuthFailed(format!("Not logged in (server returned {status})")));
        }

        if status.is_server_error() || status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MsgrError::ServerError {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(response)
    }

    /// Classify a reqwest error into a MsgrError variant.
    fn classify_error(e: reqwest::Error) -> MsgrError {
        if e.is_timeout() {
            MsgrError::Timeout(e.to_string())
        } else if e.is_connect() {
            MsgrError::Http(format!("connection failed: {e}"))
        } else {
            MsgrError::Http(e.to_string())
        }
    }
}

#[async_trait]
impl GraphqlTransport for ApiClient {
    async fn post_form(&self, path: &str, form: &[(String, String)]) -> MsgrResult<String> {
        let response = self.post_with_retry(path, form).await?;
        let body = response
            .text()
            .await
            .map_err(|e| MsgrError::Http(format!("failed to read response body: {e}")))?;
        check_login(&body)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use reqwest::cookie::Jar;

    fn test_client() -> ApiClient {
        let creds = Credentials::new("100", Arc::new(Jar::default()), "https://www.facebook.com")
            .unwrap()
            .with_fb_dtsg("tok");
        ApiClient::new(&HttpConfig::default(), &creds, "test-agent").unwrap()
    }

    #[test]
    fn test_retry_delay_calculation() {
        let client = test_client();
        assert_eq!(client.calculate_retry_delay(0), Duration::from_millis(500));
        assert_eq!(client.calculate_retry_delay(1), Duration::from_secs(1));
        assert_eq!(client.calculate_retry_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_retry_delay_capped() {
        let client = test_client();
        assert!(client.calculate_retry_delay(40) <= Duration::from_secs(4));
    }

    #[test]
    fn test_common_fields() {
        let client = test_client();
        let fields = client.common_fields();
        assert!(fields.contains(&("__user".to_string(), "100".to_string())));
        assert!(fields.contains(&("av".to_string(), "100".to_string())));
        assert!(fields.contains(&("fb_dtsg".to_string(), "tok".to_string())));
    }

    #[test]
    fn test_url_joins_base() {
        let client = test_client();
        assert_eq!(client.url("/api/graphqlbatch/"), "https://www.facebook.com/api/graphqlbatch/");
    }
}
