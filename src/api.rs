//! Remote auth endpoints and the bounded retry policy.
//!
//! The session manager talks to the server exclusively through [`AuthApi`],
//! so tests can script responses without a network. [`HttpAuthApi`] is the
//! production implementation over reqwest.

use crate::config::RetryConfig;
use crate::error::Error;
use crate::token::Credentials;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

/// The three remote collaborators of the credential lifecycle.
pub trait AuthApi: Send + Sync + 'static {
    /// `POST /auth/login` with the user's credentials.
    fn login(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Value, Error>> + Send;

    /// `POST /auth/refresh` authorized by the refresh token.
    fn refresh(&self, refresh_token: &str)
    -> impl Future<Output = Result<Value, Error>> + Send;

    /// `POST /auth/logout`, best-effort server-side invalidation.
    fn logout(&self, refresh_token: &str) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Join the configured base URL with an endpoint path.
fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{path}", base_url.trim_end_matches('/'))
}

/// Map a non-success response to the error taxonomy: 4xx is an application
/// rejection and never retried, everything else is transient.
fn error_for_status(status: u16, body: Option<&Value>) -> Error {
    let message = body
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("request rejected")
        .to_string();
    if (400..500).contains(&status) {
        Error::Auth { status, message }
    } else {
        Error::Network(format!("server returned {status}: {message}"))
    }
}

/// reqwest-backed [`AuthApi`] implementation.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthApi {
    /// # Errors
    ///
    /// Returns [`Error::Network`] when the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .build()
            .map_err(|err| Error::Network(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn json_or_error(response: reqwest::Response) -> Result<Value, Error> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|err| Error::validation("response", format!("not JSON: {err}")));
        }
        let body = response.json::<Value>().await.ok();
        Err(error_for_status(status.as_u16(), body.as_ref()))
    }
}

impl AuthApi for HttpAuthApi {
    async fn login(&self, credentials: &Credentials) -> Result<Value, Error> {
        let mut body = json!({
            "identity": credentials.identity.trim(),
            "secret": credentials.secret.expose_secret(),
        });
        if let Some(code) = &credentials.mfa_code {
            body["mfaCode"] = Value::String(code.clone());
        }

        let response = self
            .client
            .post(endpoint_url(&self.base_url, "/auth/login"))
            .json(&body)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        Self::json_or_error(response).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Value, Error> {
        let response = self
            .client
            .post(endpoint_url(&self.base_url, "/auth/refresh"))
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;
        Self::json_or_error(response).await
    }

    async fn logout(&self, refresh_token: &str) -> Result<(), Error> {
        let response = self
            .client
            .post(endpoint_url(&self.base_url, "/auth/logout"))
            .bearer_auth(refresh_token)
            .send()
            .await
            .map_err(|err| Error::Network(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(error_for_status(status.as_u16(), None))
        }
    }
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// Application rejections (4xx, validation, integrity) fail immediately; only
/// [`Error::Network`] is retried, at most `policy.max_attempts` total tries.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or on the first
/// non-transient failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    operation: &'static str,
    mut run: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let backoff = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                warn!(
                    operation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying: {err}"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(operation, attempt, "giving up: {err}");
                return Err(err);
            }
        }
    }
}
