use reqwest::{Client, header::{HeaderValue, AUTHORIZATION}};
use crate::config::Credential;
use crate::error::{Error, Result};
use crate::protocol::models::ArbitraryJson;
use serde::Serialize;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Serialize)]
struct CreateSessionRequest<'a> {
    model: &'a str,
    voice: &'a str,
    instructions: &'a str,
}

/// Requests ephemeral realtime sessions from the upstream REST API.
#[derive(Clone, Debug)]
pub struct SessionTokenClient {
    client: Client,
    base_url: String,
    auth_header: HeaderValue,
}

impl SessionTokenClient {
    /// Create a client for the REST API rooted at `base_url`.
    ///
    /// # Errors
    /// Returns an error if the credential results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: impl Into<String>, credential: &Credential) -> Result<Self> {
        Self::new_with_timeouts(base_url, credential, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// Create a client with custom timeouts.
    ///
    /// # Errors
    /// Returns an error if the credential results in an invalid header or client build fails.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        base_url: impl Into<String>,
        credential: &Credential,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;

        let mut auth_header = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))?;
        auth_header.set_sensitive(true);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    /// Create an ephemeral session and return the upstream's JSON body as is.
    ///
    /// # Errors
    /// Returns `Http` if the request fails, or `UpstreamConnect` with the
    /// status only if the upstream refuses. The refusal body is logged, not
    /// returned, since it may echo request details.
    pub async fn create_session(
        &self,
        model: &str,
        voice: &str,
        instructions: &str,
    ) -> Result<ArbitraryJson> {
        let url = format!("{}/sessions", self.base_url);
        tracing::debug!(%url, %model, %voice, "Requesting ephemeral session");

        let res = self.client
            .post(url)
            .header(AUTHORIZATION, &self.auth_header)
            .json(&CreateSessionRequest { model, voice, instructions })
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::error!(%status, body = %crate::protocol::codec::safe_truncate(&body, 512), "Upstream refused session request");
            return Err(Error::UpstreamConnect(format!(
                "session request failed with HTTP {}",
                status.as_u16()
            )));
        }

        Ok(res.json().await?)
    }
}
