//! OAuth2 client credentials exchange.
//!
//! The token source knows nothing about client authentication: it sends a
//! plain `grant_type=client_credentials` form through the transport it was
//! given and the transport chain adds the assertion.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::{Method, header};
use serde::Deserialize;
use tower::ServiceExt;

use crate::error::{Error, Result};
use crate::transport::BoxTransport;

/// Credentials are treated as expired this many seconds before their real expiry.
const EXPIRY_DELTA_SECS: i64 = 10;

/// Successful token endpoint response.
#[derive(Deserialize)]
pub struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OAuth2 error response (RFC 6749 section 5.2).
#[derive(Deserialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// The credential handed out by the issuer.
#[derive(Clone, PartialEq)]
pub struct AccessCredential {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

impl AccessCredential {
    /// Whether the credential is still usable at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + TimeDelta::seconds(EXPIRY_DELTA_SECS) < expires_at,
            None => true,
        }
    }
}

impl fmt::Debug for AccessCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessCredential")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Drives client credentials exchanges against one token endpoint.
pub struct TokenSource {
    transport: BoxTransport,
    token_url: String,
    scopes: Vec<String>,
    reuse_token: bool,
    current: Option<AccessCredential>,
}

impl TokenSource {
    pub fn new(transport: BoxTransport, token_url: impl Into<String>, scopes: Vec<String>) -> Self {
        Self {
            transport,
            token_url: token_url.into(),
            scopes,
            reuse_token: false,
            current: None,
        }
    }

    /// Hand out the last credential while it is valid instead of exchanging again.
    pub fn reuse_token(mut self, reuse: bool) -> Self {
        self.reuse_token = reuse;
        self
    }

    /// Returns a credential, exchanging for a new one unless reuse is enabled
    /// and the current one is still valid.
    pub async fn token(&mut self) -> Result<AccessCredential> {
        if self.reuse_token
            && let Some(current) = &self.current
            && current.is_valid_at(Utc::now())
        {
            return Ok(current.clone());
        }

        let credential = self.exchange().await?;
        self.current = Some(credential.clone());
        Ok(credential)
    }

    #[tracing::instrument(skip(self), fields(token_url = %self.token_url))]
    async fn exchange(&mut self) -> Result<AccessCredential> {
        let request = self.build_request()?;
        let response = self.transport.clone().oneshot(request).await?;
        parse_response(response.status(), response.body(), Utc::now())
    }

    fn build_request(&self) -> Result<http::Request<Bytes>> {
        let mut form = vec![("grant_type", "client_credentials".to_string())];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }
        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| Error::RequestTransform(e.to_string()))?;

        http::Request::builder()
            .method(Method::POST)
            .uri(&self.token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(Bytes::from(body))
            .map_err(|e| Error::RequestTransform(format!("invalid token url: {e}")))
    }
}

fn parse_response(
    status: http::StatusCode,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<AccessCredential> {
    if !status.is_success() {
        let (error, description) = match serde_json::from_slice::<ErrorResponse>(body) {
            Ok(err) => (err.error, err.error_description),
            Err(_) => (String::from_utf8_lossy(body).into_owned(), None),
        };
        return Err(Error::Exchange {
            status,
            error,
            description,
        });
    }

    let token: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidTokenResponse(e.to_string()))?;

    let access_token = token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::InvalidTokenResponse("server response missing access_token".to_string())
        })?;

    let expires_at = match token.expires_in.filter(|secs| *secs > 0) {
        Some(secs) => Some(expiry(now, secs)?),
        None => None,
    };

    Ok(AccessCredential {
        access_token,
        token_type: token.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_at,
        refresh_token: token.refresh_token,
    })
}

fn expiry(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_seconds(expires_in)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| {
            Error::InvalidTokenResponse(format!("expires_in {expires_in} is out of range"))
        })
}
