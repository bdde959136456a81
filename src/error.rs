//! Error types shared by key generation, signing and the token transport chain.

use http::StatusCode;
use jsonwebtoken::Algorithm;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Secure randomness or RSA key generation is unavailable. Fatal at startup.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("unsupported signing algorithm {0:?}, only RSA family algorithms are accepted")]
    UnsupportedAlgorithm(Algorithm),

    #[error("invalid assertion claims: {0}")]
    InvalidClaims(&'static str),

    #[error("failed to sign client assertion")]
    Signing(#[source] jsonwebtoken::errors::Error),

    /// The outgoing request could not be rewritten as a form carrying the assertion.
    #[error("failed to rewrite token request: {0}")]
    RequestTransform(String),

    #[error("http transport error")]
    Transport(#[from] reqwest::Error),

    #[error("oidc discovery failed: {0}")]
    Discovery(String),

    /// The issuer answered the token exchange with a non-success status.
    #[error("token exchange rejected with status {status}: {error}")]
    Exchange {
        status: StatusCode,
        error: String,
        description: Option<String>,
    },

    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),
}

impl Error {
    /// Whether retrying the same exchange could plausibly succeed.
    ///
    /// Network failures, server errors and rate limiting are transient.
    /// Credential rejections and malformed requests are not, and neither are
    /// client-side builder or decode errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(err) => {
                !err.is_builder()
                    && (err.is_connect() || err.is_timeout() || err.is_request() || err.is_body())
            }
            Error::Exchange { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}
