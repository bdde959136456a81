//! The token acquisition loop.
//!
//! Alternates between acquiring a credential and waiting a fixed interval.
//! What happens on a failed exchange is decided by a [`RetryPolicy`]; the
//! default [`FailFast`] ends the loop with the error.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RetryPolicyKind, RetrySettings};
use crate::error::{Error, Result};
use crate::oauth::{AccessCredential, TokenSource};

/// Decides whether a failed exchange is retried, and after how long.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts consecutive failures, starting at 1.
    /// Returning `None` makes the failure fatal.
    fn backoff(&self, err: &Error, attempt: u32) -> Option<Duration>;
}

/// Every failure is fatal.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailFast;

impl RetryPolicy for FailFast {
    fn backoff(&self, _err: &Error, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Retries transient failures with a doubling delay. Terminal failures, such
/// as the issuer rejecting our credentials, stay fatal.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy for ExponentialBackoff {
    fn backoff(&self, err: &Error, attempt: u32) -> Option<Duration> {
        if !err.is_retryable() || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

impl From<&RetrySettings> for Box<dyn RetryPolicy> {
    fn from(settings: &RetrySettings) -> Self {
        match settings.policy {
            RetryPolicyKind::FailFast => Box::new(FailFast),
            RetryPolicyKind::ExponentialBackoff => Box::new(ExponentialBackoff {
                initial: Duration::from_secs(settings.initial_backoff_secs),
                max: Duration::from_secs(settings.max_backoff_secs),
                max_attempts: settings.max_attempts,
            }),
        }
    }
}

enum LoopState {
    Acquiring,
    Waiting(Duration),
}

/// Runs until `shutdown` is cancelled or the retry policy gives up.
///
/// Every fresh credential is published on `updates`.
///
/// # Errors
/// Returns the exchange error the retry policy declared fatal.
pub async fn run(
    mut source: TokenSource,
    interval: Duration,
    retry: &dyn RetryPolicy,
    updates: watch::Sender<Option<AccessCredential>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut state = LoopState::Acquiring;
    let mut failures = 0u32;

    loop {
        state = match state {
            LoopState::Acquiring => {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = source.token() => result,
                };

                match result {
                    Ok(credential) => {
                        failures = 0;
                        info!(
                            expires_at = ?credential.expires_at,
                            refresh_token = credential.refresh_token.is_some(),
                            "acquired access token"
                        );
                        debug!(
                            access_token = %credential.access_token,
                            refresh_token = ?credential.refresh_token,
                            "access token"
                        );
                        updates.send_replace(Some(credential));
                        LoopState::Waiting(interval)
                    }
                    Err(err) => {
                        failures += 1;
                        match retry.backoff(&err, failures) {
                            Some(delay) => {
                                warn!(error = %err, attempt = failures, ?delay, "token exchange failed, retrying");
                                LoopState::Waiting(delay)
                            }
                            None => return Err(err),
                        }
                    }
                }
            }
            LoopState::Waiting(delay) => {
                debug!(?delay, "waiting before next token exchange");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => LoopState::Acquiring,
                }
            }
        };
    }

    info!("token acquisition stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::claims::AssertionClaims;
    use crate::config::Settings;
    use crate::jwt::AssertionSigner;
    use crate::key::testing::shared_key;
    use crate::transport;
    use http::StatusCode;
    use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn exchange_error(status: StatusCode) -> Error {
        Error::Exchange {
            status,
            error: "e".to_string(),
            description: None,
        }
    }

    #[test]
    fn test_fail_fast_never_retries() {
        assert_eq!(FailFast.backoff(&exchange_error(StatusCode::BAD_GATEWAY), 1), None);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = ExponentialBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            max_attempts: 4,
        };
        let transient = exchange_error(StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(policy.backoff(&transient, 1), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff(&transient, 2), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff(&transient, 3), Some(Duration::from_secs(4)));
        assert_eq!(policy.backoff(&transient, 4), Some(Duration::from_secs(5)));
        assert_eq!(policy.backoff(&transient, 5), None);

        let rejected = exchange_error(StatusCode::UNAUTHORIZED);
        assert_eq!(policy.backoff(&rejected, 1), None);
    }

    async fn issuer() -> (MockServer, String) {
        let mock_server = MockServer::start().await;
        let issuer = format!("{}/auth/realms/master", mock_server.uri());
        (mock_server, issuer)
    }

    fn source(issuer: &str) -> TokenSource {
        let settings: Settings =
            serde_json::from_value(json!({ "issuer": issuer })).unwrap();
        let transport = transport::build(
            reqwest::Client::new(),
            AssertionSigner::new(&shared_key()).unwrap(),
            settings.assertion_config(),
            true,
        );
        TokenSource::new(
            transport,
            format!("{issuer}/protocol/openid-connect/token"),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_loop_authenticates_with_assertion() {
        let (mock_server, issuer) = issuer().await;

        Mock::given(method("POST"))
            .and(path("/auth/realms/master/protocol/openid-connect/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains(
                "client_assertion_type=urn%3Aietf%3Aparams%3Aoauth%3Aclient-assertion-type%3Ajwt-bearer",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "token_type": "Bearer",
                "expires_in": 60,
                "refresh_token": "refresh",
            })))
            .mount(&mock_server)
            .await;

        let (tx, mut rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let handle = {
            let source = source(&issuer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run(source, Duration::from_secs(3600), &FailFast, tx, shutdown).await
            })
        };

        rx.changed().await.unwrap();
        let credential = rx.borrow().clone().unwrap();
        assert_eq!(credential.access_token, "access");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh"));

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.headers.get("authorization").is_none());

        let form: Vec<(String, String)> = serde_urlencoded::from_bytes(&request.body).unwrap();
        let assertion = form
            .iter()
            .find(|(k, _)| k == "client_assertion")
            .map(|(_, v)| v.clone())
            .unwrap();

        let jwk = shared_key().public_jwks().keys.remove(0);
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&issuer]);
        let data = decode::<AssertionClaims>(&assertion, &key, &validation).unwrap();

        assert_eq!(data.header.kid.as_deref(), Some(jwk.kid.as_str()));
        assert_eq!(data.claims.iss.as_deref(), Some(issuer.as_str()));
        assert_eq!(data.claims.sub, "telemeter");
        assert_eq!(data.claims.aud, vec![issuer.clone()]);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(now.abs_diff(data.claims.iat) <= 5);
    }

    #[tokio::test]
    async fn test_rejection_halts_loop() {
        let (mock_server, issuer) = issuer().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "unauthorized_client",
                "error_description": "Invalid client or Invalid client credentials",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (tx, rx) = watch::channel(None);
        let err = run(
            source(&issuer),
            Duration::from_millis(10),
            &FailFast,
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Exchange { status, .. } if status == StatusCode::UNAUTHORIZED));
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (mock_server, issuer) = issuer().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "second"})),
            )
            .mount(&mock_server)
            .await;

        let policy = ExponentialBackoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(10),
            max_attempts: 3,
        };
        let (tx, mut rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let handle = {
            let source = source(&issuer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run(source, Duration::from_secs(3600), &policy, tx, shutdown).await
            })
        };

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().access_token, "second");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_loop() {
        let (mock_server, issuer) = issuer().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "a"})))
            .mount(&mock_server)
            .await;

        let (tx, mut rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let handle = {
            let source = source(&issuer);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run(source, Duration::from_secs(3600), &FailFast, tx, shutdown).await
            })
        };

        rx.changed().await.unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
