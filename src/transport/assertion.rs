//! Rewrites token requests to authenticate with a signed client assertion
//! (`private_key_jwt`) instead of a client secret.

use std::{
    borrow::Cow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{HeaderValue, header};
use percent_encoding::percent_decode_str;
use std::future::Future;
use tower::{Layer, Service};
use tracing::debug;

use super::{TransportRequest, TransportResponse};
use crate::error::{Error, Result};
use crate::jwt::{AssertionConfig, AssertionSigner};

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Form fields dropped from the rewritten body.
const REPLACED_FIELDS: [&str; 3] = ["client_assertion_type", "client_assertion", "client_secret"];

#[derive(Clone)]
pub struct ClientAssertionService<S> {
    inner: S,
    signer: Arc<AssertionSigner>,
    claims: Arc<AssertionConfig>,
}

impl<S> ClientAssertionService<S> {
    pub fn new(inner: S, signer: Arc<AssertionSigner>, claims: Arc<AssertionConfig>) -> Self {
        ClientAssertionService {
            inner,
            signer,
            claims,
        }
    }
}

impl<S> Service<TransportRequest> for ClientAssertionService<S>
where
    S: Service<TransportRequest, Response = TransportResponse, Error = Error> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = TransportResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: TransportRequest) -> Self::Future {
        // a fresh assertion per request, never reused
        let rewritten = self
            .signer
            .sign(&self.claims)
            .and_then(|assertion| apply_assertion(&mut req, &assertion));

        match rewritten {
            Ok(()) => Box::pin(self.inner.call(req)),
            Err(err) => Box::pin(async move { Err(err) }),
        }
    }
}

/// Moves the request onto assertion based client authentication.
///
/// Any `Authorization` header is dropped and the form body gains
/// `client_assertion_type` and `client_assertion`. Existing form fields are
/// kept, apart from a `client_secret` and stale assertion fields.
///
/// # Errors
/// [`Error::RequestTransform`] if the current body is not a parseable form.
pub fn apply_assertion(req: &mut TransportRequest, assertion: &str) -> Result<()> {
    let mut form = parse_form(req)?;
    form.retain(|(key, _)| !REPLACED_FIELDS.contains(&key.as_str()));
    form.push((
        "client_assertion_type".to_string(),
        CLIENT_ASSERTION_TYPE.to_string(),
    ));
    form.push(("client_assertion".to_string(), assertion.to_string()));

    let body = serde_urlencoded::to_string(&form)
        .map_err(|e| Error::RequestTransform(e.to_string()))?;

    let headers = req.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(FORM_CONTENT_TYPE),
    );
    headers.remove(header::AUTHORIZATION);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    debug!(fields = form.len(), "token request rewritten with client assertion");
    *req.body_mut() = Bytes::from(body);
    Ok(())
}

fn parse_form(req: &TransportRequest) -> Result<Vec<(String, String)>> {
    let body = req.body();
    if body.is_empty() {
        return Ok(Vec::new());
    }

    if let Some(content_type) = req.headers().get(header::CONTENT_TYPE) {
        let essence = content_type
            .to_str()
            .ok()
            .and_then(|value| value.split(';').next())
            .map(str::trim);
        if !essence.is_some_and(|value| value.eq_ignore_ascii_case(FORM_CONTENT_TYPE)) {
            return Err(Error::RequestTransform(format!(
                "body has content type {content_type:?}, expected {FORM_CONTENT_TYPE}"
            )));
        }
    }

    let text = std::str::from_utf8(body)
        .map_err(|e| Error::RequestTransform(format!("form body is not utf-8: {e}")))?;
    check_escapes(text)?;

    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Ok((decode_component(key)?, decode_component(value)?))
        })
        .collect()
}

/// Decodes one form component. Values that do not decode to UTF-8 are
/// refused, re-encoding them would alter the field.
fn decode_component(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(Cow::into_owned)
        .map_err(|e| Error::RequestTransform(format!("form field {raw:?} is not utf-8: {e}")))
}

/// Rejects `%` not followed by two hex digits.
fn check_escapes(text: &str) -> Result<()> {
    let bytes = text.as_bytes();
    for (i, _) in text.match_indices('%') {
        let valid = bytes
            .get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !valid {
            return Err(Error::RequestTransform(format!(
                "invalid percent escape at offset {i}"
            )));
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct ClientAssertionLayer {
    signer: Arc<AssertionSigner>,
    claims: Arc<AssertionConfig>,
}

impl ClientAssertionLayer {
    pub fn new(signer: AssertionSigner, claims: AssertionConfig) -> Self {
        ClientAssertionLayer {
            signer: Arc::new(signer),
            claims: Arc::new(claims),
        }
    }
}

impl<S> Layer<S> for ClientAssertionLayer {
    type Service = ClientAssertionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientAssertionService::new(inner, self.signer.clone(), self.claims.clone())
    }
}
