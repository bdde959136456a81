//! Outbound HTTP transport chain for token requests.
//!
//! Each layer is a [`tower::Service`] over [`TransportRequest`]. The chain used
//! for token exchanges is, outermost first:
//!
//! [`diagnostic::DiagnosticService`] → [`assertion::ClientAssertionService`] → [`HttpTransport`]

pub mod assertion;
pub mod diagnostic;

use std::{
    fmt::Write as _,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use std::future::Future;
use tower::{Service, ServiceBuilder, util::BoxCloneService};

use crate::config::HttpSettings;
use crate::error::{Error, Result};
use crate::jwt::{AssertionConfig, AssertionSigner};

pub use assertion::ClientAssertionLayer;
pub use diagnostic::DiagnosticLayer;

pub type TransportRequest = http::Request<Bytes>;
pub type TransportResponse = http::Response<Bytes>;

/// Type-erased transport chain handed to the token source.
pub type BoxTransport = BoxCloneService<TransportRequest, TransportResponse, Error>;

/// Textual dump of the request exactly as [`HttpTransport`] sent it.
///
/// Attached to the response extensions so outer layers can see the request
/// after inner layers rewrote it.
#[derive(Clone, Debug)]
pub struct SentRequest(pub String);

/// Builds the pooled HTTP client used for discovery and token exchanges.
pub fn http_client(settings: &HttpSettings) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .pool_max_idle_per_host(settings.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
        .build()?)
}

/// Assembles the token request chain on top of `client`.
pub fn build(
    client: reqwest::Client,
    signer: AssertionSigner,
    claims: AssertionConfig,
    diagnostics: bool,
) -> BoxTransport {
    let service = ServiceBuilder::new()
        .option_layer(diagnostics.then(DiagnosticLayer::new))
        .layer(ClientAssertionLayer::new(signer, claims))
        .service(HttpTransport::new(client));
    BoxCloneService::new(service)
}

/// Innermost transport: sends requests over the network with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        HttpTransport { client }
    }
}

impl Service<TransportRequest> for HttpTransport {
    type Response = TransportResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let sent = SentRequest(dump_request(&req));
            let req = reqwest::Request::try_from(req)?;

            let res = client.execute(req).await?;

            let mut builder = http::Response::builder()
                .status(res.status())
                .version(res.version());
            if let Some(headers) = builder.headers_mut() {
                headers.extend(res.headers().clone());
            }
            let body = res.bytes().await?;

            let mut response = builder
                .body(body)
                .map_err(|e| Error::InvalidTokenResponse(e.to_string()))?;
            response.extensions_mut().insert(sent);
            Ok(response)
        })
    }
}

/// Reconstructs `req` in HTTP/1.1 wire format, headers and body included.
pub fn dump_request(req: &TransportRequest) -> String {
    let mut out = String::new();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let _ = write!(out, "{} {} {:?}\r\n", req.method(), target, req.version());
    if let Some(host) = req.uri().authority() {
        let _ = write!(out, "Host: {host}\r\n");
    }
    dump_headers(&mut out, req.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(req.body()));
    out
}

/// Reconstructs `res` in HTTP/1.1 wire format, headers and body included.
pub fn dump_response(res: &TransportResponse) -> String {
    let mut out = String::new();
    let _ = write!(out, "{:?} {}\r\n", res.version(), res.status());
    dump_headers(&mut out, res.headers());
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(res.body()));
    out
}

fn dump_headers(out: &mut String, headers: &http::HeaderMap) {
    for (name, value) in headers {
        let _ = write!(
            out,
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }
}
