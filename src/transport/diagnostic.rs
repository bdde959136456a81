//! Request/response dumps of outbound token traffic.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use std::future::Future;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::{SentRequest, TransportRequest, TransportResponse, dump_request, dump_response};
use crate::error::{Error, Result};

/// Delegates to the next transport, then logs the full exchange.
///
/// Errors from the next transport are logged and returned untouched.
#[derive(Clone, Debug)]
pub struct DiagnosticService<S> {
    inner: S,
}

impl<S> DiagnosticService<S> {
    pub fn new(inner: S) -> Self {
        DiagnosticService { inner }
    }
}

impl<S> Service<TransportRequest> for DiagnosticService<S>
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

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        // inner layers may rewrite the request, this is only the fallback
        let received = dump_request(&req);
        let fut = self.inner.call(req);

        Box::pin(async move {
            match fut.await {
                Ok(res) => {
                    let request = logged_request(&received, &res);
                    debug!(target: "pkjwt::diagnostic", "request {request}");
                    debug!(target: "pkjwt::diagnostic", "response {}", dump_response(&res));
                    Ok(res)
                }
                Err(err) => {
                    warn!(target: "pkjwt::diagnostic", error = %err, "token request failed");
                    Err(err)
                }
            }
        })
    }
}

/// The request as it went on the wire, when the innermost transport recorded
/// it, else the request this layer received.
fn logged_request<'a>(received: &'a str, res: &'a TransportResponse) -> &'a str {
    match res.extensions().get::<SentRequest>() {
        Some(SentRequest(sent)) => sent,
        None => received,
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiagnosticLayer {}

impl DiagnosticLayer {
    pub fn new() -> Self {
        DiagnosticLayer {}
    }
}

impl<S> Layer<S> for DiagnosticLayer {
    type Service = DiagnosticService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DiagnosticService::new(inner)
    }
}
