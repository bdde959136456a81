use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::HeaderMap,
    response::Response,
};
use opentelemetry::propagation::Extractor;
use std::future::Future;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info, span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Largest request body buffered for the request dump.
const MAX_DUMPED_BODY: usize = 64 * 1024;

/// Logs every inbound request (method, uri, headers and body) inside a span
/// parented on the caller's W3C trace context.
#[derive(Debug, Clone)]
pub struct RequestDumpService<S> {
    inner: S,
}

impl<S> RequestDumpService<S> {
    pub fn new(inner: S) -> Self {
        RequestDumpService { inner }
    }
}

pub struct HeaderExtractor<'a> {
    headers: &'a HeaderMap,
}

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(|header| header.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|h| h.as_str()).collect()
    }
}

impl<S> Service<Request> for RequestDumpService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let parent_context = opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor {
                headers: req.headers(),
            })
        });

        let request_span = span!(
            tracing::Level::INFO,
            "request",
            method = %req.method(),
            endpoint = %req.uri().path(),
        );
        // fails when no OpenTelemetry layer is installed
        if let Err(err) = request_span.set_parent(parent_context) {
            debug!(
                error = debug(err),
                "unable to set otel parent, span will be new instead"
            );
        }

        // the clone that was driven to readiness serves this request
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(
            async move {
                let (parts, body) = req.into_parts();
                let body = match to_bytes(body, MAX_DUMPED_BODY).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(error = %err, "unable to buffer request body for dump");
                        Default::default()
                    }
                };

                info!(
                    method = %parts.method,
                    uri = %parts.uri,
                    headers = ?parts.headers,
                    body = %String::from_utf8_lossy(&body),
                    "inbound request"
                );

                let response = inner
                    .call(Request::from_parts(parts, Body::from(body)))
                    .await?;
                info!(status = %response.status().as_u16(), "request finished");
                Ok(response)
            }
            .instrument(request_span),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RequestDumpLayer {}

impl RequestDumpLayer {
    pub fn new() -> Self {
        RequestDumpLayer {}
    }
}

impl Default for RequestDumpLayer {
    fn default() -> Self {
        RequestDumpLayer::new()
    }
}

impl<S> Layer<S> for RequestDumpLayer {
    type Service = RequestDumpService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestDumpService::new(inner)
    }
}
