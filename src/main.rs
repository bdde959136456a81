use anyhow::Context as _;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod jwks;
mod jwt;
mod key;
mod middleware;
mod oauth;
mod refresh;
mod telemetry;
mod transport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = config::load_config().context("failed to load configuration")?;
    let _guard = telemetry::init(&settings.telemetry).context("failed to initialise telemetry")?;

    let key = Arc::new(
        key::KeyMaterial::generate(settings.key.bits, settings.key.algorithm)
            .context("failed to generate signing key")?,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    // the `/jwks` endpoint hosting the public key
    let app = jwks::router(jwks::JwksState::new(&key)?);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("jwks endpoint listening on {}", addr);
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    let client = transport::http_client(&settings.http)?;
    let token_url = match &settings.token_url {
        Some(url) => url.clone(),
        None => {
            oauth::discover(&client, &settings.issuer)
                .await?
                .token_endpoint
        }
    };

    let signer = jwt::AssertionSigner::new(&key)?;
    tracing::info!(kid = signer.kid(), %token_url, "authenticating with client assertions");
    let transport = transport::build(
        client,
        signer,
        settings.assertion_config(),
        settings.debug_transport,
    );
    let source = oauth::TokenSource::new(transport, token_url, settings.scopes.clone())
        .reuse_token(settings.refresh.reuse_token);

    let retry: Box<dyn refresh::RetryPolicy> = (&settings.refresh.retry).into();
    let (updates, _latest) = watch::channel(None);
    let result = refresh::run(
        source,
        settings.refresh.interval(),
        retry.as_ref(),
        updates,
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    server.await?.context("jwks endpoint failed")?;
    result.context("token acquisition failed")
}

/// Cancels `shutdown` once `signal` fires. A signal listener that cannot be
/// installed leaves `shutdown` untouched.
async fn cancel_on_signal<F>(signal: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
        Err(err) => {
            tracing::error!(error = %err, "unable to listen for ctrl-c, running until the loop exits");
        }
    }
}
