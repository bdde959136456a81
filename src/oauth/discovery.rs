//! OpenID Connect provider discovery.

use serde::Deserialize;

use crate::error::{Error, Result};

const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// The parts of the provider metadata this client relies on.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// Fetches the discovery document of `issuer`.
///
/// # Errors
/// [`Error::Discovery`] if the document cannot be fetched or decoded, or
/// names a different issuer than the one asked for.
#[tracing::instrument(skip(client))]
pub async fn discover(client: &reqwest::Client, issuer: &str) -> Result<ProviderMetadata> {
    let url = format!("{}{}", issuer.trim_end_matches('/'), WELL_KNOWN_PATH);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Discovery(format!("GET {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Discovery(format!(
            "GET {url}: unexpected status {}",
            response.status()
        )));
    }

    let metadata: ProviderMetadata = response
        .json()
        .await
        .map_err(|e| Error::Discovery(format!("malformed discovery document: {e}")))?;

    if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
        return Err(Error::Discovery(format!(
            "issuer did not match the issuer returned by provider, expected {issuer:?} got {:?}",
            metadata.issuer
        )));
    }

    tracing::info!(
        token_endpoint = %metadata.token_endpoint,
        jwks_uri = ?metadata.jwks_uri,
        "discovered provider"
    );
    Ok(metadata)
}
