//! Logic for the `/jwks` endpoint.
//!
//! Serves the JSON Web Key Set (JWKS) containing the public key the issuer
//! uses to verify our client assertions. The endpoint is unauthenticated and
//! answers any method.

use crate::key::KeyMaterial;
use crate::middleware::RequestDumpLayer;
use axum::{Router, extract::State, http::header, response::IntoResponse, routing::any};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A JSON Web Key Set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Jwks {
    /// List of keys.
    pub keys: Vec<Jwk>,
}

/// A public RSA JSON Web Key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA").
    pub kty: String,
    /// Key ID.
    pub kid: String,
    /// Modulus (Base64URL encoded).
    pub n: String,
    /// Exponent (Base64URL encoded).
    pub e: String,
    /// Algorithm (e.g., "RS256").
    pub alg: String,
    /// Key use (e.g., "sig").
    pub r#use: String,
}

/// Shared state of the JWKS endpoint. Immutable after construction.
pub struct JwksState {
    /// The pre-computed JWKS JSON string.
    jwks_json: String,
}

impl JwksState {
    pub fn new(key: &KeyMaterial) -> Result<Self, serde_json::Error> {
        Ok(Self {
            jwks_json: serde_json::to_string(&key.public_jwks())?,
        })
    }
}

/// Router serving `/jwks`, wrapped in the request dump layer.
pub fn router(state: JwksState) -> Router {
    Router::new()
        .route("/jwks", any(jwks))
        .layer(RequestDumpLayer::new())
        .with_state(Arc::new(state))
}

/// Handler for the `/jwks` endpoint.
///
/// Returns the pre-computed JWKS JSON string.
pub async fn jwks(State(state): State<Arc<JwksState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/json")],
        state.jwks_json.clone(),
    )
}
