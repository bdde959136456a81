use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the client asserts about itself, independent of any single request.
///
/// Translated into [`AssertionClaims`] at signing time.
#[derive(Clone, Debug, PartialEq)]
pub struct AssertionConfig {
    /// `iss`, omitted when `None`.
    pub issuer: Option<String>,
    /// `sub`, must equal the client ID the issuer knows us by.
    pub subject: String,
    /// `aud`, must contain the issuer's own identity.
    pub audience: Vec<String>,
    /// Fixed `jti`.
    pub id: Option<String>,
    /// Mint a random `jti` per assertion when no fixed `id` is set.
    pub unique_id: bool,
    /// Adds `exp = iat + lifetime` when set.
    pub lifetime: Option<Duration>,
}

/// JWT claims of a client assertion.
#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Issuer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject, the client ID.
    pub sub: String,
    /// Audience, always serialized as an array.
    pub aud: Vec<String>,
    /// JWT ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Issued at (UNIX timestamp).
    pub iat: u64,
    /// Expiration time (UNIX timestamp).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

impl AssertionClaims {
    /// Builds the claims for one assertion issued at `now`.
    pub fn issue(config: &AssertionConfig, now: SystemTime) -> Self {
        let iat = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let jti = match &config.id {
            Some(id) => Some(id.clone()),
            None if config.unique_id => Some(random_jti()),
            None => None,
        };

        let claims = AssertionClaims {
            iss: config.issuer.clone(),
            sub: config.subject.clone(),
            aud: config.audience.clone(),
            jti,
            iat,
            exp: config.lifetime.map(|lifetime| iat + lifetime.as_secs()),
        };

        debug!("created assertion claims - {:?}", claims);
        claims
    }
}

fn random_jti() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
