use std::time::SystemTime;

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

use super::claims::{AssertionClaims, AssertionConfig};
use crate::error::{Error, Result};
use crate::key::{KeyMaterial, is_rsa_algorithm};

/// Signs client assertions with the process signing key.
///
/// The JWS header names the key by `kid` only. The public key is never
/// embedded, so verifiers must resolve it through the JWKS endpoint.
pub struct AssertionSigner {
    kid: String,
    algorithm: Algorithm,
    encoding_key: EncodingKey,
}

impl AssertionSigner {
    /// # Errors
    /// Fails if the key uses a non-RSA algorithm or cannot be encoded.
    pub fn new(key: &KeyMaterial) -> Result<Self> {
        if !is_rsa_algorithm(key.algorithm()) {
            return Err(Error::UnsupportedAlgorithm(key.algorithm()));
        }

        Ok(Self {
            kid: key.kid().to_string(),
            algorithm: key.algorithm(),
            encoding_key: key.encoding_key()?,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Produces a compact JWT for `config`, issued now.
    ///
    /// # Errors
    /// [`Error::InvalidClaims`] for an empty subject or audience,
    /// [`Error::Signing`] if the JWS cannot be produced.
    #[tracing::instrument(skip(self), fields(kid = %self.kid))]
    pub fn sign(&self, config: &AssertionConfig) -> Result<String> {
        if config.subject.is_empty() {
            return Err(Error::InvalidClaims("subject is empty"));
        }
        if config.audience.is_empty() || config.audience.iter().any(String::is_empty) {
            return Err(Error::InvalidClaims("audience is empty"));
        }

        let claims = AssertionClaims::issue(config, SystemTime::now());

        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());

        encode(&header, &claims, &self.encoding_key).map_err(Error::Signing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::Jwk;
    use crate::key::testing::shared_key;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
    use std::time::{Duration, UNIX_EPOCH};

    const ISSUER: &str = "http://localhost:8080/auth/realms/master";

    fn config() -> AssertionConfig {
        AssertionConfig {
            issuer: None,
            subject: "telemeter".to_string(),
            audience: vec![ISSUER.to_string()],
            id: None,
            unique_id: true,
            lifetime: Some(Duration::from_secs(60)),
        }
    }

    fn published_jwk() -> Jwk {
        shared_key().public_jwks().keys.remove(0)
    }

    fn verify(token: &str) -> jsonwebtoken::errors::Result<AssertionClaims> {
        let jwk = published_jwk();
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[ISSUER]);
        decode::<AssertionClaims>(token, &key, &validation).map(|data| data.claims)
    }

    #[test]
    fn test_compact_shape_and_header() {
        let signer = AssertionSigner::new(&shared_key()).unwrap();
        let token = signer.sign(&config()).unwrap();

        let segments: Vec<&str> = token.split('.').collect();
        assert_eq!(segments.len(), 3);
        for segment in &segments {
            assert!(URL_SAFE_NO_PAD.decode(segment).is_ok());
        }

        let header = decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some(shared_key().kid()));
        assert_eq!(header.kid.as_deref(), Some(published_jwk().kid.as_str()));
        assert!(header.jwk.is_none());
    }

    #[test]
    fn test_verifies_with_published_key() {
        let signer = AssertionSigner::new(&shared_key()).unwrap();
        let token = signer.sign(&config()).unwrap();

        let claims = verify(&token).unwrap();
        assert_eq!(claims.sub, "telemeter");
        assert_eq!(claims.aud, vec![ISSUER.to_string()]);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(now.abs_diff(claims.iat) <= 5);
        assert_eq!(claims.exp, Some(claims.iat + 60));
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let signer = AssertionSigner::new(&shared_key()).unwrap();
        let token = signer.sign(&config()).unwrap();
        assert!(verify(&token).is_ok());

        let header_end = token.find('.').unwrap();
        let payload_end = token.rfind('.').unwrap();
        let positions = [
            header_end / 2,
            (header_end + payload_end) / 2,
            (payload_end + token.len()) / 2,
        ];

        for pos in positions {
            let mut bytes = token.clone().into_bytes();
            bytes[pos] = if bytes[pos] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).unwrap();
            assert!(verify(&tampered).is_err(), "byte {pos} altered");
        }
    }

    #[test]
    fn test_signatures_differ_over_time() {
        let mut config = config();
        config.unique_id = false;

        let signer = AssertionSigner::new(&shared_key()).unwrap();
        let first = signer.sign(&config).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let second = signer.sign(&config).unwrap();

        let signature = |token: &str| token.rsplit('.').next().unwrap().to_string();
        assert_ne!(signature(&first), signature(&second));
    }

    #[test]
    fn test_empty_subject_or_audience_is_rejected() {
        let signer = AssertionSigner::new(&shared_key()).unwrap();

        let mut no_subject = config();
        no_subject.subject.clear();
        assert!(matches!(
            signer.sign(&no_subject),
            Err(Error::InvalidClaims(_))
        ));

        let mut no_audience = config();
        no_audience.audience.clear();
        assert!(matches!(
            signer.sign(&no_audience),
            Err(Error::InvalidClaims(_))
        ));
    }
}
