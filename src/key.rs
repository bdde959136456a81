//! cryptographic key management.
//!
//! Generates the process-wide RSA signing key at startup and derives the
//! public JWKS (JSON Web Key Set) from it. Nothing is persisted: a restart
//! produces a new key and a new key ID.

use crate::error::{Error, Result};
use crate::jwks::{Jwk, Jwks};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, EncodingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;

/// Smallest modulus accepted for RSA signing keys.
pub const MIN_RSA_BITS: usize = 2048;

/// Number of random bytes behind a key ID.
const KID_BYTES: usize = 16;

/// The `use` value published for signing keys.
const KEY_USE_SIGNATURE: &str = "sig";

/// The signing keypair together with its key ID and algorithm.
///
/// Constructed once and shared read-only: the signer borrows the private half,
/// the JWKS endpoint the public half.
pub struct KeyMaterial {
    kid: String,
    algorithm: Algorithm,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl KeyMaterial {
    /// Generates a fresh RSA keypair and a random key ID from the OS RNG.
    ///
    /// # Errors
    /// Fails with [`Error::KeyGeneration`] if `bits` is below [`MIN_RSA_BITS`]
    /// or the OS cannot supply secure randomness, and with
    /// [`Error::UnsupportedAlgorithm`] for non-RSA algorithms.
    #[tracing::instrument]
    pub fn generate(bits: usize, algorithm: Algorithm) -> Result<Self> {
        if !is_rsa_algorithm(algorithm) {
            return Err(Error::UnsupportedAlgorithm(algorithm));
        }
        if bits < MIN_RSA_BITS {
            return Err(Error::KeyGeneration(format!(
                "{bits} bit keys are too weak, at least {MIN_RSA_BITS} bits are required"
            )));
        }

        let kid = generate_kid()?;
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        let public_key = private_key.to_public_key();

        tracing::info!(kid = %kid, alg = ?algorithm, bits, "generated signing key");

        Ok(Self {
            kid,
            algorithm,
            private_key,
            public_key,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Builds the `jsonwebtoken` signing key from the private half.
    pub(crate) fn encoding_key(&self) -> Result<EncodingKey> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .map_err(|e| Error::KeyGeneration(e.to_string()))?;
        Ok(EncodingKey::from_rsa_der(der.as_bytes()))
    }

    /// The public key set published by the `/jwks` endpoint.
    ///
    /// Only the modulus and exponent leave this type.
    pub fn public_jwks(&self) -> Jwks {
        Jwks {
            keys: vec![Jwk {
                kty: "RSA".to_string(),
                r#use: KEY_USE_SIGNATURE.to_string(),
                kid: self.kid.clone(),
                alg: algorithm_name(self.algorithm).to_string(),
                n: URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be()),
            }],
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("bits", &(self.public_key.size() * 8))
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_rsa_algorithm(algorithm: Algorithm) -> bool {
    matches!(
        algorithm,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        // rejected in `generate`
        _ => "none",
    }
}

/// Random, URL-safe identifier for a freshly generated key.
fn generate_kid() -> Result<String> {
    let mut bytes = [0u8; KID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::KeyGeneration(format!("secure randomness unavailable: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, LazyLock};

    static SHARED: LazyLock<Arc<KeyMaterial>> = LazyLock::new(|| {
        Arc::new(KeyMaterial::generate(MIN_RSA_BITS, Algorithm::RS256).unwrap())
    });

    /// One RS256 key for the whole test binary.
    pub(crate) fn shared_key() -> Arc<KeyMaterial> {
        SHARED.clone()
    }
}
