//! Client assertion JWTs.
//!
//! - [`claims`]: the narrow per-client configuration and the claim set it becomes.
//! - [`signer`]: turns that configuration into a signed compact JWT.

pub mod claims;
pub mod signer;

pub use claims::AssertionConfig;
pub use signer::AssertionSigner;
