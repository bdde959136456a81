//! The OAuth2 side of the client: finding the token endpoint and exchanging
//! client credentials for an access token.

pub mod discovery;
pub mod token_source;

pub use discovery::discover;
pub use token_source::{AccessCredential, TokenSource};
