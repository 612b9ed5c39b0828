//! Bearer credential validation for the realtime handshake.
//!
//! Token issuance lives in the account service; this side only verifies.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Claims carried by a realtime bearer token.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated user's prefixed ULID.
    pub sub: String,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

/// Verify a bearer token and return the authenticated user id.
pub fn verify_token(secret: &str, token: &str) -> Result<String, Error> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| Error::AuthInvalid(e.to_string()))?;
    Ok(data.claims.sub)
}

/// Mint a token for the given user. Used by tests and local tooling; the
/// production issuer is external.
pub fn mint_token(secret: &str, user_id: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 encoding cannot fail")
}
