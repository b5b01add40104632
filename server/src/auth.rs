//! Token verification for client authentication.
//!
//! Clients authenticate by sending a compact JWT (`header.payload.signature`)
//! signed with a pre-shared HMAC secret. The server verifies the token and,
//! on success, stores the decoded claims on the connection.
//!
//! # Verification Steps
//!
//! 1. The header segment is decoded and its `alg` is checked against the
//!    HMAC family (`HS256`, `HS384`, `HS512`). Anything else, including
//!    `none`, is rejected before the signature is looked at.
//! 2. The signature is recomputed with the shared secret and compared.
//! 3. `exp` and `nbf` are enforced when present. No claim is mandatory.
//!
//! # Example
//!
//! ```rust
//! use jsonwebtoken::{encode, EncodingKey, Header};
//! use pipecast_server::auth::TokenVerifier;
//! use serde_json::json;
//!
//! let verifier = TokenVerifier::new("secret key");
//! let token = encode(
//!     &Header::default(),
//!     &json!({ "user": "alice" }),
//!     &EncodingKey::from_secret(b"secret key"),
//! )
//! .unwrap();
//!
//! let claims = verifier.verify(&token).unwrap();
//! assert_eq!(claims["user"], "alice");
//! ```

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Decoded claim set of a verified token.
pub type Claims = HashMap<String, serde_json::Value>;

/// Signing algorithms accepted for client tokens.
const HMAC_ALGORITHMS: [Algorithm; 3] = [Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

/// Errors that can occur during token verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token is not a well-formed compact JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The token declares a signing algorithm outside the HMAC family.
    ///
    /// Rejecting these up front prevents algorithm substitution, where an
    /// attacker relabels a token as `none` or as an asymmetric algorithm.
    #[error("unexpected signing method: {0}")]
    SigningMethodMismatch(String),

    /// The signature does not match the header and payload.
    #[error("invalid signature")]
    InvalidSignature,

    /// The `exp` claim is in the past.
    #[error("token has expired")]
    Expired,

    /// The `nbf` claim is in the future.
    #[error("token is not valid yet")]
    NotYetValid,
}

impl TokenError {
    /// Returns `true` if the token was rejected for cryptographic reasons.
    pub fn is_signature_error(&self) -> bool {
        matches!(self, Self::SigningMethodMismatch(_) | Self::InvalidSignature)
    }

    /// Returns `true` if the token was rejected by a time-bound claim.
    pub fn is_time_error(&self) -> bool {
        matches!(self, Self::Expired | Self::NotYetValid)
    }
}

/// The part of the JOSE header we inspect before verification.
#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
}

/// Verifies HMAC-signed tokens against a pre-shared secret.
///
/// Verification is pure computation: no I/O, no shared state. A single
/// verifier can be shared freely between connections.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for the given shared secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = HMAC_ALGORITHMS.to_vec();
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    /// Verifies `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`] describing the first check that failed.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let alg = declared_algorithm(token)?;
        match alg.parse::<Algorithm>() {
            Ok(parsed) if HMAC_ALGORITHMS.contains(&parsed) => {}
            _ => return Err(TokenError::SigningMethodMismatch(alg)),
        }

        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::ImmatureSignature => TokenError::NotYetValid,
                ErrorKind::InvalidAlgorithm => TokenError::SigningMethodMismatch(alg.clone()),
                _ => TokenError::Malformed(err.to_string()),
            })
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("key", &"<redacted>")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

/// Reads the `alg` field of the token header without trusting anything else.
fn declared_algorithm(token: &str) -> Result<String, TokenError> {
    let mut segments = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed("expected three segments".to_string()));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header.trim_end_matches('='))
        .map_err(|_| TokenError::Malformed("header is not base64url".to_string()))?;

    let raw: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|err| TokenError::Malformed(format!("invalid header: {err}")))?;

    Ok(raw.alg)
}
