//! HTTP Basic authentication for the metrics endpoint.

use axum::http::HeaderValue;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Realm advertised in `WWW-Authenticate` challenges.
pub const REALM: &str = "FIBRE Metrics";

/// Why a request failed authentication.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,
    #[error("unsupported authorization scheme")]
    Scheme,
    #[error("malformed basic credentials")]
    Malformed,
    #[error("invalid credentials")]
    Invalid,
}

impl AuthError {
    /// Stable label for the `error_type` metric dimension.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Missing => "auth_missing",
            Self::Scheme => "auth_scheme",
            Self::Malformed => "auth_malformed",
            Self::Invalid => "auth_invalid",
        }
    }
}

/// Configured username/password pair.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check an `Authorization` header against these credentials.
    pub fn verify(&self, header: Option<&HeaderValue>) -> Result<(), AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let (user, pass) = parse_basic(header)?;

        // Evaluate both comparisons before combining them.
        let user_ok = user.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = pass.as_bytes().ct_eq(self.password.as_bytes());
        if bool::from(user_ok & pass_ok) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// Decode a `Basic` authorization header into its username and password.
pub fn parse_basic(header: &HeaderValue) -> Result<(String, String), AuthError> {
    let value = header.to_str().map_err(|_| AuthError::Malformed)?;
    let (scheme, encoded) = value.trim().split_once(' ').ok_or(AuthError::Scheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::Scheme);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;

    // Passwords may contain ':'; usernames may not.
    let (user, pass) = decoded.split_once(':').ok_or(AuthError::Malformed)?;
    Ok((user.to_string(), pass.to_string()))
}

/// `WWW-Authenticate` header value for 401 responses.
pub fn challenge() -> String {
    format!("Basic realm=\"{REALM}\"")
}
