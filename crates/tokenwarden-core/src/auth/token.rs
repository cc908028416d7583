use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::AuthError;

/// A signed JWT as issued by the backend.
///
/// The string is kept verbatim; claims are decoded on demand and never
/// verified locally (the signature is the server's business).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token string without checking its shape.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Wrap a raw token string, rejecting anything that is not a well-formed JWT.
    pub fn parse(raw: impl Into<String>) -> Result<Self, AuthError> {
        let token = Self(raw.into());
        token.claims()?;
        Ok(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_well_formed(&self) -> bool {
        self.claims().is_ok()
    }

    /// Decode the payload segment.
    pub fn claims(&self) -> Result<TokenClaims, AuthError> {
        let segments: Vec<&str> = self.0.split('.').collect();
        if segments.len() != 3 {
            return Err(AuthError::MalformedToken(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AuthError::MalformedToken("empty segment".into()));
        }

        let bytes = decode_segment(segments[1])?;
        let payload: JsonValue = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::MalformedToken(format!("payload is not JSON: {e}")))?;
        if !payload.is_object() {
            return Err(AuthError::MalformedToken("payload is not an object".into()));
        }
        serde_json::from_value(payload)
            .map_err(|e| AuthError::MalformedToken(format!("invalid claims: {e}")))
    }

    /// Expiry instant from the `exp` claim, if the token carries one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.claims().ok()?.expires_at()
    }
}

/// Tokens are credentials: keep them out of logs.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token(<{} bytes>)", self.0.len())
    }
}

/// Accept URL-safe or standard alphabet, padded or not.
fn decode_segment(segment: &str) -> Result<Vec<u8>, AuthError> {
    let normalized: String = segment
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| AuthError::MalformedToken(format!("payload is not base64: {e}")))
}

/// Claims the session core cares about. Unknown claims are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Expiry, seconds since the Unix epoch
    #[serde(default)]
    pub exp: Option<f64>,
    #[serde(default)]
    pub user_id: Option<JsonValue>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub jti: Option<String>,
}

impl TokenClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = self.exp?;
        if !exp.is_finite() {
            return None;
        }
        DateTime::from_timestamp_millis((exp * 1000.0) as i64)
    }
}

/// Access and refresh token issued together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: Token,
    pub refresh: Token,
}

impl TokenPair {
    pub fn new(access: Token, refresh: Token) -> Self {
        Self { access, refresh }
    }
}
