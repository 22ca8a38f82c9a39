/// JWT Claims
///
/// Token payloads are a tagged variant on the `type` claim, so access and
/// refresh tokens each have a fixed, compile-time checked set of fields.

use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Which of the two token kinds a token is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims of a short-lived access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user id as a decimal string)
    pub sub: String,
    pub email: String,
    pub username: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    pub iss: String,
}

/// Claims of a long-lived refresh token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshClaims {
    /// Subject (user id as a decimal string)
    pub sub: String,
    /// Unique per token, so two refresh tokens minted in the same second
    /// never share a fingerprint
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TokenClaims {
    Access(AccessClaims),
    Refresh(RefreshClaims),
}

fn parse_subject(sub: &str) -> Result<i64, AuthError> {
    sub.parse::<i64>().map_err(|_| AuthError::TokenInvalid)
}

impl AccessClaims {
    pub fn user_id(&self) -> Result<i64, AuthError> {
        parse_subject(&self.sub)
    }
}

impl RefreshClaims {
    pub fn user_id(&self) -> Result<i64, AuthError> {
        parse_subject(&self.sub)
    }
}

impl TokenClaims {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenClaims::Access(_) => TokenKind::Access,
            TokenClaims::Refresh(_) => TokenKind::Refresh,
        }
    }
}
