/// JWT Token Generation and Validation
///
/// HS256 tokens signed with the process-wide secret. The issuer is built once
/// from `JwtSettings` and shared by the session service and the middleware.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::auth::claims::{AccessClaims, RefreshClaims, TokenClaims, TokenKind};
use crate::configuration::JwtSettings;
use crate::error::{AppError, AuthError, CryptoError};

#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &JwtSettings) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.validate_exp = true;
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_ttl: config.access_token_ttl(),
            refresh_ttl: config.refresh_token_ttl(),
        }
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Mint an access token carrying the user's email and username
    pub fn issue_access(&self, user_id: i64, email: &str, username: &str) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = TokenClaims::Access(AccessClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            iss: self.issuer.clone(),
        });

        self.sign(&claims)
    }

    /// Mint a refresh token for the user
    pub fn issue_refresh(&self, user_id: i64) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = TokenClaims::Refresh(RefreshClaims {
            sub: user_id.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
            iss: self.issuer.clone(),
        });

        self.sign(&claims)
    }

    pub(crate) fn sign(&self, claims: &TokenClaims) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AppError::Crypto(CryptoError::Signing(e.to_string())))
    }

    /// Validate a token and check it is of the expected kind
    ///
    /// # Errors
    /// - `TokenExpired` for a well-formed token past its `exp`
    /// - `TokenTypeMismatch` for a valid token of the other kind
    /// - `TokenInvalid` for anything else (signature, structure, issuer)
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<TokenClaims, AuthError> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => {
                    tracing::debug!(error = %e, "JWT validation error");
                    AuthError::TokenInvalid
                }
            })?;

        if claims.kind() != expected {
            return Err(AuthError::TokenTypeMismatch);
        }

        Ok(claims)
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        match self.verify(token, TokenKind::Access)? {
            TokenClaims::Access(claims) => Ok(claims),
            TokenClaims::Refresh(_) => Err(AuthError::TokenTypeMismatch),
        }
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        match self.verify(token, TokenKind::Refresh)? {
            TokenClaims::Refresh(claims) => Ok(claims),
            TokenClaims::Access(_) => Err(AuthError::TokenTypeMismatch),
        }
    }
}
