/// Domain records shared by the session protocol and the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A registered user. `password` always holds a bcrypt hash.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub username: String,
    pub password: String,
}

impl User {
    pub fn view(&self) -> UserView {
        UserView {
            name: self.name.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Insert payload for a user row; the id is assigned by storage.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub username: String,
    pub password: String,
}

impl NewUser {
    pub fn view(&self) -> UserView {
        UserView {
            name: self.name.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
        }
    }
}

/// Public projection of a user. Has no password field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserView {
    pub name: String,
    pub username: String,
    pub email: String,
}

/// A live refresh session. `fingerprint` is the keyed digest of the raw
/// refresh token.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct RegisterInput {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for RegisterInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterInput")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"[redacted]")
            .finish()
    }
}

#[derive(Clone)]
pub struct LoginInput {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginInput")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub tokens: TokenPair,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub user: UserView,
}
