/// Authentication Routes
///
/// Registration, login, refresh-token rotation, logout and a token check.
/// Tokens travel as cookies, never in JSON bodies.

use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::AccessClaims;
use crate::domain::{LoginInput, RegisterInput, TokenPair, UserView};
use crate::error::{AppError, AuthError};
use crate::session::SessionService;
use crate::storage::Store;
use crate::validators::{is_valid_email, is_valid_name, is_valid_username, validate_password};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub username: String,
    pub email: String,
    pub password: String,
}

impl TryFrom<RegisterRequest> for RegisterInput {
    type Error = AppError;

    fn try_from(req: RegisterRequest) -> Result<Self, Self::Error> {
        validate_password(&req.password)?;
        Ok(RegisterInput {
            name: is_valid_name(&req.name)?,
            username: is_valid_username(&req.username)?,
            email: is_valid_email(&req.email)?,
            password: req.password,
        })
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: UserView,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub expires_in: i64,
}

#[derive(Serialize)]
pub struct CheckTokenResponse {
    pub user_id: i64,
    pub username: String,
}

fn token_cookie(name: &'static str, value: String, max_age_secs: i64) -> Cookie<'static> {
    Cookie::build(name, value)
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(max_age_secs))
        .finish()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    let mut cookie = token_cookie(name, String::new(), 0);
    cookie.make_removal();
    cookie
}

fn token_cookies<S: Store>(session: &SessionService<S>, pair: TokenPair) -> [Cookie<'static>; 2] {
    [
        token_cookie(
            ACCESS_TOKEN_COOKIE,
            pair.access_token,
            session.tokens().access_ttl().num_seconds(),
        ),
        token_cookie(
            REFRESH_TOKEN_COOKIE,
            pair.refresh_token,
            session.tokens().refresh_ttl().num_seconds(),
        ),
    ]
}

/// POST /auth/register
///
/// # Errors
/// - 400: Validation errors
/// - 409: Username already registered
/// - 500: Internal server error
pub async fn register<S: Store>(
    form: web::Json<RegisterRequest>,
    session: web::Data<SessionService<S>>,
) -> Result<HttpResponse, AppError> {
    let input = RegisterInput::try_from(form.into_inner())?;
    let user = session.register(input).await?;

    Ok(HttpResponse::Created().json(user))
}

/// POST /auth/login
///
/// Sets `access_token` and `refresh_token` cookies. Unknown usernames and
/// wrong passwords get the same 401.
pub async fn login<S: Store>(
    form: web::Json<LoginRequest>,
    session: web::Data<SessionService<S>>,
) -> Result<HttpResponse, AppError> {
    let form = form.into_inner();
    if form.username.trim().is_empty() || form.password.is_empty() {
        return Err(AuthError::InvalidCredentials.into());
    }

    let outcome = session
        .login(LoginInput {
            username: form.username.trim().to_string(),
            password: form.password,
        })
        .await?;

    let [access, refresh] = token_cookies(session.get_ref(), outcome.tokens);
    Ok(HttpResponse::Ok()
        .cookie(access)
        .cookie(refresh)
        .json(LoginResponse {
            user: outcome.user,
            expires_in: outcome.expires_in,
        }))
}

/// POST /auth/refresh
///
/// Rotates the session held in the `refresh_token` cookie.
///
/// # Errors
/// - 401: Missing, invalid, expired, revoked or already-rotated token
pub async fn refresh<S: Store>(
    req: HttpRequest,
    session: web::Data<SessionService<S>>,
) -> Result<HttpResponse, AppError> {
    let raw = req
        .cookie(REFRESH_TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(AuthError::MissingToken)?;

    let pair = session.refresh(&raw).await?;

    let [access, refresh] = token_cookies(session.get_ref(), pair);
    Ok(HttpResponse::Ok()
        .cookie(access)
        .cookie(refresh)
        .json(RefreshResponse {
            expires_in: session.tokens().access_ttl().num_seconds(),
        }))
}

/// POST /auth/logout
///
/// Always clears both cookies. A missing or stale cookie is not an error;
/// only a storage failure while revoking is.
pub async fn logout<S: Store>(
    req: HttpRequest,
    session: web::Data<SessionService<S>>,
) -> Result<HttpResponse, AppError> {
    if let Some(cookie) = req.cookie(REFRESH_TOKEN_COOKIE) {
        if !cookie.value().is_empty() {
            session.logout(cookie.value()).await?;
        }
    }

    Ok(HttpResponse::Ok()
        .cookie(removal_cookie(ACCESS_TOKEN_COOKIE))
        .cookie(removal_cookie(REFRESH_TOKEN_COOKIE))
        .json(serde_json::json!({ "message": "Logged out" })))
}

/// GET /auth/check-token
///
/// **Requires a valid access token** in `Authorization: Bearer <token>`;
/// claims are injected by the JWT middleware.
pub async fn check_token(claims: web::ReqData<AccessClaims>) -> Result<HttpResponse, AppError> {
    let user_id = claims.user_id().map_err(|_| AuthError::Unauthorized)?;

    Ok(HttpResponse::Ok().json(CheckTokenResponse {
        user_id,
        username: claims.username.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn register_request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: " Ann ".to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_register_request_is_validated_and_trimmed() {
        let input = RegisterInput::try_from(register_request(" ann ", "a@x.com", "secret123")).unwrap();
        assert_eq!(input.name, "Ann");
        assert_eq!(input.username, "ann");
        assert_eq!(input.password, "secret123");
    }

    #[test]
    fn test_register_request_rejects_bad_fields() {
        let err = RegisterInput::try_from(register_request("ann", "nope", "secret123")).unwrap_err();
        assert!(matches!(
            err,
            AppError::Validation(ValidationError::InvalidFormat(_))
        ));

        let err = RegisterInput::try_from(register_request("ann", "a@x.com", "")).unwrap_err();
        assert!(matches!(err, AppError::Validation(ValidationError::EmptyField(_))));
    }

    #[test]
    fn test_token_cookie_attributes() {
        let cookie = token_cookie(REFRESH_TOKEN_COOKIE, "abc".to_string(), 604_800);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(CookieDuration::seconds(604_800)));
        assert_eq!(cookie.path(), Some("/"));
    }

    #[test]
    fn test_removal_cookie_expires_immediately() {
        let cookie = removal_cookie(ACCESS_TOKEN_COOKIE);
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(CookieDuration::ZERO));
    }
}
