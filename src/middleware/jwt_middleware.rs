/// JWT Authentication Middleware
///
/// Validates the access token from the Authorization header and injects its
/// claims into request extensions for use by route handlers.

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use std::rc::Rc;

use crate::auth::TokenIssuer;
use crate::error::{AppError, AuthError};

/// Guards a scope with `Authorization: Bearer <access token>`
///
/// Refresh tokens are rejected here even when validly signed.
pub struct JwtMiddleware {
    tokens: TokenIssuer,
}

impl JwtMiddleware {
    pub fn new(tokens: TokenIssuer) -> Self {
        Self { tokens }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = JwtMiddlewareService<S>;
    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(JwtMiddlewareService {
            service: Rc::new(service),
            tokens: self.tokens.clone(),
        }))
    }
}

pub struct JwtMiddlewareService<S> {
    service: Rc<S>,
    tokens: TokenIssuer,
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    req.headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

impl<S, B> Service<ServiceRequest> for JwtMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = match bearer_token(&req) {
            Some(token) => token,
            None => {
                tracing::warn!(path = %req.path(), "Missing or malformed Authorization header");
                return Box::pin(async { Err(AppError::Auth(AuthError::MissingToken).into()) });
            }
        };

        match self.tokens.verify_access(&token) {
            Ok(claims) => {
                tracing::debug!(user_id = %claims.sub, "Access token validated");
                req.extensions_mut().insert(claims);

                let service = self.service.clone();
                Box::pin(async move { service.call(req).await })
            }
            Err(e) => {
                tracing::warn!(reason = %e, "Access token rejected");
                Box::pin(async { Err(AppError::Auth(AuthError::Unauthorized).into()) })
            }
        }
    }
}
